//! Runtime structures the compiler reads from and installs into
//!
//! Classes and methods, the registry compile-time resolution looks into, and what gets built up
//! as methods are compiled: the method lookup, call nodes, and the dynamic call table.

mod call_nodes;
mod class;
mod compiled;
mod jit;
mod lookup;
mod registry;
mod stack_walker;
mod thunks;

pub use call_nodes::*;
pub use class::*;
pub use compiled::*;
pub use jit::*;
pub use lookup::*;
pub use registry::*;
pub use stack_walker::*;
pub use thunks::*;
