//! Method compiler
//!
//! [`compile`] takes one method from bytecode to machine code plus the tables the runtime needs
//! to walk and scan its frames: trace sites with frame maps, exception ranges and line numbers.

mod compiler;
mod context;
mod encoder;
mod errors;
mod event_log;
mod frame;
mod frame_map;
mod settings;
mod tables;
mod walker;

pub use compiler::*;
pub use context::*;
pub use encoder::*;
pub use errors::*;
pub use event_log::*;
pub use frame::*;
pub use frame_map::*;
pub use settings::*;
pub use tables::*;
pub use walker::*;
