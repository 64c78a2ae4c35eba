//! Baseline JIT core for JVM bytecode
//!
//! The pipeline for one method is:
//!
//!   1. [`jit::compile`] walks the bytecode with an explicit continuation stack, driving an
//!      [`backend::Assembler`] and appending to an event log
//!   2. the event log is replayed until the frame maps at merge points and call sites stop
//!      narrowing
//!   3. the back end resolves addresses, after which exception handler and line number tables are
//!      translated into native offsets and the frame maps are packed into a searchable table
//!
//! [`runtime::Jit`] wraps this with the publish protocol: the walk happens against a snapshot of
//! the method without any lock held, then the result is published under the class lock (first
//! writer wins).

pub mod backend;
pub mod jit;
pub mod jvm;
pub mod runtime;
pub mod util;
