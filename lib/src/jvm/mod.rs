//! Read JVM classes
//!
//! This covers everything the compiler needs to know about the class file format and nothing
//! more: the constant pool, method `Code` attributes with their exception and line number tables,
//! descriptors and names, access flags, and a decoder from raw bytecode into [`Instruction`]s.
//!
//! ### Simple example
//!
//! ```
//! use classjit::jvm::*;
//!
//! # fn decode_method() -> Result<(), Error> {
//! // int f(int a) { return a + 1; }
//! let code = [0x1a, 0x04, 0x60, 0xac];
//! let instructions = decode_all(&code)?;
//! assert_eq!(instructions[2], (2, Instruction::Binary(ValueKind::Int, BinaryOp::Add)));
//!
//! let descriptor = MethodDescriptor::parse("(I)I").map_err(Error::IoError)?;
//! assert_eq!(descriptor.parameter_length(false), 1);
//! # Ok(())
//! # }
//! # decode_method().unwrap();
//! ```

mod access_flags;
mod binary_format;
mod bytecode;
pub mod class_file;
mod descriptors;
mod errors;
mod names;

pub use access_flags::*;
pub use binary_format::*;
pub use bytecode::*;
pub use class_file::{
    ClassConstantIndex, Constant, ConstantIndex, ConstantsPool, MemberKind, MemberRef,
    NameAndTypeConstantIndex, StringConstantIndex, Utf8ConstantIndex,
};
pub use descriptors::*;
pub use errors::*;
pub use names::*;
