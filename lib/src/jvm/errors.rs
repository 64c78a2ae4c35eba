use std::io;

/// Errors from reading class files and decoding bytecode
#[derive(Debug)]
pub enum Error {
    IoError(io::Error),

    /// The file does not start with `0xCAFEBABE`
    BadMagic(u32),

    /// Constant pool entry has a tag that does not correspond to any constant
    BadConstantTag { index: u16, tag: u8 },

    /// Index is zero, past the end of the pool, or in the unusable slot after a `long`/`double`
    BadConstantIndex(u16),

    /// Constant exists but is not of the kind required at the use site
    UnexpectedConstant { index: u16, expected: &'static str },

    /// A constant pool builder ran out of the 65535 addressable slots
    ConstantPoolOverflow,

    /// Modified UTF-8 that does not decode to valid UTF-16
    MalformedUtf8(Vec<u8>),
    MalformedName(String),
    MalformedDescriptor(String),

    /// Known attribute whose payload is inconsistent with its declared length
    BadAttribute(&'static str),

    UnknownOpcode { ip: usize, opcode: u8 },
    TruncatedInstruction { ip: usize },
    BadBranchTarget { ip: usize, target: i64 },
    BadNewArrayType { ip: usize, atype: u8 },
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IoError(err)
    }
}
