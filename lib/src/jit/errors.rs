use crate::jvm::{self, ValueKind};

/// Reasons a compilation can fail
///
/// These all mean the bytecode (or the class it came from) is invalid or hostile. None of them
/// are conditions that generated code recovers from.
#[derive(Debug)]
pub enum Error {
    Bytecode(jvm::Error),

    /// Pop from an empty operand stack
    StackUnderflow { ip: usize },

    /// Push past `max_stack`
    StackOverflow { ip: usize },

    /// Operand on the stack is not of the kind the instruction consumes
    StackTypeMismatch {
        ip: usize,
        expected: ValueKind,
        found: ValueKind,
    },

    /// Two paths reach the same instruction with differently shaped operand stacks
    StackMapMismatch { ip: usize },

    /// Local variable index at or past `max_locals`
    LocalOutOfRange { ip: usize, index: u16 },

    /// `ret` when no subroutine is active, or through a local that holds no return address
    RetOutsideSubroutine { ip: usize },

    /// `jsr` to a subroutine that is already active, which would be copied without end
    RecursiveSubroutine { ip: usize, target: usize },

    /// Method is `native` or `abstract`
    MissingCode,

    /// Constant pool entry used by an instruction is not of a kind it accepts
    UnexpectedConstant { ip: usize, index: u16 },

    /// A trace element for which the back end produced no address
    UnresolvedTrace { ip: usize },

    /// Frame maps were still narrowing after this many replays of the event log
    FrameMapDivergence { passes: usize },

    /// No free slot left in the dynamic call table
    DynamicTableFull { capacity: usize },
}

impl From<jvm::Error> for Error {
    fn from(err: jvm::Error) -> Error {
        Error::Bytecode(err)
    }
}
