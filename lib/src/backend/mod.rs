//! Boundary between the bytecode walker and a machine code back end
//!
//! The walker treats the back end as a stack-machine IR builder: it pushes and pops typed values,
//! asks for arithmetic, memory and call operations, and brackets every bytecode instruction with
//! a logical instruction pointer. Logical instruction pointers are "duplicated" offsets: code that
//! belongs to the `n`th copy of a `jsr` subroutine lives at `ip + n * code_length`.
//!
//! Nothing here knows about instruction encodings. Once the walk is done, [`Assembler::resolve`]
//! lays the code out, after which the query methods translate logical offsets and trace sites into
//! native code offsets.

mod recording;

pub use recording::*;

use crate::jit::TraceId;
use crate::jvm::{BaseType, BinaryOp, CompareMode, OrdComparison, ValueKind};
use crate::runtime::{Routine, Thunk};
use bitflags::bitflags;
use std::fmt::Debug;

bitflags! {
    /// Properties of a call site, shared by the back end, trace elements, and call nodes
    pub struct CallFlags: u8 {
        /// Target is loaded from a vtable or a dynamic call table slot
        const VIRTUAL = 0b001;

        /// The caller's frame is reused
        const TAIL_CALL = 0b010;

        /// Target may be out of range of a direct call instruction
        const LONG_CALL = 0b100;
    }
}

/// Shape of the native frame, fixed before any code is emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Length of the bytecode (before any subroutine duplication)
    pub logical_code_length: usize,

    /// Slots taken by parameters, including `this`
    pub parameter_footprint: usize,

    /// Slots taken by all locals, including parameters
    pub local_footprint: usize,

    /// Words in the frame, excluding the return address
    pub aligned_frame_size: usize,
}

/// Immediate operands
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Null,
    Address(u64),

    /// Reference held in entry `n` of the compiled method's object pool
    PoolEntry(usize),
}

impl Immediate {
    pub fn kind(&self) -> ValueKind {
        match self {
            Immediate::Int(_) => ValueKind::Int,
            Immediate::Long(_) | Immediate::Address(_) => ValueKind::Long,
            Immediate::Float(_) => ValueKind::Float,
            Immediate::Double(_) => ValueKind::Double,
            Immediate::Null | Immediate::PoolEntry(_) => ValueKind::Object,
        }
    }
}

/// Size and extension of a memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Reference,

    /// Native pointer sized word (vtable entries, code addresses)
    Word,
}

impl MemoryKind {
    /// Kind of the value once loaded
    pub fn value_kind(self) -> ValueKind {
        match self {
            MemoryKind::Byte | MemoryKind::Char | MemoryKind::Short | MemoryKind::Int => {
                ValueKind::Int
            }
            MemoryKind::Long | MemoryKind::Word => ValueKind::Long,
            MemoryKind::Float => ValueKind::Float,
            MemoryKind::Double => ValueKind::Double,
            MemoryKind::Reference => ValueKind::Object,
        }
    }

    pub fn from_base_type(base_type: BaseType) -> MemoryKind {
        match base_type {
            BaseType::Byte | BaseType::Boolean => MemoryKind::Byte,
            BaseType::Char => MemoryKind::Char,
            BaseType::Short => MemoryKind::Short,
            BaseType::Int => MemoryKind::Int,
            BaseType::Long => MemoryKind::Long,
            BaseType::Float => MemoryKind::Float,
            BaseType::Double => MemoryKind::Double,
        }
    }
}

/// Memory operand: `base + offset + index * scale`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Memory<V> {
    pub base: V,
    pub offset: i32,
    pub index: Option<V>,
    pub scale: u8,
}

impl<V> Memory<V> {
    pub fn at(base: V, offset: i32) -> Memory<V> {
        Memory {
            base,
            offset,
            index: None,
            scale: 1,
        }
    }

    pub fn indexed(base: V, offset: i32, index: V, scale: u8) -> Memory<V> {
        Memory {
            base,
            offset,
            index: Some(index),
            scale,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Barrier {
    StoreStore,
    StoreLoad,
    Load,
}

/// What a call instruction jumps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget<V> {
    /// Already compiled code
    Address(u64),
    Thunk(Thunk),
    Routine(Routine),

    /// Address computed at run time (vtable slots, dynamic call table slots, resolved references)
    Indirect(V),
}

/// Back end IR builder
///
/// Every method takes the logical position implied by the most recent `start_logical_ip`. Values
/// are opaque handles: the walker never inspects them, it only threads them between operations.
pub trait Assembler {
    type Value: Copy + Debug;

    /// Snapshot of the IR stack, restored when the walker resumes a saved continuation
    type State: Clone;

    fn init(&mut self, layout: FrameLayout);

    /// Add another copy of the logical code, for a newly entered subroutine
    fn extend_logical_code(&mut self, additional: usize);

    fn save_state(&self) -> Self::State;
    fn restore_state(&mut self, state: Self::State);

    /// Start emitting code for a logical instruction that hasn't been visited before
    fn start_logical_ip(&mut self, ip: usize);

    /// Continue at an already emitted logical instruction (control flow merge)
    fn visit_logical_ip(&mut self, ip: usize);

    /// Locals at the next instruction are wherever they were at `ip` (exception handler entry)
    fn init_locals_from_logical_ip(&mut self, ip: usize);

    /// Spill every local to its frame slot, so a fault can be delivered with a precise frame
    fn save_locals(&mut self);

    fn push(&mut self, kind: ValueKind, value: Self::Value);
    fn pop(&mut self, kind: ValueKind) -> Self::Value;

    /// Read a local variable (by translated native index)
    fn load_local(&mut self, kind: ValueKind, index: usize) -> Self::Value;
    fn store_local(&mut self, kind: ValueKind, index: usize, value: Self::Value);

    fn constant(&mut self, immediate: Immediate) -> Self::Value;

    /// Pointer to the current thread structure
    fn thread(&mut self) -> Self::Value;

    /// `trace` is present when the operation can fault inside a protected region
    fn binary_op(
        &mut self,
        op: BinaryOp,
        kind: ValueKind,
        a: Self::Value,
        b: Self::Value,
        trace: Option<TraceId>,
    ) -> Self::Value;
    fn negate(&mut self, kind: ValueKind, a: Self::Value) -> Self::Value;
    fn convert(&mut self, from: ValueKind, to: ValueKind, a: Self::Value) -> Self::Value;
    fn truncate(&mut self, to: BaseType, a: Self::Value) -> Self::Value;

    /// Three-way comparison (`lcmp`, `fcmpl`, `dcmpg`, ...) producing an `int`
    fn compare(
        &mut self,
        kind: ValueKind,
        mode: Option<CompareMode>,
        a: Self::Value,
        b: Self::Value,
    ) -> Self::Value;

    fn load(
        &mut self,
        kind: MemoryKind,
        memory: Memory<Self::Value>,
        trace: Option<TraceId>,
    ) -> Self::Value;
    fn store(
        &mut self,
        kind: MemoryKind,
        memory: Memory<Self::Value>,
        value: Self::Value,
        trace: Option<TraceId>,
    );
    fn barrier(&mut self, barrier: Barrier);

    /// Compare `index` against the array length and call `handler` if out of bounds
    ///
    /// The call to `handler` is a call site of its own: its return address is where `trace`
    /// resolves to.
    fn check_bounds(
        &mut self,
        array: Self::Value,
        length_offset: i32,
        index: Self::Value,
        handler: u64,
        trace: TraceId,
    );

    /// Compare the stack pointer against the thread's stack limit and call `handler` on overflow
    fn check_stack_overflow(&mut self, handler: u64);

    /// Emit a call, returning the result (meaningless if `return_kind` is `None`)
    fn call(
        &mut self,
        target: CallTarget<Self::Value>,
        flags: CallFlags,
        trace: Option<TraceId>,
        return_kind: Option<ValueKind>,
        arguments: &[(ValueKind, Self::Value)],
    ) -> Self::Value;

    /// Jump to `target` if `a <condition> b`
    fn cond_jump(
        &mut self,
        condition: OrdComparison,
        kind: ValueKind,
        a: Self::Value,
        b: Self::Value,
        target: usize,
    );
    fn jump(&mut self, target: usize);

    /// Jump through a table of logical targets indexed by `value - low`
    fn table_jump(&mut self, value: Self::Value, low: i32, targets: &[usize], default: usize);

    /// Jump to the target paired with the matching key
    fn lookup_jump(&mut self, value: Self::Value, cases: &[(i32, usize)], default: usize);

    fn return_(&mut self, kind: Option<ValueKind>, value: Option<Self::Value>);

    /// Lay out the code, returning its length in bytes
    fn resolve(&mut self) -> usize;

    /// Write the resolved code out (`buffer` is exactly the length from `resolve`)
    fn write(&self, buffer: &mut [u8]);

    /// Offset of the first machine instruction emitted for a logical instruction
    fn machine_offset(&self, ip: usize) -> Option<usize>;

    /// Offset just past the last machine instruction emitted for a logical instruction
    fn machine_end_offset(&self, ip: usize) -> Option<usize>;

    /// Offset of the return address (or the faulting instruction's successor) of a trace site
    fn trace_offset(&self, trace: TraceId) -> Option<usize>;
}
