use super::{Assembler, Barrier, CallFlags, CallTarget, FrameLayout, Immediate, Memory, MemoryKind};
use crate::jit::TraceId;
use crate::jvm::{BaseType, BinaryOp, CompareMode, OrdComparison, ValueKind};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::{BTreeMap, HashMap};

/// Operation recorded by [`RecordingAssembler`]
///
/// Values are numbered in order of creation. Operands refer to those numbers.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Start of a logical instruction
    Label(usize),
    Constant(usize, Immediate),
    Thread(usize),
    LoadLocal(usize, ValueKind, usize),
    StoreLocal(ValueKind, usize, usize),
    SaveLocals,
    InitLocalsFrom(usize),
    Binary(usize, BinaryOp, ValueKind, usize, usize),
    Negate(usize, ValueKind, usize),
    Convert(usize, ValueKind, ValueKind, usize),
    Truncate(usize, BaseType, usize),
    Compare(usize, ValueKind, Option<CompareMode>, usize, usize),
    Load(usize, MemoryKind, Memory<usize>),
    Store(MemoryKind, Memory<usize>, usize),
    Barrier(Barrier),
    CheckBounds { array: usize, index: usize, handler: u64 },
    CheckStackOverflow { handler: u64 },
    Call {
        result: Option<usize>,
        target: CallTarget<usize>,
        flags: CallFlags,
        arguments: Vec<usize>,
    },
    CondJump(OrdComparison, ValueKind, usize, usize, usize),
    Jump(usize),
    TableJump { value: usize, low: i32, targets: Vec<usize>, default: usize },
    LookupJump { value: usize, cases: Vec<(i32, usize)>, default: usize },
    Return(Option<usize>),
}

impl Op {
    /// Every operation takes one machine word, except for labels, which take a single byte so
    /// that empty logical instructions still get distinct addresses
    pub fn size(&self) -> usize {
        match self {
            Op::Label(_) => 1,
            Op::TableJump { targets, .. } => 8 * (1 + targets.len()),
            Op::LookupJump { cases, .. } => 8 * (1 + cases.len()),
            _ => 8,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Op::Label(_) => 0xcc,
            Op::Constant(..) => 0x01,
            Op::Thread(_) => 0x02,
            Op::LoadLocal(..) => 0x03,
            Op::StoreLocal(..) => 0x04,
            Op::SaveLocals => 0x05,
            Op::InitLocalsFrom(_) => 0x06,
            Op::Binary(..) => 0x07,
            Op::Negate(..) => 0x08,
            Op::Convert(..) => 0x09,
            Op::Truncate(..) => 0x0a,
            Op::Compare(..) => 0x0b,
            Op::Load(..) => 0x0c,
            Op::Store(..) => 0x0d,
            Op::Barrier(_) => 0x0e,
            Op::CheckBounds { .. } => 0x0f,
            Op::CheckStackOverflow { .. } => 0x10,
            Op::Call { .. } => 0x11,
            Op::CondJump(..) => 0x12,
            Op::Jump(_) => 0x13,
            Op::TableJump { .. } => 0x14,
            Op::LookupJump { .. } => 0x15,
            Op::Return(_) => 0x16,
        }
    }
}

#[derive(Debug, Clone)]
struct Recorded {
    op: Op,
    trace: Option<TraceId>,
}

/// Deterministic back end that records operations instead of generating machine code
///
/// Code is laid out as a prologue (everything emitted before the first logical instruction)
/// followed by every visited logical instruction in ascending order of duplicated offset. This
/// is enough to exercise everything that depends on code addresses: trace elements, exception
/// handler ranges, line numbers, and the method lookup.
#[derive(Debug, Default)]
pub struct RecordingAssembler {
    layout: Option<FrameLayout>,
    logical_length: usize,
    stack: Vec<usize>,
    next_value: usize,
    prologue: Vec<Recorded>,
    blocks: BTreeMap<usize, Vec<Recorded>>,
    current: Option<usize>,
    pending_locals: Option<usize>,

    // Populated by `resolve`
    block_ranges: HashMap<usize, (usize, usize)>,
    trace_offsets: HashMap<TraceId, usize>,
    code_length: usize,
}

impl RecordingAssembler {
    pub fn new() -> RecordingAssembler {
        RecordingAssembler::default()
    }

    pub fn layout(&self) -> Option<FrameLayout> {
        self.layout
    }

    /// Length of the code, once resolved
    pub fn code_length(&self) -> usize {
        self.code_length
    }

    /// Total logical length, including subroutine copies
    pub fn logical_length(&self) -> usize {
        self.logical_length
    }

    /// Logical instructions that were started, in ascending order
    pub fn visited_ips(&self) -> impl Iterator<Item = usize> + '_ {
        self.blocks.keys().copied()
    }

    /// Operations emitted for one logical instruction
    pub fn ops_at(&self, ip: usize) -> Vec<&Op> {
        self.blocks
            .get(&ip)
            .map(|block| block.iter().map(|recorded| &recorded.op).collect())
            .unwrap_or_default()
    }

    /// All operations, in layout order
    pub fn ops(&self) -> Vec<&Op> {
        self.prologue
            .iter()
            .chain(self.blocks.values().flatten())
            .map(|recorded| &recorded.op)
            .collect()
    }

    fn fresh(&mut self) -> usize {
        let value = self.next_value;
        self.next_value += 1;
        value
    }

    fn emit(&mut self, op: Op, trace: Option<TraceId>) {
        let recorded = Recorded { op, trace };
        match self.current {
            Some(ip) => self.blocks.entry(ip).or_default().push(recorded),
            None => self.prologue.push(recorded),
        }
    }

    fn emit_value(&mut self, make_op: impl FnOnce(usize) -> Op, trace: Option<TraceId>) -> usize {
        let value = self.fresh();
        self.emit(make_op(value), trace);
        value
    }
}

impl Assembler for RecordingAssembler {
    type Value = usize;
    type State = Vec<usize>;

    fn init(&mut self, layout: FrameLayout) {
        self.layout = Some(layout);
        self.logical_length = layout.logical_code_length;
    }

    fn extend_logical_code(&mut self, additional: usize) {
        self.logical_length += additional;
    }

    fn save_state(&self) -> Vec<usize> {
        self.stack.clone()
    }

    fn restore_state(&mut self, state: Vec<usize>) {
        self.stack = state;
        self.current = None;
    }

    fn start_logical_ip(&mut self, ip: usize) {
        self.current = Some(ip);
        self.emit(Op::Label(ip), None);
        if let Some(from) = self.pending_locals.take() {
            self.emit(Op::InitLocalsFrom(from), None);
        }
    }

    fn visit_logical_ip(&mut self, ip: usize) {
        // Right after a restore, the branch that saved the state already falls through to `ip`
        if self.current.is_some() {
            self.emit(Op::Jump(ip), None);
        }
    }

    fn init_locals_from_logical_ip(&mut self, ip: usize) {
        self.pending_locals = Some(ip);
    }

    fn save_locals(&mut self) {
        self.emit(Op::SaveLocals, None);
    }

    fn push(&mut self, _kind: ValueKind, value: usize) {
        self.stack.push(value);
    }

    fn pop(&mut self, _kind: ValueKind) -> usize {
        match self.stack.pop() {
            Some(value) => value,
            None => self.fresh(),
        }
    }

    fn load_local(&mut self, kind: ValueKind, index: usize) -> usize {
        self.emit_value(|value| Op::LoadLocal(value, kind, index), None)
    }

    fn store_local(&mut self, kind: ValueKind, index: usize, value: usize) {
        self.emit(Op::StoreLocal(kind, index, value), None);
    }

    fn constant(&mut self, immediate: Immediate) -> usize {
        self.emit_value(|value| Op::Constant(value, immediate), None)
    }

    fn thread(&mut self) -> usize {
        self.emit_value(Op::Thread, None)
    }

    fn binary_op(
        &mut self,
        op: BinaryOp,
        kind: ValueKind,
        a: usize,
        b: usize,
        trace: Option<TraceId>,
    ) -> usize {
        self.emit_value(|value| Op::Binary(value, op, kind, a, b), trace)
    }

    fn negate(&mut self, kind: ValueKind, a: usize) -> usize {
        self.emit_value(|value| Op::Negate(value, kind, a), None)
    }

    fn convert(&mut self, from: ValueKind, to: ValueKind, a: usize) -> usize {
        self.emit_value(|value| Op::Convert(value, from, to, a), None)
    }

    fn truncate(&mut self, to: BaseType, a: usize) -> usize {
        self.emit_value(|value| Op::Truncate(value, to, a), None)
    }

    fn compare(
        &mut self,
        kind: ValueKind,
        mode: Option<CompareMode>,
        a: usize,
        b: usize,
    ) -> usize {
        self.emit_value(|value| Op::Compare(value, kind, mode, a, b), None)
    }

    fn load(&mut self, kind: MemoryKind, memory: Memory<usize>, trace: Option<TraceId>) -> usize {
        self.emit_value(|value| Op::Load(value, kind, memory), trace)
    }

    fn store(
        &mut self,
        kind: MemoryKind,
        memory: Memory<usize>,
        value: usize,
        trace: Option<TraceId>,
    ) {
        self.emit(Op::Store(kind, memory, value), trace);
    }

    fn barrier(&mut self, barrier: Barrier) {
        self.emit(Op::Barrier(barrier), None);
    }

    fn check_bounds(
        &mut self,
        array: usize,
        _length_offset: i32,
        index: usize,
        handler: u64,
        trace: TraceId,
    ) {
        self.emit(
            Op::CheckBounds {
                array,
                index,
                handler,
            },
            Some(trace),
        );
    }

    fn check_stack_overflow(&mut self, handler: u64) {
        self.emit(Op::CheckStackOverflow { handler }, None);
    }

    fn call(
        &mut self,
        target: CallTarget<usize>,
        flags: CallFlags,
        trace: Option<TraceId>,
        return_kind: Option<ValueKind>,
        arguments: &[(ValueKind, usize)],
    ) -> usize {
        let value = self.fresh();
        let op = Op::Call {
            result: return_kind.map(|_| value),
            target,
            flags,
            arguments: arguments.iter().map(|(_, value)| *value).collect(),
        };
        self.emit(op, trace);
        value
    }

    fn cond_jump(
        &mut self,
        condition: OrdComparison,
        kind: ValueKind,
        a: usize,
        b: usize,
        target: usize,
    ) {
        self.emit(Op::CondJump(condition, kind, a, b, target), None);
    }

    fn jump(&mut self, target: usize) {
        self.emit(Op::Jump(target), None);
    }

    fn table_jump(&mut self, value: usize, low: i32, targets: &[usize], default: usize) {
        let op = Op::TableJump {
            value,
            low,
            targets: targets.to_vec(),
            default,
        };
        self.emit(op, None);
    }

    fn lookup_jump(&mut self, value: usize, cases: &[(i32, usize)], default: usize) {
        let op = Op::LookupJump {
            value,
            cases: cases.to_vec(),
            default,
        };
        self.emit(op, None);
    }

    fn return_(&mut self, _kind: Option<ValueKind>, value: Option<usize>) {
        self.emit(Op::Return(value), None);
    }

    fn resolve(&mut self) -> usize {
        let mut offset = 0;
        let mut trace_offsets = HashMap::new();
        let mut place = |block: &[Recorded]| -> (usize, usize) {
            let start = offset;
            for recorded in block {
                offset += recorded.op.size();
                if let Some(trace) = recorded.trace {
                    trace_offsets.insert(trace, offset);
                }
            }
            (start, offset)
        };

        place(&self.prologue);
        let block_ranges: HashMap<usize, (usize, usize)> = self
            .blocks
            .iter()
            .map(|(ip, block)| (*ip, place(block)))
            .collect();

        self.block_ranges = block_ranges;
        self.trace_offsets = trace_offsets;
        self.code_length = offset;
        offset
    }

    fn write(&self, buffer: &mut [u8]) {
        let mut offset = 0;
        for recorded in self.prologue.iter().chain(self.blocks.values().flatten()) {
            let size = recorded.op.size();
            let Some(slot) = buffer.get_mut(offset..offset + size) else {
                return;
            };
            if size == 1 {
                slot[0] = recorded.op.tag();
            } else {
                for (i, word) in slot.chunks_exact_mut(8).enumerate() {
                    let tag = if i == 0 { recorded.op.tag() } else { 0 };
                    LittleEndian::write_u64(word, (tag as u64) << 56 | (offset + 8 * i) as u64);
                }
            }
            offset += size;
        }
    }

    fn machine_offset(&self, ip: usize) -> Option<usize> {
        self.block_ranges.get(&ip).map(|(start, _)| *start)
    }

    fn machine_end_offset(&self, ip: usize) -> Option<usize> {
        self.block_ranges.get(&ip).map(|(_, end)| *end)
    }

    fn trace_offset(&self, trace: TraceId) -> Option<usize> {
        self.trace_offsets.get(&trace).copied()
    }
}
