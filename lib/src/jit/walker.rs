//! Bytecode walker
//!
//! Every reachable path through the method is walked once, in one go: the walker feeds the back
//! end and appends to the event log that the frame map analysis replays afterwards. Branches are
//! followed depth first. The other side of a branch is saved as a continuation (back end state
//! and abstract frame included) and resumed once the current path reaches code that was already
//! emitted, or leaves the method. Continuations live on an explicit stack, so deeply nested
//! control flow never grows the native stack.
//!
//! Exception handlers are walked last, as long as their protected range has any code.

use super::{Context, Environment, Error, Event, Frame, Subroutine, TraceId, TraceKind};
use crate::backend::{
    Assembler, Barrier, CallFlags, CallTarget, FrameLayout, Immediate, Memory, MemoryKind,
};
use crate::jvm::{
    self, decode, ArrayKind, BinaryName, BinaryOp, ClassAccessFlags, CompareMode, Constant,
    ConstantIndex, EqComparison, FieldType, Instruction, InvokeType, MethodDescriptor,
    OrdComparison, ParseDescriptor, UnqualifiedName, ValueKind,
};
use crate::runtime::{Class, Field, Link, Method, MethodCode, Routine, Thunk};
use crate::util::Width;
use std::collections::HashMap;
use std::sync::Arc;

/// What to do once an instruction is compiled
enum Step {
    /// Continue at a (duplicated) offset
    Next(usize),

    /// Walk `target` first, then come back to `resume`
    Branch { target: usize, resume: usize },

    /// Walk every target in turn (never empty)
    Switch(Vec<usize>),

    /// This path is done
    End,
}

/// Saved path, to be resumed when the current one ends
enum Continuation<'c, S> {
    Branch {
        resume: usize,
        state: S,
        frame: Frame,
        subroutine: Option<&'c Subroutine<'c>>,
    },

    /// Switch targets not yet walked (in reverse order)
    Table {
        targets: Vec<usize>,
        state: S,
        frame: Frame,
        subroutine: Option<&'c Subroutine<'c>>,
    },
}

/// Class operand of `new`, `checkcast`, ... prepared before the operand stack is popped
enum ClassOperand<'c> {
    Resolved(&'c Arc<Class>),

    /// Needs a run time call to resolve, with its own trace site
    Unresolved(ConstantIndex, TraceId),
}

/// What the walk found out, beyond what went into the back end and the context
pub struct WalkResult {
    pub layout: FrameLayout,

    /// Visit count per duplicated offset (merge points have more than one)
    pub visits: Vec<u32>,
}

pub struct Walker<'a, 'c, A: Assembler> {
    env: Environment<'a>,
    class: &'c Arc<Class>,
    method: &'c Method,
    code: &'c MethodCode,
    asm: &'a mut A,
    context: &'a mut Context<'c>,
    code_length: usize,

    visits: Vec<u32>,

    /// Operand stack kinds at the first visit of every offset, checked at later visits
    stack_maps: HashMap<usize, Vec<ValueKind>>,

    /// Locals at the first visit of every offset, for exception handler entry
    local_maps: HashMap<usize, Vec<Option<ValueKind>>>,

    /// Back end state right after the prologue
    initial_state: Option<A::State>,

    frame: Frame,
    subroutine: Option<&'c Subroutine<'c>>,

    /// The next instruction started is a handler entry and the exception must be pushed first
    pending_exception: bool,
}

impl<'a, 'c, A: Assembler> Walker<'a, 'c, A> {
    pub fn new(
        env: Environment<'a>,
        class: &'c Arc<Class>,
        method: &'c Method,
        code: &'c MethodCode,
        asm: &'a mut A,
        context: &'a mut Context<'c>,
    ) -> Self {
        let code_length = code.bytecode.len();
        let frame = Frame::for_entry(method, code.max_locals as usize, code.max_stack as usize);
        Walker {
            env,
            class,
            method,
            code,
            asm,
            context,
            code_length,
            visits: vec![0; code_length],
            stack_maps: HashMap::new(),
            local_maps: HashMap::new(),
            initial_state: None,
            frame,
            subroutine: None,
            pending_exception: false,
        }
    }

    /// Walk the whole method, handlers included
    pub fn run(mut self) -> Result<WalkResult, Error> {
        if self.code_length == 0 {
            return Err(jvm::Error::TruncatedInstruction { ip: 0 }.into());
        }
        let max_locals = self.code.max_locals as usize;
        let parameter_footprint = self.method.parameter_footprint();
        if max_locals < parameter_footprint {
            return Err(Error::LocalOutOfRange {
                ip: 0,
                index: parameter_footprint as u16,
            });
        }

        let layout = FrameLayout {
            logical_code_length: self.code_length,
            parameter_footprint,
            local_footprint: max_locals,
            aligned_frame_size: self
                .env
                .settings
                .align_frame_size(max_locals + self.code.max_stack as usize),
        };
        self.asm.init(layout);
        self.initial_state = Some(self.asm.save_state());
        self.asm
            .check_stack_overflow(self.env.thunks.address(Thunk::StackOverflowException));

        // Parameters are the only locals set on entry
        for index in 0..max_locals {
            if self.frame.local(index) == Some(ValueKind::Object) {
                let bit = self.frame.translate_local(index, 1);
                self.context.events.append(Event::Mark(bit));
            }
        }

        if self.method.is_synchronized() {
            let trace = self.call_trace(0, None, CallFlags::empty());
            let lock = self.lock_object();
            self.routine(
                Routine::AcquireMonitor,
                trace,
                None,
                &[(ValueKind::Object, lock)],
            );
        }

        self.walk(0)?;
        self.compile_handlers()?;

        log::debug!(
            "walked {}: {} events, {} traces, {} subroutine copies",
            self.method.qualified_name(),
            self.context.events.len(),
            self.context.traces.len(),
            self.context.subroutine_count()
        );
        Ok(WalkResult {
            layout,
            visits: self.visits,
        })
    }

    fn walk(&mut self, start: usize) -> Result<(), Error> {
        let mut continuations: Vec<Continuation<'c, A::State>> = vec![];
        let mut ip = start;
        loop {
            ip = match self.visit(ip)? {
                Step::Next(next) => next,
                Step::Branch { target, resume } => {
                    continuations.push(Continuation::Branch {
                        resume,
                        state: self.asm.save_state(),
                        frame: self.frame.clone(),
                        subroutine: self.subroutine,
                    });
                    self.context.events.append(Event::EnterContext);
                    target
                }
                Step::Switch(mut targets) => {
                    targets.reverse();
                    let first = targets.pop();
                    continuations.push(Continuation::Table {
                        targets,
                        state: self.asm.save_state(),
                        frame: self.frame.clone(),
                        subroutine: self.subroutine,
                    });
                    self.context.events.append(Event::EnterContext);
                    match first {
                        Some(first) => first,
                        None => match self.resume(&mut continuations) {
                            Some(ip) => ip,
                            None => return Ok(()),
                        },
                    }
                }
                Step::End => match self.resume(&mut continuations) {
                    Some(ip) => ip,
                    None => return Ok(()),
                },
            };
        }
    }

    /// Pop continuations until one has somewhere left to go
    fn resume(&mut self, continuations: &mut Vec<Continuation<'c, A::State>>) -> Option<usize> {
        while let Some(continuation) = continuations.pop() {
            self.context.events.append(Event::LeaveContext);
            match continuation {
                Continuation::Branch {
                    resume,
                    state,
                    frame,
                    subroutine,
                } => {
                    self.asm.restore_state(state);
                    self.frame = frame;
                    self.subroutine = subroutine;
                    return Some(resume);
                }
                Continuation::Table {
                    mut targets,
                    state,
                    frame,
                    subroutine,
                } => {
                    if let Some(next) = targets.pop() {
                        self.asm.restore_state(state.clone());
                        self.frame = frame.clone();
                        self.subroutine = subroutine;
                        continuations.push(Continuation::Table {
                            targets,
                            state,
                            frame,
                            subroutine,
                        });
                        self.context.events.append(Event::EnterContext);
                        return Some(next);
                    }
                }
            }
        }
        None
    }

    fn visit(&mut self, ip: usize) -> Result<Step, Error> {
        self.context.events.append(Event::Ip(ip));
        self.visits[ip] += 1;

        if self.visits[ip] > 1 {
            if self.stack_maps.get(&ip) != Some(&self.frame.stack_map()) {
                return Err(Error::StackMapMismatch { ip });
            }
            self.asm.visit_logical_ip(ip);
            return Ok(Step::End);
        }

        self.stack_maps.insert(ip, self.frame.stack_map());
        self.local_maps.insert(ip, self.frame.locals().to_vec());
        self.asm.start_logical_ip(ip);

        if self.pending_exception {
            self.pending_exception = false;
            let thread = self.asm.thread();
            let memory = Memory::at(thread, self.env.settings.layout.thread_exception_offset);
            let exception = self.asm.load(MemoryKind::Reference, memory, None);
            self.asm.push(ValueKind::Object, exception);
        }

        let original = ip % self.code_length;
        let (insn, next) = decode(&self.code.bytecode, original)?;
        log::trace!("{:>5}: {:?}", ip, insn);

        let continues = insn.falls_through() || matches!(insn, Instruction::Jsr(_));
        if continues && next >= self.code_length {
            return Err(jvm::Error::TruncatedInstruction { ip: original }.into());
        }
        let next = ip - original + next;
        self.compile_instruction(ip, insn, next)
    }

    fn compile_instruction(
        &mut self,
        ip: usize,
        insn: Instruction,
        next: usize,
    ) -> Result<Step, Error> {
        use Instruction::*;

        match insn {
            Nop => (),
            AConstNull => self.push_constant(ip, Immediate::Null)?,
            IConst(value) => self.push_constant(ip, Immediate::Int(value))?,
            LConst(value) => self.push_constant(ip, Immediate::Long(value))?,
            FConst(value) => self.push_constant(ip, Immediate::Float(value))?,
            DConst(value) => self.push_constant(ip, Immediate::Double(value))?,
            Ldc(index) => self.ldc(ip, index)?,
            Ldc2(index) => {
                let immediate = match self.class.constants.get(index)? {
                    Constant::Long(value) => Immediate::Long(*value),
                    Constant::Double(value) => Immediate::Double(*value),
                    _ => return Err(Error::UnexpectedConstant { ip, index: index.0 }),
                };
                self.push_constant(ip, immediate)?;
            }

            Load(kind, index) => {
                let value = self.load_local(ip, kind, index)?;
                self.push(ip, kind, value)?;
            }
            Store(ValueKind::Object, index) => {
                // `astore` also stores the return addresses pushed by `jsr`
                let (kind, value) = self.pop_any(ip)?;
                if kind != ValueKind::Object && kind != ValueKind::Address {
                    return Err(Error::StackTypeMismatch {
                        ip,
                        expected: ValueKind::Object,
                        found: kind,
                    });
                }
                self.store_local(ip, kind, index, value)?;
            }
            Store(kind, index) => {
                let value = self.pop(ip, kind)?;
                self.store_local(ip, kind, index, value)?;
            }
            IInc(index, delta) => {
                let value = self.load_local(ip, ValueKind::Int, index)?;
                let delta = self.asm.constant(Immediate::Int(delta as i32));
                let sum = self
                    .asm
                    .binary_op(BinaryOp::Add, ValueKind::Int, value, delta, None);
                self.store_local(ip, ValueKind::Int, index, sum)?;
            }

            ArrayLoad(kind) => {
                let bounds = self.bounds_trace(ip);
                let trace = self.fault_trace(ip);
                let index = self.pop(ip, ValueKind::Int)?;
                let array = self.pop(ip, ValueKind::Object)?;
                let memory = self.array_element(array, index, kind, bounds);
                let value = self.asm.load(array_memory_kind(kind), memory, trace);
                self.push(ip, kind.value_kind(), value)?;
            }
            ArrayStore(kind) => {
                let bounds = self.bounds_trace(ip);
                let trace = self.fault_trace(ip);
                let value = self.pop(ip, kind.value_kind())?;
                let index = self.pop(ip, ValueKind::Int)?;
                let array = self.pop(ip, ValueKind::Object)?;
                let memory = self.array_element(array, index, kind, bounds);
                self.asm
                    .store(array_memory_kind(kind), memory, value, trace);
            }
            ArrayLength => {
                let trace = self.fault_trace(ip);
                let array = self.pop(ip, ValueKind::Object)?;
                let memory = Memory::at(array, self.env.settings.layout.array_length_offset);
                let length = self.asm.load(MemoryKind::Int, memory, trace);
                self.push(ip, ValueKind::Int, length)?;
            }

            Pop => {
                self.pop_category(ip, 1)?;
            }
            Pop2 => {
                let (kind, _) = self.pop_any(ip)?;
                if kind.width() == 1 {
                    self.pop_category(ip, 1)?;
                }
            }
            Dup => {
                let a = self.pop_category(ip, 1)?;
                self.push_all(ip, &[a, a])?;
            }
            DupX1 => {
                let a = self.pop_category(ip, 1)?;
                let b = self.pop_category(ip, 1)?;
                self.push_all(ip, &[a, b, a])?;
            }
            DupX2 => {
                let a = self.pop_category(ip, 1)?;
                let b = self.pop_any(ip)?;
                if b.0.width() == 2 {
                    self.push_all(ip, &[a, b, a])?;
                } else {
                    let c = self.pop_category(ip, 1)?;
                    self.push_all(ip, &[a, c, b, a])?;
                }
            }
            Dup2 => {
                let a = self.pop_any(ip)?;
                if a.0.width() == 2 {
                    self.push_all(ip, &[a, a])?;
                } else {
                    let b = self.pop_category(ip, 1)?;
                    self.push_all(ip, &[b, a, b, a])?;
                }
            }
            Dup2X1 => {
                let a = self.pop_any(ip)?;
                if a.0.width() == 2 {
                    let b = self.pop_category(ip, 1)?;
                    self.push_all(ip, &[a, b, a])?;
                } else {
                    let b = self.pop_category(ip, 1)?;
                    let c = self.pop_category(ip, 1)?;
                    self.push_all(ip, &[b, a, c, b, a])?;
                }
            }
            Dup2X2 => {
                let a = self.pop_any(ip)?;
                if a.0.width() == 2 {
                    let b = self.pop_any(ip)?;
                    if b.0.width() == 2 {
                        self.push_all(ip, &[a, b, a])?;
                    } else {
                        let c = self.pop_category(ip, 1)?;
                        self.push_all(ip, &[a, c, b, a])?;
                    }
                } else {
                    let b = self.pop_category(ip, 1)?;
                    let c = self.pop_any(ip)?;
                    if c.0.width() == 2 {
                        self.push_all(ip, &[b, a, c, b, a])?;
                    } else {
                        let d = self.pop_category(ip, 1)?;
                        self.push_all(ip, &[b, a, d, c, b, a])?;
                    }
                }
            }
            Swap => {
                let a = self.pop_category(ip, 1)?;
                let b = self.pop_category(ip, 1)?;
                self.push_all(ip, &[a, b])?;
            }

            Binary(kind, op @ BinaryOp::Shift(_)) => {
                let amount = self.pop(ip, ValueKind::Int)?;
                let value = self.pop(ip, kind)?;
                let result = self.asm.binary_op(op, kind, value, amount, None);
                self.push(ip, kind, result)?;
            }
            Binary(kind, op) => {
                let integral = kind == ValueKind::Int || kind == ValueKind::Long;
                let trace = if integral && op.can_fault() {
                    self.fault_trace(ip)
                } else {
                    None
                };
                let b = self.pop(ip, kind)?;
                let a = self.pop(ip, kind)?;
                let result = self.asm.binary_op(op, kind, a, b, trace);
                self.push(ip, kind, result)?;
            }
            Neg(kind) => {
                let value = self.pop(ip, kind)?;
                let result = self.asm.negate(kind, value);
                self.push(ip, kind, result)?;
            }
            Convert(from, to) => {
                let value = self.pop(ip, from)?;
                let result = self.asm.convert(from, to, value);
                self.push(ip, to, result)?;
            }
            Truncate(to) => {
                let value = self.pop(ip, ValueKind::Int)?;
                let result = self.asm.truncate(to, value);
                self.push(ip, ValueKind::Int, result)?;
            }
            LCmp => self.compare(ip, ValueKind::Long, None)?,
            FCmp(mode) => self.compare(ip, ValueKind::Float, Some(mode))?,
            DCmp(mode) => self.compare(ip, ValueKind::Double, Some(mode))?,

            If(condition, target) => {
                let target = self.branch_target(ip, target);
                let value = self.pop(ip, ValueKind::Int)?;
                let zero = self.asm.constant(Immediate::Int(0));
                self.asm
                    .cond_jump(condition, ValueKind::Int, value, zero, target);
                return Ok(Step::Branch {
                    target,
                    resume: next,
                });
            }
            IfICmp(condition, target) => {
                let target = self.branch_target(ip, target);
                let b = self.pop(ip, ValueKind::Int)?;
                let a = self.pop(ip, ValueKind::Int)?;
                self.asm.cond_jump(condition, ValueKind::Int, a, b, target);
                return Ok(Step::Branch {
                    target,
                    resume: next,
                });
            }
            IfACmp(condition, target) => {
                let target = self.branch_target(ip, target);
                let b = self.pop(ip, ValueKind::Object)?;
                let a = self.pop(ip, ValueKind::Object)?;
                self.asm
                    .cond_jump(ord_comparison(condition), ValueKind::Object, a, b, target);
                return Ok(Step::Branch {
                    target,
                    resume: next,
                });
            }
            IfNull(condition, target) => {
                let target = self.branch_target(ip, target);
                let value = self.pop(ip, ValueKind::Object)?;
                let null = self.asm.constant(Immediate::Null);
                self.asm.cond_jump(
                    ord_comparison(condition),
                    ValueKind::Object,
                    value,
                    null,
                    target,
                );
                return Ok(Step::Branch {
                    target,
                    resume: next,
                });
            }
            Goto(target) => {
                let target = self.branch_target(ip, target);
                self.asm.jump(target);
                return Ok(Step::Next(target));
            }
            Jsr(target) => return self.jsr(ip, target, next),
            Ret(index) => return self.ret(ip, index),
            TableSwitch {
                default,
                low,
                targets,
            } => {
                let value = self.pop(ip, ValueKind::Int)?;
                let base = ip - ip % self.code_length;
                let default = base + default;
                let targets: Vec<usize> = targets.iter().map(|target| base + target).collect();
                self.asm.table_jump(value, low, &targets, default);
                return Ok(Step::Switch(distinct_targets(default, targets)));
            }
            LookupSwitch { default, targets } => {
                let value = self.pop(ip, ValueKind::Int)?;
                let base = ip - ip % self.code_length;
                let default = base + default;
                let cases: Vec<(i32, usize)> = targets
                    .iter()
                    .map(|(key, target)| (*key, base + target))
                    .collect();
                self.asm.lookup_jump(value, &cases, default);
                let targets = cases.into_iter().map(|(_, target)| target).collect();
                return Ok(Step::Switch(distinct_targets(default, targets)));
            }

            Return(kind) => {
                self.return_(ip, kind)?;
                return Ok(Step::End);
            }
            AThrow => {
                let trace = self.call_trace(ip, None, CallFlags::empty());
                let exception = self.pop(ip, ValueKind::Object)?;
                self.routine(
                    Routine::Throw,
                    trace,
                    None,
                    &[(ValueKind::Object, exception)],
                );
                return Ok(Step::End);
            }

            GetStatic(index) => self.field_access(ip, index, true, false)?,
            PutStatic(index) => self.field_access(ip, index, true, true)?,
            GetField(index) => self.field_access(ip, index, false, false)?,
            PutField(index) => self.field_access(ip, index, false, true)?,
            Invoke(invoke_type, index) => self.invoke(ip, next, invoke_type, index)?,
            InvokeDynamic(index) => self.invoke_dynamic(ip, index)?,

            New(index) => {
                let operand = self.prepare_class(ip, index)?;
                let trace = self.call_trace(ip, None, CallFlags::empty());
                let class = self.class_value(operand);
                let object = self.routine(
                    Routine::MakeNew,
                    trace,
                    Some(ValueKind::Object),
                    &[(ValueKind::Object, class)],
                );
                self.push(ip, ValueKind::Object, object)?;
            }
            NewArray(element) => {
                let trace = self.call_trace(ip, None, CallFlags::empty());
                let length = self.pop(ip, ValueKind::Int)?;
                let element = self
                    .asm
                    .constant(Immediate::Int(element.array_type_code() as i32));
                let array = self.routine(
                    Routine::MakeBlankArray,
                    trace,
                    Some(ValueKind::Object),
                    &[(ValueKind::Int, element), (ValueKind::Int, length)],
                );
                self.push(ip, ValueKind::Object, array)?;
            }
            ANewArray(index) => {
                let operand = self.prepare_class(ip, index)?;
                let trace = self.call_trace(ip, None, CallFlags::empty());
                let length = self.pop(ip, ValueKind::Int)?;
                let class = self.class_value(operand);
                let array = self.routine(
                    Routine::MakeBlankObjectArray,
                    trace,
                    Some(ValueKind::Object),
                    &[(ValueKind::Object, class), (ValueKind::Int, length)],
                );
                self.push(ip, ValueKind::Object, array)?;
            }
            MultiANewArray(index, dimensions) => {
                let operand = self.prepare_class(ip, index)?;
                let trace = self.call_trace(ip, None, CallFlags::empty());
                let mut lengths = vec![];
                for _ in 0..dimensions {
                    lengths.push((ValueKind::Int, self.pop(ip, ValueKind::Int)?));
                }
                lengths.reverse();
                let class = self.class_value(operand);
                let count = self.asm.constant(Immediate::Int(dimensions as i32));
                let mut arguments = vec![(ValueKind::Object, class), (ValueKind::Int, count)];
                arguments.extend(lengths);
                let array = self.routine(
                    Routine::MakeMultiArray,
                    trace,
                    Some(ValueKind::Object),
                    &arguments,
                );
                self.push(ip, ValueKind::Object, array)?;
            }
            CheckCast(index) => {
                let operand = self.prepare_class(ip, index)?;
                let trace = self.call_trace(ip, None, CallFlags::empty());
                let object = self.pop(ip, ValueKind::Object)?;
                let class = self.class_value(operand);
                let result = self.routine(
                    Routine::CheckCast,
                    trace,
                    Some(ValueKind::Object),
                    &[(ValueKind::Object, class), (ValueKind::Object, object)],
                );
                self.push(ip, ValueKind::Object, result)?;
            }
            InstanceOf(index) => {
                let operand = self.prepare_class(ip, index)?;
                let trace = self.call_trace(ip, None, CallFlags::empty());
                let object = self.pop(ip, ValueKind::Object)?;
                let class = self.class_value(operand);
                let result = self.routine(
                    Routine::InstanceOf,
                    trace,
                    Some(ValueKind::Int),
                    &[(ValueKind::Object, class), (ValueKind::Object, object)],
                );
                self.push(ip, ValueKind::Int, result)?;
            }
            MonitorEnter => self.monitor(ip, Routine::AcquireMonitor)?,
            MonitorExit => self.monitor(ip, Routine::ReleaseMonitor)?,
        }

        Ok(Step::Next(next))
    }

    // Operand stack and locals. Every change to a slot that could hold a reference is logged.

    fn push(&mut self, ip: usize, kind: ValueKind, value: A::Value) -> Result<(), Error> {
        let offset = self.frame.push(kind, ip)?;
        let bit = self.frame.stack_bit(offset);
        if kind.is_reference() {
            self.context.events.append(Event::Mark(bit));
        } else {
            for slot in 0..kind.width() {
                self.context.events.append(Event::Clear(bit + slot));
            }
        }
        self.asm.push(kind, value);
        Ok(())
    }

    fn push_constant(&mut self, ip: usize, immediate: Immediate) -> Result<(), Error> {
        let value = self.asm.constant(immediate);
        self.push(ip, immediate.kind(), value)
    }

    fn push_all(&mut self, ip: usize, values: &[(ValueKind, A::Value)]) -> Result<(), Error> {
        for (kind, value) in values {
            self.push(ip, *kind, *value)?;
        }
        Ok(())
    }

    fn pop_any(&mut self, ip: usize) -> Result<(ValueKind, A::Value), Error> {
        let (offset, kind) = self.frame.pop(ip)?;
        if kind.is_reference() {
            let bit = self.frame.stack_bit(offset);
            self.context.events.append(Event::Clear(bit));
        }
        Ok((kind, self.asm.pop(kind)))
    }

    fn pop(&mut self, ip: usize, expected: ValueKind) -> Result<A::Value, Error> {
        match self.frame.peek() {
            Some(found) if found != expected => Err(Error::StackTypeMismatch {
                ip,
                expected,
                found,
            }),
            _ => self.pop_any(ip).map(|(_, value)| value),
        }
    }

    /// Pop a value of a given computational category (number of slots)
    fn pop_category(&mut self, ip: usize, width: usize) -> Result<(ValueKind, A::Value), Error> {
        match self.frame.peek() {
            Some(found) if found.width() != width => Err(Error::StackTypeMismatch {
                ip,
                expected: if width == 1 {
                    ValueKind::Int
                } else {
                    ValueKind::Long
                },
                found,
            }),
            _ => self.pop_any(ip),
        }
    }

    fn pop_arguments(
        &mut self,
        ip: usize,
        kinds: &[ValueKind],
    ) -> Result<Vec<(ValueKind, A::Value)>, Error> {
        let mut arguments = Vec::with_capacity(kinds.len());
        for kind in kinds.iter().rev() {
            arguments.push((*kind, self.pop(ip, *kind)?));
        }
        arguments.reverse();
        Ok(arguments)
    }

    fn load_local(&mut self, ip: usize, kind: ValueKind, index: u16) -> Result<A::Value, Error> {
        self.frame.check_local(index, kind.width(), ip)?;
        let native = self.frame.translate_local(index as usize, kind.width());
        Ok(self.asm.load_local(kind, native))
    }

    fn store_local(
        &mut self,
        ip: usize,
        kind: ValueKind,
        index: u16,
        value: A::Value,
    ) -> Result<(), Error> {
        self.frame.check_local(index, kind.width(), ip)?;
        self.frame.set_local(index as usize, kind);
        let native = self.frame.translate_local(index as usize, kind.width());
        if kind.is_reference() {
            self.context.events.append(Event::Mark(native));
        } else {
            for slot in 0..kind.width() {
                self.context.events.append(Event::Clear(native + slot));
            }
        }
        self.asm.store_local(kind, native, value);
        Ok(())
    }

    // Trace sites and calls

    fn call_flags(&self) -> CallFlags {
        if self.env.settings.long_calls {
            CallFlags::LONG_CALL
        } else {
            CallFlags::empty()
        }
    }

    fn call_trace(&mut self, ip: usize, target: Option<Arc<Method>>, flags: CallFlags) -> TraceId {
        let flags = flags | self.call_flags();
        self.context.new_trace(ip, TraceKind::Call, target, flags)
    }

    /// Trace site for an instruction that can fault, if a handler could catch the fault
    fn fault_trace(&mut self, ip: usize) -> Option<TraceId> {
        if !self.in_try_block(ip) {
            return None;
        }
        self.asm.save_locals();
        Some(
            self.context
                .new_trace(ip, TraceKind::Fault, None, CallFlags::empty()),
        )
    }

    fn in_try_block(&self, ip: usize) -> bool {
        let original = ip % self.code_length;
        self.code.handlers.iter().any(|handler| {
            (handler.start_pc as usize..handler.end_pc as usize).contains(&original)
        })
    }

    fn routine(
        &mut self,
        routine: Routine,
        trace: TraceId,
        return_kind: Option<ValueKind>,
        arguments: &[(ValueKind, A::Value)],
    ) -> A::Value {
        let flags = self.call_flags();
        self.asm.call(
            CallTarget::Routine(routine),
            flags,
            Some(trace),
            return_kind,
            arguments,
        )
    }

    fn pool_constant(&mut self, index: usize) -> A::Value {
        self.asm.constant(Immediate::PoolEntry(index))
    }

    /// Constant pool entry of the class being compiled, for run time resolution
    fn reference(&mut self, index: ConstantIndex) -> A::Value {
        let entry = self.context.pool.reference(self.class, index);
        self.pool_constant(entry)
    }

    /// Object that a synchronized method locks
    fn lock_object(&mut self) -> A::Value {
        if self.method.is_static() {
            let entry = self.context.pool.class(self.class);
            self.pool_constant(entry)
        } else {
            let this = self.frame.translate_local(0, 1);
            self.asm.load_local(ValueKind::Object, this)
        }
    }

    fn resolve(&self, index: ConstantIndex) -> Result<Option<&'c Link>, Error> {
        let class: &'c Class = self.class;
        Ok(self.env.registry.resolve(class, index)?)
    }

    fn prepare_class(&mut self, ip: usize, index: ConstantIndex) -> Result<ClassOperand<'c>, Error> {
        Ok(match self.resolve(index)? {
            Some(Link::Class(class)) => ClassOperand::Resolved(class),
            _ => ClassOperand::Unresolved(index, self.call_trace(ip, None, CallFlags::empty())),
        })
    }

    fn class_value(&mut self, operand: ClassOperand<'c>) -> A::Value {
        match operand {
            ClassOperand::Resolved(class) => {
                let entry = self.context.pool.class(class);
                self.pool_constant(entry)
            }
            ClassOperand::Unresolved(index, trace) => {
                let reference = self.reference(index);
                self.routine(
                    Routine::ResolveClass,
                    trace,
                    Some(ValueKind::Object),
                    &[(ValueKind::Object, reference)],
                )
            }
        }
    }

    // Instructions that need more than a few lines

    fn ldc(&mut self, ip: usize, index: ConstantIndex) -> Result<(), Error> {
        let class: &'c Arc<Class> = self.class;
        match class.constants.get(index)? {
            Constant::Integer(value) => self.push_constant(ip, Immediate::Int(*value)),
            Constant::Float(value) => self.push_constant(ip, Immediate::Float(*value)),
            Constant::String(utf8) => {
                let string = class.constants.get_utf8_str(*utf8)?;
                let entry = self.context.pool.string(string);
                let value = self.pool_constant(entry);
                self.push(ip, ValueKind::Object, value)
            }
            Constant::Class(_) => {
                let operand = self.prepare_class(ip, index)?;
                let value = self.class_value(operand);
                self.push(ip, ValueKind::Object, value)
            }
            Constant::MethodType { .. } | Constant::MethodHandle { .. } | Constant::Dynamic { .. } => {
                let trace = self.call_trace(ip, None, CallFlags::empty());
                let reference = self.reference(index);
                let value = self.routine(
                    Routine::ResolveConstant,
                    trace,
                    Some(ValueKind::Object),
                    &[(ValueKind::Object, reference)],
                );
                self.push(ip, ValueKind::Object, value)
            }
            _ => Err(Error::UnexpectedConstant { ip, index: index.0 }),
        }
    }

    fn monitor(&mut self, ip: usize, routine: Routine) -> Result<(), Error> {
        let trace = self.call_trace(ip, None, CallFlags::empty());
        let object = self.pop(ip, ValueKind::Object)?;
        self.routine(routine, trace, None, &[(ValueKind::Object, object)]);
        Ok(())
    }

    fn compare(
        &mut self,
        ip: usize,
        kind: ValueKind,
        mode: Option<CompareMode>,
    ) -> Result<(), Error> {
        let b = self.pop(ip, kind)?;
        let a = self.pop(ip, kind)?;
        let result = self.asm.compare(kind, mode, a, b);
        self.push(ip, ValueKind::Int, result)
    }

    /// Call site of the bounds check in front of an array access, if there is one
    fn bounds_trace(&mut self, ip: usize) -> Option<TraceId> {
        if self.env.settings.bounds_checks {
            Some(self.call_trace(ip, None, CallFlags::empty()))
        } else {
            None
        }
    }

    fn array_element(
        &mut self,
        array: A::Value,
        index: A::Value,
        kind: ArrayKind,
        bounds: Option<TraceId>,
    ) -> Memory<A::Value> {
        let layout = &self.env.settings.layout;
        if let Some(trace) = bounds {
            let handler = self.env.thunks.address(Thunk::ArrayBoundsException);
            self.asm
                .check_bounds(array, layout.array_length_offset, index, handler, trace);
        }
        let size = kind.element_size(layout.reference_size) as u8;
        Memory::indexed(array, layout.array_body_offset, index, size)
    }

    /// Translate a branch target into the current copy, polling for GC on backward branches
    fn branch_target(&mut self, ip: usize, target: usize) -> usize {
        let target = ip - ip % self.code_length + target;
        if target <= ip {
            let trace = self.call_trace(ip, None, CallFlags::empty());
            self.routine(Routine::GcIfNecessary, trace, None, &[]);
        }
        target
    }

    fn jsr(&mut self, ip: usize, target: usize, next: usize) -> Result<Step, Error> {
        let mut active = self.subroutine;
        while let Some(subroutine) = active {
            if subroutine.entry == target {
                return Err(Error::RecursiveSubroutine {
                    ip: ip % self.code_length,
                    target,
                });
            }
            active = subroutine.outer;
        }

        let return_address = self.asm.constant(Immediate::Address(next as u64));
        self.push(ip, ValueKind::Address, return_address)?;

        let subroutine =
            self.context
                .new_subroutine(self.subroutine, target, next, self.code_length);
        self.asm.extend_logical_code(self.code_length);
        self.visits
            .resize(self.visits.len() + self.code_length, 0);
        log::trace!(
            "entering copy {} of subroutine at {} from {}",
            subroutine.index,
            target,
            ip
        );

        let target = subroutine.duplicated_base + target;
        self.asm.jump(target);
        self.subroutine = Some(subroutine);
        Ok(Step::Next(target))
    }

    fn ret(&mut self, ip: usize, index: u16) -> Result<Step, Error> {
        let subroutine = self
            .subroutine
            .ok_or(Error::RetOutsideSubroutine { ip })?;
        self.frame.check_local(index, 1, ip)?;
        if self.frame.local(index as usize) != Some(ValueKind::Address) {
            return Err(Error::RetOutsideSubroutine { ip });
        }
        self.asm.jump(subroutine.return_address);
        self.subroutine = subroutine.outer;
        Ok(Step::Next(subroutine.return_address))
    }

    fn return_(&mut self, ip: usize, kind: Option<ValueKind>) -> Result<(), Error> {
        let value = if self.method.is_synchronized() {
            let trace = self.call_trace(ip, None, CallFlags::empty());
            let value = match kind {
                Some(kind) => Some(self.pop(ip, kind)?),
                None => None,
            };
            let lock = self.lock_object();
            self.routine(
                Routine::ReleaseMonitor,
                trace,
                None,
                &[(ValueKind::Object, lock)],
            );
            value
        } else {
            match kind {
                Some(kind) => Some(self.pop(ip, kind)?),
                None => None,
            }
        };

        // Final fields must be visible before the new object can escape
        if self.method.is_constructor() && self.class.has_final_member() {
            self.asm.barrier(Barrier::StoreStore);
        }
        self.asm.return_(kind, value);
        Ok(())
    }

    fn field_access(
        &mut self,
        ip: usize,
        index: ConstantIndex,
        is_static: bool,
        is_put: bool,
    ) -> Result<(), Error> {
        if let Some(Link::Field { class, field }) = self.resolve(index)? {
            return self.resolved_field_access(ip, class, field, is_put);
        }

        let member = self.class.constants.get_member(index)?;
        let field_type = FieldType::parse(&member.descriptor)
            .map_err(|_| jvm::Error::MalformedDescriptor(member.descriptor.clone()))?;
        let kind = ValueKind::from(&field_type);

        let trace = self.call_trace(ip, None, CallFlags::empty());
        let value = if is_put { Some(self.pop(ip, kind)?) } else { None };
        let object = if is_static {
            None
        } else {
            Some(self.pop(ip, ValueKind::Object)?)
        };
        let reference = self.reference(index);

        let mut arguments = vec![(ValueKind::Object, reference)];
        arguments.extend(object.map(|object| (ValueKind::Object, object)));
        arguments.extend(value.map(|value| (kind, value)));
        let routine = match (is_static, is_put) {
            (false, false) => Routine::GetFieldFromReference(kind),
            (false, true) => Routine::SetFieldFromReference(kind),
            (true, false) => Routine::GetStaticFromReference(kind),
            (true, true) => Routine::SetStaticFromReference(kind),
        };
        if is_put {
            self.routine(routine, trace, None, &arguments);
        } else {
            let result = self.routine(routine, trace, Some(kind), &arguments);
            self.push(ip, kind, result)?;
        }
        Ok(())
    }

    fn resolved_field_access(
        &mut self,
        ip: usize,
        owner: &'c Arc<Class>,
        field: &'c Arc<Field>,
        is_put: bool,
    ) -> Result<(), Error> {
        let kind = field.value_kind();
        let memory_kind = field.memory_kind();
        let offset = field.offset as i32;

        if field.is_static() {
            // Code in the class itself only runs once initialization has started
            if !owner.is_initialized() && !Arc::ptr_eq(owner, self.class) {
                let trace = self.call_trace(ip, None, CallFlags::empty());
                let entry = self.context.pool.class(owner);
                let class = self.pool_constant(entry);
                self.routine(
                    Routine::InitClass,
                    trace,
                    None,
                    &[(ValueKind::Object, class)],
                );
            }
            let entry = self.context.pool.static_table(owner);
            if is_put {
                let value = self.pop(ip, kind)?;
                let table = self.pool_constant(entry);
                self.store_field(field, Memory::at(table, offset), value, None);
            } else {
                let table = self.pool_constant(entry);
                let value = self.load_field(field, Memory::at(table, offset), None);
                self.push(ip, kind, value)?;
            }
        } else {
            let trace = self.fault_trace(ip);
            if is_put {
                let value = self.pop(ip, kind)?;
                let object = self.pop(ip, ValueKind::Object)?;
                self.store_field(field, Memory::at(object, offset), value, trace);
            } else {
                let object = self.pop(ip, ValueKind::Object)?;
                let value = self.load_field(field, Memory::at(object, offset), trace);
                self.push(ip, kind, value)?;
            }
        }
        log::trace!("{}: inlined {:?} access to {}", ip, memory_kind, field.name);
        Ok(())
    }

    fn load_field(
        &mut self,
        field: &Field,
        memory: Memory<A::Value>,
        trace: Option<TraceId>,
    ) -> A::Value {
        let value = self.asm.load(field.memory_kind(), memory, trace);
        if field.is_volatile() {
            self.asm.barrier(Barrier::Load);
        }
        value
    }

    fn store_field(
        &mut self,
        field: &Field,
        memory: Memory<A::Value>,
        value: A::Value,
        trace: Option<TraceId>,
    ) {
        if field.is_volatile() {
            self.asm.barrier(Barrier::StoreStore);
        }
        self.asm.store(field.memory_kind(), memory, value, trace);
        if field.is_volatile() {
            self.asm.barrier(Barrier::StoreLoad);
        }
    }

    fn invoke(
        &mut self,
        ip: usize,
        next: usize,
        invoke_type: InvokeType,
        index: ConstantIndex,
    ) -> Result<(), Error> {
        let member = self.class.constants.get_member(index)?;
        let descriptor = MethodDescriptor::parse(&member.descriptor)
            .map_err(|_| jvm::Error::MalformedDescriptor(member.descriptor.clone()))?;
        let mut kinds = vec![];
        if invoke_type != InvokeType::Static {
            kinds.push(ValueKind::Object);
        }
        kinds.extend(descriptor.parameters.iter().map(ValueKind::from));
        let return_kind = descriptor.return_type.as_ref().map(ValueKind::from);

        let resolved = match self.resolve(index)? {
            Some(Link::Method { class, method }) => Some((class, method)),
            _ => None,
        };
        let (callee_class, callee_name) = match resolved {
            Some((_, method)) => (&method.class_name, &method.name),
            None => (&member.class, &member.name),
        };
        let tail = self.can_tail_call(ip, next, return_kind, callee_class, callee_name)?;
        let flags = self.call_flags();

        // The call node of a tail call site records that it jumps through the tail call thunk
        let tail_flag = if tail {
            CallFlags::TAIL_CALL
        } else {
            CallFlags::empty()
        };

        let result = match (invoke_type, resolved) {
            (InvokeType::Interface, _) => {
                let find_trace = self.call_trace(ip, None, CallFlags::empty());
                let trace = self.call_trace(ip, None, CallFlags::VIRTUAL | tail_flag);
                let arguments = self.pop_arguments(ip, &kinds)?;
                let reference = self.reference(index);
                let address = self.routine(
                    Routine::FindInterfaceMethodFromInstance,
                    find_trace,
                    Some(ValueKind::Long),
                    &[(ValueKind::Object, reference), arguments[0]],
                );
                self.emit_call(
                    CallTarget::Indirect(address),
                    flags | CallFlags::VIRTUAL,
                    trace,
                    tail,
                    return_kind,
                    &arguments,
                )
            }
            (InvokeType::Virtual, Some((class, method))) if needs_dispatch(class, method) => {
                let vtable_index = method.vtable_index.unwrap_or_default();
                let trace = self.call_trace(ip, None, CallFlags::VIRTUAL | tail_flag);
                let arguments = self.pop_arguments(ip, &kinds)?;
                let layout = &self.env.settings.layout;
                let class_memory = Memory::at(arguments[0].1, layout.class_pointer_offset);
                let entry_offset = layout.vtable_offset + (vtable_index * layout.word_size) as i32;
                let class_pointer = self.asm.load(MemoryKind::Word, class_memory, None);
                let address =
                    self.asm
                        .load(MemoryKind::Word, Memory::at(class_pointer, entry_offset), None);
                self.emit_call(
                    CallTarget::Indirect(address),
                    flags | CallFlags::VIRTUAL,
                    trace,
                    tail,
                    return_kind,
                    &arguments,
                )
            }
            (_, Some((_, method))) => {
                let trace = self.call_trace(ip, Some(method.clone()), tail_flag);
                let arguments = self.pop_arguments(ip, &kinds)?;
                let target = match method.compiled() {
                    Some(compiled) => CallTarget::Address(compiled.start()),
                    None => CallTarget::Thunk(Thunk::DefaultCompile),
                };
                self.emit_call(target, flags, trace, tail, return_kind, &arguments)
            }
            (_, None) => {
                let find_trace = self.call_trace(ip, None, CallFlags::empty());
                let virtual_flag = if invoke_type == InvokeType::Virtual {
                    CallFlags::VIRTUAL
                } else {
                    CallFlags::empty()
                };
                let trace = self.call_trace(ip, None, virtual_flag | tail_flag);
                let arguments = self.pop_arguments(ip, &kinds)?;
                let reference = self.reference(index);
                let mut find_arguments = vec![(ValueKind::Object, reference)];
                if invoke_type == InvokeType::Virtual {
                    find_arguments.push(arguments[0]);
                }
                let address = self.routine(
                    Routine::FindMethodFromReference(invoke_type),
                    find_trace,
                    Some(ValueKind::Long),
                    &find_arguments,
                );
                self.emit_call(
                    CallTarget::Indirect(address),
                    flags | virtual_flag,
                    trace,
                    tail,
                    return_kind,
                    &arguments,
                )
            }
        };

        if let Some(kind) = return_kind {
            self.push(ip, kind, result)?;
        }
        Ok(())
    }

    /// Call a method, replacing the current frame if `tail` is set
    fn emit_call(
        &mut self,
        target: CallTarget<A::Value>,
        flags: CallFlags,
        trace: TraceId,
        tail: bool,
        return_kind: Option<ValueKind>,
        arguments: &[(ValueKind, A::Value)],
    ) -> A::Value {
        let address = match (tail, target) {
            (false, _) | (true, CallTarget::Routine(_)) => {
                return self
                    .asm
                    .call(target, flags, Some(trace), return_kind, arguments)
            }
            (true, CallTarget::Indirect(address)) => address,
            (true, CallTarget::Address(address)) => self.asm.constant(Immediate::Address(address)),
            (true, CallTarget::Thunk(thunk)) => {
                let address = self.env.thunks.address(thunk);
                self.asm.constant(Immediate::Address(address))
            }
        };

        let thread = self.asm.thread();
        let slot = Memory::at(thread, self.env.settings.layout.thread_tail_address_offset);
        self.asm.store(MemoryKind::Word, slot, address, None);
        self.asm.call(
            CallTarget::Thunk(Thunk::TailCall),
            flags | CallFlags::TAIL_CALL,
            Some(trace),
            return_kind,
            arguments,
        )
    }

    fn can_tail_call(
        &self,
        ip: usize,
        next: usize,
        return_kind: Option<ValueKind>,
        callee_class: &BinaryName,
        callee_name: &UnqualifiedName,
    ) -> Result<bool, Error> {
        let caller_return = self
            .method
            .descriptor
            .return_type
            .as_ref()
            .map(ValueKind::from);
        Ok(self.env.settings.tail_calls
            && !self.method.is_synchronized()
            && !self.in_try_block(ip)
            && !(self.method.is_constructor() && self.class.has_final_member())
            && caller_return == return_kind
            && self.returns_at(next % self.code_length)?
            && self
                .env
                .settings
                .classpath
                .can_tail_call(&self.class.name, callee_class, callee_name))
    }

    /// Does control go straight to a return from `ip` (through any number of `goto`s)?
    fn returns_at(&self, mut ip: usize) -> Result<bool, Error> {
        for _ in 0..self.code_length {
            match decode(&self.code.bytecode, ip)?.0 {
                Instruction::Goto(target) => ip = target,
                Instruction::Return(_) => return Ok(true),
                _ => return Ok(false),
            }
        }
        Ok(false)
    }

    fn invoke_dynamic(&mut self, ip: usize, index: ConstantIndex) -> Result<(), Error> {
        let class: &'c Arc<Class> = self.class;
        let name_and_type = match class.constants.get(index)? {
            Constant::InvokeDynamic { name_and_type, .. } => *name_and_type,
            _ => return Err(Error::UnexpectedConstant { ip, index: index.0 }),
        };
        let (_, descriptor) = class.constants.get_name_and_type_strs(name_and_type)?;
        let descriptor = MethodDescriptor::parse(descriptor)
            .map_err(|_| jvm::Error::MalformedDescriptor(descriptor.to_owned()))?;
        let kinds: Vec<ValueKind> = descriptor.parameters.iter().map(ValueKind::from).collect();
        let return_kind = descriptor.return_type.as_ref().map(ValueKind::from);

        let dynamic_calls = self.env.dynamic_calls;
        let slot = dynamic_calls.reserve(
            &class.name,
            index,
            self.env.thunks.address(Thunk::DefaultDynamic),
        )?;
        let slot_address = dynamic_calls
            .slot_address(slot)
            .ok_or(Error::DynamicTableFull {
                capacity: dynamic_calls.capacity(),
            })?;

        let flags = self.call_flags() | CallFlags::VIRTUAL;
        let trace = self.call_trace(ip, None, CallFlags::VIRTUAL);
        let arguments = self.pop_arguments(ip, &kinds)?;
        let slot = self.asm.constant(Immediate::Address(slot_address));
        let target = self.asm.load(MemoryKind::Word, Memory::at(slot, 0), None);
        let result = self.asm.call(
            CallTarget::Indirect(target),
            flags,
            Some(trace),
            return_kind,
            &arguments,
        );
        if let Some(kind) = return_kind {
            self.push(ip, kind, result)?;
        }
        Ok(())
    }

    /// Walk the handlers whose protected range has code, until no more become reachable
    fn compile_handlers(&mut self) -> Result<(), Error> {
        let code = self.code;
        let mut done = vec![false; code.handlers.len()];
        loop {
            let mut progress = false;
            for (handler, done) in code.handlers.iter().zip(done.iter_mut()) {
                if *done {
                    continue;
                }
                let start = handler.start_pc as usize;
                let end = (handler.end_pc as usize).min(self.code_length);
                let handler_ip = handler.handler_pc as usize;
                if handler_ip >= self.code_length {
                    return Err(jvm::Error::BadBranchTarget {
                        ip: start,
                        target: handler_ip as i64,
                    }
                    .into());
                }
                let covered = self.visited_in_range(start, end);
                let Some(first) = covered.first().copied() else {
                    continue;
                };
                *done = true;
                progress = true;

                self.context
                    .events
                    .append(Event::EnterExceptionRegion { start, end });
                if self.visits[handler_ip] > 0 {
                    // Shared with another handler (or reached normally): just a merge
                    if self.stack_maps.get(&handler_ip) != Some(&vec![ValueKind::Object]) {
                        return Err(Error::StackMapMismatch { ip: handler_ip });
                    }
                    self.context.events.append(Event::Ip(handler_ip));
                    self.visits[handler_ip] += 1;
                } else {
                    self.enter_handler(first, &covered)?;
                    self.walk(handler_ip)?;
                }
                self.context.events.append(Event::LeaveContext);
            }
            if !progress {
                return Ok(());
            }
        }
    }

    /// Duplicated offsets in `start..end` of any copy that have been visited
    fn visited_in_range(&self, start: usize, end: usize) -> Vec<usize> {
        let copies = self.visits.len() / self.code_length;
        (0..copies)
            .flat_map(|copy| {
                let base = copy * self.code_length;
                (base + start..base + end).filter(|ip| self.visits[*ip] > 0)
            })
            .collect()
    }

    /// Set up the frame at a handler entry: locals as they were everywhere in the protected
    /// range, and just the exception on the stack
    fn enter_handler(&mut self, first: usize, covered: &[usize]) -> Result<(), Error> {
        if let Some(state) = &self.initial_state {
            self.asm.restore_state(state.clone());
        }
        self.asm.init_locals_from_logical_ip(first);

        let max_locals = self.code.max_locals as usize;
        let mut frame = Frame::new(
            max_locals,
            self.code.max_stack as usize,
            self.method.parameter_footprint(),
        );
        let mut snapshots = covered.iter().filter_map(|ip| self.local_maps.get(ip));
        if let Some(locals) = snapshots.next() {
            for (index, kind) in locals.iter().enumerate() {
                if let Some(kind) = kind {
                    frame.set_local(index, *kind);
                }
            }
            for locals in snapshots {
                frame.merge_locals(locals);
            }
        }
        let offset = frame.push(ValueKind::Object, first)?;
        let exception_bit = frame.stack_bit(offset);
        for bit in exception_bit + 1..max_locals + frame.max_stack() {
            self.context.events.append(Event::Clear(bit));
        }
        self.context.events.append(Event::Mark(exception_bit));

        self.frame = frame;
        self.subroutine = None;
        self.pending_exception = true;
        Ok(())
    }
}

/// Does a resolved `invokevirtual` have to go through the vtable?
fn needs_dispatch(class: &Class, method: &Method) -> bool {
    !(method.is_final()
        || method.is_private()
        || class.access_flags.contains(ClassAccessFlags::FINAL)
        || method.vtable_index.is_none())
}

fn ord_comparison(comparison: EqComparison) -> OrdComparison {
    match comparison {
        EqComparison::EQ => OrdComparison::EQ,
        EqComparison::NE => OrdComparison::NE,
    }
}

fn array_memory_kind(kind: ArrayKind) -> MemoryKind {
    match kind {
        ArrayKind::Int => MemoryKind::Int,
        ArrayKind::Long => MemoryKind::Long,
        ArrayKind::Float => MemoryKind::Float,
        ArrayKind::Double => MemoryKind::Double,
        ArrayKind::Object => MemoryKind::Reference,
        ArrayKind::Byte => MemoryKind::Byte,
        ArrayKind::Char => MemoryKind::Char,
        ArrayKind::Short => MemoryKind::Short,
    }
}

/// Default first, then every other target once, in order
fn distinct_targets(default: usize, targets: Vec<usize>) -> Vec<usize> {
    let mut distinct = vec![default];
    for target in targets {
        if !distinct.contains(&target) {
            distinct.push(target);
        }
    }
    distinct
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn switch_targets_are_deduplicated() {
        assert_eq!(distinct_targets(9, vec![3, 9, 3, 5]), vec![9, 3, 5]);
        assert_eq!(distinct_targets(2, vec![]), vec![2]);
    }

    #[test]
    fn eq_comparisons() {
        assert_eq!(ord_comparison(EqComparison::NE), OrdComparison::NE);
        assert_eq!(ord_comparison(!EqComparison::NE), OrdComparison::EQ);
    }
}
