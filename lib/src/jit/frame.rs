use super::Error;
use crate::jvm::ValueKind;
use crate::runtime::Method;
use crate::util::{Offset, OffsetVec, Width};

/// Native index of a local variable
///
/// Parameters are numbered in reverse (the last parameter is closest to the frame's base, as it
/// was pushed last by the caller), everything after the parameters keeps its bytecode index.
/// `footprint` is the number of slots the value takes.
pub fn translate_local_index(parameter_footprint: usize, footprint: usize, index: usize) -> usize {
    if index < parameter_footprint {
        parameter_footprint - index - footprint
    } else {
        index
    }
}

/// Abstract state of the operand stack and locals at one point of one path through the method
///
/// Cloning a frame gives a branch its own copy of the stack map to mutate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    stack: OffsetVec<ValueKind>,

    /// Kind of value starting at each local slot (`None` for unset slots and the second half of
    /// wide values)
    locals: Vec<Option<ValueKind>>,

    max_stack: usize,
    parameter_footprint: usize,
}

impl Frame {
    pub fn new(max_locals: usize, max_stack: usize, parameter_footprint: usize) -> Frame {
        Frame {
            stack: OffsetVec::new(),
            locals: vec![None; max_locals],
            max_stack,
            parameter_footprint,
        }
    }

    /// Frame at method entry: parameters (and `this`) are set, everything else is empty
    pub fn for_entry(method: &Method, max_locals: usize, max_stack: usize) -> Frame {
        let mut frame = Frame::new(max_locals, max_stack, method.parameter_footprint());
        let mut index = 0;
        if !method.is_static() {
            frame.set_local(0, ValueKind::Object);
            index += 1;
        }
        for parameter in &method.descriptor.parameters {
            let kind = ValueKind::from(parameter);
            frame.set_local(index, kind);
            index += kind.width();
        }
        frame
    }

    pub fn max_locals(&self) -> usize {
        self.locals.len()
    }

    pub fn max_stack(&self) -> usize {
        self.max_stack
    }

    pub fn parameter_footprint(&self) -> usize {
        self.parameter_footprint
    }

    /// Bits in a frame map: one per local, then one per stack slot
    pub fn map_size(&self) -> usize {
        self.locals.len() + self.max_stack
    }

    /// Native index of the first slot of a local
    pub fn translate_local(&self, index: usize, footprint: usize) -> usize {
        translate_local_index(self.parameter_footprint, footprint, index)
    }

    /// Frame map bit of a stack slot
    pub fn stack_bit(&self, offset: Offset) -> usize {
        self.locals.len() + offset.0
    }

    /// Number of occupied stack slots
    pub fn stack_depth(&self) -> usize {
        self.stack.offset_len().0
    }

    /// Kinds of the values on the stack, bottom first
    pub fn stack_map(&self) -> Vec<ValueKind> {
        self.stack.iter().map(|(_, _, kind)| *kind).collect()
    }

    pub fn peek(&self) -> Option<ValueKind> {
        self.stack.last().map(|(_, kind)| *kind)
    }

    /// Push a value, returning the offset of its first slot
    pub fn push(&mut self, kind: ValueKind, ip: usize) -> Result<Offset, Error> {
        if self.stack_depth() + kind.width() > self.max_stack {
            return Err(Error::StackOverflow { ip });
        }
        Ok(self.stack.push(kind))
    }

    pub fn pop(&mut self, ip: usize) -> Result<(Offset, ValueKind), Error> {
        self.stack.pop().ok_or(Error::StackUnderflow { ip })
    }

    pub fn clear_stack(&mut self) {
        self.stack.clear();
    }

    pub fn locals(&self) -> &[Option<ValueKind>] {
        &self.locals
    }

    pub fn local(&self, index: usize) -> Option<ValueKind> {
        self.locals.get(index).copied().flatten()
    }

    /// Check that a value of the given width fits at a local index
    pub fn check_local(&self, index: u16, footprint: usize, ip: usize) -> Result<(), Error> {
        let index_usize = index as usize;
        let end = index_usize + footprint;
        let straddles_parameters = index_usize < self.parameter_footprint && end > self.parameter_footprint;
        if end > self.locals.len() || straddles_parameters {
            Err(Error::LocalOutOfRange { ip, index })
        } else {
            Ok(())
        }
    }

    /// Record the kind of a local (the index must have been checked)
    pub fn set_local(&mut self, index: usize, kind: ValueKind) {
        // Overwriting the second half of a wide value invalidates the whole value
        if index > 0 {
            if let Some(Some(previous)) = self.locals.get(index - 1) {
                if previous.width() == 2 {
                    self.locals[index - 1] = None;
                }
            }
        }
        if let Some(slot) = self.locals.get_mut(index) {
            *slot = Some(kind);
        }
        if kind.width() == 2 {
            if let Some(slot) = self.locals.get_mut(index + 1) {
                *slot = None;
            }
        }
    }

    /// Keep only the locals that hold the same kind in both frames
    pub fn merge_locals(&mut self, other: &[Option<ValueKind>]) {
        for (local, other) in self.locals.iter_mut().zip(other) {
            if *local != *other {
                *local = None;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parameters_are_reversed() {
        // (IJ)V static: int at 0, long at 1..3
        assert_eq!(translate_local_index(3, 1, 0), 2);
        assert_eq!(translate_local_index(3, 2, 1), 0);
        assert_eq!(translate_local_index(3, 1, 3), 3);
        assert_eq!(translate_local_index(0, 2, 4), 4);
    }

    #[test]
    fn stack_bounds() {
        let mut frame = Frame::new(2, 3, 1);
        assert_eq!(frame.push(ValueKind::Long, 0).unwrap(), Offset(0));
        assert_eq!(frame.push(ValueKind::Object, 1).unwrap(), Offset(2));
        assert_eq!(frame.stack_bit(Offset(2)), 4);
        assert!(matches!(
            frame.push(ValueKind::Int, 2),
            Err(Error::StackOverflow { ip: 2 })
        ));
        assert_eq!(frame.stack_map(), vec![ValueKind::Long, ValueKind::Object]);
        assert_eq!(frame.pop(3).unwrap(), (Offset(2), ValueKind::Object));
        assert_eq!(frame.pop(3).unwrap(), (Offset(0), ValueKind::Long));
        assert!(matches!(frame.pop(4), Err(Error::StackUnderflow { ip: 4 })));
    }

    #[test]
    fn locals() {
        let mut frame = Frame::new(4, 0, 2);
        assert!(frame.check_local(1, 2, 0).is_err());
        assert!(frame.check_local(2, 2, 0).is_ok());
        assert!(frame.check_local(3, 2, 0).is_err());

        frame.set_local(2, ValueKind::Double);
        assert_eq!(frame.local(2), Some(ValueKind::Double));
        frame.set_local(3, ValueKind::Int);
        assert_eq!(frame.local(2), None);
        assert_eq!(frame.local(3), Some(ValueKind::Int));

        let mut other = frame.clone();
        other.set_local(3, ValueKind::Object);
        other.set_local(0, ValueKind::Int);
        frame.set_local(0, ValueKind::Int);
        frame.merge_locals(other.locals());
        assert_eq!(frame.local(0), Some(ValueKind::Int));
        assert_eq!(frame.local(3), None);
    }
}
