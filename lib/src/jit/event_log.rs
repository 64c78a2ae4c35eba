use super::TraceId;

/// Facts recorded during the walk, replayed by the frame-map analysis
///
/// Slot numbers are frame map bit indices: translated locals first, then operand stack slots.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Start of a branch target (or switch case) walked as a nested path
    EnterContext,

    /// End of the innermost nested path (or exception handler)
    LeaveContext,

    /// Instruction boundary at a duplicated offset
    Ip(usize),

    /// Slot now holds a reference
    Mark(usize),

    /// Slot now holds something other than a reference
    Clear(usize),

    /// Start of an exception handler protecting `start..end` (offsets into the bytecode)
    EnterExceptionRegion { start: usize, end: usize },

    /// Trace site, whose frame map is whatever the roots are at this point
    Trace(TraceId),
}

/// Append-only sequence of [`Event`]s
#[derive(Debug, Default, Clone)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    pub fn new() -> EventLog {
        EventLog::default()
    }

    pub fn append(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Does any exception handler consume trace frame maps?
    pub fn has_exception_regions(&self) -> bool {
        self.events
            .iter()
            .any(|event| matches!(event, Event::EnterExceptionRegion { .. }))
    }
}
