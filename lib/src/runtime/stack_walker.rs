//! Walking the native stack
//!
//! A frame of compiled code is `aligned_frame_size` words starting at the stack pointer, with
//! frame map bit `i` describing the word at `sp + i * word_size`. The return address into the
//! caller sits right above the frame, and the caller's frame starts right above that.
//!
//! Whenever compiled code calls into the runtime, the runtime saves the instruction and stack
//! pointers of the innermost compiled frame. Those saved frames are where walking resumes when it
//! runs into a return address that isn't in compiled code.

use super::{CompiledMethod, MethodLookup};
use std::sync::Arc;

/// Read access to the memory holding the stack
pub trait NativeStack {
    fn read_word(&self, address: u64) -> Option<u64>;
}

/// Entry point into compiled code, recorded by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedFrame {
    /// Return address in compiled code
    pub ip: u64,
    pub sp: u64,
}

/// One frame of compiled code
#[derive(Debug, Clone)]
pub struct JitFrame {
    pub method: Arc<CompiledMethod>,

    /// Return address of the call that is in progress in this frame
    pub ip: u64,
    pub sp: u64,
}

impl JitFrame {
    pub fn line_number(&self) -> Option<u16> {
        self.method.line_number(self.ip)
    }

    /// Call `visitor` with the address of every slot holding a live reference
    ///
    /// Returns `false` if the frame has no frame map for its return address.
    pub fn visit_roots(&self, word_size: usize, mut visitor: impl FnMut(u64)) -> bool {
        let Some(map) = self.method.frame_map(self.ip) else {
            return false;
        };
        for bit in map.iter_ones() {
            visitor(self.sp + (bit * word_size) as u64);
        }
        true
    }
}

/// Iterator over the compiled frames of one thread, innermost first
pub struct StackWalker<'a, S: NativeStack> {
    stack: &'a S,
    methods: &'a MethodLookup,
    word_size: usize,
    saved: std::vec::IntoIter<SavedFrame>,
    next: Option<(u64, u64)>,
}

impl<'a, S: NativeStack> StackWalker<'a, S> {
    /// `saved` are the runtime's saved frames, innermost first
    pub fn new(
        stack: &'a S,
        methods: &'a MethodLookup,
        word_size: usize,
        saved: Vec<SavedFrame>,
    ) -> Self {
        let mut saved = saved.into_iter();
        let next = saved.next().map(|frame| (frame.ip, frame.sp));
        StackWalker {
            stack,
            methods,
            word_size,
            saved,
            next,
        }
    }
}

impl<'a, S: NativeStack> Iterator for StackWalker<'a, S> {
    type Item = JitFrame;

    fn next(&mut self) -> Option<JitFrame> {
        loop {
            let (ip, sp) = self.next.take()?;
            let Some(method) = self.methods.find(ip) else {
                // Left compiled code: carry on from the next entry into it
                self.next = self.saved.next().map(|frame| (frame.ip, frame.sp));
                continue;
            };

            let word = self.word_size as u64;
            let return_slot = sp + method.aligned_frame_size() as u64 * word;
            self.next = match self.stack.read_word(return_slot) {
                Some(caller_ip) => Some((caller_ip, return_slot + word)),
                None => self.saved.next().map(|frame| (frame.ip, frame.sp)),
            };
            return Some(JitFrame { method, ip, sp });
        }
    }
}
