use crate::jvm::{BinaryName, UnqualifiedName};
use std::fmt::{Debug, Error as FmtError, Formatter};

pub struct Settings {
    /// The target architecture can reuse the caller's frame for a call
    ///
    /// Even when this is set, a call is only compiled as a tail call if the caller is not
    /// `synchronized`, the call is not in a try block, the call is immediately followed by a
    /// return of a compatible type, and the classpath policy allows it.
    pub tail_calls: bool,

    /// Calls might not reach their targets with a direct call instruction
    pub long_calls: bool,

    /// Emit array bounds checks
    pub bounds_checks: bool,

    /// Frames are padded to a multiple of this many words
    pub stack_alignment: usize,

    /// Upper limit on the number of times the frame-map analysis replays the event log
    ///
    /// Frame maps only ever narrow, so the analysis always terminates, but a method with many
    /// nested loops can take a lot of passes. Hitting the limit fails the compilation.
    pub max_frame_map_passes: usize,

    /// Number of slots in the dynamic call table (`invokedynamic` sites across the process)
    pub dynamic_call_capacity: usize,

    /// Where things are in heap objects, for inline field, array and vtable accesses
    pub layout: ObjectLayout,

    /// Caller-sensitive methods that must not be entered through a tail call
    pub classpath: Box<dyn ClasspathPolicy + Send + Sync>,
}

impl Settings {
    pub fn new() -> Settings {
        Settings {
            tail_calls: true,
            long_calls: false,
            bounds_checks: true,
            stack_alignment: 2,
            max_frame_map_passes: 64,
            dynamic_call_capacity: 4096,
            layout: ObjectLayout::default(),
            classpath: Box::new(DefaultClasspathPolicy),
        }
    }

    /// Round a frame size (in words, excluding the return address) up to the stack alignment
    ///
    /// The return address is pushed by the call, so it counts towards alignment.
    pub fn align_frame_size(&self, size: usize) -> usize {
        let alignment = self.stack_alignment.max(1);
        let with_return = size + 1;
        let aligned = (with_return + alignment - 1) / alignment * alignment;
        aligned - 1
    }
}

impl Default for Settings {
    fn default() -> Settings {
        Settings::new()
    }
}

impl Debug for Settings {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Settings")
            .field("tail_calls", &self.tail_calls)
            .field("long_calls", &self.long_calls)
            .field("bounds_checks", &self.bounds_checks)
            .field("stack_alignment", &self.stack_alignment)
            .field("max_frame_map_passes", &self.max_frame_map_passes)
            .field("dynamic_call_capacity", &self.dynamic_call_capacity)
            .field("layout", &self.layout)
            .finish()
    }
}

/// Offsets (in bytes) into heap objects and the thread structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectLayout {
    /// Size of a native pointer
    pub word_size: usize,

    /// Size of a reference stored in a field or array
    pub reference_size: usize,

    /// Size of the header that precedes the first field of every object
    pub header_size: usize,

    /// Where an object stores a pointer to its class
    pub class_pointer_offset: i32,

    /// Where the vtable starts inside a class
    pub vtable_offset: i32,

    pub array_length_offset: i32,
    pub array_body_offset: i32,

    /// Where a thread stores the target of a pending tail call
    pub thread_tail_address_offset: i32,

    /// Where a thread stores the exception being delivered to a handler
    pub thread_exception_offset: i32,
}

impl Default for ObjectLayout {
    fn default() -> ObjectLayout {
        ObjectLayout {
            word_size: 8,
            reference_size: 8,
            header_size: 8,
            class_pointer_offset: 0,
            vtable_offset: 64,
            array_length_offset: 8,
            array_body_offset: 16,
            thread_tail_address_offset: 32,
            thread_exception_offset: 40,
        }
    }
}

/// Decides which callees are off limits for tail calls
///
/// Some library methods inspect their caller's frame (`Reflection.getCallerClass`,
/// `System.loadLibrary`, ...). If the caller's frame had been replaced by a tail call, they would
/// see the wrong class.
pub trait ClasspathPolicy {
    fn can_tail_call(
        &self,
        caller_class: &BinaryName,
        callee_class: &BinaryName,
        callee_name: &UnqualifiedName,
    ) -> bool;
}

/// Rejects the caller-sensitive methods of the standard class library
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClasspathPolicy;

impl ClasspathPolicy for DefaultClasspathPolicy {
    fn can_tail_call(
        &self,
        _caller_class: &BinaryName,
        callee_class: &BinaryName,
        callee_name: &UnqualifiedName,
    ) -> bool {
        let reflection =
            callee_class == &BinaryName::JDK_REFLECTION || callee_class == &BinaryName::SUN_REFLECTION;
        let loader = callee_class == &BinaryName::SYSTEM || callee_class == &BinaryName::RUNTIME;

        !(reflection && callee_name == &UnqualifiedName::GETCALLERCLASS
            || loader
                && (callee_name == &UnqualifiedName::LOAD
                    || callee_name == &UnqualifiedName::LOADLIBRARY))
    }
}
