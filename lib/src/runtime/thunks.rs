use crate::jit::Error;
use crate::jvm::{BinaryName, ConstantIndex, InvokeType, ValueKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Trampolines generated once per process and called into from compiled code
///
/// The compiler only ever emits calls to these; their machine bodies belong to the embedder.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Thunk {
    /// Compile the callee (recorded in the call node for the return address) and patch the site
    DefaultCompile,

    /// Resolve a virtual call, then install the target in the receiver class's vtable
    DefaultVirtual,

    /// Bootstrap an `invokedynamic` site and install the target in its dynamic call table slot
    DefaultDynamic,

    /// Marshal arguments for a `native` method
    NativeInvoke,

    ArrayBoundsException,
    StackOverflowException,

    /// Enter the method whose address is in the thread's tail address slot, reusing the frame
    TailCall,
}

impl Thunk {
    pub const ALL: [Thunk; 7] = [
        Thunk::DefaultCompile,
        Thunk::DefaultVirtual,
        Thunk::DefaultDynamic,
        Thunk::NativeInvoke,
        Thunk::ArrayBoundsException,
        Thunk::StackOverflowException,
        Thunk::TailCall,
    ];

    /// Fixed index in the thunk table
    pub const fn index(self) -> usize {
        match self {
            Thunk::DefaultCompile => 0,
            Thunk::DefaultVirtual => 1,
            Thunk::DefaultDynamic => 2,
            Thunk::NativeInvoke => 3,
            Thunk::ArrayBoundsException => 4,
            Thunk::StackOverflowException => 5,
            Thunk::TailCall => 6,
        }
    }
}

/// Addresses of the thunks: entry `n` is at `base + n * entry_size`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ThunkTable {
    base: u64,
    entry_size: u64,
}

impl ThunkTable {
    pub const fn new(base: u64, entry_size: u64) -> ThunkTable {
        ThunkTable { base, entry_size }
    }

    pub fn address(&self, thunk: Thunk) -> u64 {
        self.base + thunk.index() as u64 * self.entry_size
    }

    /// Which thunk (if any) starts exactly at `address`?
    pub fn thunk_at(&self, address: u64) -> Option<Thunk> {
        let offset = address.checked_sub(self.base)?;
        if self.entry_size == 0 || offset % self.entry_size != 0 {
            return None;
        }
        Thunk::ALL.get((offset / self.entry_size) as usize).copied()
    }

    /// Is `address` anywhere inside one of the thunks?
    pub fn contains(&self, address: u64) -> bool {
        let end = self.base + Thunk::ALL.len() as u64 * self.entry_size;
        (self.base..end).contains(&address)
    }
}

/// Runtime support routines called from compiled code
///
/// Unlike thunks, these are ordinary calls that return to the caller. Routines taking a constant
/// pool reference resolve it lazily (and may throw a linkage error at run time).
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Routine {
    /// Safe point poll: collect garbage or pause if another thread asked for it
    GcIfNecessary,

    /// Run `<clinit>` if the class is not yet initialized
    InitClass,

    MakeNew,
    MakeBlankArray,
    MakeBlankObjectArray,
    MakeMultiArray,
    CheckCast,
    InstanceOf,
    Throw,
    AcquireMonitor,
    ReleaseMonitor,

    /// Load and link the class named by a constant pool entry, returning the class object
    ResolveClass,

    /// Materialize a `String`, `Class`, `MethodType` or `MethodHandle` constant
    ResolveConstant,

    /// Resolve a method reference and return the address to call
    FindMethodFromReference(InvokeType),

    /// Find the implementation of an interface method in the receiver's class
    FindInterfaceMethodFromInstance,

    GetFieldFromReference(ValueKind),
    SetFieldFromReference(ValueKind),
    GetStaticFromReference(ValueKind),
    SetStaticFromReference(ValueKind),
}

/// Process-wide table of `invokedynamic` call site targets
///
/// Each site gets a slot holding the address to call, initialised to the default dynamic thunk
/// and overwritten once the site is bootstrapped. Slots are never removed, and their count is
/// fixed at boot so that compiled code can embed slot addresses.
pub struct DynamicCallTable {
    slots: Box<[AtomicU64]>,

    /// Which slot each call site has reserved, keyed on the declaring class and constant index
    sites: Mutex<HashMap<(BinaryName, ConstantIndex), usize>>,
}

impl DynamicCallTable {
    pub fn new(capacity: usize) -> DynamicCallTable {
        DynamicCallTable {
            slots: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            sites: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of reserved slots
    pub fn len(&self) -> usize {
        self.sites.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the slot for a call site, reserving (and initialising) a fresh one if needed
    ///
    /// Compiling the same method twice must land on the same slot, hence the keying on site.
    pub fn reserve(
        &self,
        class: &BinaryName,
        index: ConstantIndex,
        initial_target: u64,
    ) -> Result<usize, Error> {
        let mut sites = self.sites.lock();
        let key = (class.clone(), index);
        if let Some(slot) = sites.get(&key) {
            return Ok(*slot);
        }
        let slot = sites.len();
        if slot >= self.slots.len() {
            return Err(Error::DynamicTableFull {
                capacity: self.slots.len(),
            });
        }
        self.slots[slot].store(initial_target, Ordering::Release);
        sites.insert(key, slot);
        Ok(slot)
    }

    /// Address of the slot itself, relative to the start of the table
    pub fn slot_offset(slot: usize) -> u64 {
        (slot * std::mem::size_of::<u64>()) as u64
    }

    /// Absolute address of a slot, for compiled code to load the target from
    pub fn slot_address(&self, slot: usize) -> Option<u64> {
        self.slots
            .get(slot)
            .map(|target| target as *const AtomicU64 as u64)
    }

    pub fn target(&self, slot: usize) -> Option<u64> {
        self.slots
            .get(slot)
            .map(|target| target.load(Ordering::Acquire))
    }

    /// Install a bootstrapped target (returns `false` if there is no such slot)
    pub fn set_target(&self, slot: usize, address: u64) -> bool {
        match self.slots.get(slot) {
            Some(target) => {
                target.store(address, Ordering::Release);
                true
            }
            None => false,
        }
    }
}
