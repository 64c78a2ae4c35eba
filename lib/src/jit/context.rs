use super::{Event, EventLog};
use crate::backend::CallFlags;
use crate::jvm::ConstantIndex;
use crate::runtime::{Class, Method};
use crate::util::{BitMap, RefId};
use std::collections::HashMap;
use std::fmt::{Debug, Error as FmtError, Formatter};
use std::sync::Arc;
use typed_arena::Arena;

/// Allocation arenas for one compilation
///
/// Everything allocated here is freed in one go when the compilation ends, whether or not it
/// succeeded.
pub struct ContextArenas<'c> {
    subroutine_arena: Arena<Subroutine<'c>>,
}

impl<'c> ContextArenas<'c> {
    pub fn new() -> Self {
        ContextArenas {
            subroutine_arena: Arena::new(),
        }
    }
}

impl<'c> Default for ContextArenas<'c> {
    fn default() -> Self {
        ContextArenas::new()
    }
}

/// One entered copy of a `jsr` target
///
/// Each `jsr` gets its own copy of the whole logical code, so that the subroutine body is
/// compiled against the types live at that particular call site. Copy `n` lives at duplicated
/// offsets `n * code_length .. (n + 1) * code_length`.
#[derive(Debug)]
pub struct Subroutine<'c> {
    /// Copy number (the code outside of any subroutine is copy 0)
    pub index: usize,

    /// Subroutine active at the `jsr`
    pub outer: Option<&'c Subroutine<'c>>,

    /// Bytecode offset the `jsr` jumps to
    pub entry: usize,

    /// Duplicated offset at which `ret` resumes (in the outer copy)
    pub return_address: usize,

    /// Duplicated offset of bytecode offset 0 in this copy
    pub duplicated_base: usize,
}

/// Index of a trace element in its compilation
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TraceId(pub usize);

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum TraceKind {
    /// Call instruction (to a method, thunk, or runtime routine)
    Call,

    /// Instruction in a try block that can throw without calling anything
    Fault,
}

/// Frame map site: a call, or a faulting instruction inside a try block
pub struct TraceElement {
    /// Duplicated offset of the instruction
    pub ip: usize,
    pub kind: TraceKind,

    /// Directly called method, if known at compile time (never set for virtual calls)
    pub target: Option<Arc<Method>>,
    pub flags: CallFlags,

    /// Offset of the return address in the code, once the back end has resolved it
    pub address: Option<usize>,

    /// Frame map (all ones until the analysis narrows it)
    pub map: BitMap,
}

impl Debug for TraceElement {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("TraceElement")
            .field("ip", &self.ip)
            .field("kind", &self.kind)
            .field(
                "target",
                &self.target.as_ref().map(|target| target.qualified_name()),
            )
            .field("flags", &self.flags)
            .field("address", &self.address)
            .field("map", &self.map)
            .finish()
    }
}

/// Heap objects that compiled code refers to
///
/// The compiled method keeps these alive. Generated code addresses them by pool index.
#[derive(Clone)]
pub enum PoolEntry {
    /// The class object itself
    Class(Arc<Class>),

    /// The table holding the static fields of a class
    StaticTable(Arc<Class>),

    /// String literal
    String(String),

    /// Symbolic constant pool entry of the class being compiled, for lazy resolution
    Reference { class: Arc<Class>, index: ConstantIndex },
}

impl Debug for PoolEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            PoolEntry::Class(class) => write!(f, "Class({})", class.name),
            PoolEntry::StaticTable(class) => write!(f, "StaticTable({})", class.name),
            PoolEntry::String(string) => write!(f, "String({:?})", string),
            PoolEntry::Reference { class, index } => {
                write!(f, "Reference({}#{})", class.name, index.0)
            }
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
enum PoolKey<'c> {
    Class(RefId<'c, Class>),
    StaticTable(RefId<'c, Class>),
    String(&'c str),
    Reference(ConstantIndex),
}

/// Deduplicated [`PoolEntry`]s, keyed on identity
pub struct ObjectPool<'c> {
    entries: Vec<PoolEntry>,
    indices: HashMap<PoolKey<'c>, usize>,
}

impl<'c> ObjectPool<'c> {
    pub fn new() -> Self {
        ObjectPool {
            entries: vec![],
            indices: HashMap::new(),
        }
    }

    fn intern(&mut self, key: PoolKey<'c>, make_entry: impl FnOnce() -> PoolEntry) -> usize {
        let entries = &mut self.entries;
        *self.indices.entry(key).or_insert_with(|| {
            entries.push(make_entry());
            entries.len() - 1
        })
    }

    pub fn class(&mut self, class: &'c Arc<Class>) -> usize {
        self.intern(PoolKey::Class(RefId(&**class)), || {
            PoolEntry::Class(class.clone())
        })
    }

    pub fn static_table(&mut self, class: &'c Arc<Class>) -> usize {
        self.intern(PoolKey::StaticTable(RefId(&**class)), || {
            PoolEntry::StaticTable(class.clone())
        })
    }

    pub fn string(&mut self, string: &'c str) -> usize {
        self.intern(PoolKey::String(string), || {
            PoolEntry::String(string.to_owned())
        })
    }

    /// Constant pool entry of `class`, which must be the class being compiled
    pub fn reference(&mut self, class: &'c Arc<Class>, index: ConstantIndex) -> usize {
        self.intern(PoolKey::Reference(index), || PoolEntry::Reference {
            class: class.clone(),
            index,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<PoolEntry> {
        self.entries
    }
}

impl<'c> Default for ObjectPool<'c> {
    fn default() -> Self {
        ObjectPool::new()
    }
}

/// State of one in-flight compilation
pub struct Context<'c> {
    arenas: &'c ContextArenas<'c>,
    pub events: EventLog,
    pub traces: Vec<TraceElement>,
    pub pool: ObjectPool<'c>,
    subroutine_count: usize,

    /// Bits in every frame map (`max_locals + max_stack`)
    map_size: usize,
}

impl<'c> Context<'c> {
    pub fn new(arenas: &'c ContextArenas<'c>, map_size: usize) -> Self {
        Context {
            arenas,
            events: EventLog::new(),
            traces: vec![],
            pool: ObjectPool::new(),
            subroutine_count: 0,
            map_size,
        }
    }

    pub fn map_size(&self) -> usize {
        self.map_size
    }

    pub fn subroutine_count(&self) -> usize {
        self.subroutine_count
    }

    /// Register a trace site at the current point of the event log
    pub fn new_trace(
        &mut self,
        ip: usize,
        kind: TraceKind,
        target: Option<Arc<Method>>,
        flags: CallFlags,
    ) -> TraceId {
        let id = TraceId(self.traces.len());
        self.traces.push(TraceElement {
            ip,
            kind,
            target,
            flags,
            address: None,
            map: BitMap::filled(self.map_size),
        });
        self.events.append(Event::Trace(id));
        id
    }

    pub fn trace(&self, id: TraceId) -> &TraceElement {
        &self.traces[id.0]
    }

    /// Allocate the next subroutine copy
    pub fn new_subroutine(
        &mut self,
        outer: Option<&'c Subroutine<'c>>,
        entry: usize,
        return_address: usize,
        code_length: usize,
    ) -> &'c Subroutine<'c> {
        self.subroutine_count += 1;
        let index = self.subroutine_count;
        self.arenas.subroutine_arena.alloc(Subroutine {
            index,
            outer,
            entry,
            return_address,
            duplicated_base: index * code_length,
        })
    }
}
