use super::{
    CallNode, CallNodeTable, Class, ClassRegistry, CompiledMethod, DynamicCallTable, Method,
    MethodLookup, NativeStack, SavedFrame, StackWalker, ThunkTable,
};
use crate::backend::Assembler;
use crate::jit::{compile, Environment, Error, Settings, TraceKind};
use parking_lot::Mutex;
use std::sync::Arc;

/// Where the next method's code goes
struct CodeSpace {
    next: u64,
}

impl CodeSpace {
    const ALIGNMENT: u64 = 16;

    fn allocate(&mut self, len: usize) -> u64 {
        let start = self.next;
        let len = (len.max(1) as u64 + Self::ALIGNMENT - 1) / Self::ALIGNMENT * Self::ALIGNMENT;
        self.next += len;
        start
    }
}

/// Process-wide compiler state
///
/// Any number of threads may compile at once. Compilation itself only reads shared state; the
/// result is installed under a single lock, and if two threads compiled the same method, the
/// first one to take the lock wins.
pub struct Jit {
    settings: Settings,
    thunks: ThunkTable,
    registry: ClassRegistry,
    methods: MethodLookup,
    call_nodes: CallNodeTable,
    dynamic_calls: DynamicCallTable,

    /// Serializes installing compiled code
    class_lock: Mutex<CodeSpace>,
}

impl Jit {
    /// Set up the compiler, with compiled code going at `code_base` onwards
    pub fn boot(settings: Settings, thunks: ThunkTable, code_base: u64) -> Jit {
        log::info!("booting JIT with {:?}", settings);
        let dynamic_calls = DynamicCallTable::new(settings.dynamic_call_capacity);
        Jit {
            settings,
            thunks,
            registry: ClassRegistry::new(),
            methods: MethodLookup::new(),
            call_nodes: CallNodeTable::new(),
            dynamic_calls,
            class_lock: Mutex::new(CodeSpace {
                next: (code_base + CodeSpace::ALIGNMENT - 1) / CodeSpace::ALIGNMENT
                    * CodeSpace::ALIGNMENT,
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn thunks(&self) -> &ThunkTable {
        &self.thunks
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    pub fn methods(&self) -> &MethodLookup {
        &self.methods
    }

    pub fn call_nodes(&self) -> &CallNodeTable {
        &self.call_nodes
    }

    pub fn dynamic_calls(&self) -> &DynamicCallTable {
        &self.dynamic_calls
    }

    /// Define a class (see [`ClassRegistry::define`])
    pub fn define_class(&self, class: Arc<Class>) -> Arc<Class> {
        self.registry.define(class)
    }

    pub fn environment(&self) -> Environment<'_> {
        Environment {
            settings: &self.settings,
            registry: &self.registry,
            thunks: &self.thunks,
            dynamic_calls: &self.dynamic_calls,
        }
    }

    /// Compile a method and install the result, unless it is already compiled
    ///
    /// Returns whichever compiled code ends up installed.
    pub fn compile_method<A: Assembler>(
        &self,
        class: &Arc<Class>,
        method: &Arc<Method>,
        asm: &mut A,
    ) -> Result<Arc<CompiledMethod>, Error> {
        if let Some(compiled) = method.compiled() {
            return Ok(compiled.clone());
        }

        // Compile from a private snapshot, without holding any lock
        let code = method.code().cloned().ok_or(Error::MissingCode)?;
        let compilation = match compile(self.environment(), class, method, &code, asm) {
            Ok(compilation) => compilation,
            Err(err) => {
                log::error!("failed to compile {}: {:?}", method.qualified_name(), err);
                return Err(err);
            }
        };

        let mut code_space = self.class_lock.lock();
        if let Some(compiled) = method.compiled() {
            log::debug!(
                "discarding compilation of {}: already installed",
                method.qualified_name()
            );
            return Ok(compiled.clone());
        }

        let start = code_space.allocate(compilation.code.len());
        for trace in &compilation.traces {
            if trace.kind == TraceKind::Call {
                self.call_nodes.insert(CallNode {
                    address: start + trace.offset as u64,
                    target: trace.target.clone(),
                    flags: trace.flags,
                });
            }
        }
        let compiled = Arc::new(CompiledMethod::new(
            method.qualified_name(),
            start,
            compilation.code.into_boxed_slice(),
            compilation.layout.aligned_frame_size,
            compilation.frame_maps,
            compilation.handlers,
            compilation.line_numbers,
            compilation.pool,
        ));

        // Visible to stack walks before anyone can call it
        self.methods.insert(compiled.clone());
        method.publish(compiled.clone());
        log::info!(
            "installed {} at {:#x} ({} bytes)",
            compiled.name(),
            compiled.start(),
            compiled.len()
        );
        Ok(compiled)
    }

    /// Compiled method containing a code address
    pub fn find_method(&self, address: u64) -> Option<Arc<CompiledMethod>> {
        self.methods.find(address)
    }

    /// Call node for a return address
    pub fn call_node(&self, return_address: u64) -> Option<CallNode> {
        self.call_nodes.find(return_address)
    }

    /// Walk the compiled frames of a thread, given the frames its runtime calls saved
    pub fn stack_walker<'a, S: NativeStack>(
        &'a self,
        stack: &'a S,
        saved: Vec<SavedFrame>,
    ) -> StackWalker<'a, S> {
        StackWalker::new(stack, &self.methods, self.settings.layout.word_size, saved)
    }
}
