use super::{
    analyze, translate_handlers, translate_line_numbers, Context, ContextArenas, Error,
    ExceptionRange, FrameMapTable, NativeLineNumber, PoolEntry, Settings, TraceId, TraceKind,
    Visited, Walker,
};
use crate::backend::{Assembler, CallFlags, FrameLayout};
use crate::runtime::{Class, ClassRegistry, DynamicCallTable, Method, MethodCode, ThunkTable};
use crate::util::BitMap;
use std::sync::Arc;

/// Everything outside of the method itself that compilation reads
#[derive(Copy, Clone)]
pub struct Environment<'a> {
    pub settings: &'a Settings,

    /// Classes that constant pool references can resolve to at compile time
    pub registry: &'a ClassRegistry,
    pub thunks: &'a ThunkTable,

    /// Slots for `invokedynamic` sites are reserved during compilation
    pub dynamic_calls: &'a DynamicCallTable,
}

/// Trace site with its final code offset and frame map
#[derive(Debug, Clone)]
pub struct ResolvedTrace {
    /// Duplicated offset
    pub ip: usize,

    /// Code offset of the return address (or of the instruction after the faulting one)
    pub offset: usize,
    pub kind: TraceKind,
    pub target: Option<Arc<Method>>,
    pub flags: CallFlags,
    pub map: BitMap,
}

/// Point where control flow paths join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePoint {
    /// Duplicated offset
    pub ip: usize,

    /// Number of times the walk reached this point
    pub predecessors: u32,

    /// Slots holding a reference on every path in
    pub map: BitMap,
}

/// Output of compiling one method
#[derive(Debug)]
pub struct Compilation {
    pub layout: FrameLayout,
    pub code: Vec<u8>,

    /// In creation order
    pub traces: Vec<ResolvedTrace>,

    /// In ascending order of duplicated offset
    pub merge_points: Vec<MergePoint>,
    pub handlers: Vec<ExceptionRange>,
    pub line_numbers: Vec<NativeLineNumber>,

    /// Frame maps of every trace site, keyed on return address
    pub frame_maps: FrameMapTable,
    pub pool: Vec<PoolEntry>,

    /// Bits in each frame map (locals, then operand stack slots)
    pub map_size: usize,

    /// Replays of the event log the frame map analysis needed
    pub passes: usize,

    /// Copies of the code made for `jsr` subroutines
    pub subroutines: usize,
}

/// Compile a method, given a snapshot of its code
///
/// Nothing global is modified apart from the dynamic call table (slots are reserved per site, so
/// compiling the same method twice is harmless). Publishing the result is up to the caller.
pub fn compile<A: Assembler>(
    env: Environment,
    class: &Arc<Class>,
    method: &Method,
    code: &MethodCode,
    asm: &mut A,
) -> Result<Compilation, Error> {
    let code_length = code.bytecode.len();
    let map_size = code.max_locals as usize + code.max_stack as usize;
    let arenas = ContextArenas::new();
    let mut context = Context::new(&arenas, map_size);

    let walk = Walker::new(env, class, method, code, asm, &mut context).run()?;

    let analysis = analyze(
        &context.events,
        &mut context.traces,
        &walk.visits,
        code_length,
        map_size,
        env.settings.max_frame_map_passes,
    )?;
    log::trace!(
        "{}: frame maps settled after {} passes over {} merge points",
        method.qualified_name(),
        analysis.passes,
        analysis.merge_tables.len()
    );

    let length = asm.resolve();
    let mut machine_code = vec![0; length];
    asm.write(&mut machine_code);

    for (index, trace) in context.traces.iter_mut().enumerate() {
        let offset = asm
            .trace_offset(TraceId(index))
            .ok_or(Error::UnresolvedTrace { ip: trace.ip })?;
        trace.address = Some(offset);
    }

    let visited = Visited {
        visits: &walk.visits,
        code_length,
    };
    let handlers = translate_handlers(&*asm, code, &class.constants, &visited)?;
    let line_numbers = translate_line_numbers(&*asm, code, &visited);

    let traces: Vec<ResolvedTrace> = context
        .traces
        .iter()
        .map(|trace| ResolvedTrace {
            ip: trace.ip,
            offset: trace.address.unwrap_or_default(),
            kind: trace.kind,
            target: trace.target.clone(),
            flags: trace.flags,
            map: trace.map.clone(),
        })
        .collect();
    let frame_maps =
        FrameMapTable::encode(map_size, traces.iter().map(|trace| (trace.offset, &trace.map)));
    let merge_points = analysis
        .merge_tables
        .iter()
        .map(|(ip, map)| MergePoint {
            ip,
            predecessors: walk.visits[ip],
            map: map.clone(),
        })
        .collect();

    let subroutines = context.subroutine_count();
    let pool = context.pool.into_entries();
    log::debug!(
        "compiled {}: {} bytes, {} traces, {} handlers",
        method.qualified_name(),
        machine_code.len(),
        traces.len(),
        handlers.len()
    );

    Ok(Compilation {
        layout: walk.layout,
        code: machine_code,
        traces,
        merge_points,
        handlers,
        line_numbers,
        frame_maps,
        pool,
        map_size,
        passes: analysis.passes,
        subroutines,
    })
}
