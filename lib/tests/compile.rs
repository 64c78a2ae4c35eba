use classjit::backend::{
    Assembler, Barrier, CallFlags, CallTarget, Immediate, MemoryKind, Op, RecordingAssembler,
};
use classjit::jit::{self, Error, MergePoint, Settings};
use classjit::jvm::class_file::{ExceptionHandler, LineNumber};
use classjit::jvm::*;
use classjit::runtime::*;
use classjit::util::BitMap;
use std::collections::HashMap;
use std::sync::Arc;

const CLASS: &str = "demo/Calls";

fn name<N: Name>(name: &str) -> N {
    N::from_str(name).unwrap()
}

fn boot(settings: Settings) -> Jit {
    Jit::boot(settings, ThunkTable::new(0x10_0000, 0x40), 0x40_0000)
}

fn code(max_stack: u16, max_locals: u16, bytecode: Vec<u8>) -> MethodCode {
    MethodCode {
        max_stack,
        max_locals,
        bytecode,
        handlers: vec![],
        line_numbers: vec![],
    }
}

/// Big-endian operand bytes of a constant pool index
fn operand(index: ConstantIndex) -> [u8; 2] {
    index.0.to_be_bytes()
}

/// Constant pool indices of the helper methods every test class declares
struct Helpers {
    tick: ConstantIndex,
    callee: ConstantIndex,
}

/// Define `demo/Calls`, with `static void tick()`, `static int callee(int)`, and whatever else
/// `add_methods` declares
fn define(jit: &Jit, add_methods: impl FnOnce(&mut ClassBuilder, &Helpers)) -> Arc<Class> {
    let class_name: BinaryName = name(CLASS);
    let mut builder = ClassBuilder::new(class_name.clone(), ClassAccessFlags::PUBLIC, None);
    let helpers = Helpers {
        tick: builder
            .constants()
            .get_method_ref(&class_name, &name("tick"), "()V", false)
            .unwrap(),
        callee: builder
            .constants()
            .get_method_ref(&class_name, &name("callee"), "(I)I", false)
            .unwrap(),
    };
    builder
        .add_method(
            name("tick"),
            MethodDescriptor::parse("()V").unwrap(),
            MethodAccessFlags::STATIC,
            Some(code(0, 0, vec![0xb1])),
        )
        .add_method(
            name("callee"),
            MethodDescriptor::parse("(I)I").unwrap(),
            MethodAccessFlags::STATIC,
            Some(code(1, 1, vec![0x1a, 0xac])),
        );
    add_methods(&mut builder, &helpers);
    jit.define_class(builder.build(&jit.settings().layout))
}

fn static_method(
    builder: &mut ClassBuilder,
    method_name: &str,
    descriptor: &str,
    code: MethodCode,
) {
    builder.add_method(
        name(method_name),
        MethodDescriptor::parse(descriptor).unwrap(),
        MethodAccessFlags::STATIC,
        Some(code),
    );
}

fn method(class: &Arc<Class>, method_name: &str, descriptor: &str) -> Arc<Method> {
    class
        .declared_method(&name(method_name), descriptor)
        .unwrap()
        .clone()
}

/// Compile without installing anything
fn compile_only(
    jit: &Jit,
    class: &Arc<Class>,
    method: &Method,
) -> (Result<jit::Compilation, Error>, RecordingAssembler) {
    let mut asm = RecordingAssembler::new();
    let code = method.code().unwrap().clone();
    let result = jit::compile(jit.environment(), class, method, &code, &mut asm);
    (result, asm)
}

/// Targets and flags of every call, in layout order
fn calls(asm: &RecordingAssembler) -> Vec<(CallTarget<usize>, CallFlags)> {
    asm.ops()
        .into_iter()
        .filter_map(|op| match op {
            Op::Call { target, flags, .. } => Some((*target, *flags)),
            _ => None,
        })
        .collect()
}

fn bits(len: usize, ones: &[usize]) -> BitMap {
    let mut map = BitMap::zeros(len);
    for one in ones {
        map.set(*one);
    }
    map
}

// static int choose(int a, int b) { return a > 0 ? a + b : a - b; }
const TERNARY: [u8; 14] = [
    0x1a, // 0: iload_0
    0x9e, 0x00, 0x09, // 1: ifle 10
    0x1a, // 4: iload_0
    0x1b, // 5: iload_1
    0x60, // 6: iadd
    0xa7, 0x00, 0x06, // 7: goto 13
    0x1a, // 10: iload_0
    0x1b, // 11: iload_1
    0x64, // 12: isub
    0xac, // 13: ireturn
];

#[test]
fn ternary_compiles_and_installs() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, _| {
        static_method(builder, "choose", "(II)I", code(2, 2, TERNARY.to_vec()))
    });
    let choose = method(&class, "choose", "(II)I");

    let (compilation, asm) = compile_only(&jit, &class, &choose);
    let compilation = compilation.unwrap();
    assert_eq!(
        asm.visited_ips().collect::<Vec<_>>(),
        vec![0, 1, 4, 5, 6, 7, 10, 11, 12, 13]
    );
    assert!(asm.ops_at(1).iter().any(|op| matches!(
        op,
        Op::CondJump(OrdComparison::LE, ValueKind::Int, _, _, 10)
    )));
    assert_eq!(
        compilation.merge_points,
        vec![MergePoint {
            ip: 13,
            predecessors: 2,
            map: BitMap::zeros(4),
        }]
    );
    assert!(compilation.traces.is_empty());
    assert!(compilation.frame_maps.is_empty());
    assert_eq!(compilation.layout.aligned_frame_size, 5);
    assert_eq!(compilation.passes, 1);

    // Compiling for real installs the code where stack walks find it
    let compiled = jit
        .compile_method(&class, &choose, &mut RecordingAssembler::new())
        .unwrap();
    assert!(Arc::ptr_eq(choose.compiled().unwrap(), &compiled));
    assert_eq!(compiled.name(), "demo/Calls.choose(II)I");
    assert_eq!(compiled.start() % 16, 0);
    assert!(compiled.start() >= 0x40_0000);
    assert_eq!(compiled.len(), compilation.code.len());
    let found = jit.find_method(compiled.start() + 3).unwrap();
    assert!(Arc::ptr_eq(&found, &compiled));
    assert!(jit.find_method(compiled.end()).is_none());
}

// static void pick(int a) { Object o; int i; if (a > 0) i = 0 else o = null; tick(); }
//
// Local 1 is a reference on the first path walked and an int on the second, so the call after
// the merge sees no live references, but only once the second path is replayed.
fn local_kinds(tick: ConstantIndex) -> Vec<u8> {
    let [hi, lo] = operand(tick);
    vec![
        0x1a, // 0: iload_0
        0x9e, 0x00, 0x08, // 1: ifle 9
        0x03, // 4: iconst_0
        0x3c, // 5: istore_1
        0xa7, 0x00, 0x05, // 6: goto 11
        0x01, // 9: aconst_null
        0x4c, // 10: astore_1
        0xb8, hi, lo, // 11: invokestatic tick
        0xb1, // 14: return
    ]
}

#[test]
fn merges_narrow_frame_maps() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, helpers| {
        static_method(builder, "pick", "(I)V", code(1, 2, local_kinds(helpers.tick)))
    });
    let pick = method(&class, "pick", "(I)V");

    let (compilation, _) = compile_only(&jit, &class, &pick);
    let compilation = compilation.unwrap();
    assert_eq!(compilation.map_size, 3);
    assert_eq!(compilation.passes, 2);
    assert_eq!(
        compilation.merge_points,
        vec![MergePoint {
            ip: 11,
            predecessors: 2,
            map: BitMap::zeros(3),
        }]
    );

    assert_eq!(compilation.traces.len(), 1);
    let trace = &compilation.traces[0];
    assert_eq!(trace.ip, 11);
    assert_eq!(trace.kind, jit::TraceKind::Call);
    assert_eq!(trace.map, BitMap::zeros(3));
    let target = trace.target.as_ref().unwrap();
    assert_eq!(target.qualified_name(), "demo/Calls.tick()V");
}

#[test]
fn frame_map_passes_are_bounded() {
    let settings = Settings {
        max_frame_map_passes: 1,
        ..Settings::new()
    };
    let jit = boot(settings);
    let class = define(&jit, |builder, helpers| {
        static_method(builder, "pick", "(I)V", code(1, 2, local_kinds(helpers.tick)))
    });
    let pick = method(&class, "pick", "(I)V");

    let result = jit.compile_method(&class, &pick, &mut RecordingAssembler::new());
    assert!(matches!(result, Err(Error::FrameMapDivergence { passes: 1 })));
    assert!(pick.compiled().is_none());
    assert!(jit.methods().is_empty());
    assert!(jit.call_nodes().is_empty());
}

#[test]
fn subroutines_are_compiled_per_call_site() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, helpers| {
        let [hi, lo] = operand(helpers.tick);
        let bytecode = vec![
            0x01, // 0: aconst_null
            0x4d, // 1: astore_2
            0xa8, 0x00, 0x09, // 2: jsr 11
            0x03, // 5: iconst_0
            0x3d, // 6: istore_2
            0xa8, 0x00, 0x04, // 7: jsr 11
            0xb1, // 10: return
            0x4c, // 11: astore_1
            0xb8, hi, lo, // 12: invokestatic tick
            0xa9, 0x01, // 15: ret 1
        ];
        static_method(builder, "twice", "()V", code(1, 3, bytecode))
    });
    let twice = method(&class, "twice", "()V");

    let (compilation, asm) = compile_only(&jit, &class, &twice);
    let compilation = compilation.unwrap();
    assert_eq!(compilation.subroutines, 2);
    assert_eq!(asm.logical_length(), 3 * 17);
    assert_eq!(
        asm.visited_ips().collect::<Vec<_>>(),
        vec![0, 1, 2, 5, 6, 7, 10, 28, 29, 32, 45, 46, 49]
    );

    // Same call, different copies: only the first sees the reference in local 2
    let traces: Vec<(usize, &BitMap)> = compilation
        .traces
        .iter()
        .map(|trace| (trace.ip, &trace.map))
        .collect();
    assert_eq!(traces, vec![(29, &bits(4, &[2])), (46, &bits(4, &[]))]);
    assert_ne!(compilation.traces[0].offset, compilation.traces[1].offset);

    // Both sites get a call node naming the callee
    let compiled = jit
        .compile_method(&class, &twice, &mut RecordingAssembler::new())
        .unwrap();
    assert_eq!(compiled.frame_maps().len(), 2);
    for (offset, _) in compiled.frame_maps().iter() {
        let node = jit.call_node(compiled.start() + offset as u64).unwrap();
        assert_eq!(
            node.target.map(|target| target.qualified_name()),
            Some(String::from("demo/Calls.tick()V"))
        );
    }
}

#[test]
fn ret_outside_subroutine_is_rejected() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, _| {
        static_method(builder, "bad", "()V", code(1, 2, vec![0xa9, 0x01]))
    });
    let bad = method(&class, "bad", "()V");
    let (result, _) = compile_only(&jit, &class, &bad);
    assert!(matches!(result, Err(Error::RetOutsideSubroutine { ip: 0 })));
}

#[test]
fn recursive_subroutines_are_rejected() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, _| {
        let bytecode = vec![
            0xa8, 0x00, 0x03, // 0: jsr 3
            0x4b, // 3: astore_0
            0xa8, 0xff, 0xff, // 4: jsr 3
            0xb1, // 7: return
        ];
        static_method(builder, "again", "()V", code(1, 1, bytecode))
    });
    let again = method(&class, "again", "()V");
    let (result, _) = compile_only(&jit, &class, &again);
    assert!(matches!(
        result,
        Err(Error::RecursiveSubroutine { ip: 4, target: 3 })
    ));
}

#[test]
fn handlers_inside_subroutines_are_copied() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, helpers| {
        let [hi, lo] = operand(helpers.tick);
        let mut body = code(
            1,
            1,
            vec![
                0xa8, 0x00, 0x09, // 0: jsr 9
                0xa8, 0x00, 0x06, // 3: jsr 9
                0xb1, // 6: return
                0x57, // 7: pop
                0xb1, // 8: return
                0x4b, // 9: astore_0
                0xb8, hi, lo, // 10: invokestatic tick
                0xa9, 0x00, // 13: ret 0
            ],
        );
        body.handlers.push(ExceptionHandler {
            start_pc: 10,
            end_pc: 13,
            handler_pc: 7,
            catch_type: None,
        });
        static_method(builder, "guardedTwice", "()V", body);
    });
    let guarded = method(&class, "guardedTwice", "()V");

    let (compilation, asm) = compile_only(&jit, &class, &guarded);
    let compilation = compilation.unwrap();
    assert_eq!(compilation.subroutines, 2);
    assert_eq!(
        asm.visited_ips().collect::<Vec<_>>(),
        vec![0, 3, 6, 7, 8, 24, 25, 28, 39, 40, 43]
    );
    let trace_ips: Vec<usize> = compilation.traces.iter().map(|trace| trace.ip).collect();
    assert_eq!(trace_ips, vec![25, 40]);

    // One range per copy, each around nothing but that copy's call
    let ranges: Vec<(usize, usize)> = compilation
        .handlers
        .iter()
        .map(|range| (range.start, range.end))
        .collect();
    let expected: Vec<(usize, usize)> = [25, 40]
        .iter()
        .map(|ip| {
            (
                asm.machine_offset(*ip).unwrap(),
                asm.machine_end_offset(*ip).unwrap(),
            )
        })
        .collect();
    assert_eq!(ranges, expected);
    for range in &compilation.handlers {
        assert_eq!(range.handler, asm.machine_offset(7).unwrap());
        assert_eq!(range.catch_type, None);
    }

    let (first, second) = (&compilation.handlers[0], &compilation.handlers[1]);
    let (first_call, second_call) = (&compilation.traces[0], &compilation.traces[1]);
    assert!(first.covers_return_address(first_call.offset));
    assert!(!first.covers_return_address(second_call.offset));
    assert!(second.covers_return_address(second_call.offset));
    assert!(!second.covers_return_address(first_call.offset));
    assert!(first.end <= asm.machine_offset(39).unwrap());
    assert!(second.start >= asm.machine_end_offset(28).unwrap());
}

fn forward(callee: ConstantIndex) -> Vec<u8> {
    let [hi, lo] = operand(callee);
    vec![0x1a, 0xb8, hi, lo, 0xac] // iload_0; invokestatic callee; ireturn
}

#[test]
fn tail_calls() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, helpers| {
        let [hi, lo] = operand(helpers.callee);
        static_method(builder, "forward", "(I)I", code(1, 1, forward(helpers.callee)));

        // Reaching the return through a goto still counts
        let via_goto = vec![0x1a, 0xb8, hi, lo, 0xa7, 0x00, 0x03, 0xac];
        static_method(builder, "viaGoto", "(I)I", code(1, 1, via_goto));

        builder.add_method(
            name("locked"),
            MethodDescriptor::parse("(I)I").unwrap(),
            MethodAccessFlags::STATIC | MethodAccessFlags::SYNCHRONIZED,
            Some(code(1, 1, forward(helpers.callee))),
        );

        // The caller returns nothing, so the result is dropped: not a tail call
        let discard = vec![0x1a, 0xb8, hi, lo, 0xb1];
        static_method(builder, "discard", "(I)V", code(1, 1, discard));

        // Something happens after the call
        let plus_one = vec![0x1a, 0xb8, hi, lo, 0x04, 0x60, 0xac];
        static_method(builder, "plusOne", "(I)I", code(2, 1, plus_one));
    });

    let compile = |method_name: &str, descriptor: &str| {
        let (result, asm) = compile_only(&jit, &class, &method(&class, method_name, descriptor));
        result.unwrap();
        calls(&asm)
    };
    let direct = CallTarget::Thunk(Thunk::DefaultCompile);

    assert_eq!(
        compile("forward", "(I)I"),
        vec![(CallTarget::Thunk(Thunk::TailCall), CallFlags::TAIL_CALL)]
    );
    assert_eq!(
        compile("viaGoto", "(I)I"),
        vec![(CallTarget::Thunk(Thunk::TailCall), CallFlags::TAIL_CALL)]
    );
    assert_eq!(
        compile("locked", "(I)I"),
        vec![
            (CallTarget::Routine(Routine::AcquireMonitor), CallFlags::empty()),
            (direct, CallFlags::empty()),
            (CallTarget::Routine(Routine::ReleaseMonitor), CallFlags::empty()),
        ]
    );
    assert_eq!(compile("discard", "(I)V"), vec![(direct, CallFlags::empty())]);
    assert_eq!(compile("plusOne", "(I)I"), vec![(direct, CallFlags::empty())]);
}

#[test]
fn tail_call_stores_the_target_in_the_thread() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, helpers| {
        static_method(builder, "forward", "(I)I", code(1, 1, forward(helpers.callee)))
    });
    let (result, asm) = compile_only(&jit, &class, &method(&class, "forward", "(I)I"));
    result.unwrap();

    let compile_thunk = jit.thunks().address(Thunk::DefaultCompile);
    let layout = jit.settings().layout;
    let ops = asm.ops_at(1);
    let address = ops.iter().find_map(|op| match op {
        Op::Constant(value, Immediate::Address(address))
            if *address == compile_thunk =>
        {
            Some(*value)
        }
        _ => None,
    });
    let address = address.unwrap();
    assert!(ops.iter().any(|op| matches!(
        op,
        Op::Store(MemoryKind::Word, memory, value)
            if *value == address && memory.offset == layout.thread_tail_address_offset
    )));
}

#[test]
fn tail_calls_can_be_disabled() {
    let settings = Settings {
        tail_calls: false,
        ..Settings::new()
    };
    let jit = boot(settings);
    let class = define(&jit, |builder, helpers| {
        static_method(builder, "forward", "(I)I", code(1, 1, forward(helpers.callee)))
    });
    let (result, asm) = compile_only(&jit, &class, &method(&class, "forward", "(I)I"));
    result.unwrap();
    assert_eq!(
        calls(&asm),
        vec![(CallTarget::Thunk(Thunk::DefaultCompile), CallFlags::empty())]
    );
}

#[test]
fn tail_call_sites_are_flagged() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, helpers| {
        let [hi, lo] = operand(helpers.callee);
        static_method(builder, "forward", "(I)I", code(1, 1, forward(helpers.callee)));
        let plus_one = vec![0x1a, 0xb8, hi, lo, 0x04, 0x60, 0xac];
        static_method(builder, "plusOne", "(I)I", code(2, 1, plus_one));
    });
    let forward = method(&class, "forward", "(I)I");
    let plus_one = method(&class, "plusOne", "(I)I");

    let (compilation, _) = compile_only(&jit, &class, &forward);
    let compilation = compilation.unwrap();
    assert_eq!(compilation.traces.len(), 1);
    assert_eq!(compilation.traces[0].flags, CallFlags::TAIL_CALL);
    let offset = compilation.traces[0].offset;
    let (other, _) = compile_only(&jit, &class, &plus_one);
    assert_eq!(other.unwrap().traces[0].flags, CallFlags::empty());

    // The call node says the site goes through the tail call thunk, and still names the callee
    let compiled = jit
        .compile_method(&class, &forward, &mut RecordingAssembler::new())
        .unwrap();
    let node = jit.call_node(compiled.start() + offset as u64).unwrap();
    assert!(node.flags.contains(CallFlags::TAIL_CALL));
    assert_eq!(
        node.target.map(|target| target.qualified_name()),
        Some(String::from("demo/Calls.callee(I)I"))
    );
}

#[test]
fn caller_sensitive_methods_are_not_tail_called() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, _| {
        let load_library = builder
            .constants()
            .get_method_ref(
                &BinaryName::SYSTEM,
                &UnqualifiedName::LOADLIBRARY,
                "(Ljava/lang/String;)V",
                false,
            )
            .unwrap();
        let [hi, lo] = operand(load_library);
        let bytecode = vec![0x2a, 0xb8, hi, lo, 0xb1]; // aload_0; invokestatic; return
        static_method(builder, "load", "(Ljava/lang/String;)V", code(1, 1, bytecode));
    });
    let (result, asm) = compile_only(
        &jit,
        &class,
        &method(&class, "load", "(Ljava/lang/String;)V"),
    );
    let compilation = result.unwrap();

    // `java/lang/System` is not defined, so the target is found at run time
    let calls = calls(&asm);
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[0],
        (
            CallTarget::Routine(Routine::FindMethodFromReference(InvokeType::Static)),
            CallFlags::empty()
        )
    );
    assert!(matches!(calls[1], (CallTarget::Indirect(_), flags) if flags.is_empty()));

    // Both calls see the string argument, both on the stack and in the parameter slot
    assert_eq!(compilation.traces.len(), 2);
    for trace in &compilation.traces {
        assert_eq!(trace.map, bits(2, &[0, 1]));
    }
}

#[test]
fn exception_tables_are_translated() {
    let jit = boot(Settings::new());
    let layout = jit.settings().layout;
    let failure = jit.define_class(
        ClassBuilder::new(name("demo/Failure"), ClassAccessFlags::PUBLIC, None).build(&layout),
    );
    let sub_failure = ClassBuilder::new(
        name("demo/SubFailure"),
        ClassAccessFlags::PUBLIC,
        Some(failure.clone()),
    )
    .build(&layout);
    let other =
        ClassBuilder::new(name("demo/Other"), ClassAccessFlags::PUBLIC, None).build(&layout);

    let class = define(&jit, |builder, helpers| {
        let catch_type = builder.constants().get_class(&failure.name).unwrap();
        let [hi, lo] = operand(helpers.callee);
        let mut body = code(
            1,
            1,
            vec![
                0x1a, // 0: iload_0
                0xb8, hi, lo, // 1: invokestatic callee
                0xac, // 4: ireturn
                0x57, // 5: pop
                0x02, // 6: iconst_m1
                0xac, // 7: ireturn
            ],
        );
        body.handlers.push(ExceptionHandler {
            start_pc: 0,
            end_pc: 4,
            handler_pc: 5,
            catch_type: Some(catch_type),
        });
        body.line_numbers = vec![
            LineNumber {
                start_pc: 0,
                line_number: 10,
            },
            LineNumber {
                start_pc: 5,
                line_number: 12,
            },
        ];
        static_method(builder, "guarded", "(I)I", body);
    });
    let guarded = method(&class, "guarded", "(I)I");

    let (compilation, asm) = compile_only(&jit, &class, &guarded);
    let compilation = compilation.unwrap();

    // In a try block: a plain call, not a tail call
    assert_eq!(
        calls(&asm),
        vec![(CallTarget::Thunk(Thunk::DefaultCompile), CallFlags::empty())]
    );
    assert!(asm
        .ops_at(5)
        .iter()
        .any(|op| matches!(op, Op::InitLocalsFrom(0))));

    // Prologue (8), then 0: label + load (9), 1: label + call (9), 4: label + return (9)
    assert_eq!(compilation.handlers.len(), 1);
    let range = &compilation.handlers[0];
    assert_eq!((range.start, range.end, range.handler), (8, 26, 35));
    assert_eq!(range.catch_type, Some(name("demo/Failure")));
    assert_eq!(compilation.traces[0].offset, 26);
    assert!(range.covers_return_address(26));
    assert_eq!(compilation.passes, 2);

    let compiled = jit
        .compile_method(&class, &guarded, &mut RecordingAssembler::new())
        .unwrap();
    let return_address = compiled.start() + 26;
    assert_eq!(
        compiled.find_handler(return_address, &sub_failure),
        Some(compiled.start() + 35)
    );
    assert_eq!(compiled.find_handler(return_address, &other), None);
    assert_eq!(compiled.find_handler(compiled.start() + 8, &failure), None);
    assert_eq!(compiled.frame_map(return_address), Some(BitMap::zeros(2)));

    assert_eq!(compiled.line_number(return_address), Some(10));
    assert_eq!(compiled.line_number(compiled.start() + 40), Some(12));
}

#[test]
fn unreachable_handlers_are_dropped() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, _| {
        let mut body = code(
            1,
            1,
            vec![
                0x03, // 0: iconst_0
                0xac, // 1: ireturn
                0x03, // 2: iconst_0 (never reached)
                0xac, // 3: ireturn
                0x57, // 4: pop
                0x03, // 5: iconst_0
                0xac, // 6: ireturn
            ],
        );
        body.handlers.push(ExceptionHandler {
            start_pc: 2,
            end_pc: 4,
            handler_pc: 4,
            catch_type: None,
        });
        static_method(builder, "dead", "()I", body);
    });
    let (compilation, asm) = compile_only(&jit, &class, &method(&class, "dead", "()I"));
    let compilation = compilation.unwrap();
    assert!(compilation.handlers.is_empty());
    assert_eq!(asm.visited_ips().collect::<Vec<_>>(), vec![0, 1]);
}

#[test]
fn concurrent_compilations_publish_once() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, helpers| {
        static_method(builder, "pick", "(I)V", code(1, 2, local_kinds(helpers.tick)))
    });
    let pick = method(&class, "pick", "(I)V");

    let results: Vec<Arc<CompiledMethod>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    jit.compile_method(&class, &pick, &mut RecordingAssembler::new())
                        .unwrap()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    let installed = pick.compiled().unwrap();
    for result in &results {
        assert!(Arc::ptr_eq(result, installed));
    }
    assert_eq!(jit.methods().len(), 1);
    assert_eq!(jit.call_nodes().len(), 1);
}

struct FakeStack(HashMap<u64, u64>);

impl NativeStack for FakeStack {
    fn read_word(&self, address: u64) -> Option<u64> {
        self.0.get(&address).copied()
    }
}

#[test]
fn stack_walks_report_live_references() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, helpers| {
        let [hi, lo] = operand(helpers.tick);
        // static Object keep(Object o) { tick(); return o; }
        let bytecode = vec![0xb8, hi, lo, 0x2a, 0xb0];
        static_method(builder, "keep", "(Ljava/lang/Object;)Ljava/lang/Object;", code(1, 1, bytecode));
    });
    let keep = method(&class, "keep", "(Ljava/lang/Object;)Ljava/lang/Object;");
    let compiled = jit
        .compile_method(&class, &keep, &mut RecordingAssembler::new())
        .unwrap();
    assert_eq!(compiled.aligned_frame_size(), 3);

    let (offset, map) = compiled.frame_maps().iter().next().unwrap();
    assert_eq!(map, bits(2, &[0]));
    let return_address = compiled.start() + offset as u64;
    let node = jit.call_node(return_address).unwrap();
    assert_eq!(node.flags, CallFlags::empty());

    // Called from something that isn't compiled code
    let sp = 0x7000;
    let stack = FakeStack(vec![(sp + 3 * 8, 0x99)].into_iter().collect());
    let saved = vec![SavedFrame {
        ip: return_address,
        sp,
    }];
    let frames: Vec<JitFrame> = jit.stack_walker(&stack, saved).collect();
    assert_eq!(frames.len(), 1);
    assert!(Arc::ptr_eq(&frames[0].method, &compiled));

    let mut roots = vec![];
    assert!(frames[0].visit_roots(8, |slot| roots.push(slot)));
    assert_eq!(roots, vec![sp]);
}

#[test]
fn methods_without_code_are_not_compiled() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, _| {
        builder.add_method(
            name("native"),
            MethodDescriptor::parse("()V").unwrap(),
            MethodAccessFlags::STATIC | MethodAccessFlags::NATIVE,
            None,
        );
    });
    let native = method(&class, "native", "()V");
    let result = jit.compile_method(&class, &native, &mut RecordingAssembler::new());
    assert!(matches!(result, Err(Error::MissingCode)));
}

// static int first(int[] a) { return a[0]; }
const FIRST_ELEMENT: [u8; 4] = [0x2a, 0x03, 0x2e, 0xac]; // aload_0; iconst_0; iaload; ireturn

#[test]
fn bounds_checks_are_call_sites() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, _| {
        static_method(builder, "first", "([I)I", code(2, 1, FIRST_ELEMENT.to_vec()));

        let mut body = code(2, 1, FIRST_ELEMENT.to_vec());
        body.bytecode.extend([0x57, 0x02, 0xac]); // 4: pop; iconst_m1; ireturn
        body.handlers.push(ExceptionHandler {
            start_pc: 0,
            end_pc: 4,
            handler_pc: 4,
            catch_type: None,
        });
        static_method(builder, "firstOr", "([I)I", body);
    });
    let first = method(&class, "first", "([I)I");
    let first_or = method(&class, "firstOr", "([I)I");

    // Prologue (8), 0: label + load (9), 1: label + constant (9), 2: label + check + load
    let (compilation, asm) = compile_only(&jit, &class, &first);
    let compilation = compilation.unwrap();
    let traces: Vec<(usize, usize, jit::TraceKind)> = compilation
        .traces
        .iter()
        .map(|trace| (trace.ip, trace.offset, trace.kind))
        .collect();
    assert_eq!(traces, vec![(2, 35, jit::TraceKind::Call)]);
    assert_eq!(compilation.traces[0].map, bits(3, &[0, 1]));
    let thunk = jit.thunks().address(Thunk::ArrayBoundsException);
    assert!(matches!(
        asm.ops_at(2).as_slice(),
        [Op::Label(2), Op::CheckBounds { handler, .. }, Op::Load(_, MemoryKind::Int, _)]
            if *handler == thunk
    ));

    // In a try block the load gets a trace of its own, after the check's
    let (compilation, asm) = compile_only(&jit, &class, &first_or);
    let compilation = compilation.unwrap();
    let traces: Vec<(usize, usize, jit::TraceKind)> = compilation
        .traces
        .iter()
        .map(|trace| (trace.ip, trace.offset, trace.kind))
        .collect();
    assert_eq!(
        traces,
        vec![(2, 43, jit::TraceKind::Call), (2, 51, jit::TraceKind::Fault)]
    );
    for trace in &compilation.traces {
        assert_eq!(trace.map, bits(3, &[0, 1]));
    }
    assert!(matches!(
        asm.ops_at(2).as_slice(),
        [Op::Label(2), Op::SaveLocals, Op::CheckBounds { .. }, Op::Load(..)]
    ));

    // The thunk call is a call node with a frame map, for the exception it throws
    let compiled = jit
        .compile_method(&class, &first, &mut RecordingAssembler::new())
        .unwrap();
    let return_address = compiled.start() + 35;
    assert_eq!(compiled.frame_map(return_address), Some(bits(3, &[0, 1])));
    let node = jit.call_node(return_address).unwrap();
    assert!(node.target.is_none());
}

#[test]
fn bounds_checks_can_be_disabled() {
    let settings = Settings {
        bounds_checks: false,
        ..Settings::new()
    };
    let jit = boot(settings);
    let class = define(&jit, |builder, _| {
        static_method(builder, "first", "([I)I", code(2, 1, FIRST_ELEMENT.to_vec()))
    });
    let (compilation, asm) = compile_only(&jit, &class, &method(&class, "first", "([I)I"));
    assert!(compilation.unwrap().traces.is_empty());
    assert!(!asm
        .ops()
        .iter()
        .any(|op| matches!(op, Op::CheckBounds { .. })));
}

/// Declare `public void name()`, which gets a vtable slot
fn virtual_method(builder: &mut ClassBuilder, method_name: &str) -> ConstantIndex {
    let class_name = builder.name().clone();
    builder.add_method(
        name(method_name),
        MethodDescriptor::parse("()V").unwrap(),
        MethodAccessFlags::PUBLIC,
        Some(code(0, 1, vec![0xb1])),
    );
    builder
        .constants()
        .get_method_ref(&class_name, &name(method_name), "()V", false)
        .unwrap()
}

#[test]
fn virtual_calls_in_both_arms() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, _| {
        let [f_hi, f_lo] = operand(virtual_method(builder, "f"));
        let [g_hi, g_lo] = operand(virtual_method(builder, "g"));
        // static void both(Calls c, int a) { if (a > 0) { c.f(); o = c; } else { c.g(); o = 0; } }
        let bytecode = vec![
            0x1b, // 0: iload_1
            0x9e, 0x00, 0x0c, // 1: ifle 13
            0x2a, // 4: aload_0
            0xb6, f_hi, f_lo, // 5: invokevirtual f
            0x2a, // 8: aload_0
            0x4d, // 9: astore_2
            0xa7, 0x00, 0x09, // 10: goto 19
            0x2a, // 13: aload_0
            0xb6, g_hi, g_lo, // 14: invokevirtual g
            0x03, // 17: iconst_0
            0x3d, // 18: istore_2
            0xb1, // 19: return
        ];
        static_method(builder, "both", "(Ldemo/Calls;I)V", code(1, 3, bytecode));
    });
    let both = method(&class, "both", "(Ldemo/Calls;I)V");

    let (compilation, asm) = compile_only(&jit, &class, &both);
    let compilation = compilation.unwrap();

    // Locals: `a` is bit 0, `c` bit 1, `o` bit 2; the stack slot is bit 3
    let traces: Vec<(usize, CallFlags, &BitMap)> = compilation
        .traces
        .iter()
        .map(|trace| (trace.ip, trace.flags, &trace.map))
        .collect();
    let receiver = bits(4, &[1, 3]);
    assert_eq!(
        traces,
        vec![
            (14, CallFlags::VIRTUAL, &receiver),
            (5, CallFlags::VIRTUAL, &receiver)
        ]
    );
    assert!(compilation
        .traces
        .iter()
        .all(|trace| trace.target.is_none()));

    // Only one arm leaves a reference in `o`
    assert_eq!(
        compilation.merge_points,
        vec![MergePoint {
            ip: 19,
            predecessors: 2,
            map: bits(4, &[1]),
        }]
    );

    // Both go through the vtable: class pointer, then the entry
    let calls = calls(&asm);
    assert_eq!(calls.len(), 2);
    for call in &calls {
        assert!(matches!(call, (CallTarget::Indirect(_), flags) if *flags == CallFlags::VIRTUAL));
    }
    let layout = jit.settings().layout;
    let f = method(&class, "f", "()V");
    let entry = layout.vtable_offset + (f.vtable_index.unwrap() * layout.word_size) as i32;
    assert!(asm.ops_at(5).iter().any(|op| matches!(
        op,
        Op::Load(_, MemoryKind::Word, memory) if memory.offset == entry
    )));
}

#[test]
fn interface_calls_look_the_target_up() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, _| {
        let run = builder
            .constants()
            .get_method_ref(&name("demo/Task"), &name("run"), "()V", true)
            .unwrap();
        let [hi, lo] = operand(run);
        // static void go(Task t) { t.run(); }
        let bytecode = vec![0x2a, 0xb9, hi, lo, 0x01, 0x00, 0xb1];
        static_method(builder, "go", "(Ldemo/Task;)V", code(1, 1, bytecode));
    });
    let (compilation, asm) = compile_only(&jit, &class, &method(&class, "go", "(Ldemo/Task;)V"));
    let compilation = compilation.unwrap();

    // The call is the last thing before the return, so it is also a tail call
    assert_eq!(
        calls(&asm),
        vec![
            (
                CallTarget::Routine(Routine::FindInterfaceMethodFromInstance),
                CallFlags::empty()
            ),
            (
                CallTarget::Thunk(Thunk::TailCall),
                CallFlags::VIRTUAL | CallFlags::TAIL_CALL
            ),
        ]
    );
    let traces: Vec<(usize, CallFlags, &BitMap)> = compilation
        .traces
        .iter()
        .map(|trace| (trace.ip, trace.flags, &trace.map))
        .collect();
    let receiver = bits(2, &[0, 1]);
    assert_eq!(
        traces,
        vec![
            (1, CallFlags::empty(), &receiver),
            (1, CallFlags::VIRTUAL | CallFlags::TAIL_CALL, &receiver)
        ]
    );
}

#[test]
fn invokedynamic_goes_through_a_table_slot() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, _| {
        let site = builder
            .constants()
            .get_invoke_dynamic(0, &name("run"), "(I)Ljava/lang/Runnable;")
            .unwrap();
        let [hi, lo] = operand(site);
        // static Runnable lambda(int x) { return () -> ...; }
        let bytecode = vec![0x1a, 0xba, hi, lo, 0x00, 0x00, 0xb0];
        static_method(builder, "lambda", "(I)Ljava/lang/Runnable;", code(1, 1, bytecode));
    });
    let lambda = method(&class, "lambda", "(I)Ljava/lang/Runnable;");

    let (compilation, asm) = compile_only(&jit, &class, &lambda);
    let compilation = compilation.unwrap();
    let dynamic_calls = jit.dynamic_calls();
    assert_eq!(dynamic_calls.len(), 1);
    assert_eq!(
        dynamic_calls.target(0),
        Some(jit.thunks().address(Thunk::DefaultDynamic))
    );

    // Load the target out of the slot, then call it
    let slot_address = dynamic_calls.slot_address(0).unwrap();
    let ops = asm.ops_at(1);
    let slot = ops.iter().find_map(|op| match op {
        Op::Constant(value, Immediate::Address(address)) if *address == slot_address => {
            Some(*value)
        }
        _ => None,
    });
    let slot = slot.unwrap();
    assert!(ops.iter().any(|op| matches!(
        op,
        Op::Load(_, MemoryKind::Word, memory) if memory.base == slot && memory.offset == 0
    )));
    assert!(matches!(
        calls(&asm).as_slice(),
        [(CallTarget::Indirect(_), flags)] if *flags == CallFlags::VIRTUAL
    ));
    assert_eq!(compilation.traces.len(), 1);
    assert_eq!(compilation.traces[0].flags, CallFlags::VIRTUAL);
    assert_eq!(compilation.traces[0].map, BitMap::zeros(2));

    // Compiling the site again reuses its slot
    let (compilation, _) = compile_only(&jit, &class, &lambda);
    compilation.unwrap();
    assert_eq!(jit.dynamic_calls().len(), 1);
}

#[test]
fn volatile_fields_get_barriers() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, _| {
        let class_name = builder.name().clone();
        builder.add_field(
            name("count"),
            FieldType::Base(BaseType::Int),
            FieldAccessFlags::PRIVATE | FieldAccessFlags::VOLATILE,
        );
        let count = builder
            .constants()
            .get_field_ref(&class_name, &name("count"), "I")
            .unwrap();
        let [hi, lo] = operand(count);
        // aload_0; getfield count; ireturn
        let read = vec![0x2a, 0xb4, hi, lo, 0xac];
        static_method(builder, "read", "(Ldemo/Calls;)I", code(1, 1, read));
        // aload_0; iload_1; putfield count; return
        let write = vec![0x2a, 0x1b, 0xb5, hi, lo, 0xb1];
        static_method(builder, "write", "(Ldemo/Calls;I)V", code(2, 2, write));
    });

    // The header comes first
    let offset = jit.settings().layout.header_size as i32;

    let (compilation, asm) = compile_only(&jit, &class, &method(&class, "read", "(Ldemo/Calls;)I"));
    assert!(compilation.unwrap().traces.is_empty());
    assert!(matches!(
        asm.ops_at(1).as_slice(),
        [Op::Label(1), Op::Load(_, MemoryKind::Int, memory), Op::Barrier(Barrier::Load)]
            if memory.offset == offset
    ));

    let (compilation, asm) =
        compile_only(&jit, &class, &method(&class, "write", "(Ldemo/Calls;I)V"));
    assert!(compilation.unwrap().traces.is_empty());
    assert!(matches!(
        asm.ops_at(2).as_slice(),
        [
            Op::Label(2),
            Op::Barrier(Barrier::StoreStore),
            Op::Store(MemoryKind::Int, memory, _),
            Op::Barrier(Barrier::StoreLoad),
        ] if memory.offset == offset
    ));
    assert!(calls(&asm).is_empty());
}

#[test]
fn statics_of_other_classes_initialise_them_first() {
    let jit = boot(Settings::new());
    let layout = jit.settings().layout;
    let mut counter = ClassBuilder::new(name("demo/Counter"), ClassAccessFlags::PUBLIC, None);
    counter.add_field(
        name("total"),
        FieldType::Base(BaseType::Long),
        FieldAccessFlags::PUBLIC | FieldAccessFlags::STATIC,
    );
    let counter = jit.define_class(counter.build(&layout));

    let class = define(&jit, |builder, _| {
        let total = builder
            .constants()
            .get_field_ref(&counter.name, &name("total"), "J")
            .unwrap();
        let [hi, lo] = operand(total);
        // static long total() { return Counter.total; }
        static_method(builder, "total", "()J", code(2, 0, vec![0xb2, hi, lo, 0xad]));
    });
    let total = method(&class, "total", "()J");

    let (compilation, asm) = compile_only(&jit, &class, &total);
    let compilation = compilation.unwrap();
    assert_eq!(
        calls(&asm),
        vec![(CallTarget::Routine(Routine::InitClass), CallFlags::empty())]
    );
    assert_eq!(compilation.traces.len(), 1);
    assert!(asm.ops_at(0).iter().any(|op| matches!(
        op,
        Op::Load(_, MemoryKind::Long, memory) if memory.offset == layout.header_size as i32
    )));

    // Once initialised, the access is just the load
    counter.mark_initialized();
    let (compilation, asm) = compile_only(&jit, &class, &total);
    assert!(compilation.unwrap().traces.is_empty());
    assert!(calls(&asm).is_empty());
}

#[test]
fn unresolved_members_are_resolved_at_run_time() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, _| {
        let missing: BinaryName = name("demo/Missing");
        let value = builder
            .constants()
            .get_field_ref(&missing, &name("value"), "I")
            .unwrap();
        let flag = builder
            .constants()
            .get_field_ref(&missing, &name("flag"), "I")
            .unwrap();
        let class = builder.constants().get_class(&missing).unwrap();
        let [value_hi, value_lo] = operand(value);
        let [flag_hi, flag_lo] = operand(flag);
        let [class_hi, class_lo] = operand(class.into());
        let bytecode = vec![
            0x2a, // 0: aload_0
            0xb4, value_hi, value_lo, // 1: getfield Missing.value
            0xb3, flag_hi, flag_lo, // 4: putstatic Missing.flag
            0xbb, class_hi, class_lo, // 7: new Missing
            0xb0, // 10: areturn
        ];
        static_method(
            builder,
            "touch",
            "(Ldemo/Missing;)Ljava/lang/Object;",
            code(1, 1, bytecode),
        );
    });
    let touch = method(&class, "touch", "(Ldemo/Missing;)Ljava/lang/Object;");

    let (compilation, asm) = compile_only(&jit, &class, &touch);
    let compilation = compilation.unwrap();
    assert_eq!(
        calls(&asm),
        vec![
            (
                CallTarget::Routine(Routine::GetFieldFromReference(ValueKind::Int)),
                CallFlags::empty()
            ),
            (
                CallTarget::Routine(Routine::SetStaticFromReference(ValueKind::Int)),
                CallFlags::empty()
            ),
            (CallTarget::Routine(Routine::ResolveClass), CallFlags::empty()),
            (CallTarget::Routine(Routine::MakeNew), CallFlags::empty()),
        ]
    );

    // Each call has its own site; the object is still on the stack at the getfield
    let traces: Vec<(usize, &BitMap)> = compilation
        .traces
        .iter()
        .map(|trace| (trace.ip, &trace.map))
        .collect();
    assert_eq!(
        traces,
        vec![
            (1, &bits(2, &[0, 1])),
            (4, &bits(2, &[0])),
            (7, &bits(2, &[0])),
            (7, &bits(2, &[0])),
        ]
    );
    assert!(!compilation.pool.is_empty());
}

/// Cases shared by both switches: 28 returns 0, 30 returns 1, 32 returns -1
const SWITCH_ARMS: [u8; 6] = [0x03, 0xac, 0x04, 0xac, 0x02, 0xac];

#[test]
fn switches_walk_every_target() {
    let jit = boot(Settings::new());
    let class = define(&jit, |builder, _| {
        // 0: iload_0; 1: tableswitch (padded to 4) 0..=2 -> 28, 30, 28, default 32
        let mut table = vec![0x1a, 0xaa, 0x00, 0x00];
        for word in [31, 0, 2, 27, 29, 27] {
            table.extend(i32::to_be_bytes(word));
        }
        table.extend(SWITCH_ARMS);
        static_method(builder, "table", "(I)I", code(1, 1, table));

        // 0: iload_0; 1: lookupswitch (padded to 4) -5 -> 28, 100 -> 30, default 32
        let mut lookup = vec![0x1a, 0xab, 0x00, 0x00];
        for word in [31, 2, -5, 27, 100, 29] {
            lookup.extend(i32::to_be_bytes(word));
        }
        lookup.extend(SWITCH_ARMS);
        static_method(builder, "lookup", "(I)I", code(1, 1, lookup));
    });

    let (compilation, asm) = compile_only(&jit, &class, &method(&class, "table", "(I)I"));
    let compilation = compilation.unwrap();
    assert_eq!(
        asm.visited_ips().collect::<Vec<_>>(),
        vec![0, 1, 28, 29, 30, 31, 32, 33]
    );
    assert!(asm.ops_at(1).iter().any(|op| matches!(
        op,
        Op::TableJump { low: 0, targets, default: 32, .. } if targets == &vec![28, 30, 28]
    )));
    assert!(compilation.merge_points.is_empty());

    let (compilation, asm) = compile_only(&jit, &class, &method(&class, "lookup", "(I)I"));
    let compilation = compilation.unwrap();
    assert_eq!(
        asm.visited_ips().collect::<Vec<_>>(),
        vec![0, 1, 28, 29, 30, 31, 32, 33]
    );
    assert!(asm.ops_at(1).iter().any(|op| matches!(
        op,
        Op::LookupJump { cases, default: 32, .. } if cases == &vec![(-5, 28), (100, 30)]
    )));
    assert!(compilation.merge_points.is_empty());
    assert!(compilation.traces.is_empty());
}
