use classjit::backend::RecordingAssembler;
use classjit::jit::{self, Settings};
use classjit::jvm::class_file::ClassFile;
use classjit::jvm::Name;
use classjit::runtime::{ClassBuilder, CompiledMethod, Jit, ThunkTable};
use classjit::util::BitMap;

use clap::{Arg, ArgAction, Command};
use std::process;

/// Where the thunks and compiled code pretend to live
const THUNK_BASE: u64 = 0x1000_0000;
const THUNK_SIZE: u64 = 0x40;
const CODE_BASE: u64 = 0x2000_0000;

fn main() -> Result<(), jit::Error> {
    env_logger::init();

    let matches = Command::new("JVM bytecode JIT")
        .version("0.1.0")
        .about("Compile the methods of a class file and print frame maps, handlers, and lines")
        .arg(
            Arg::new("method")
                .long("method")
                .value_name("NAME")
                .action(ArgAction::Set)
                .help("Only compile methods with this name"),
        )
        .arg(
            Arg::new("no-tail-calls")
                .long("no-tail-calls")
                .action(ArgAction::SetTrue)
                .help("Never compile calls as tail calls"),
        )
        .arg(
            Arg::new("long-calls")
                .long("long-calls")
                .action(ArgAction::SetTrue)
                .help("Assume call targets may be out of range of direct calls"),
        )
        .arg(
            Arg::new("no-bounds-checks")
                .long("no-bounds-checks")
                .action(ArgAction::SetTrue)
                .help("Omit array bounds checks"),
        )
        .arg(
            Arg::new("dump")
                .long("dump")
                .action(ArgAction::SetTrue)
                .help("Also print the recorded back end operations"),
        )
        .arg(
            Arg::new("INPUT")
                .help("Class file to compile")
                .required(true)
                .index(1),
        )
        .get_matches();

    let settings = Settings {
        tail_calls: !matches.get_flag("no-tail-calls"),
        long_calls: matches.get_flag("long-calls"),
        bounds_checks: !matches.get_flag("no-bounds-checks"),
        ..Settings::new()
    };
    let only = matches.get_one::<String>("method");
    let dump = matches.get_flag("dump");

    let jit = Jit::boot(settings, ThunkTable::new(THUNK_BASE, THUNK_SIZE), CODE_BASE);

    let Some(class_file_path) = matches.get_one::<String>("INPUT") else {
        return Ok(());
    };
    log::info!("Reading '{}'", class_file_path);
    let class_file = ClassFile::read_from_path(class_file_path)?;
    let class = ClassBuilder::from_class_file(class_file, None)?.build(&jit.settings().layout);
    let class = jit.define_class(class);

    let mut failures = 0;
    for method in &class.methods {
        if only.map_or(false, |only| method.name.as_str() != only.as_str()) {
            continue;
        }
        if method.code().is_none() {
            log::debug!("skipping {}: no code", method.qualified_name());
            continue;
        }

        let mut asm = RecordingAssembler::new();
        match jit.compile_method(&class, method, &mut asm) {
            Ok(compiled) => {
                print_method(&compiled);
                if dump {
                    for op in asm.ops() {
                        println!("    {:?}", op);
                    }
                }
            }
            Err(_) => failures += 1,
        }
    }

    if failures > 0 {
        log::error!("{} method(s) failed to compile", failures);
        process::exit(1);
    }
    Ok(())
}

fn print_method(compiled: &CompiledMethod) {
    println!(
        "{} @ {:#x} ({} bytes, frame of {} words)",
        compiled.name(),
        compiled.start(),
        compiled.len(),
        compiled.aligned_frame_size()
    );
    for (offset, map) in compiled.frame_maps().iter() {
        println!("  frame map +{:<6} {}", offset, render_map(&map));
    }
    for range in compiled.handlers() {
        let catch_type = range
            .catch_type
            .as_ref()
            .map_or("any", |catch_type| catch_type.as_str());
        println!(
            "  handler   +{}..+{} -> +{} ({})",
            range.start, range.end, range.handler, catch_type
        );
    }
    for line in compiled.line_numbers() {
        println!("  line      +{:<6} {}", line.offset, line.line);
    }
}

fn render_map(map: &BitMap) -> String {
    (0..map.len())
        .map(|bit| if map.get(bit) { '1' } else { '0' })
        .collect()
}
