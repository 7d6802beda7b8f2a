//! Lox CLI
//!
//! `lox <script>` runs a file and exits with a sysexits(3) status; `lox`
//! alone starts a line-based interactive session that keeps its globals
//! across inputs and keeps going after errors.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

use lox_runtime::{InterpretError, Vm, VmOptions};

const EX_USAGE: i32 = 64;
const EX_DATAERR: i32 = 65;
const EX_SOFTWARE: i32 = 70;
const EX_IOERR: i32 = 74;

#[derive(Parser)]
#[command(name = "lox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Lox interpreter - run a script or start a REPL", long_about = None)]
struct Cli {
    /// Script to run; starts an interactive session when omitted
    script: Option<PathBuf>,

    /// Disassemble each compiled function before running
    #[arg(long)]
    dump_bytecode: bool,

    /// Trace executed instructions and the value stack
    #[arg(long)]
    trace: bool,

    /// Run a full collection at every allocation safepoint
    #[arg(long)]
    stress_gc: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            if e.use_stderr() {
                process::exit(EX_USAGE);
            }
            // --help and --version are not usage errors.
            return;
        }
    };

    init_tracing(cli.trace);

    let options = VmOptions::new()
        .with_dump_bytecode(cli.dump_bytecode)
        .with_trace_execution(cli.trace)
        .with_stress_gc(cli.stress_gc);

    match cli.script {
        Some(path) => process::exit(run_file(&path, options)),
        None => repl(options),
    }
}

/// `LOX_LOG` picks the filter; `--trace` defaults it to TRACE for the
/// interpreter targets so the flag works without extra environment setup.
fn init_tracing(trace: bool) {
    let fallback = if trace { "lox=trace" } else { "warn" };
    let filter =
        EnvFilter::try_from_env("LOX_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_file(path: &Path, options: VmOptions) -> i32 {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Could not read {}: {}", path.display(), e);
            return EX_IOERR;
        }
    };
    let mut vm = Vm::new(options);
    match vm.interpret(&source) {
        Ok(()) => 0,
        Err(InterpretError::Compile) => EX_DATAERR,
        Err(InterpretError::Runtime(_)) => EX_SOFTWARE,
    }
}

fn repl(options: VmOptions) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("Could not start the interactive session: {e}");
            process::exit(EX_IOERR);
        }
    };
    let mut vm = Vm::new(options);
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(&line);
                // Errors were already reported; the session continues.
                let _ = vm.interpret(&line);
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{e}");
                break;
            }
        }
    }
}
