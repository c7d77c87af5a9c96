//! lark command-line driver: script runner and REPL.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use lark::{Error, Interpreter, Options};
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

#[derive(Parser)]
#[command(name = "lark", version, about = "The lark scripting language")]
struct Cli {
    /// Script to run; starts a REPL when omitted.
    script: Option<PathBuf>,

    /// Run the garbage collector on every allocation.
    #[arg(long)]
    stress_gc: bool,

    /// Disassemble each function after compiling it.
    #[arg(long)]
    dump_bytecode: bool,

    /// Log every executed instruction (combine with RUST_LOG=lark=trace).
    #[arg(long)]
    trace: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = Options {
        stress_gc: cli.stress_gc,
        print_code: cli.dump_bytecode,
        trace_execution: cli.trace,
    };
    let mut interpreter = Interpreter::with_options(options);
    match cli.script {
        Some(path) => run_file(&mut interpreter, &path),
        None => repl(&mut interpreter),
    }
}

fn run_file(interpreter: &mut Interpreter, path: &Path) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read \"{}\": {}.", path.display(), err);
            return ExitCode::from(EX_IOERR);
        }
    };
    match interpreter.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ Error::Compile(_)) => {
            eprintln!("{err}");
            ExitCode::from(EX_DATAERR)
        }
        Err(err @ Error::Runtime { .. }) => {
            eprintln!("{err}");
            ExitCode::from(EX_SOFTWARE)
        }
    }
}

fn repl(interpreter: &mut Interpreter) -> ExitCode {
    let mut editor = match rustyline::DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("Could not start line editor: {err}.");
            return ExitCode::from(EX_IOERR);
        }
    };
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                if let Err(err) = interpreter.interpret(&line) {
                    eprintln!("{err}");
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                return ExitCode::SUCCESS;
            }
            Err(err) => {
                eprintln!("Read error: {err}.");
                return ExitCode::from(EX_IOERR);
            }
        }
    }
}
