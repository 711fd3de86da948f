//! rook-drv - Driver for the Rook interpreter.
//!
//! Wires the compiler and the VM together behind one entry point,
//! [`interpret`], and provides the two front ends the `rook` binary
//! dispatches to: a script runner and a REPL. Both return the process exit
//! code as a plain byte; the binary converts it at the boundary.

use std::io::{BufRead, IsTerminal, Write};
use std::path::Path;

use anyhow::Context;
use rustyline::error::ReadlineError;

pub use rook_runtime::Vm;

/// Exit code for success.
pub const EXIT_OK: u8 = 0;
/// Exit code for a command-line usage error.
pub const EXIT_USAGE: u8 = 64;
/// Exit code when compilation fails.
pub const EXIT_COMPILE_ERROR: u8 = 65;
/// Exit code when execution fails.
pub const EXIT_RUNTIME_ERROR: u8 = 70;
/// Exit code when the script cannot be read.
pub const EXIT_IO_ERROR: u8 = 74;

/// Result of interpreting one source unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    CompileError,
    RuntimeError,
}

/// Compiles and runs a source string on the given VM.
///
/// Diagnostics and runtime errors have already been written to standard
/// error by the time this returns; the outcome tells the caller which exit
/// code applies.
pub fn interpret(vm: &mut Vm, source: &str) -> Outcome {
    let function = match rook_compiler::compile(source, vm) {
        Ok(function) => function,
        Err(_) => return Outcome::CompileError,
    };
    match vm.run(function) {
        Ok(()) => Outcome::Ok,
        Err(_) => Outcome::RuntimeError,
    }
}

/// Runs a script file, mapping the result to the process exit code.
pub fn run_file(path: &Path) -> u8 {
    let source = match read_source(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: {err:#}");
            return EXIT_IO_ERROR;
        }
    };
    tracing::debug!(path = %path.display(), bytes = source.len(), "running script");

    let mut vm = Vm::new();
    match interpret(&mut vm, &source) {
        Outcome::Ok => EXIT_OK,
        Outcome::CompileError => EXIT_COMPILE_ERROR,
        Outcome::RuntimeError => EXIT_RUNTIME_ERROR,
    }
}

fn read_source(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("cannot read script '{}'", path.display()))
}

/// Reads and interprets lines until end of input. One VM lives for the
/// whole session, so definitions carry across lines; errors are reported
/// and the session continues.
pub fn repl() -> u8 {
    let mut vm = Vm::new();
    if std::io::stdin().is_terminal() {
        interactive_repl(&mut vm)
    } else {
        piped_repl(&mut vm)
    }
}

fn interactive_repl(vm: &mut Vm) -> u8 {
    let mut editor = match rustyline::DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("error: cannot start line editor: {err}");
            return EXIT_IO_ERROR;
        }
    };

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                interpret(vm, &line);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("error: {err}");
                return EXIT_IO_ERROR;
            }
        }
    }
    EXIT_OK
}

fn piped_repl(vm: &mut Vm) -> u8 {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        match line {
            Ok(line) => {
                interpret(vm, &line);
                let _ = std::io::stdout().flush();
            }
            Err(err) => {
                eprintln!("error: {err}");
                return EXIT_IO_ERROR;
            }
        }
    }
    EXIT_OK
}
