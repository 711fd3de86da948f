//! The `rook` binary: REPL with no arguments, script runner with one.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rook_drv::{repl, run_file, EXIT_USAGE};

/// The Rook interpreter.
///
/// With no arguments, starts an interactive session; with a script path,
/// runs it.
#[derive(Parser, Debug)]
#[command(name = "rook")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "The Rook interpreter", long_about = None)]
struct Cli {
    /// Script to run; omit to start a REPL
    #[arg(value_name = "PATH")]
    args: Vec<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("ROOK_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.args.as_slice() {
        [] => repl(),
        [path] => run_file(path),
        _ => {
            eprintln!("Usage: rook [path]");
            EXIT_USAGE
        }
    };
    ExitCode::from(code)
}
