//! `capctl` entrypoint.
//!
//! Delegates to [`capchild_cli::run`] with the process arguments and locked
//! standard streams.

use std::io;
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut stdout = io::stdout().lock();
    let mut stderr = io::stderr().lock();
    capchild_cli::run(std::env::args_os(), &mut stdout, &mut stderr)
}
