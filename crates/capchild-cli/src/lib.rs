//! Runtime for `capctl`, the operator-facing capture controller.
//!
//! [`run`] splits leading configuration flags from the command line, loads
//! configuration through `ortho_config` (defaults, then the TOML file, then
//! `CAPCHILD_*` environment variables, then those flags), installs telemetry
//! and executes one subcommand. Results go to the given stdout; logs and
//! errors go to stderr.

mod cli;
mod commands;
mod config;
mod errors;
mod output;
mod telemetry;

use std::ffi::OsString;
use std::io::Write;
use std::process::ExitCode;

use clap::Parser;

pub use cli::OutputFormat;
pub use telemetry::{TelemetryError, initialise as initialise_telemetry};

use cli::Cli;
use config::{ConfigLoader, OrthoConfigLoader, split_arguments};
use errors::AppError;
use output::Printer;

/// Runs `capctl` with `args` and returns its exit code.
#[must_use]
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    run_with_loader(args, stdout, stderr, &OrthoConfigLoader)
}

fn run_with_loader<I, W, E, L>(args: I, stdout: &mut W, stderr: &mut E, loader: &L) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
    L: ConfigLoader,
{
    let args: Vec<OsString> = args.into_iter().collect();
    let split = split_arguments(&args);
    let cli = match Cli::try_parse_from(split.command) {
        Ok(cli) => cli,
        Err(error) => return usage(&error, stdout, stderr),
    };
    match execute(&cli, &split.config, loader, stdout) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            report(&error, stderr);
            ExitCode::FAILURE
        }
    }
}

fn execute<W: Write, L: ConfigLoader>(
    cli: &Cli,
    config_args: &[OsString],
    loader: &L,
    stdout: &mut W,
) -> Result<(), AppError> {
    let config = loader.load(config_args)?;
    telemetry::initialise(&config)?;
    let mut printer = Printer::new(stdout, cli.global.output);
    commands::execute(&cli.command, &config, &mut printer)
}

fn usage<W: Write, E: Write>(error: &clap::Error, stdout: &mut W, stderr: &mut E) -> ExitCode {
    let rendered = error.render();
    let written = if error.use_stderr() {
        write!(stderr, "{rendered}")
    } else {
        write!(stdout, "{rendered}")
    };
    if written.is_err() {
        return ExitCode::FAILURE;
    }
    u8::try_from(error.exit_code()).map_or(ExitCode::FAILURE, ExitCode::from)
}

fn report<E: Write>(error: &AppError, stderr: &mut E) {
    let detail = error.detail();
    let written = match detail {
        Some(text) => writeln!(stderr, "capctl: {error}\n  {text}"),
        None => writeln!(stderr, "capctl: {error}"),
    };
    if written.is_err() {
        tracing::error!(error = %error, "failed to report error");
    }
}
