//! vroot-show: inspect what the active session would do.
//!
//! Must run inside a session (SBOX_SESSION_DIR set). Prints the mapped
//! host path for pathnames, or the rewritten file/argv for an exec,
//! without performing either.

mod commands;

use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use vroot::session::{Session, SessionConfig};

#[derive(Parser, Debug)]
#[command(
    name = "vroot-show",
    version,
    about = "Show how the active vroot session maps paths and rewrites exec parameters"
)]
struct Cli {
    /// Show using this name as the calling program's name
    #[arg(short = 'b', long = "binary-name", default_value = "ANYBINARY")]
    binary_name: String,

    /// Show using the named mapping mode (default: current session mode)
    #[arg(short = 'm', long = "mode")]
    mode: Option<String>,

    /// Show using this name as the calling function's name
    #[arg(short = 'f', long = "function", default_value = "ANYFUNCTION")]
    function: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show mappings of pathnames
    Path(commands::path::PathArgs),
    /// Show execve() modifications
    Exec(commands::exec::ExecArgs),
}

fn main() -> ExitCode {
    // usage problems exit with 1, per the historical contract
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("vroot-show: error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = SessionConfig::from_env()
        .context("vroot-show must be executed inside a vroot session")?;
    if let Some(mode) = &cli.mode {
        config.mode = Some(mode.clone());
    }
    let session = Session::open(config).context("failed to open the session")?;

    match &cli.command {
        Command::Path(args) => commands::path::execute(&session, &cli.binary_name, &cli.function, args),
        Command::Exec(args) => commands::exec::execute(&session, args),
    }
}
