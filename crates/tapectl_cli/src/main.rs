//! `tapectl`: wraps an interactive program, recording or replaying a
//! deterministic tape of the session; also inspects/maintains the tape
//! store directly via the `tapes` subcommand family.

mod cli;

use std::process::ExitCode;

use clap::Parser;
use tapectl_logging::{init_logging, LogConfig};

use cli::run::{Mode, SharedArgs};
use cli::tapes::TapesArgs;

#[derive(Parser, Debug)]
#[command(name = "tapectl", about = "Record and replay deterministic tapes of interactive terminal sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a program live, recording a new tape (record=new, fallback=proxy).
    Rec(SharedArgs),
    /// Replay a recorded tape against the wrapped program (record=disabled).
    Play(SharedArgs),
    /// Replay when a tape matches, fall back to a live child otherwise.
    Proxy(SharedArgs),
    /// Inspect and maintain the tape store.
    Tapes(TapesArgs),
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(64);
        }
    };

    let (verbose, quiet) = match &cli.command {
        Commands::Rec(a) | Commands::Play(a) | Commands::Proxy(a) => (a.debug, a.silent),
        Commands::Tapes(_) => (false, false),
    };

    if let Err(err) = init_logging(LogConfig {
        app_name: "tapectl",
        verbose,
        quiet,
    }) {
        eprintln!("failed to initialize logging: {err:#}");
        return ExitCode::from(4);
    }

    let result = match cli.command {
        Commands::Rec(args) => cli::run::run_session(args, Mode::Rec),
        Commands::Play(args) => cli::run::run_session(args, Mode::Play),
        Commands::Proxy(args) => cli::run::run_session(args, Mode::Proxy),
        Commands::Tapes(args) => cli::tapes::run(args),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(4)
        }
    }
}
