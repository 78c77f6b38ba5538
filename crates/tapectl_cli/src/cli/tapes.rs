//! The `tapes` subcommand family: inspect and maintain a tape store
//! directly, without driving a live session.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;

use tapectl_store::TapeStore;

#[derive(Args, Debug)]
pub struct TapesArgs {
    /// Tape store root directory.
    #[arg(long, default_value = "./tapes", global = true)]
    pub tapes: PathBuf,

    #[command(subcommand)]
    pub command: TapesCommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum TapesCommand {
    /// List every tape in the store with its exchange count.
    List,
    /// Validate every tape against the schema, reporting problems.
    Validate {
        /// Also flag unrecognized top-level keys.
        #[arg(long)]
        strict: bool,
    },
    /// Redact secrets out of recorded input/output across the store.
    Redact {
        /// Rewrite modified tapes in place; otherwise only report the count.
        #[arg(long)]
        inplace: bool,
    },
    /// Diff two tape files' exchanges.
    Diff { a: PathBuf, b: PathBuf },
}

pub fn run(args: TapesArgs) -> Result<ExitCode> {
    match args.command {
        TapesCommand::List => list(&args.tapes),
        TapesCommand::Validate { strict } => validate(&args.tapes, strict),
        TapesCommand::Redact { inplace } => redact(&args.tapes, inplace),
        TapesCommand::Diff { a, b } => diff(&a, &b),
    }
}

fn list(root: &std::path::Path) -> Result<ExitCode> {
    let (store, diagnostics) = TapeStore::load_all(root);
    for diag in &diagnostics {
        eprintln!("skipped {}: {}", diag.path.display(), diag.reason);
    }
    for (path, tape) in store.loaded_tapes() {
        println!(
            "{}\t{} exchange(s)\t{}",
            path.display(),
            tape.exchanges.len(),
            tape.meta.program
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn validate(root: &std::path::Path, strict: bool) -> Result<ExitCode> {
    let (store, diagnostics) = TapeStore::load_all(root);
    for diag in &diagnostics {
        eprintln!("skipped {}: {}", diag.path.display(), diag.reason);
    }
    let errors = store.validate(strict);
    if errors.is_empty() && diagnostics.is_empty() {
        println!("all tapes valid");
        return Ok(ExitCode::SUCCESS);
    }
    for (path, err) in &errors {
        eprintln!("{}: {err}", path.display());
    }
    if errors.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(3))
    }
}

fn redact(root: &std::path::Path, inplace: bool) -> Result<ExitCode> {
    let (store, diagnostics) = TapeStore::load_all(root);
    for diag in &diagnostics {
        eprintln!("skipped {}: {}", diag.path.display(), diag.reason);
    }
    let count = store
        .redact_all(inplace)
        .context("failed to redact tape store")?;
    println!("{count} tape(s) redacted{}", if inplace { "" } else { " (dry run)" });
    Ok(ExitCode::SUCCESS)
}

fn diff(a: &std::path::Path, b: &std::path::Path) -> Result<ExitCode> {
    let raw_a = std::fs::read(a).with_context(|| format!("failed to read {}", a.display()))?;
    let raw_b = std::fs::read(b).with_context(|| format!("failed to read {}", b.display()))?;
    let tape_a = tapectl_tape::decode(&raw_a).with_context(|| format!("failed to decode {}", a.display()))?;
    let tape_b = tapectl_tape::decode(&raw_b).with_context(|| format!("failed to decode {}", b.display()))?;

    let max_len = tape_a.exchanges.len().max(tape_b.exchanges.len());
    let mut differs = false;
    for idx in 0..max_len {
        match (tape_a.exchanges.get(idx), tape_b.exchanges.get(idx)) {
            (Some(x), Some(y)) if x == y => {}
            (Some(_), Some(_)) => {
                differs = true;
                println!("exchange {idx}: differs");
            }
            (Some(_), None) => {
                differs = true;
                println!("exchange {idx}: only in {}", a.display());
            }
            (None, Some(_)) => {
                differs = true;
                println!("exchange {idx}: only in {}", b.display());
            }
            (None, None) => unreachable!("idx < max_len"),
        }
    }
    if !differs {
        println!("tapes are equivalent ({} exchange(s))", tape_a.exchanges.len());
    }
    Ok(ExitCode::SUCCESS)
}
