//! Shared driver for the `rec`/`play`/`proxy` subcommands: builds a
//! `Session` from the shared flags and pumps stdin lines through it,
//! printing whatever comes back until the child exits or stdin closes.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use tapectl_keys::KeyPolicy;
use tapectl_policy::{resolve_seed, ErrorInjectionMode, ErrorPolicy, LatencyPolicy};
use tapectl_session::{FallbackMode, Session, SessionConfig, SessionError};
use tapectl_store::RecordMode;
use tapectl_tape::PtyGeometry;
use tapectl_transport::TransportError;

/// No prompt pattern is known generically, so each send is followed by a
/// short idle wait: whatever arrives within this window is treated as the
/// reply and the resulting `ExpectTimeout` is the natural exchange boundary.
const IDLE_TIMEOUT_MS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Rec,
    Play,
    Proxy,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordModeArg {
    New,
    Overwrite,
    Disabled,
}

impl From<RecordModeArg> for RecordMode {
    fn from(value: RecordModeArg) -> Self {
        match value {
            RecordModeArg::New => RecordMode::New,
            RecordModeArg::Overwrite => RecordMode::Overwrite,
            RecordModeArg::Disabled => RecordMode::Disabled,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallbackArg {
    #[value(name = "not_found")]
    NotFound,
    Proxy,
}

impl From<FallbackArg> for FallbackMode {
    fn from(value: FallbackArg) -> Self {
        match value {
            FallbackArg::NotFound => FallbackMode::NotFound,
            FallbackArg::Proxy => FallbackMode::Proxy,
        }
    }
}

#[derive(Args, Debug)]
pub struct SharedArgs {
    /// Tape store root directory.
    #[arg(long, default_value = "./tapes")]
    pub tapes: std::path::PathBuf,

    #[arg(long, value_enum)]
    pub record: Option<RecordModeArg>,

    #[arg(long, value_enum)]
    pub fallback: Option<FallbackArg>,

    /// `<ms>` for a constant delay, or `<min>,<max>` for a uniform range.
    #[arg(long)]
    pub latency: Option<String>,

    #[arg(long = "error-rate")]
    pub error_rate: Option<u8>,

    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub summary: Option<bool>,

    #[arg(long)]
    pub silent: bool,

    #[arg(long)]
    pub debug: bool,

    #[arg(long = "allow-env", value_delimiter = ',')]
    pub allow_env: Vec<String>,

    #[arg(long = "ignore-env", value_delimiter = ',')]
    pub ignore_env: Vec<String>,

    #[arg(long = "ignore-args", value_delimiter = ',')]
    pub ignore_args: Vec<String>,

    #[arg(long = "ignore-stdin")]
    pub ignore_stdin: bool,

    /// Tag recorded under `meta.tag`, for labeling related tapes.
    #[arg(long)]
    pub name: Option<String>,

    /// The wrapped program and its arguments, after `--`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

fn parse_latency(spec: &str) -> Result<LatencyPolicy> {
    if let Some((lo, hi)) = spec.split_once(',') {
        let lo: u32 = lo.trim().parse().context("invalid latency range start")?;
        let hi: u32 = hi.trim().parse().context("invalid latency range end")?;
        Ok(LatencyPolicy::Range(lo, hi))
    } else {
        let ms: u32 = spec.trim().parse().context("invalid latency value")?;
        Ok(LatencyPolicy::Const(ms))
    }
}

pub fn run_session(args: SharedArgs, mode: Mode) -> Result<ExitCode> {
    if args.command.is_empty() {
        anyhow::bail!("missing program to run after `--`");
    }
    let (program, program_args) = args.command.split_first().expect("checked non-empty above");

    let record_mode = match mode {
        Mode::Rec => args.record.map(RecordMode::from).unwrap_or(RecordMode::New),
        Mode::Play => RecordMode::Disabled,
        Mode::Proxy => RecordMode::New,
    };
    let fallback_mode = match mode {
        Mode::Rec => args.fallback.map(FallbackMode::from).unwrap_or(FallbackMode::Proxy),
        Mode::Play => args.fallback.map(FallbackMode::from).unwrap_or(FallbackMode::NotFound),
        Mode::Proxy => FallbackMode::Proxy,
    };

    let key_policy = Arc::new(KeyPolicy {
        allow_env: if args.allow_env.is_empty() {
            None
        } else {
            Some(args.allow_env.clone())
        },
        ignore_env: args.ignore_env.clone(),
        ignore_args: args.ignore_args.clone(),
        ignore_stdin: args.ignore_stdin,
        command_matcher: None,
        stdin_matcher: None,
    });

    let latency_policy = match &args.latency {
        Some(spec) => parse_latency(spec)?,
        None => LatencyPolicy::Const(0),
    };
    let error_policy = ErrorPolicy::Const(args.error_rate.unwrap_or(0));

    let wallclock_day = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let seed = resolve_seed(None, None, program, program_args, &wallclock_day);

    let env: BTreeMap<String, String> = std::env::vars().collect();
    let cwd = std::env::current_dir()
        .context("failed to read current directory")?
        .to_string_lossy()
        .into_owned();

    let config = SessionConfig {
        command: program.clone(),
        args: program_args.to_vec(),
        env,
        cwd,
        pty: PtyGeometry { rows: 24, cols: 80 },
        tapes_root: args.tapes.clone(),
        record_mode,
        fallback_mode,
        key_policy,
        latency_policy,
        error_policy,
        error_mode: ErrorInjectionMode::Truncate,
        redact: true,
        seed,
        summary: args.summary.unwrap_or(!args.silent),
        platform: std::env::consts::OS.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        flags: vec![],
        tag: args.name.clone(),
    };

    let mut session = Session::new(config).context("failed to start session")?;
    let exit_code = drive_interactive(&mut session);
    session.close().context("failed to finalize session")?;
    exit_code
}

fn drive_interactive(session: &mut Session) -> Result<ExitCode> {
    let stdin = std::io::stdin();
    let mut line = String::new();
    let mut exit_code = ExitCode::SUCCESS;

    'lines: loop {
        if !session.is_alive() {
            break;
        }
        line.clear();
        let read = stdin
            .lock()
            .read_line(&mut line)
            .context("failed to read from stdin")?;
        if read == 0 {
            break;
        }
        let text = line.trim_end_matches(['\n', '\r']);
        session.send_line("", None, text);

        loop {
            match session.expect(&[], IDLE_TIMEOUT_MS) {
                Ok(_) => {
                    print_bytes(session.before());
                    print_bytes(session.after());
                }
                Err(SessionError::Transport(TransportError::ExpectTimeout { recent_output })) => {
                    print_bytes(&recent_output);
                    break;
                }
                Err(SessionError::Transport(TransportError::TapeMiss { key_components, nearest })) => {
                    eprintln!(
                        "tape miss: no recorded exchange for {key_components} (nearest: {})",
                        nearest.join(", ")
                    );
                    exit_code = ExitCode::from(2);
                    break 'lines;
                }
                Err(SessionError::Transport(TransportError::InjectedError { at_exchange })) => {
                    eprintln!("injected fault at exchange {at_exchange}");
                    break;
                }
                Err(SessionError::Transport(TransportError::Cancelled)) => break,
                Err(SessionError::Store(err)) => return Err(err).context("tape store error"),
                Err(SessionError::Recorder(err)) => return Err(err).context("recorder error"),
                Err(SessionError::Io(err)) => return Err(err).context("I/O error"),
            }
            if !session.is_alive() {
                break;
            }
        }
    }

    Ok(exit_code)
}

fn print_bytes(bytes: &[u8]) {
    use std::io::Write;
    if bytes.is_empty() {
        return;
    }
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    let _ = lock.write_all(bytes);
    let _ = lock.flush();
}
