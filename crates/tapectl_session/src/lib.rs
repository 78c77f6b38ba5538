//! Orchestrates transport selection (C9): replay when record is disabled,
//! live-with-recording otherwise, with mid-session fallback from replay to
//! live on a tape miss when the fallback policy allows it.

mod live;
mod summary;

pub use live::LiveTransport;
pub use summary::print_summary;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tapectl_keys::{KeyPolicy, MatchingContext};
use tapectl_policy::{ErrorInjectionMode, ErrorPolicy, LatencyPolicy};
use tapectl_recorder::{
    DefaultNameGenerator, ExchangeEndReason, InputKind, Recorder, RecorderConfig, RecorderError,
    TapeNameGenerator,
};
use tapectl_replay::{ReplayConfig, ReplayTransport};
use tapectl_store::{RecordMode, StoreError, TapeStore};
use tapectl_tape::{ExitInfo, PtyGeometry};
use tapectl_transport::{Pattern, Transport, TransportError};

/// Replay-miss behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackMode {
    NotFound,
    Proxy,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Fixed construction parameters for a Session.
#[derive(Clone)]
pub struct SessionConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
    pub pty: PtyGeometry,
    pub tapes_root: PathBuf,
    pub record_mode: RecordMode,
    pub fallback_mode: FallbackMode,
    pub key_policy: Arc<KeyPolicy>,
    pub latency_policy: LatencyPolicy,
    pub error_policy: ErrorPolicy,
    pub error_mode: ErrorInjectionMode,
    pub redact: bool,
    pub seed: u64,
    pub summary: bool,
    pub platform: String,
    pub version: String,
    pub flags: Vec<String>,
    pub tag: Option<String>,
}

/// Grace period before a live child is force-killed on close.
const GRACE_MS: u64 = 2_000;

#[derive(Clone)]
struct PendingSend {
    bytes: Vec<u8>,
    is_line: bool,
    prompt: String,
    state_hash: Option<String>,
}

enum ActiveTransport {
    Live {
        transport: LiveTransport,
        recorder: Recorder,
        naming: Box<dyn TapeNameGenerator>,
    },
    Replay(ReplayTransport),
}

pub struct Session {
    store: Arc<TapeStore>,
    config: SessionConfig,
    active: ActiveTransport,
    last_input: Option<PendingSend>,
    closed: bool,
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        let (store, diagnostics) = TapeStore::load_all(&config.tapes_root);
        for d in &diagnostics {
            tracing::warn!(path = %d.path.display(), reason = %d.reason, "tape failed to load");
        }
        store.build_index(&config.key_policy);
        let store = Arc::new(store);

        let active = if config.record_mode == RecordMode::Disabled {
            ActiveTransport::Replay(ReplayTransport::new(store.clone(), Self::replay_config(&config)))
        } else {
            let transport = LiveTransport::spawn(&config.command, &config.args, &config.cwd, &config.env)?;
            let recorder = Recorder::new(Self::recorder_config(&config));
            ActiveTransport::Live {
                transport,
                recorder,
                naming: Box::new(DefaultNameGenerator),
            }
        };

        Ok(Self {
            store,
            config,
            active,
            last_input: None,
            closed: false,
        })
    }

    fn replay_config(config: &SessionConfig) -> ReplayConfig {
        ReplayConfig {
            program: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            cwd: config.cwd.clone(),
            latency_policy: config.latency_policy.clone(),
            error_policy: config.error_policy.clone(),
            error_mode: config.error_mode,
            key_policy: config.key_policy.clone(),
            seed: config.seed,
        }
    }

    fn recorder_config(config: &SessionConfig) -> RecorderConfig {
        RecorderConfig {
            program: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            cwd: config.cwd.clone(),
            pty: config.pty,
            tag: config.tag.clone(),
            seed: Some(config.seed),
            platform: config.platform.clone(),
            version: config.version.clone(),
            flags: config.flags.clone(),
            record_mode: config.record_mode,
            redact: config.redact,
        }
    }

    fn current_ctx(&self) -> MatchingContext {
        let (prompt, state_hash) = match &self.last_input {
            Some(p) => (p.prompt.clone(), p.state_hash.clone()),
            None => (String::new(), None),
        };
        MatchingContext {
            program: self.config.command.clone(),
            args: self.config.args.clone(),
            env: self.config.env.clone(),
            cwd: self.config.cwd.clone(),
            prompt,
            state_hash,
        }
    }

    pub fn send_line(&mut self, prompt_hint: &str, state_hash: Option<String>, text: &str) -> usize {
        self.last_input = Some(PendingSend {
            bytes: text.as_bytes().to_vec(),
            is_line: true,
            prompt: prompt_hint.to_string(),
            state_hash: state_hash.clone(),
        });
        let program = self.config.command.clone();
        let args = self.config.args.clone();
        let env = self.config.env.clone();
        let cwd = self.config.cwd.clone();
        match &mut self.active {
            ActiveTransport::Live { transport, recorder, .. } => {
                let ctx = MatchingContext {
                    program,
                    args,
                    env,
                    cwd,
                    prompt: prompt_hint.to_string(),
                    state_hash,
                };
                recorder.on_send(&ctx, text.as_bytes(), InputKind::Line);
                transport.sendline(text)
            }
            ActiveTransport::Replay(transport) => {
                transport.note_prompt(prompt_hint, state_hash);
                transport.sendline(text)
            }
        }
    }

    pub fn send(&mut self, prompt_hint: &str, state_hash: Option<String>, bytes: &[u8]) -> usize {
        self.last_input = Some(PendingSend {
            bytes: bytes.to_vec(),
            is_line: false,
            prompt: prompt_hint.to_string(),
            state_hash: state_hash.clone(),
        });
        let program = self.config.command.clone();
        let args = self.config.args.clone();
        let env = self.config.env.clone();
        let cwd = self.config.cwd.clone();
        match &mut self.active {
            ActiveTransport::Live { transport, recorder, .. } => {
                let ctx = MatchingContext {
                    program,
                    args,
                    env,
                    cwd,
                    prompt: prompt_hint.to_string(),
                    state_hash,
                };
                recorder.on_send(&ctx, bytes, InputKind::Raw);
                transport.send(bytes)
            }
            ActiveTransport::Replay(transport) => {
                transport.note_prompt(prompt_hint, state_hash);
                transport.send(bytes)
            }
        }
    }

    fn resend_pending(&mut self, pending: &PendingSend) {
        let program = self.config.command.clone();
        let args = self.config.args.clone();
        let env = self.config.env.clone();
        let cwd = self.config.cwd.clone();
        if let ActiveTransport::Live { transport, recorder, .. } = &mut self.active {
            let ctx = MatchingContext {
                program,
                args,
                env,
                cwd,
                prompt: pending.prompt.clone(),
                state_hash: pending.state_hash.clone(),
            };
            let kind = if pending.is_line { InputKind::Line } else { InputKind::Raw };
            recorder.on_send(&ctx, &pending.bytes, kind);
            if pending.is_line {
                transport.sendline(&String::from_utf8_lossy(&pending.bytes));
            } else {
                transport.send(&pending.bytes);
            }
        }
    }

    fn fallback_to_live(&mut self) -> Result<(), SessionError> {
        tracing::info!("tape miss under proxy fallback; spawning live child");
        let transport = LiveTransport::spawn(&self.config.command, &self.config.args, &self.config.cwd, &self.config.env)?;
        let recorder = Recorder::new(Self::recorder_config(&self.config));
        self.active = ActiveTransport::Live {
            transport,
            recorder,
            naming: Box::new(DefaultNameGenerator),
        };
        Ok(())
    }

    pub fn expect(&mut self, patterns: &[Pattern], timeout_ms: u64) -> Result<usize, SessionError> {
        let ctx = self.current_ctx();
        let mut is_replay_miss = false;
        let outcome: Result<usize, TransportError> = match &mut self.active {
            ActiveTransport::Live { transport, recorder, .. } => {
                let result = transport.expect(patterns, timeout_ms);
                let consumed = transport.take_consumed();
                recorder.tee(&consumed);
                match &result {
                    Ok(_) => {
                        if let Some(exit) = transport.exit_status() {
                            recorder.on_exchange_end(
                                &ctx,
                                ExchangeEndReason::ChildExited {
                                    code: exit.code,
                                    signal: exit.signal,
                                },
                            );
                        } else {
                            recorder.on_exchange_end(&ctx, ExchangeEndReason::PromptMatched);
                        }
                    }
                    Err(TransportError::ExpectTimeout { .. }) => {
                        recorder.on_exchange_end(&ctx, ExchangeEndReason::Timeout);
                    }
                    Err(_) => {}
                }
                result
            }
            ActiveTransport::Replay(transport) => {
                let result = transport.expect(patterns, timeout_ms);
                is_replay_miss = matches!(result, Err(TransportError::TapeMiss { .. }));
                result
            }
        };

        if is_replay_miss && self.config.fallback_mode == FallbackMode::Proxy {
            self.fallback_to_live()?;
            if let Some(pending) = self.last_input.clone() {
                self.resend_pending(&pending);
            }
            return self.expect(patterns, timeout_ms);
        }

        outcome.map_err(SessionError::from)
    }

    pub fn expect_exact(&mut self, literals: &[Vec<u8>], timeout_ms: u64) -> Result<usize, SessionError> {
        let patterns: Vec<Pattern> = literals.iter().cloned().map(Pattern::Literal).collect();
        self.expect(&patterns, timeout_ms)
    }

    pub fn is_alive(&self) -> bool {
        match &self.active {
            ActiveTransport::Live { transport, .. } => transport.is_alive(),
            ActiveTransport::Replay(transport) => transport.is_alive(),
        }
    }

    pub fn before(&self) -> &[u8] {
        match &self.active {
            ActiveTransport::Live { transport, .. } => transport.before(),
            ActiveTransport::Replay(transport) => transport.before(),
        }
    }

    pub fn after(&self) -> &[u8] {
        match &self.active {
            ActiveTransport::Live { transport, .. } => transport.after(),
            ActiveTransport::Replay(transport) => transport.after(),
        }
    }

    pub fn exit_status(&self) -> Option<ExitInfo> {
        match &self.active {
            ActiveTransport::Live { transport, .. } => transport.exit_status(),
            ActiveTransport::Replay(transport) => transport.exit_status(),
        }
    }

    pub fn store(&self) -> &TapeStore {
        &self.store
    }

    /// Terminate the live child (if any), flush the Recorder, and print the
    /// exit summary if enabled. Idempotent.
    pub fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match &mut self.active {
            ActiveTransport::Live { transport, recorder, naming } => {
                transport.terminate(GRACE_MS);
                recorder.finalize(&self.store, naming.as_ref())?;
            }
            ActiveTransport::Replay(transport) => {
                transport.close();
            }
        }

        if self.config.summary {
            print_summary(&self.store);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapectl_tape::{Chunk, Exchange, PreContext, SessionInfo, Tape, TapeMeta};

    fn base_config(tapes_root: PathBuf) -> SessionConfig {
        SessionConfig {
            command: "sqlite3".into(),
            args: vec!["-batch".into()],
            env: BTreeMap::new(),
            cwd: "/tmp".into(),
            pty: PtyGeometry { rows: 24, cols: 80 },
            tapes_root,
            record_mode: RecordMode::Disabled,
            fallback_mode: FallbackMode::NotFound,
            key_policy: Arc::new(KeyPolicy::default()),
            latency_policy: LatencyPolicy::Const(0),
            error_policy: ErrorPolicy::Const(0),
            error_mode: ErrorInjectionMode::Truncate,
            redact: true,
            seed: 42,
            summary: false,
            platform: "linux".into(),
            version: "0.1.0".into(),
            flags: vec![],
            tag: None,
        }
    }

    fn write_sample_tape(dir: &std::path::Path) {
        std::fs::create_dir_all(dir.join("sqlite3")).unwrap();
        let meta = TapeMeta {
            created_at: "2024-01-02T03:04:05Z".parse().unwrap(),
            program: "sqlite3".into(),
            args: vec!["-batch".into()],
            env: BTreeMap::new(),
            cwd: "/tmp".into(),
            pty: PtyGeometry { rows: 24, cols: 80 },
            tag: None,
            latency: None,
            error_rate: None,
            seed: None,
        };
        let session = SessionInfo {
            platform: "linux".into(),
            version: "0.1.0".into(),
            flags: vec![],
        };
        let mut exchange = Exchange::new(
            PreContext {
                prompt: String::new(),
                state_hash: None,
            },
            tapectl_tape::Input::Line("select 1;\n".into()),
        );
        exchange.output.push(Chunk::new(0, b"1\n".to_vec()));
        exchange.dur_ms = 0;
        let tape = Tape {
            meta,
            session,
            exchanges: vec![exchange],
        };
        std::fs::write(dir.join("sqlite3/a.json5"), tapectl_tape::encode(&tape)).unwrap();
    }

    #[test]
    fn replay_session_hits_recorded_exchange() {
        let dir = tempfile::tempdir().unwrap();
        write_sample_tape(dir.path());
        let mut session = Session::new(base_config(dir.path().to_path_buf())).unwrap();

        session.send_line("", None, "select 1;");
        let result = session.expect(&[Pattern::literal("1\n")], 1000);
        assert!(result.is_ok());
    }

    #[test]
    fn replay_session_miss_not_found_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        write_sample_tape(dir.path());
        let mut session = Session::new(base_config(dir.path().to_path_buf())).unwrap();

        session.send_line("", None, "select 2;");
        let result = session.expect(&[Pattern::literal("1\n")], 1000);
        assert!(matches!(result, Err(SessionError::Transport(TransportError::TapeMiss { .. }))));
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_sample_tape(dir.path());
        let mut session = Session::new(base_config(dir.path().to_path_buf())).unwrap();
        session.close().unwrap();
        session.close().unwrap();
    }

    #[test]
    fn live_session_round_trips_through_cat() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path().to_path_buf());
        config.command = "cat".into();
        config.args = vec![];
        config.record_mode = RecordMode::New;
        config.fallback_mode = FallbackMode::Proxy;

        let mut session = Session::new(config).unwrap();
        session.send_line("", None, "hello");
        let result = session.expect(&[Pattern::literal("hello\n")], 2000);
        assert!(result.is_ok());
        session.close().unwrap();

        let mut found = false;
        for entry in walkdir_like(dir.path()) {
            if entry.extension().and_then(|e| e.to_str()) == Some("json5") {
                found = true;
            }
        }
        assert!(found, "expected a tape file to be written under {:?}", dir.path());
    }

    fn walkdir_like(root: &std::path::Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    out.extend(walkdir_like(&path));
                } else {
                    out.push(path);
                }
            }
        }
        out
    }
}
