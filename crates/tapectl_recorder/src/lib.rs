//! Tees a live child's read stream into chunks, segments them into
//! exchanges at prompt/timeout/exit boundaries, and hands the finished tape
//! to the store. Decorators run as a best-effort pipeline: a failing
//! decorator is logged and skipped, never aborts the session.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tapectl_keys::MatchingContext;
use tapectl_store::{RecordMode, StoreError, TapeStore};
use tapectl_tape::{Chunk, Exchange, ExitInfo, Input, PreContext, PtyGeometry, SessionInfo, Tape, TapeMeta};

/// Decorator or redaction failure reported during finalize.
#[derive(Debug, Clone, thiserror::Error)]
#[error("decorator {name} failed: {reason}")]
pub struct DecoratorError {
    pub name: String,
    pub reason: String,
}

/// A redaction pass failed; persistence of this tape is aborted.
#[derive(Debug, Clone, thiserror::Error)]
#[error("redaction failed: {reason}")]
pub struct RedactionError {
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error(transparent)]
    Redaction(#[from] RedactionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How an exchange ended.
#[derive(Debug, Clone)]
pub enum ExchangeEndReason {
    PromptMatched,
    Timeout,
    ChildExited { code: i32, signal: Option<i32> },
}

/// Whether the caller's input was a text line or raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Line,
    Raw,
}

/// Append-only byte sink that timestamps writes relative to the previous one.
pub struct ChunkSink {
    chunks: Vec<Chunk>,
    last_write: Option<Instant>,
}

impl ChunkSink {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            last_write: None,
        }
    }

    /// Record `bytes` as a new chunk, delay measured from the previous write.
    pub fn write(&mut self, bytes: &[u8]) {
        let now = Instant::now();
        let delay_ms = match self.last_write {
            Some(prev) => now.saturating_duration_since(prev).as_millis() as u32,
            None => 0,
        };
        self.chunks.push(Chunk::new(delay_ms, bytes.to_vec()));
        self.last_write = Some(now);
    }

    pub fn flush(&mut self) {}

    /// Clear accumulated chunks and the delay clock, starting a fresh exchange.
    pub fn reset(&mut self) {
        self.chunks.clear();
        self.last_write = None;
    }

    pub fn drain(&mut self) -> Vec<Chunk> {
        std::mem::take(&mut self.chunks)
    }
}

impl Default for ChunkSink {
    fn default() -> Self {
        Self::new()
    }
}

struct PendingExchange {
    pre: PreContext,
    input: Input,
    started_at: Instant,
}

/// Static per-tape fields captured once when the Recorder is constructed.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
    pub pty: PtyGeometry,
    pub tag: Option<String>,
    pub seed: Option<u64>,
    pub platform: String,
    pub version: String,
    pub flags: Vec<String>,
    pub record_mode: RecordMode,
    pub redact: bool,
}

type InputDecorator = Box<dyn Fn(&MatchingContext, &[u8]) -> Result<Vec<u8>, DecoratorError> + Send>;
type OutputDecorator = Box<dyn Fn(&MatchingContext, &[Chunk]) -> Result<Vec<Chunk>, DecoratorError> + Send>;
type TapeDecorator = Box<dyn Fn(&mut Tape) -> Result<(), DecoratorError> + Send>;
type CustomRedactor = Box<dyn Fn(&[u8]) -> Result<Vec<u8>, RedactionError> + Send>;

/// Generates the relative tape path a finished recording is written to.
pub trait TapeNameGenerator: Send + Sync {
    fn generate(&self, program: &str, epoch_ms: u64, hash_seed: &[u8]) -> PathBuf;
}

fn basename(program: &str) -> &str {
    program.rsplit(['/', '\\']).next().unwrap_or(program)
}

/// `<program_basename>/unnamed-<epoch_ms>-<hash8>.json5`, the hash derived
/// from `(program, args, start time)`.
pub struct DefaultNameGenerator;

impl TapeNameGenerator for DefaultNameGenerator {
    fn generate(&self, program: &str, epoch_ms: u64, hash_seed: &[u8]) -> PathBuf {
        let mut hasher = blake3::Hasher::new();
        hasher.update(hash_seed);
        hasher.update(&epoch_ms.to_le_bytes());
        let digest = hasher.finalize();
        let hash8: String = digest.as_bytes()[..4].iter().map(|b| format!("{b:02x}")).collect();
        PathBuf::from(format!("{}/unnamed-{epoch_ms}-{hash8}.json5", basename(program)))
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Segments live output into exchanges and assembles the finished tape.
pub struct Recorder {
    config: RecorderConfig,
    sink: ChunkSink,
    pending: Vec<Exchange>,
    current: Option<PendingExchange>,
    input_decorator: Option<InputDecorator>,
    output_decorator: Option<OutputDecorator>,
    tape_decorator: Option<TapeDecorator>,
    custom_redactor: Option<CustomRedactor>,
}

impl Recorder {
    pub fn new(config: RecorderConfig) -> Self {
        let mut recorder = Self {
            config,
            sink: ChunkSink::new(),
            pending: Vec::new(),
            current: None,
            input_decorator: None,
            output_decorator: None,
            tape_decorator: None,
            custom_redactor: None,
        };
        // Implicit startup exchange: captures the banner before any send.
        recorder.current = Some(PendingExchange {
            pre: PreContext {
                prompt: String::new(),
                state_hash: None,
            },
            input: Input::Raw(Vec::new()),
            started_at: Instant::now(),
        });
        recorder
    }

    pub fn set_input_decorator(&mut self, f: InputDecorator) {
        self.input_decorator = Some(f);
    }

    pub fn set_output_decorator(&mut self, f: OutputDecorator) {
        self.output_decorator = Some(f);
    }

    pub fn set_tape_decorator(&mut self, f: TapeDecorator) {
        self.tape_decorator = Some(f);
    }

    pub fn set_custom_redactor(&mut self, f: CustomRedactor) {
        self.custom_redactor = Some(f);
    }

    /// Tee a chunk of output from the live child's read stream.
    pub fn tee(&mut self, bytes: &[u8]) {
        self.sink.write(bytes);
    }

    /// Begin a new exchange: snapshot the pre-context, decorate the input,
    /// and reset the chunk clock.
    pub fn on_send(&mut self, ctx: &MatchingContext, input_bytes: &[u8], kind: InputKind) {
        if self.current.is_some() {
            self.close_current(ctx, ExchangeEndReason::PromptMatched);
        }
        let decorated = match &self.input_decorator {
            Some(f) => match f(ctx, input_bytes) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(decorator = %e.name, reason = %e.reason, "input decorator failed; using undecorated input");
                    input_bytes.to_vec()
                }
            },
            None => input_bytes.to_vec(),
        };
        let input = match kind {
            InputKind::Line => Input::Line(String::from_utf8_lossy(&decorated).into_owned()),
            InputKind::Raw => Input::Raw(decorated),
        };
        self.current = Some(PendingExchange {
            pre: PreContext {
                prompt: tapectl_normalize::collapse_ws(&tapectl_normalize::strip_ansi(&ctx.prompt)),
                state_hash: ctx.state_hash.clone(),
            },
            input,
            started_at: Instant::now(),
        });
        self.sink.reset();
    }

    /// Close out the in-flight exchange and push it to the pending queue.
    pub fn on_exchange_end(&mut self, ctx: &MatchingContext, reason: ExchangeEndReason) {
        self.close_current(ctx, reason);
    }

    /// Take the in-flight exchange, if any, decorate its captured output, and
    /// push it to the pending queue. Shared by `on_exchange_end` and by
    /// `on_send`, which must flush the previous exchange before starting a
    /// new one rather than silently dropping it.
    fn close_current(&mut self, ctx: &MatchingContext, reason: ExchangeEndReason) {
        let Some(pending) = self.current.take() else {
            return;
        };
        let mut output = self.sink.drain();
        if let Some(f) = &self.output_decorator {
            match f(ctx, &output) {
                Ok(decorated) => output = decorated,
                Err(e) => {
                    tracing::warn!(decorator = %e.name, reason = %e.reason, "output decorator failed; using undecorated output");
                }
            }
        }
        let dur_ms = pending.started_at.elapsed().as_millis() as u64;
        let exit = match reason {
            ExchangeEndReason::ChildExited { code, signal } => Some(ExitInfo { code, signal }),
            _ => None,
        };
        self.pending.push(Exchange {
            pre: pending.pre,
            input: pending.input,
            output,
            exit,
            dur_ms,
            annotations: BTreeMap::new(),
        });
    }

    fn redact_pending(&self) -> Result<Vec<Exchange>, RedactionError> {
        let mut exchanges = self.pending.clone();
        for exchange in &mut exchanges {
            exchange.input = match &exchange.input {
                Input::Line(text) => Input::Line(self.redact_text(text)?),
                Input::Raw(bytes) => Input::Raw(self.redact_bytes(bytes)?),
            };
            for chunk in &mut exchange.output {
                chunk.data = self.redact_bytes(&chunk.data)?;
            }
        }
        Ok(exchanges)
    }

    fn redact_bytes(&self, bytes: &[u8]) -> Result<Vec<u8>, RedactionError> {
        if let Some(custom) = &self.custom_redactor {
            return custom(bytes);
        }
        match std::str::from_utf8(bytes) {
            Ok(text) => Ok(tapectl_normalize::redact_secrets(text).into_bytes()),
            Err(_) => Ok(bytes.to_vec()),
        }
    }

    fn redact_text(&self, text: &str) -> Result<String, RedactionError> {
        if let Some(custom) = &self.custom_redactor {
            let redacted = custom(text.as_bytes())?;
            return Ok(String::from_utf8_lossy(&redacted).into_owned());
        }
        Ok(tapectl_normalize::redact_secrets(text))
    }

    fn build_meta(&self) -> TapeMeta {
        TapeMeta {
            created_at: chrono::Utc::now(),
            program: self.config.program.clone(),
            args: self.config.args.clone(),
            env: self.config.env.clone(),
            cwd: self.config.cwd.clone(),
            pty: self.config.pty,
            tag: self.config.tag.clone(),
            latency: None,
            error_rate: None,
            seed: self.config.seed,
        }
    }

    /// Assemble the recorded exchanges into a Tape and persist it via
    /// `store`. Returns `None` when record mode is disabled or nothing was
    /// captured.
    pub fn finalize(
        &mut self,
        store: &TapeStore,
        naming: &dyn TapeNameGenerator,
    ) -> Result<Option<PathBuf>, RecorderError> {
        if self.config.record_mode == RecordMode::Disabled || self.pending.is_empty() {
            return Ok(None);
        }

        let exchanges = if self.config.redact {
            self.redact_pending()?
        } else {
            tracing::warn!("persisting unredacted tape bytes: redaction is disabled");
            self.pending.clone()
        };

        let mut tape = Tape {
            meta: self.build_meta(),
            session: SessionInfo {
                platform: self.config.platform.clone(),
                version: self.config.version.clone(),
                flags: self.config.flags.clone(),
            },
            exchanges,
        };

        if let Some(f) = &self.tape_decorator {
            if let Err(e) = f(&mut tape) {
                tracing::warn!(decorator = %e.name, reason = %e.reason, "tape decorator failed; using undecorated tape");
            }
        }

        let mut hash_seed = self.config.program.clone().into_bytes();
        hash_seed.push(0x1f);
        hash_seed.extend(self.config.args.join("\u{0}").into_bytes());
        let rel_path = naming.generate(&self.config.program, epoch_ms(), &hash_seed);

        store.write_tape(&rel_path, &tape, self.config.record_mode)?;
        self.pending.clear();
        Ok(Some(rel_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    fn ctx() -> MatchingContext {
        MatchingContext {
            program: "sqlite3".into(),
            args: vec![],
            env: BTreeMap::new(),
            cwd: "/tmp".into(),
            prompt: "sqlite> ".into(),
            state_hash: None,
        }
    }

    fn config() -> RecorderConfig {
        RecorderConfig {
            program: "sqlite3".into(),
            args: vec!["-batch".into()],
            env: BTreeMap::new(),
            cwd: "/tmp".into(),
            pty: PtyGeometry { rows: 24, cols: 80 },
            tag: None,
            seed: Some(42),
            platform: "linux".into(),
            version: "0.1.0".into(),
            flags: vec![],
            record_mode: RecordMode::New,
            redact: true,
        }
    }

    #[test]
    fn chunk_sink_first_write_has_zero_delay() {
        let mut sink = ChunkSink::new();
        sink.write(b"hello");
        let chunks = sink.drain();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].delay_ms, 0);
    }

    #[test]
    fn chunk_sink_reset_clears_clock() {
        let mut sink = ChunkSink::new();
        sink.write(b"a");
        sink.reset();
        sink.write(b"b");
        let chunks = sink.drain();
        assert_eq!(chunks[0].delay_ms, 0);
    }

    #[test]
    fn exchange_records_send_and_output() {
        let mut recorder = Recorder::new(config());
        recorder.on_exchange_end(&ctx(), ExchangeEndReason::PromptMatched);
        recorder.on_send(&ctx(), b"select 1;\n", InputKind::Line);
        recorder.tee(b"1\n");
        sleep(Duration::from_millis(5));
        recorder.tee(b"sqlite> ");
        recorder.on_exchange_end(&ctx(), ExchangeEndReason::PromptMatched);

        assert_eq!(recorder.pending.len(), 2);
        let exchange = &recorder.pending[1];
        assert_eq!(exchange.input, Input::Line("select 1;\n".into()));
        assert_eq!(exchange.output.len(), 2);
        assert!(exchange.dur_ms >= recorder.pending[1].output[1].delay_ms as u64);
    }

    #[test]
    fn empty_output_exchange_has_zero_chunks() {
        let mut recorder = Recorder::new(config());
        recorder.on_exchange_end(&ctx(), ExchangeEndReason::PromptMatched);
        recorder.on_send(&ctx(), b"select 1;\n", InputKind::Line);
        recorder.on_exchange_end(&ctx(), ExchangeEndReason::PromptMatched);
        assert_eq!(recorder.pending[1].output.len(), 0);
    }

    #[test]
    fn failing_input_decorator_falls_back_to_undecorated() {
        let mut recorder = Recorder::new(config());
        recorder.on_exchange_end(&ctx(), ExchangeEndReason::PromptMatched);
        recorder.set_input_decorator(Box::new(|_ctx, _bytes| {
            Err(DecoratorError {
                name: "uppercase".into(),
                reason: "boom".into(),
            })
        }));
        recorder.on_send(&ctx(), b"select 1;\n", InputKind::Line);
        recorder.on_exchange_end(&ctx(), ExchangeEndReason::PromptMatched);
        assert_eq!(recorder.pending[1].input, Input::Line("select 1;\n".into()));
    }

    #[test]
    fn redaction_masks_secret_in_output() {
        let mut recorder = Recorder::new(config());
        recorder.on_exchange_end(&ctx(), ExchangeEndReason::PromptMatched);
        recorder.on_send(&ctx(), b"whoami\n", InputKind::Line);
        recorder.tee(b"password: hunter2\n");
        recorder.on_exchange_end(&ctx(), ExchangeEndReason::PromptMatched);

        let redacted = recorder.redact_pending().unwrap();
        let text = std::str::from_utf8(&redacted[1].output[0].data).unwrap();
        assert!(text.contains("password: ***"));
    }

    #[test]
    fn finalize_writes_tape_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = TapeStore::load_all(dir.path());

        let mut recorder = Recorder::new(config());
        recorder.on_exchange_end(&ctx(), ExchangeEndReason::PromptMatched);
        recorder.on_send(&ctx(), b"select 1;\n", InputKind::Line);
        recorder.tee(b"1\nsqlite> ");
        recorder.on_exchange_end(
            &ctx(),
            ExchangeEndReason::ChildExited {
                code: 0,
                signal: None,
            },
        );

        let path = recorder.finalize(&store, &DefaultNameGenerator).unwrap();
        assert!(path.is_some());
        let rel = path.unwrap();
        assert!(dir.path().join(&rel).exists());
    }

    #[test]
    fn disabled_record_mode_finalize_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = TapeStore::load_all(dir.path());

        let mut cfg = config();
        cfg.record_mode = RecordMode::Disabled;
        let mut recorder = Recorder::new(cfg);
        recorder.on_exchange_end(&ctx(), ExchangeEndReason::PromptMatched);
        recorder.on_send(&ctx(), b"select 1;\n", InputKind::Line);
        recorder.tee(b"1\n");
        recorder.on_exchange_end(&ctx(), ExchangeEndReason::PromptMatched);

        let result = recorder.finalize(&store, &DefaultNameGenerator).unwrap();
        assert!(result.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
