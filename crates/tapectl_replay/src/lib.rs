//! A pexpect-shaped surrogate for a live child: resolves each `send` against
//! the tape store's index and streams the matched exchange's recorded
//! chunks back to the caller, pacing them per the latency policy and
//! occasionally injecting a fault per the error policy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tapectl_keys::{KeyPolicy, MatchingContext, NormalizedKey};
use tapectl_policy::{resolve_latency, should_inject, ErrorInjectionMode, ErrorPolicy, LatencyPolicy, PolicyRng};
use tapectl_store::TapeStore;
use tapectl_tape::{ExitInfo, Input};
use tapectl_transport::{last_lines, LogSink, Pattern, Transport, TransportError, RECENT_OUTPUT_LINES};

/// Fixed per-session fields a replayed context is built from; only `prompt`
/// and `state_hash` vary per exchange.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
    pub latency_policy: LatencyPolicy,
    pub error_policy: ErrorPolicy,
    pub error_mode: ErrorInjectionMode,
    pub key_policy: Arc<KeyPolicy>,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Streaming,
    Closed,
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Earliest-start, first-pattern-index tie-break match, mirroring pexpect.
fn search_patterns(buffer: &[u8], patterns: &[Pattern]) -> Option<(usize, usize, usize)> {
    let mut best: Option<(usize, usize, usize)> = None;
    for (idx, pattern) in patterns.iter().enumerate() {
        let hit = match pattern {
            Pattern::Regex(re) => re.find(buffer).map(|m| (m.start(), m.end())),
            Pattern::Literal(lit) => find_subslice(buffer, lit).map(|start| (start, start + lit.len())),
            Pattern::Eof | Pattern::Timeout => None,
        };
        if let Some((start, end)) = hit {
            match best {
                Some((best_start, ..)) if start >= best_start => {}
                _ => best = Some((start, end, idx)),
            }
        }
    }
    best
}

/// Stands in for a live child during replay, driving a looked-up exchange's
/// chunks through the shared `Transport` surface.
pub struct ReplayTransport {
    store: Arc<TapeStore>,
    config: ReplayConfig,
    rng: PolicyRng,
    prompt: String,
    state_hash: Option<String>,
    state: State,
    exchange: Option<(usize, usize)>,
    chunk_idx: usize,
    buffer: Vec<u8>,
    before: Vec<u8>,
    after: Vec<u8>,
    match_span: Option<(usize, usize)>,
    exit_status: Option<ExitInfo>,
    pending_miss: Option<TransportError>,
    logfile: Option<Box<dyn LogSink>>,
}

impl ReplayTransport {
    pub fn new(store: Arc<TapeStore>, config: ReplayConfig) -> Self {
        let seed = config.seed;
        Self {
            store,
            config,
            rng: PolicyRng::from_seed(seed),
            prompt: String::new(),
            state_hash: None,
            state: State::Idle,
            exchange: None,
            chunk_idx: 0,
            buffer: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            match_span: None,
            exit_status: None,
            pending_miss: None,
            logfile: None,
        }
    }

    /// Update the matching context's prompt/state hash ahead of the next `send`.
    pub fn note_prompt(&mut self, prompt: &str, state_hash: Option<String>) {
        self.prompt = prompt.to_string();
        self.state_hash = state_hash;
    }

    fn matching_ctx(&self) -> MatchingContext {
        MatchingContext {
            program: self.config.program.clone(),
            args: self.config.args.clone(),
            env: self.config.env.clone(),
            cwd: self.config.cwd.clone(),
            prompt: self.prompt.clone(),
            state_hash: self.state_hash.clone(),
        }
    }

    fn begin_exchange(&mut self, input: Input) {
        let ctx = self.matching_ctx();
        self.buffer.clear();
        self.before.clear();
        self.after.clear();
        self.match_span = None;
        self.chunk_idx = 0;
        self.pending_miss = None;

        match self.store.find_match(&ctx, &input, &self.config.key_policy) {
            Some(hit) => {
                if let Some((path, _)) = self.store.tape_at(hit.0) {
                    self.store.mark_used(&path);
                }
                self.exchange = Some(hit);
                self.state = State::Streaming;
            }
            None => {
                let key = tapectl_keys::build_key(&ctx, &input, &self.config.key_policy);
                let nearest = nearest_keys(&self.store, key, 3);
                self.pending_miss = Some(TransportError::TapeMiss {
                    key_components: format!(
                        "{}|{}|{}",
                        ctx.program,
                        ctx.args.join(","),
                        ctx.prompt
                    ),
                    nearest: nearest.into_iter().map(NormalizedKey::to_hex).collect(),
                });
                self.exchange = None;
                self.state = State::Idle;
            }
        }
    }

    fn current_exchange(&self) -> Option<tapectl_tape::Exchange> {
        let (tape_idx, exchange_idx) = self.exchange?;
        let (_, tape) = self.store.tape_at(tape_idx)?;
        tape.exchanges.get(exchange_idx).cloned()
    }

    fn drive_expect(&mut self, patterns: &[Pattern], timeout_ms: u64) -> Result<usize, TransportError> {
        if let Some(err) = self.pending_miss.take() {
            return Err(err);
        }

        let Some(exchange) = self.current_exchange() else {
            return Err(TransportError::Cancelled);
        };

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let error_rate = match &self.config.error_policy {
            ErrorPolicy::Const(rate) => *rate,
            ErrorPolicy::Fn(f) => f(&self.matching_ctx()),
        };

        loop {
            if let Some((start, end, idx)) = search_patterns(&self.buffer, patterns) {
                self.before = self.buffer[..start].to_vec();
                self.after = self.buffer[end..].to_vec();
                self.match_span = Some((start, end));
                self.settle_after_match(&exchange);
                return Ok(idx);
            }

            if self.chunk_idx < exchange.output.len() {
                let chunk = exchange.output[self.chunk_idx].clone();
                let ctx = self.matching_ctx();
                let latency = resolve_latency(&self.config.latency_policy, &ctx, chunk.delay_ms, &mut self.rng);
                if latency > 0 {
                    std::thread::sleep(Duration::from_millis(latency as u64));
                }

                if self.chunk_idx > 0 && should_inject(error_rate, &mut self.rng) {
                    match self.config.error_mode {
                        ErrorInjectionMode::Truncate => {
                            let at_exchange = self.exchange.map(|(_, idx)| idx).unwrap_or(0);
                            self.state = State::Idle;
                            return Err(TransportError::InjectedError { at_exchange });
                        }
                        ErrorInjectionMode::ExitCode(code) => {
                            self.exit_status = Some(ExitInfo { code, signal: None });
                            self.chunk_idx = exchange.output.len();
                            continue;
                        }
                    }
                }

                if let Some(sink) = &mut self.logfile {
                    sink.write(&chunk.data);
                }
                self.buffer.extend_from_slice(&chunk.data);
                self.chunk_idx += 1;
                continue;
            }

            if patterns.iter().any(|p| matches!(p, Pattern::Eof)) {
                let len = self.buffer.len();
                self.before = self.buffer.clone();
                self.after.clear();
                self.match_span = Some((len, len));
                self.settle_after_match(&exchange);
                let eof_idx = patterns.iter().position(|p| matches!(p, Pattern::Eof)).unwrap();
                return Ok(eof_idx);
            }

            if Instant::now() >= deadline {
                return Err(TransportError::ExpectTimeout {
                    recent_output: last_lines(&self.buffer, RECENT_OUTPUT_LINES),
                });
            }
        }
    }

    fn settle_after_match(&mut self, exchange: &tapectl_tape::Exchange) {
        if self.chunk_idx >= exchange.output.len() {
            if let Some(exit) = &exchange.exit {
                self.exit_status = Some(exit.clone());
                self.state = State::Closed;
                return;
            }
        }
        self.state = State::Idle;
    }
}

fn nearest_keys(store: &TapeStore, key: NormalizedKey, n: usize) -> Vec<NormalizedKey> {
    let mut keys = store.indexed_keys();
    keys.sort_by_key(|k| k.hamming_distance(&key));
    keys.truncate(n);
    keys
}

impl Transport for ReplayTransport {
    fn send(&mut self, bytes: &[u8]) -> usize {
        self.begin_exchange(Input::Raw(bytes.to_vec()));
        bytes.len()
    }

    fn sendline(&mut self, text: &str) -> usize {
        let mut line = text.to_string();
        line.push('\n');
        let len = line.len();
        self.begin_exchange(Input::Line(line));
        len
    }

    fn expect(&mut self, patterns: &[Pattern], timeout_ms: u64) -> Result<usize, TransportError> {
        self.drive_expect(patterns, timeout_ms)
    }

    fn expect_exact(&mut self, literals: &[Vec<u8>], timeout_ms: u64) -> Result<usize, TransportError> {
        let patterns: Vec<Pattern> = literals.iter().cloned().map(Pattern::Literal).collect();
        self.drive_expect(&patterns, timeout_ms)
    }

    fn is_alive(&self) -> bool {
        self.exit_status.is_none() && self.state != State::Closed
    }

    fn terminate(&mut self, _grace_ms: u64) -> Option<ExitInfo> {
        self.state = State::Closed;
        self.exit_status.clone()
    }

    fn close(&mut self) {
        self.state = State::Closed;
    }

    fn before(&self) -> &[u8] {
        &self.before
    }

    fn after(&self) -> &[u8] {
        &self.after
    }

    fn match_span(&self) -> Option<(usize, usize)> {
        self.match_span
    }

    fn exit_status(&self) -> Option<ExitInfo> {
        self.exit_status.clone()
    }

    fn set_logfile_read(&mut self, sink: Option<Box<dyn LogSink>>) {
        self.logfile = sink;
    }
}
