//! The capability set shared by a live PTY child and the Replay Transport:
//! `send`/`sendline`/`expect`/`expect_exact`/`is_alive`/`close`, plus the
//! observable `before`/`after`/`match_span`/`exit_status` fields. Modeled as
//! a trait so the Session Facade can be monomorphized per transport with no
//! runtime dispatch in the hot path.

pub use tapectl_tape::ExitInfo as ExitStatus;

/// One element of a pattern set passed to `expect`.
#[derive(Debug, Clone)]
pub enum Pattern {
    Regex(regex::bytes::Regex),
    Literal(Vec<u8>),
    Eof,
    Timeout,
}

impl Pattern {
    pub fn literal(bytes: impl Into<Vec<u8>>) -> Self {
        Pattern::Literal(bytes.into())
    }

    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Pattern::Regex(regex::bytes::Regex::new(pattern)?))
    }
}

/// A byte sink a transport can tee its read stream into (`logfile_read`).
pub trait LogSink: Send {
    fn write(&mut self, bytes: &[u8]);
    fn flush(&mut self);
}

/// Errors a transport's blocking operations can raise.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("expect timed out waiting for a pattern match")]
    ExpectTimeout { recent_output: Vec<u8> },
    #[error("transport was cancelled while an operation was in flight")]
    Cancelled,
    #[error("a fault was injected at exchange {at_exchange}")]
    InjectedError { at_exchange: usize },
    #[error("no recorded exchange matched this input")]
    TapeMiss {
        key_components: String,
        nearest: Vec<String>,
    },
}

/// The number of trailing output lines kept in an `ExpectTimeout` snapshot.
pub const RECENT_OUTPUT_LINES: usize = 50;

/// Truncate `buf` to at most `RECENT_OUTPUT_LINES` trailing lines, splitting
/// on `\n` and preserving the original line endings of the kept suffix.
pub fn last_lines(buf: &[u8], max_lines: usize) -> Vec<u8> {
    let newline_positions: Vec<usize> = buf
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'\n')
        .map(|(i, _)| i)
        .collect();
    let len = newline_positions.len();
    if len <= max_lines {
        return buf.to_vec();
    }
    let start = newline_positions[len - max_lines - 1] + 1;
    buf[start..].to_vec()
}

/// Shared transport surface implemented by both the live child handle and
/// the Replay Transport.
pub trait Transport {
    fn send(&mut self, bytes: &[u8]) -> usize;
    fn sendline(&mut self, text: &str) -> usize;
    fn expect(&mut self, patterns: &[Pattern], timeout_ms: u64) -> Result<usize, TransportError>;
    fn expect_exact(
        &mut self,
        literals: &[Vec<u8>],
        timeout_ms: u64,
    ) -> Result<usize, TransportError>;
    fn is_alive(&self) -> bool;
    fn terminate(&mut self, grace_ms: u64) -> Option<ExitStatus>;
    fn close(&mut self);
    fn before(&self) -> &[u8];
    fn after(&self) -> &[u8];
    fn match_span(&self) -> Option<(usize, usize)>;
    fn exit_status(&self) -> Option<ExitStatus>;
    fn set_logfile_read(&mut self, sink: Option<Box<dyn LogSink>>);
}
