//! A minimal pipe-based stand-in for a live PTY child. The real PTY-spawning
//! library is an out-of-scope external collaborator (spec §6.2); this wraps
//! a plain `std::process::Child` with piped stdin/stdout, good enough to
//! drive the Recorder and exercise the full record path end to end.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tapectl_tape::ExitInfo;
use tapectl_transport::{last_lines, LogSink, Pattern, Transport, TransportError, RECENT_OUTPUT_LINES};

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn search_patterns(buffer: &[u8], patterns: &[Pattern]) -> Option<(usize, usize, usize)> {
    let mut best: Option<(usize, usize, usize)> = None;
    for (idx, pattern) in patterns.iter().enumerate() {
        let hit = match pattern {
            Pattern::Regex(re) => re.find(buffer).map(|m| (m.start(), m.end())),
            Pattern::Literal(lit) => find_subslice(buffer, lit).map(|s| (s, s + lit.len())),
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

/// Spawns `program` with piped stdin/stdout and a background thread that
/// forwards stdout bytes to the foreground `expect` loop over a channel.
pub struct LiveTransport {
    child: Child,
    stdin: ChildStdin,
    rx: mpsc::Receiver<Vec<u8>>,
    _reader: JoinHandle<()>,
    buffer: Vec<u8>,
    before: Vec<u8>,
    after: Vec<u8>,
    match_span: Option<(usize, usize)>,
    exit_status: Option<ExitInfo>,
    logfile: Option<Box<dyn LogSink>>,
}

impl LiveTransport {
    pub fn spawn(
        program: &str,
        args: &[String],
        cwd: &str,
        env: &BTreeMap<String, String>,
    ) -> std::io::Result<Self> {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        command.env_clear();
        for (k, v) in env {
            command.env(k, v);
        }

        let mut child = command.spawn()?;
        let stdin = child.stdin.take().expect("stdin was piped");
        let mut stdout = child.stdout.take().expect("stdout was piped");

        let (tx, rx) = mpsc::channel();
        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match stdout.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            child,
            stdin,
            rx,
            _reader: reader,
            buffer: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            match_span: None,
            exit_status: None,
            logfile: None,
        })
    }

    /// Drain the bytes read since the last call, for the Session to hand to
    /// the Recorder's `ChunkSink`. Coarser than a live per-read tee, but the
    /// PTY collaborator that would make per-read timing meaningful is out of
    /// scope here.
    pub fn take_consumed(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    fn drive_expect(&mut self, patterns: &[Pattern], timeout_ms: u64) -> Result<usize, TransportError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if let Some((start, end, idx)) = search_patterns(&self.buffer, patterns) {
                self.before = self.buffer[..start].to_vec();
                self.after = self.buffer[end..].to_vec();
                self.match_span = Some((start, end));
                return Ok(idx);
            }

            if let Ok(status) = self.child.try_wait() {
                if let Some(status) = status {
                    self.exit_status = Some(ExitInfo {
                        code: status.code().unwrap_or(-1),
                        signal: None,
                    });
                    if patterns.iter().any(|p| matches!(p, Pattern::Eof)) {
                        let len = self.buffer.len();
                        self.before = self.buffer.clone();
                        self.after.clear();
                        self.match_span = Some((len, len));
                        let idx = patterns.iter().position(|p| matches!(p, Pattern::Eof)).unwrap();
                        return Ok(idx);
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::ExpectTimeout {
                    recent_output: last_lines(&self.buffer, RECENT_OUTPUT_LINES),
                });
            }

            match self.rx.recv_timeout(remaining.min(Duration::from_millis(50))) {
                Ok(bytes) => {
                    if let Some(sink) = &mut self.logfile {
                        sink.write(&bytes);
                    }
                    self.buffer.extend_from_slice(&bytes);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {}
            }
        }
    }
}

impl Transport for LiveTransport {
    fn send(&mut self, bytes: &[u8]) -> usize {
        self.stdin.write_all(bytes).ok();
        bytes.len()
    }

    fn sendline(&mut self, text: &str) -> usize {
        let mut line = text.to_string();
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).ok();
        line.len()
    }

    fn expect(&mut self, patterns: &[Pattern], timeout_ms: u64) -> Result<usize, TransportError> {
        self.drive_expect(patterns, timeout_ms)
    }

    fn expect_exact(&mut self, literals: &[Vec<u8>], timeout_ms: u64) -> Result<usize, TransportError> {
        let patterns: Vec<Pattern> = literals.iter().cloned().map(Pattern::Literal).collect();
        self.drive_expect(&patterns, timeout_ms)
    }

    fn is_alive(&self) -> bool {
        self.exit_status.is_none()
    }

    fn terminate(&mut self, grace_ms: u64) -> Option<ExitInfo> {
        if let Ok(Some(status)) = self.child.try_wait() {
            self.exit_status = Some(ExitInfo {
                code: status.code().unwrap_or(-1),
                signal: None,
            });
            return self.exit_status.clone();
        }
        std::thread::sleep(Duration::from_millis(grace_ms));
        if self.child.try_wait().ok().flatten().is_none() {
            let _ = self.child.kill();
        }
        if let Ok(status) = self.child.wait() {
            self.exit_status = Some(ExitInfo {
                code: status.code().unwrap_or(-1),
                signal: None,
            });
        }
        self.exit_status.clone()
    }

    fn close(&mut self) {
        let _ = self.child.kill();
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
