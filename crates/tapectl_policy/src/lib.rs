//! Latency resolution, probabilistic error injection, redaction toggling,
//! and seed derivation for Replay sessions. The RNG is deterministic
//! (`rand_pcg::Pcg64`, not a cryptographic generator) because the contract
//! is reproducibility given a seed, not unpredictability.

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::sync::Arc;
use tapectl_keys::MatchingContext;

const MAX_LATENCY_MS: u32 = 60_000;

/// Resolves per-chunk replay delay: a constant, a uniform range, a callable,
/// or (if none configured) the recorded delay.
#[derive(Clone)]
pub enum LatencyPolicy {
    Const(u32),
    Range(u32, u32),
    Fn(Arc<dyn Fn(&MatchingContext) -> u32 + Send + Sync>),
}

impl std::fmt::Debug for LatencyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LatencyPolicy::Const(ms) => write!(f, "LatencyPolicy::Const({ms})"),
            LatencyPolicy::Range(lo, hi) => write!(f, "LatencyPolicy::Range({lo}, {hi})"),
            LatencyPolicy::Fn(_) => write!(f, "LatencyPolicy::Fn(..)"),
        }
    }
}

/// Resolves a probability (0-100) of injecting a synthetic fault into an
/// in-flight replay exchange.
#[derive(Clone)]
pub enum ErrorPolicy {
    Const(u8),
    Fn(Arc<dyn Fn(&MatchingContext) -> u8 + Send + Sync>),
}

impl std::fmt::Debug for ErrorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorPolicy::Const(rate) => write!(f, "ErrorPolicy::Const({rate})"),
            ErrorPolicy::Fn(_) => write!(f, "ErrorPolicy::Fn(..)"),
        }
    }
}

/// How an injected fault is surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorInjectionMode {
    /// Truncate output mid-stream; surface `InjectedError` on the next `expect`.
    Truncate,
    /// Latch `exit_status` to a configured non-zero code.
    ExitCode(i32),
}

/// Whether the Recorder is allowed to persist redacted or raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedactionPolicy {
    On,
    Off,
}

impl Default for RedactionPolicy {
    fn default() -> Self {
        RedactionPolicy::On
    }
}

/// Resolve the per-chunk delay for a recorded value, clamped to
/// `[0, 60_000]` ms.
pub fn resolve_latency(
    policy: &LatencyPolicy,
    ctx: &MatchingContext,
    recorded_ms: u32,
    rng: &mut PolicyRng,
) -> u32 {
    let raw = match policy {
        LatencyPolicy::Const(ms) => *ms,
        LatencyPolicy::Range(lo, hi) => rng.sample_uniform(*lo, *hi),
        LatencyPolicy::Fn(f) => f(ctx),
    };
    raw.min(MAX_LATENCY_MS)
}

/// Draw from the seeded RNG and report whether a fault should be injected
/// for this chunk, given `error_rate` in `[0, 100]`.
pub fn should_inject(error_rate: u8, rng: &mut PolicyRng) -> bool {
    let draw = rng.sample_unit();
    draw < (error_rate.min(100) as f64) / 100.0
}

/// Resolve the effective seed: per-tape override, else session override,
/// else a deterministic derivation from `(program, args, start_wallclock_day)`.
pub fn resolve_seed(
    tape_seed: Option<u64>,
    session_seed: Option<u64>,
    program: &str,
    args: &[String],
    wallclock_day: &str,
) -> u64 {
    tape_seed
        .or(session_seed)
        .unwrap_or_else(|| derive_seed(program, args, wallclock_day))
}

fn derive_seed(program: &str, args: &[String], wallclock_day: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(program.as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(args.join("\u{0}").as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(wallclock_day.as_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().expect("8 bytes"))
}

/// A session-owned deterministic RNG. Never shared across sessions; replay
/// and latency draws come from the same stream so the sequence of
/// `(latency_ms, error_decision)` pairs is reproducible given a seed.
pub struct PolicyRng {
    rng: Pcg64,
}

impl PolicyRng {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: Pcg64::seed_from_u64(seed),
        }
    }

    fn sample_uniform(&mut self, lo: u32, hi: u32) -> u32 {
        if lo >= hi {
            return lo;
        }
        self.rng.gen_range(lo..=hi)
    }

    fn sample_unit(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }
}
