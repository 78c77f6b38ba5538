//! Builds normalized lookup keys from a runtime matching context under an
//! allow/ignore policy. Hashing mirrors the `hash_parts` construction used
//! elsewhere in the workspace for idempotency keys: a 0x1F separator between
//! fields feeding a single blake3 hasher, truncated to 128 bits.

use std::collections::BTreeMap;
use tapectl_tape::Input;

const SEP: u8 = 0x1f;

/// 128-bit fingerprint identifying an exchange's matching context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedKey([u8; 16]);

impl NormalizedKey {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Hamming distance in bits, used to surface the nearest stored keys in
    /// a `TapeMissError` diagnostic.
    pub fn hamming_distance(&self, other: &NormalizedKey) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Runtime context a caller's input is matched against.
#[derive(Debug, Clone)]
pub struct MatchingContext {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
    pub prompt: String,
    pub state_hash: Option<String>,
}

/// Canonicalizes `(program, args)` into a custom match representation,
/// e.g. to fold equivalent invocations together.
pub trait CommandMatcher: Send + Sync {
    fn canonicalize(&self, program: &str, args: &[String]) -> (String, Vec<String>);
}

/// Canonicalizes stdin bytes before they are folded into the key, e.g. to
/// ignore whitespace-only differences a literal match would otherwise see.
pub trait StdinMatcher: Send + Sync {
    fn canonicalize(&self, input_bytes: &[u8]) -> Vec<u8>;
}

const IGNORE_CWD_SENTINEL: &str = "cwd";

/// Allow/ignore policy controlling which context fields feed the key.
#[derive(Default)]
pub struct KeyPolicy {
    pub allow_env: Option<Vec<String>>,
    pub ignore_env: Vec<String>,
    pub ignore_args: Vec<String>,
    pub ignore_stdin: bool,
    pub command_matcher: Option<Box<dyn CommandMatcher>>,
    pub stdin_matcher: Option<Box<dyn StdinMatcher>>,
}

fn basename(program: &str) -> &str {
    program
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(program)
}

fn filter_args(args: &[String], ignore_args: &[String]) -> Vec<String> {
    args.iter()
        .enumerate()
        .filter(|(idx, value)| {
            !ignore_args.contains(&idx.to_string()) && !ignore_args.contains(value)
        })
        .map(|(_, value)| value.clone())
        .collect()
}

fn filter_env(env: &BTreeMap<String, String>, policy: &KeyPolicy) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(k, _)| match &policy.allow_env {
            Some(allowed) => allowed.contains(k),
            None => !policy.ignore_env.contains(k),
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Build the normalized key for `(ctx, input)` under `policy`. Two contexts
/// yielding identical normalized fields always produce identical keys.
pub fn build_key(ctx: &MatchingContext, input: &Input, policy: &KeyPolicy) -> NormalizedKey {
    let (program, args) = if let Some(matcher) = &policy.command_matcher {
        matcher.canonicalize(basename(&ctx.program), &ctx.args)
    } else {
        (
            basename(&ctx.program).to_string(),
            filter_args(&ctx.args, &policy.ignore_args),
        )
    };

    let env = filter_env(&ctx.env, policy);

    let cwd = if policy.ignore_args.iter().any(|a| a == IGNORE_CWD_SENTINEL) {
        String::new()
    } else {
        ctx.cwd.clone()
    };

    let prompt = tapectl_normalize::collapse_ws(&tapectl_normalize::strip_ansi(&ctx.prompt));

    let input_bytes = if policy.ignore_stdin {
        Vec::new()
    } else {
        let raw = input.match_bytes();
        match &policy.stdin_matcher {
            Some(matcher) => matcher.canonicalize(&raw),
            None => raw,
        }
    };

    let mut hasher = blake3::Hasher::new();
    hasher.update(program.as_bytes());
    hasher.update(&[SEP]);
    hasher.update(args.join("\u{0}").as_bytes());
    hasher.update(&[SEP]);
    for (k, v) in &env {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b";");
    }
    hasher.update(&[SEP]);
    hasher.update(cwd.as_bytes());
    hasher.update(&[SEP]);
    hasher.update(prompt.as_bytes());
    hasher.update(&[SEP]);
    hasher.update(&input_bytes);
    hasher.update(&[SEP]);
    if let Some(state_hash) = &ctx.state_hash {
        hasher.update(state_hash.as_bytes());
    }

    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest.as_bytes()[..16]);
    NormalizedKey(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> MatchingContext {
        MatchingContext {
            program: "/usr/bin/sqlite3".into(),
            args: vec!["-batch".into()],
            env: BTreeMap::new(),
            cwd: "/tmp".into(),
            prompt: "sqlite> ".into(),
            state_hash: None,
        }
    }

    #[test]
    fn identical_contexts_produce_identical_keys() {
        let policy = KeyPolicy::default();
        let input = Input::Line("select 1;".into());
        let a = build_key(&ctx(), &input, &policy);
        let b = build_key(&ctx(), &input, &policy);
        assert_eq!(a, b);
    }

    #[test]
    fn program_basename_is_normalized() {
        let policy = KeyPolicy::default();
        let input = Input::Line("select 1;".into());
        let mut other = ctx();
        other.program = "sqlite3".into();
        assert_eq!(
            build_key(&ctx(), &input, &policy),
            build_key(&other, &input, &policy)
        );
    }

    #[test]
    fn ignored_cwd_does_not_affect_key() {
        let mut policy = KeyPolicy::default();
        policy.ignore_args.push("cwd".into());
        let input = Input::Line("select 1;".into());
        let mut other = ctx();
        other.cwd = "/somewhere/else".into();
        assert_eq!(
            build_key(&ctx(), &input, &policy),
            build_key(&other, &input, &policy)
        );
    }

    #[test]
    fn differing_input_changes_key() {
        let policy = KeyPolicy::default();
        let a = build_key(&ctx(), &Input::Line("select 1;".into()), &policy);
        let b = build_key(&ctx(), &Input::Line("select 2;".into()), &policy);
        assert_ne!(a, b);
    }

    #[test]
    fn ignore_stdin_collapses_different_inputs() {
        let mut policy = KeyPolicy::default();
        policy.ignore_stdin = true;
        let a = build_key(&ctx(), &Input::Line("select 1;".into()), &policy);
        let b = build_key(&ctx(), &Input::Line("select 2;".into()), &policy);
        assert_eq!(a, b);
    }

    #[test]
    fn env_allowlist_ignores_unlisted_keys() {
        let mut policy = KeyPolicy::default();
        policy.allow_env = Some(vec!["PATH".into()]);
        let mut a = ctx();
        a.env.insert("PATH".into(), "/bin".into());
        a.env.insert("SECRET".into(), "one".into());
        let mut b = ctx();
        b.env.insert("PATH".into(), "/bin".into());
        b.env.insert("SECRET".into(), "two".into());
        let input = Input::Line("select 1;".into());
        assert_eq!(build_key(&a, &input, &policy), build_key(&b, &input, &policy));
    }

    #[test]
    fn hamming_distance_zero_for_equal_keys() {
        let policy = KeyPolicy::default();
        let input = Input::Line("select 1;".into());
        let a = build_key(&ctx(), &input, &policy);
        assert_eq!(a.hamming_distance(&a), 0);
    }
}
