//! Tape/exchange/chunk data model and JSON5 codec.
//!
//! A tape captures one invocation of a target program as an ordered list of
//! exchanges. Encoding is deterministic: struct field order mirrors the
//! on-disk key order so diffs between tape revisions stay stable.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Error returned when a tape fails to decode or validate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("schema error at {path}: {reason}")]
pub struct SchemaError {
    pub path: String,
    pub reason: String,
}

impl SchemaError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// A timed byte segment of an exchange's output.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub delay_ms: u32,
    pub data: Vec<u8>,
    pub is_utf8: bool,
}

impl Chunk {
    /// Construct a chunk, computing `is_utf8` from a strict validity check.
    pub fn new(delay_ms: u32, data: Vec<u8>) -> Self {
        let is_utf8 = std::str::from_utf8(&data).is_ok();
        Self {
            delay_ms,
            data,
            is_utf8,
        }
    }
}

impl Serialize for Chunk {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("delayMs", &self.delay_ms)?;
        map.serialize_entry("dataB64", &STANDARD.encode(&self.data))?;
        map.serialize_entry("isUtf8", &self.is_utf8)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Chunk {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(rename = "delayMs", alias = "delay_ms")]
            delay_ms: u32,
            #[serde(rename = "dataB64", alias = "data_b64")]
            data_b64: String,
            #[serde(rename = "isUtf8", alias = "is_utf8", default)]
            is_utf8: Option<bool>,
        }
        let raw = Raw::deserialize(deserializer)?;
        let data = STANDARD
            .decode(&raw.data_b64)
            .map_err(|e| de::Error::custom(format!("invalid base64 in dataB64: {e}")))?;
        let is_utf8 = raw
            .is_utf8
            .unwrap_or_else(|| std::str::from_utf8(&data).is_ok());
        Ok(Chunk {
            delay_ms: raw.delay_ms,
            data,
            is_utf8,
        })
    }
}

/// An input that began an exchange: either a newline-terminated line or
/// arbitrary raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Line(String),
    Raw(Vec<u8>),
}

impl Input {
    /// The bytes used for key-building and matching: `Line` has its single
    /// trailing `\r?\n` stripped; `Raw` is used verbatim.
    pub fn match_bytes(&self) -> Vec<u8> {
        match self {
            Input::Line(s) => strip_trailing_newline(s).into(),
            Input::Raw(b) => b.clone(),
        }
    }
}

fn strip_trailing_newline(s: &str) -> &str {
    let s = s.strip_suffix('\n').unwrap_or(s);
    s.strip_suffix('\r').unwrap_or(s)
}

impl Serialize for Input {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;
        match self {
            Input::Line(text) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "line")?;
                map.serialize_entry("dataText", text)?;
                map.end()
            }
            Input::Raw(bytes) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "raw")?;
                map.serialize_entry("dataBytesB64", &STANDARD.encode(bytes))?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Input {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(rename = "type")]
            ty: String,
            #[serde(rename = "dataText", alias = "data_text", default)]
            data_text: Option<String>,
            #[serde(rename = "dataBytesB64", alias = "data_bytes_b64", default)]
            data_bytes_b64: Option<String>,
        }
        let raw = Raw::deserialize(deserializer)?;
        match raw.ty.as_str() {
            "line" => {
                let text = raw
                    .data_text
                    .ok_or_else(|| de::Error::missing_field("dataText"))?;
                Ok(Input::Line(text))
            }
            "raw" => {
                let b64 = raw
                    .data_bytes_b64
                    .ok_or_else(|| de::Error::missing_field("dataBytesB64"))?;
                let bytes = STANDARD
                    .decode(&b64)
                    .map_err(|e| de::Error::custom(format!("invalid base64 in dataBytesB64: {e}")))?;
                Ok(Input::Raw(bytes))
            }
            other => Err(de::Error::custom(format!("unknown input type: {other}"))),
        }
    }
}

/// Exit status recorded on the last exchange of a tape, if the program exited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

/// Context captured immediately before an exchange begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreContext {
    pub prompt: String,
    #[serde(alias = "state_hash", skip_serializing_if = "Option::is_none")]
    pub state_hash: Option<String>,
}

/// Geometry of the pseudo-terminal a tape was recorded against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyGeometry {
    pub rows: u16,
    pub cols: u16,
}

/// A per-tape override of the session-wide latency policy. The callable
/// variant of the runtime policy (see `tapectl_policy`) has no persisted
/// form; only the constant and range shapes round-trip through a tape file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TapeLatencyOverride {
    Const { ms: u32 },
    Range { lo: u32, hi: u32 },
}

/// One atomic input-plus-response segment within a tape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exchange {
    pub pre: PreContext,
    pub input: Input,
    pub output: Vec<Chunk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitInfo>,
    #[serde(alias = "dur_ms")]
    pub dur_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, serde_json::Value>,
}

impl Exchange {
    pub fn new(pre: PreContext, input: Input) -> Self {
        Self {
            pre,
            input,
            output: Vec::new(),
            exit: None,
            dur_ms: 0,
            annotations: BTreeMap::new(),
        }
    }
}

/// Per-tape invocation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapeMeta {
    #[serde(alias = "created_at")]
    pub created_at: DateTime<Utc>,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
    pub pty: PtyGeometry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<TapeLatencyOverride>,
    #[serde(
        rename = "errorRate",
        alias = "error_rate",
        skip_serializing_if = "Option::is_none"
    )]
    pub error_rate: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// Recording-side session descriptor, carried for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub platform: String,
    pub version: String,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// A persistent record of one program invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tape {
    pub meta: TapeMeta,
    pub session: SessionInfo,
    pub exchanges: Vec<Exchange>,
}

/// Encode a tape to its canonical JSON5 textual form. `is_utf8` flags are
/// recomputed from the chunk bytes so a caller can never persist a stale flag.
pub fn encode(tape: &Tape) -> Vec<u8> {
    let mut normalized = tape.clone();
    for exchange in &mut normalized.exchanges {
        for chunk in &mut exchange.output {
            chunk.is_utf8 = std::str::from_utf8(&chunk.data).is_ok();
        }
    }
    let value = serde_json::to_value(&normalized).expect("Tape always serializes to json value");
    json5::to_string(&value)
        .expect("json5 encoding of a json value never fails")
        .into_bytes()
}

/// Decode a tape from JSON5 bytes, accepting camelCase or snake_case keys.
pub fn decode(bytes: &[u8]) -> Result<Tape, SchemaError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| SchemaError::new("<root>", format!("invalid utf8: {e}")))?;
    json5::from_str::<Tape>(text).map_err(|e| SchemaError::new("<root>", e.to_string()))
}

const TOP_LEVEL_KEYS: &[&str] = &["meta", "session", "exchanges"];

/// Validate structural invariants (and, in `strict` mode, reject unknown
/// top-level keys present in `raw`).
pub fn validate(tape: &Tape, raw: &[u8], strict: bool) -> Vec<SchemaError> {
    let mut errors = Vec::new();

    if tape.exchanges.is_empty() {
        errors.push(SchemaError::new("exchanges", "tape has no exchanges"));
    }

    let mut exit_count = 0;
    let last_index = tape.exchanges.len().saturating_sub(1);
    for (idx, exchange) in tape.exchanges.iter().enumerate() {
        if exchange.exit.is_some() {
            exit_count += 1;
            if idx != last_index {
                errors.push(SchemaError::new(
                    format!("exchanges[{idx}].exit"),
                    "exit metadata may only appear on the last exchange",
                ));
            }
        }
        let declared_delays: u64 = exchange.output.iter().map(|c| c.delay_ms as u64).sum();
        if declared_delays > exchange.dur_ms {
            errors.push(SchemaError::new(
                format!("exchanges[{idx}].dur_ms"),
                format!(
                    "dur_ms ({}) is less than the sum of chunk delays ({})",
                    exchange.dur_ms, declared_delays
                ),
            ));
        }
    }
    if exit_count > 1 {
        errors.push(SchemaError::new("exchanges", "more than one exit recorded"));
    }

    if strict {
        let parsed = serde_json::from_slice::<serde_json::Value>(raw).ok().or_else(|| {
            std::str::from_utf8(raw)
                .ok()
                .and_then(|text| json5::from_str::<serde_json::Value>(text).ok())
        });
        if let Some(serde_json::Value::Object(map)) = parsed {
            for key in map.keys() {
                if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
                    errors.push(SchemaError::new(
                        "<root>",
                        format!("unknown top-level key in strict mode: {key}"),
                    ));
                }
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tape() -> Tape {
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
            seed: Some(42),
        };
        let session = SessionInfo {
            platform: "linux".into(),
            version: "0.1.0".into(),
            flags: vec![],
        };
        let mut exchange = Exchange::new(
            PreContext {
                prompt: "sqlite> ".into(),
                state_hash: None,
            },
            Input::Line("select 1;".into()),
        );
        exchange.output.push(Chunk::new(12, b"1\n".to_vec()));
        exchange.output.push(Chunk::new(3, b"sqlite> ".to_vec()));
        exchange.dur_ms = 20;
        Tape {
            meta,
            session,
            exchanges: vec![exchange],
        }
    }

    #[test]
    fn round_trip_equality() {
        let tape = sample_tape();
        let bytes = encode(&tape);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(tape, decoded);
    }

    #[test]
    fn key_order_is_stable() {
        let tape = sample_tape();
        let text = String::from_utf8(encode(&tape)).unwrap();
        let meta_pos = text.find("meta").unwrap();
        let session_pos = text.find("session").unwrap();
        let exchanges_pos = text.find("exchanges").unwrap();
        assert!(meta_pos < session_pos);
        assert!(session_pos < exchanges_pos);
    }

    #[test]
    fn decode_accepts_snake_case_keys() {
        let snake = r#"{
            "meta": {
                "created_at": "2024-01-02T03:04:05Z",
                "program": "sqlite3",
                "args": [],
                "env": {},
                "cwd": "/tmp",
                "pty": {"rows": 24, "cols": 80}
            },
            "session": {"platform": "linux", "version": "0.1.0", "flags": []},
            "exchanges": [{
                "pre": {"prompt": "sqlite> "},
                "input": {"type": "line", "dataText": "select 1;"},
                "output": [],
                "dur_ms": 0
            }]
        }"#;
        let tape = decode(snake.as_bytes()).unwrap();
        assert_eq!(tape.meta.program, "sqlite3");
    }

    #[test]
    fn decode_rejects_negative_delay() {
        let bad = r#"{
            "meta": {
                "createdAt": "2024-01-02T03:04:05Z",
                "program": "sqlite3",
                "args": [],
                "env": {},
                "cwd": "/tmp",
                "pty": {"rows": 24, "cols": 80}
            },
            "session": {"platform": "linux", "version": "0.1.0", "flags": []},
            "exchanges": [{
                "pre": {"prompt": "sqlite> "},
                "input": {"type": "line", "dataText": "select 1;"},
                "output": [{"delayMs": -1, "dataB64": "", "isUtf8": true}],
                "durMs": 0
            }]
        }"#;
        assert!(decode(bad.as_bytes()).is_err());
    }

    #[test]
    fn validate_flags_empty_exchanges() {
        let mut tape = sample_tape();
        tape.exchanges.clear();
        let raw = encode(&tape);
        let errors = validate(&tape, &raw, false);
        assert!(errors.iter().any(|e| e.path == "exchanges"));
    }

    #[test]
    fn validate_flags_non_terminal_exit() {
        let mut tape = sample_tape();
        let first = tape.exchanges[0].clone();
        tape.exchanges.push(first);
        tape.exchanges[0].exit = Some(ExitInfo {
            code: 0,
            signal: None,
        });
        let raw = encode(&tape);
        let errors = validate(&tape, &raw, false);
        assert!(errors.iter().any(|e| e.path.contains("exit")));
    }

    #[test]
    fn validate_strict_rejects_unknown_top_level_key() {
        let tape = sample_tape();
        let raw = br#"{"meta": {}, "session": {}, "exchanges": [], "bogus": 1}"#;
        let errors = validate(&tape, raw, true);
        assert!(errors.iter().any(|e| e.reason.contains("bogus")));
    }

    #[test]
    fn binary_output_round_trips_losslessly() {
        let mut tape = sample_tape();
        let binary = vec![0u8, 159, 146, 150, 255];
        tape.exchanges[0].output = vec![Chunk::new(0, binary.clone())];
        let bytes = encode(&tape);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.exchanges[0].output[0].data, binary);
        assert!(!decoded.exchanges[0].output[0].is_utf8);
    }

    #[test]
    fn input_match_bytes_strips_trailing_newline() {
        let input = Input::Line("select 1;\r\n".into());
        assert_eq!(input.match_bytes(), b"select 1;");
    }

    #[test]
    fn input_raw_match_bytes_is_verbatim() {
        let input = Input::Raw(vec![1, 2, 3]);
        assert_eq!(input.match_bytes(), vec![1, 2, 3]);
    }
}
