//! Loads tapes recursively, indexes them by normalized key, and persists
//! writes atomically under an exclusive advisory lock.

mod lock;

pub use lock::{lock_path_for, RetryBudget, TapeLockGuard};

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tapectl_keys::{build_key, KeyPolicy, MatchingContext, NormalizedKey};
use tapectl_tape::{SchemaError, Tape};

/// Errors surfaced by Store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path} during {op}: {source}")]
    Io {
        path: PathBuf,
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to acquire lock on {path}")]
    Lock { path: PathBuf },
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Whether a tape write appends to (`New`), wholesale replaces (`Overwrite`),
/// or never touches (`Disabled`) a tape file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    New,
    Overwrite,
    Disabled,
}

/// A diagnostic produced while loading a tape that failed to decode; load
/// continues with the remaining files.
#[derive(Debug, Clone)]
pub struct LoadDiagnostic {
    pub path: PathBuf,
    pub reason: String,
}

struct LoadedTape {
    path: PathBuf,
    raw: Vec<u8>,
    tape: Tape,
}

/// In-memory collection of loaded tapes plus their normalized-key index.
pub struct TapeStore {
    root: PathBuf,
    tapes: RwLock<Vec<LoadedTape>>,
    index: RwLock<BTreeMap<NormalizedKey, (usize, usize)>>,
    used_paths: RwLock<BTreeSet<PathBuf>>,
    new_paths: RwLock<BTreeSet<PathBuf>>,
    all_paths: RwLock<BTreeSet<PathBuf>>,
}

impl TapeStore {
    /// Walk `root` recursively for `*.json5` tapes, decoding each. Decode
    /// failures are collected as diagnostics; loading continues regardless.
    pub fn load_all(root: impl Into<PathBuf>) -> (Self, Vec<LoadDiagnostic>) {
        let root = root.into();
        let mut diagnostics = Vec::new();
        let mut loaded = Vec::new();
        let mut all_paths = BTreeSet::new();

        let mut entries: Vec<PathBuf> = walkdir::WalkDir::new(&root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().map(|ext| ext == "json5").unwrap_or(false))
            .map(|e| e.path().to_path_buf())
            .collect();
        entries.sort();

        for path in entries {
            let rel = path.strip_prefix(&root).unwrap_or(&path).to_path_buf();
            all_paths.insert(rel.clone());
            match fs::read(&path) {
                Ok(raw) => match tapectl_tape::decode(&raw) {
                    Ok(tape) => loaded.push(LoadedTape {
                        path: rel,
                        raw,
                        tape,
                    }),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "tape failed schema validation");
                        diagnostics.push(LoadDiagnostic {
                            path: rel,
                            reason: e.to_string(),
                        });
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to read tape file");
                    diagnostics.push(LoadDiagnostic {
                        path: rel,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let store = Self {
            root,
            tapes: RwLock::new(loaded),
            index: RwLock::new(BTreeMap::new()),
            used_paths: RwLock::new(BTreeSet::new()),
            new_paths: RwLock::new(BTreeSet::new()),
            all_paths: RwLock::new(all_paths),
        };
        (store, diagnostics)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build the normalized-key index over every loaded exchange. Duplicate
    /// keys are logged; the first occurrence in load order wins.
    pub fn build_index(&self, policy: &KeyPolicy) {
        let tapes = self.tapes.read().expect("tapes lock poisoned");
        let mut index = self.index.write().expect("index lock poisoned");
        index.clear();
        for (tape_idx, loaded) in tapes.iter().enumerate() {
            for (exchange_idx, exchange) in loaded.tape.exchanges.iter().enumerate() {
                let ctx = MatchingContext {
                    program: loaded.tape.meta.program.clone(),
                    args: loaded.tape.meta.args.clone(),
                    env: loaded.tape.meta.env.clone(),
                    cwd: loaded.tape.meta.cwd.clone(),
                    prompt: exchange.pre.prompt.clone(),
                    state_hash: exchange.pre.state_hash.clone(),
                };
                let key = build_key(&ctx, &exchange.input, policy);
                index.entry(key).or_insert_with(|| {
                    (tape_idx, exchange_idx)
                });
                if index.get(&key) != Some(&(tape_idx, exchange_idx)) {
                    tracing::warn!(
                        tape = %loaded.path.display(),
                        exchange = exchange_idx,
                        "duplicate normalized key; first occurrence wins"
                    );
                }
            }
        }
    }

    /// Look up the stored exchange matching the current runtime context.
    pub fn find_match(
        &self,
        ctx: &MatchingContext,
        input: &tapectl_tape::Input,
        policy: &KeyPolicy,
    ) -> Option<(usize, usize)> {
        let key = build_key(ctx, input, policy);
        self.index
            .read()
            .expect("index lock poisoned")
            .get(&key)
            .copied()
    }

    /// The normalized key for every indexed exchange, used for `TapeMiss`
    /// nearest-key diagnostics.
    pub fn indexed_keys(&self) -> Vec<NormalizedKey> {
        self.index
            .read()
            .expect("index lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub fn tape_at(&self, tape_idx: usize) -> Option<(PathBuf, Tape)> {
        let tapes = self.tapes.read().expect("tapes lock poisoned");
        tapes
            .get(tape_idx)
            .map(|t| (t.path.clone(), t.tape.clone()))
    }

    /// Every successfully loaded tape, as `(relative path, tape)`, in load
    /// order. Used by `tapes list`; decode failures are not included here,
    /// only in `load_all`'s diagnostics.
    pub fn loaded_tapes(&self) -> Vec<(PathBuf, Tape)> {
        self.tapes
            .read()
            .expect("tapes lock poisoned")
            .iter()
            .map(|t| (t.path.clone(), t.tape.clone()))
            .collect()
    }

    pub fn mark_used(&self, rel_path: &Path) {
        self.used_paths
            .write()
            .expect("used_paths lock poisoned")
            .insert(rel_path.to_path_buf());
    }

    pub fn mark_new(&self, rel_path: &Path) {
        self.new_paths
            .write()
            .expect("new_paths lock poisoned")
            .insert(rel_path.to_path_buf());
        self.all_paths
            .write()
            .expect("all_paths lock poisoned")
            .insert(rel_path.to_path_buf());
    }

    pub fn used_paths(&self) -> BTreeSet<PathBuf> {
        self.used_paths.read().expect("used_paths lock poisoned").clone()
    }

    pub fn new_paths(&self) -> BTreeSet<PathBuf> {
        self.new_paths.read().expect("new_paths lock poisoned").clone()
    }

    pub fn all_paths(&self) -> BTreeSet<PathBuf> {
        self.all_paths.read().expect("all_paths lock poisoned").clone()
    }

    /// Encode `tape` and write it to `rel_path` (relative to the store's
    /// root) under an exclusive lock, atomically via temp-file + rename.
    pub fn write_tape(
        &self,
        rel_path: &Path,
        tape: &Tape,
        mode: RecordMode,
    ) -> Result<(), StoreError> {
        if mode == RecordMode::Disabled {
            return Ok(());
        }
        let abs_path = self.root.join(rel_path);
        if let Some(parent) = abs_path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                op: "create_dir_all",
                source,
            })?;
        }

        let budget = RetryBudget::default();
        let _guard = lock::lock_exclusive(&abs_path, &budget)?;

        let existed_before = abs_path.exists();
        let final_tape = if mode == RecordMode::New && existed_before {
            let existing_raw = fs::read(&abs_path).map_err(|source| StoreError::Io {
                path: abs_path.clone(),
                op: "read existing tape",
                source,
            })?;
            let existing = tapectl_tape::decode(&existing_raw)?;
            merge_new_exchanges(existing, tape)
        } else {
            tape.clone()
        };

        atomic_write(&abs_path, &tapectl_tape::encode(&final_tape))?;

        {
            let mut tapes = self.tapes.write().expect("tapes lock poisoned");
            if let Some(existing) = tapes.iter_mut().find(|t| t.path == rel_path) {
                existing.tape = final_tape;
                existing.raw = fs::read(&abs_path).unwrap_or_default();
            } else {
                tapes.push(LoadedTape {
                    path: rel_path.to_path_buf(),
                    raw: fs::read(&abs_path).unwrap_or_default(),
                    tape: final_tape,
                });
            }
        }

        if !existed_before {
            self.mark_new(rel_path);
        }
        self.all_paths
            .write()
            .expect("all_paths lock poisoned")
            .insert(rel_path.to_path_buf());

        Ok(())
    }

    /// Re-run schema validation over every loaded tape.
    pub fn validate(&self, strict: bool) -> Vec<(PathBuf, SchemaError)> {
        let tapes = self.tapes.read().expect("tapes lock poisoned");
        let mut errors = Vec::new();
        for loaded in tapes.iter() {
            for err in tapectl_tape::validate(&loaded.tape, &loaded.raw, strict) {
                errors.push((loaded.path.clone(), err));
            }
        }
        errors
    }

    /// Apply `redact_secrets` to every exchange's input and output across
    /// every loaded tape. When `inplace`, rewrites modified tapes atomically.
    pub fn redact_all(&self, inplace: bool) -> Result<usize, StoreError> {
        let mut modified_paths = Vec::new();
        {
            let mut tapes = self.tapes.write().expect("tapes lock poisoned");
            for loaded in tapes.iter_mut() {
                let mut changed = false;
                for exchange in &mut loaded.tape.exchanges {
                    if redact_input(&mut exchange.input) {
                        changed = true;
                    }
                    for chunk in &mut exchange.output {
                        if redact_chunk(chunk) {
                            changed = true;
                        }
                    }
                }
                if changed {
                    modified_paths.push((loaded.path.clone(), loaded.tape.clone()));
                }
            }
        }

        if inplace {
            for (path, tape) in &modified_paths {
                self.write_tape(path, tape, RecordMode::Overwrite)?;
            }
        }

        Ok(modified_paths.len())
    }
}

fn redact_input(input: &mut tapectl_tape::Input) -> bool {
    match input {
        tapectl_tape::Input::Line(text) => {
            let redacted = tapectl_normalize::redact_secrets(text);
            let changed = redacted != *text;
            *text = redacted;
            changed
        }
        tapectl_tape::Input::Raw(bytes) => redact_bytes(bytes),
    }
}

fn redact_chunk(chunk: &mut tapectl_tape::Chunk) -> bool {
    redact_bytes(&mut chunk.data)
}

fn redact_bytes(bytes: &mut Vec<u8>) -> bool {
    match std::str::from_utf8(bytes) {
        Ok(text) => {
            let redacted = tapectl_normalize::redact_secrets(text);
            if redacted.as_bytes() != bytes.as_slice() {
                *bytes = redacted.into_bytes();
                true
            } else {
                false
            }
        }
        Err(_) => false,
    }
}

fn merge_new_exchanges(existing: Tape, incoming: &Tape) -> Tape {
    let policy = KeyPolicy::default();
    let existing_keys: BTreeSet<NormalizedKey> = existing
        .exchanges
        .iter()
        .map(|ex| {
            let ctx = MatchingContext {
                program: existing.meta.program.clone(),
                args: existing.meta.args.clone(),
                env: existing.meta.env.clone(),
                cwd: existing.meta.cwd.clone(),
                prompt: ex.pre.prompt.clone(),
                state_hash: ex.pre.state_hash.clone(),
            };
            build_key(&ctx, &ex.input, &policy)
        })
        .collect();

    let mut merged = existing;
    for ex in &incoming.exchanges {
        let ctx = MatchingContext {
            program: merged.meta.program.clone(),
            args: merged.meta.args.clone(),
            env: merged.meta.env.clone(),
            cwd: merged.meta.cwd.clone(),
            prompt: ex.pre.prompt.clone(),
            state_hash: ex.pre.state_hash.clone(),
        };
        let key = build_key(&ctx, &ex.input, &policy);
        if !existing_keys.contains(&key) {
            merged.exchanges.push(ex.clone());
        }
    }
    merged
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("json5.tmp");
    {
        let mut tmp = File::create(&tmp_path).map_err(|source| StoreError::Io {
            path: tmp_path.clone(),
            op: "create temp file",
            source,
        })?;
        tmp.write_all(bytes).map_err(|source| StoreError::Io {
            path: tmp_path.clone(),
            op: "write temp file",
            source,
        })?;
        tmp.sync_all().map_err(|source| StoreError::Io {
            path: tmp_path.clone(),
            op: "fsync temp file",
            source,
        })?;
    }
    fs::rename(&tmp_path, path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        op: "rename temp file",
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapectl_tape::{Exchange, Input, PreContext, PtyGeometry, SessionInfo, TapeMeta};
    use tempfile::tempdir;

    fn make_tape(program: &str, line: &str) -> Tape {
        let meta = TapeMeta {
            created_at: "2024-01-02T03:04:05Z".parse().unwrap(),
            program: program.into(),
            args: vec![],
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
        let exchange = Exchange::new(
            PreContext {
                prompt: "sqlite> ".into(),
                state_hash: None,
            },
            Input::Line(line.into()),
        );
        Tape {
            meta,
            session,
            exchanges: vec![exchange],
        }
    }

    #[test]
    fn load_all_finds_json5_files() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sqlite3");
        fs::create_dir_all(&sub).unwrap();
        let tape = make_tape("sqlite3", "select 1;");
        fs::write(sub.join("a.json5"), tapectl_tape::encode(&tape)).unwrap();

        let (store, diagnostics) = TapeStore::load_all(dir.path());
        assert!(diagnostics.is_empty());
        assert_eq!(store.tapes.read().unwrap().len(), 1);
    }

    #[test]
    fn load_all_collects_diagnostics_and_continues() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("bad.json5"), b"{not json5 at all!!").unwrap();
        let tape = make_tape("sqlite3", "select 1;");
        fs::write(dir.path().join("good.json5"), tapectl_tape::encode(&tape)).unwrap();

        let (store, diagnostics) = TapeStore::load_all(dir.path());
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(store.tapes.read().unwrap().len(), 1);
    }

    #[test]
    fn find_match_hits_indexed_exchange() {
        let dir = tempdir().unwrap();
        let tape = make_tape("sqlite3", "select 1;");
        fs::write(dir.path().join("a.json5"), tapectl_tape::encode(&tape)).unwrap();
        let (store, _) = TapeStore::load_all(dir.path());
        let policy = KeyPolicy::default();
        store.build_index(&policy);

        let ctx = MatchingContext {
            program: "sqlite3".into(),
            args: vec![],
            env: BTreeMap::new(),
            cwd: "/tmp".into(),
            prompt: "sqlite> ".into(),
            state_hash: None,
        };
        let hit = store.find_match(&ctx, &Input::Line("select 1;".into()), &policy);
        assert_eq!(hit, Some((0, 0)));
    }

    #[test]
    fn write_tape_new_appends_without_duplicating() {
        let dir = tempdir().unwrap();
        let tape = make_tape("sqlite3", "select 1;");
        let rel = PathBuf::from("sqlite3/a.json5");
        fs::create_dir_all(dir.path().join("sqlite3")).unwrap();
        let (store, _) = TapeStore::load_all(dir.path());
        let store = TapeStore { root: dir.path().to_path_buf(), ..store };
        store.write_tape(&rel, &tape, RecordMode::New).unwrap();

        let incoming = make_tape("sqlite3", "select 2;");
        store.write_tape(&rel, &incoming, RecordMode::New).unwrap();

        let (_, merged) = store.tape_at(0).unwrap();
        assert_eq!(merged.exchanges.len(), 2);

        // Re-adding the same input should not duplicate.
        store.write_tape(&rel, &incoming, RecordMode::New).unwrap();
        let (_, merged_again) = store.tape_at(0).unwrap();
        assert_eq!(merged_again.exchanges.len(), 2);
    }

    #[test]
    fn write_tape_overwrite_replaces_contents() {
        let dir = tempdir().unwrap();
        let tape = make_tape("sqlite3", "select 1;");
        let rel = PathBuf::from("sqlite3/a.json5");
        let (store, _) = TapeStore::load_all(dir.path());
        let store = TapeStore { root: dir.path().to_path_buf(), ..store };
        store.write_tape(&rel, &tape, RecordMode::New).unwrap();

        let replacement = make_tape("sqlite3", "select 2;");
        store.write_tape(&rel, &replacement, RecordMode::Overwrite).unwrap();

        let (_, result) = store.tape_at(0).unwrap();
        assert_eq!(result.exchanges.len(), 1);
        assert_eq!(result.exchanges[0].input, Input::Line("select 2;".into()));
    }

    #[test]
    fn disabled_mode_never_writes() {
        let dir = tempdir().unwrap();
        let tape = make_tape("sqlite3", "select 1;");
        let rel = PathBuf::from("sqlite3/a.json5");
        let (store, _) = TapeStore::load_all(dir.path());
        let store = TapeStore { root: dir.path().to_path_buf(), ..store };
        store.write_tape(&rel, &tape, RecordMode::Disabled).unwrap();
        assert!(!dir.path().join("sqlite3/a.json5").exists());
    }

    #[test]
    fn redact_all_masks_secret_input() {
        let dir = tempdir().unwrap();
        let mut tape = make_tape("sqlite3", "password: hunter2");
        tape.exchanges[0].output = vec![];
        let rel = PathBuf::from("sqlite3/a.json5");
        let (store, _) = TapeStore::load_all(dir.path());
        let store = TapeStore { root: dir.path().to_path_buf(), ..store };
        store.write_tape(&rel, &tape, RecordMode::New).unwrap();

        let modified = store.redact_all(false).unwrap();
        assert_eq!(modified, 1);
    }

    #[test]
    fn loaded_tapes_reports_every_decoded_tape() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("bad.json5"), b"{not json5 at all!!").unwrap();
        let tape = make_tape("sqlite3", "select 1;");
        fs::write(dir.path().join("good.json5"), tapectl_tape::encode(&tape)).unwrap();

        let (store, _) = TapeStore::load_all(dir.path());
        let loaded = store.loaded_tapes();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, PathBuf::from("good.json5"));
    }

    #[test]
    fn exit_summary_accounting_is_disjoint_and_covers_all() {
        let dir = tempdir().unwrap();
        let tape = make_tape("sqlite3", "select 1;");
        fs::write(dir.path().join("a.json5"), tapectl_tape::encode(&tape)).unwrap();
        let (store, _) = TapeStore::load_all(dir.path());
        store.mark_used(Path::new("a.json5"));

        let used = store.used_paths();
        let new = store.new_paths();
        let all = store.all_paths();
        let unused: BTreeSet<_> = all.difference(&used).cloned().collect();
        let unused: BTreeSet<_> = unused.difference(&new).cloned().collect();
        assert!(new.intersection(&unused).next().is_none());
        let union: BTreeSet<_> = used.union(&unused).cloned().collect();
        let union: BTreeSet<_> = union.union(&new).cloned().collect();
        assert_eq!(union, all);
    }
}
