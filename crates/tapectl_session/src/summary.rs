//! The end-of-session accounting report (C8). Kept as a free function over
//! `&TapeStore` rather than a method so the CLI can call it without owning
//! the store.

use std::collections::BTreeSet;
use std::path::PathBuf;

use tapectl_store::TapeStore;

/// `true` if the summary banner was emitted (both sets non-empty after
/// excluding the unused-but-new overlap).
pub fn print_summary(store: &TapeStore) -> bool {
    let used = store.used_paths();
    let new = store.new_paths();
    let all = store.all_paths();

    let unused: BTreeSet<PathBuf> = all
        .difference(&used)
        .filter(|p| !new.contains(*p))
        .cloned()
        .collect();

    if new.is_empty() && unused.is_empty() {
        return false;
    }

    println!("===== SUMMARY (claude_control) =====");
    println!("New tapes:");
    for path in &new {
        println!("- {}", path.display());
    }
    println!("Unused tapes:");
    for path in &unused {
        println!("- {}", path.display());
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapectl_tape::{Exchange, Input, PreContext, PtyGeometry, SessionInfo, Tape, TapeMeta};

    fn sample_tape() -> Tape {
        Tape {
            meta: TapeMeta {
                created_at: "2024-01-02T03:04:05Z".parse().unwrap(),
                program: "sqlite3".into(),
                args: vec![],
                env: Default::default(),
                cwd: "/tmp".into(),
                pty: PtyGeometry { rows: 24, cols: 80 },
                tag: None,
                latency: None,
                error_rate: None,
                seed: None,
            },
            session: SessionInfo {
                platform: "linux".into(),
                version: "0.1.0".into(),
                flags: vec![],
            },
            exchanges: vec![Exchange::new(
                PreContext {
                    prompt: "sqlite> ".into(),
                    state_hash: None,
                },
                Input::Line("select 1;".into()),
            )],
        }
    }

    #[test]
    fn empty_summary_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = TapeStore::load_all(dir.path());
        assert!(!print_summary(&store));
    }

    #[test]
    fn unused_and_new_are_disjoint_and_cover_all() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json5"), tapectl_tape::encode(&sample_tape())).unwrap();
        std::fs::write(dir.path().join("b.json5"), tapectl_tape::encode(&sample_tape())).unwrap();
        let (store, _) = TapeStore::load_all(dir.path());
        store.mark_used(std::path::Path::new("a.json5"));

        let emitted = print_summary(&store);
        assert!(emitted);
    }

    #[test]
    fn print_summary_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json5"), tapectl_tape::encode(&sample_tape())).unwrap();
        let (store, _) = TapeStore::load_all(dir.path());
        let first = print_summary(&store);
        let second = print_summary(&store);
        assert_eq!(first, second);
    }
}
