use super::*;
use crate::journal::append_journal_entry;
use esky_core::EskyError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn build_test_root_path(nanos: u128) -> PathBuf {
    let mut path = std::env::temp_dir();
    let sequence = TEST_ROOT_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.push(format!(
        "esky-fstxn-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    path
}

fn test_root() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let root = build_test_root_path(nanos);
    fs::create_dir_all(&root).expect("must create test root");
    root.canonicalize().expect("must canonicalize test root")
}

fn seed_tree(root: &Path) {
    fs::write(root.join("a.txt"), b"alpha").expect("must write a.txt");
    fs::write(root.join("b.txt"), b"bravo").expect("must write b.txt");
    fs::create_dir_all(root.join("c/inner")).expect("must create c/inner");
    fs::write(root.join("c/inner/file"), b"charlie").expect("must write c/inner/file");
}

fn scratch_dirs(root: &Path) -> Vec<PathBuf> {
    fs::read_dir(root)
        .expect("must read root")
        .map(|entry| entry.expect("must read entry").path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(SCRATCH_PREFIX))
        })
        .collect()
}

const OP_COUNT: usize = 5;

/// Queues op `index` (1-based) of a fixed five-step transaction, or a delete
/// of a path that does not exist when `index == failing`.
fn queue_op(txn: &mut Transaction, index: usize, failing: usize) {
    if index == failing {
        txn.delete("does-not-exist").expect("must queue failing op");
        return;
    }
    match index {
        1 => txn.add("a.txt", b"alpha v2".to_vec()).expect("must queue add"),
        2 => txn
            .add("new/deep/file.txt", b"fresh".to_vec())
            .expect("must queue nested add"),
        3 => txn
            .move_path("b.txt", "moved/b.txt")
            .expect("must queue move"),
        4 => txn.delete("c").expect("must queue delete"),
        5 => txn.add_dir("d/e").expect("must queue add_dir"),
        _ => unreachable!("only five ops"),
    }
}

#[test]
fn build_test_root_path_disambiguates_same_timestamp_calls() {
    assert_ne!(build_test_root_path(7), build_test_root_path(7));
}

#[test]
fn failing_step_restores_pre_transaction_state_for_every_k() {
    for strategy in [TxnStrategy::Direct, TxnStrategy::Staged] {
        for failing in 1..=OP_COUNT {
            let root = test_root();
            seed_tree(&root);
            let before = snapshot_tree(&root).expect("must snapshot before");

            let mut txn = Transaction::begin_with(&root, strategy).expect("must begin");
            for index in 1..=OP_COUNT {
                queue_op(&mut txn, index, failing);
            }
            let err = txn.commit().expect_err("commit must fail");

            match EskyError::find(&err) {
                Some(EskyError::TransactionFailure { step, .. }) => assert_eq!(
                    *step, failing,
                    "{strategy:?} must report the failing step"
                ),
                other => panic!("expected TransactionFailure, got {other:?}"),
            }
            let after = snapshot_tree(&root).expect("must snapshot after");
            assert_eq!(
                before, after,
                "{strategy:?} rollback must restore state when step {failing} fails"
            );
            assert!(scratch_dirs(&root).is_empty(), "scratch must be removed");
            let _ = fs::remove_dir_all(&root);
        }
    }
}

#[test]
fn commit_applies_every_step_for_both_strategies() {
    for strategy in [TxnStrategy::Direct, TxnStrategy::Staged] {
        let root = test_root();
        seed_tree(&root);

        let mut txn = Transaction::begin_with(&root, strategy).expect("must begin");
        assert_eq!(txn.strategy(), strategy);
        for index in 1..=OP_COUNT {
            queue_op(&mut txn, index, 0);
        }
        assert_eq!(txn.len(), OP_COUNT);
        txn.commit().expect("commit must succeed");

        assert_eq!(fs::read(root.join("a.txt")).expect("must read"), b"alpha v2");
        assert_eq!(
            fs::read(root.join("new/deep/file.txt")).expect("must read"),
            b"fresh"
        );
        assert!(!root.join("b.txt").exists());
        assert_eq!(
            fs::read(root.join("moved/b.txt")).expect("must read"),
            b"bravo"
        );
        assert!(!root.join("c").exists());
        assert!(root.join("d/e").is_dir());
        assert!(scratch_dirs(&root).is_empty(), "scratch must be removed");
        let _ = fs::remove_dir_all(&root);
    }
}

#[test]
fn dropping_without_commit_changes_nothing() {
    let root = test_root();
    seed_tree(&root);
    let before = snapshot_tree(&root).expect("must snapshot before");

    {
        let mut txn = Transaction::begin(&root).expect("must begin");
        txn.add("a.txt", b"never".to_vec()).expect("must queue");
        txn.delete("b.txt").expect("must queue");
        let staging = txn.staging_dir("payload").expect("must create staging dir");
        fs::write(staging.join("x"), b"x").expect("must write staged file");
    }

    assert_eq!(before, snapshot_tree(&root).expect("must snapshot after"));
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn abort_discards_queued_ops_and_scratch() {
    let root = test_root();
    seed_tree(&root);
    let before = snapshot_tree(&root).expect("must snapshot before");

    let mut txn = Transaction::begin_with(&root, TxnStrategy::Staged).expect("must begin");
    txn.add("z.txt", b"zulu".to_vec()).expect("must queue");
    txn.abort();

    assert_eq!(before, snapshot_tree(&root).expect("must snapshot after"));
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn staging_dir_contents_can_be_moved_into_place() {
    let root = test_root();
    let mut txn = Transaction::begin(&root).expect("must begin");
    let staging = txn.staging_dir("demo-1.0").expect("must create staging dir");
    fs::create_dir_all(staging.join("bin")).expect("must create bin");
    fs::write(staging.join("bin/demo"), b"#!demo").expect("must write");
    txn.move_path(&staging, "demo-1.0-linux-x86_64")
        .expect("must queue move");
    txn.commit().expect("commit must succeed");

    assert_eq!(
        fs::read(root.join("demo-1.0-linux-x86_64/bin/demo")).expect("must read"),
        b"#!demo"
    );
    assert!(scratch_dirs(&root).is_empty());
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn move_new_refuses_an_existing_destination() {
    let root = test_root();
    seed_tree(&root);
    let before = snapshot_tree(&root).expect("must snapshot");

    let mut txn = Transaction::begin(&root).expect("must begin");
    txn.add("fresh.txt", b"fresh".to_vec()).expect("must queue add");
    let staging = txn.staging_dir("c").expect("must create staging dir");
    fs::write(staging.join("other"), b"replacement").expect("must write");
    txn.move_new(&staging, "c").expect("must queue move");
    let err = txn.commit().expect_err("existing destination must fail");

    assert!(matches!(
        EskyError::find(&err),
        Some(EskyError::TransactionFailure { step: 2, .. })
    ));
    assert_eq!(snapshot_tree(&root).expect("must snapshot"), before);
    assert!(scratch_dirs(&root).is_empty());
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn staging_dir_rejects_path_like_names() {
    let root = test_root();
    let mut txn = Transaction::begin(&root).expect("must begin");
    assert!(txn.staging_dir("../escape").is_err());
    assert!(txn.staging_dir("").is_err());
    drop(txn);
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn copy_file_reads_source_outside_root() {
    let root = test_root();
    let outside = test_root();
    fs::write(outside.join("payload.bin"), b"payload").expect("must write source");

    for strategy in [TxnStrategy::Direct, TxnStrategy::Staged] {
        let mut txn = Transaction::begin_with(&root, strategy).expect("must begin");
        txn.copy_file(outside.join("payload.bin"), "copied.bin")
            .expect("must queue copy");
        txn.commit().expect("commit must succeed");
        assert_eq!(
            fs::read(root.join("copied.bin")).expect("must read"),
            b"payload"
        );
    }

    let _ = fs::remove_dir_all(&root);
    let _ = fs::remove_dir_all(&outside);
}

#[test]
fn paths_outside_root_are_scope_violations_without_side_effects() {
    let root = test_root();
    let outside = test_root();
    seed_tree(&root);
    let before = snapshot_tree(&root).expect("must snapshot before");

    for path in [
        PathBuf::from("../escape.txt"),
        PathBuf::from("c/../../escape.txt"),
        outside.join("escape.txt"),
        root.clone(),
        PathBuf::from("."),
    ] {
        let mut txn = Transaction::begin(&root).expect("must begin");
        txn.add("a.txt", b"queued before violation".to_vec())
            .expect("must queue valid op");
        let err = txn
            .add(&path, b"x".to_vec())
            .expect_err("out of scope add must fail");
        assert!(
            matches!(
                EskyError::find(&err),
                Some(EskyError::ScopeViolation { .. })
            ),
            "{} must be a scope violation",
            path.display()
        );
        assert!(txn.delete("b.txt").is_err(), "poisoned txn rejects new ops");
        let err = txn.commit().expect_err("poisoned commit must fail");
        assert!(matches!(
            EskyError::find(&err),
            Some(EskyError::TransactionFailure { step: 2, .. })
        ));
    }

    assert_eq!(before, snapshot_tree(&root).expect("must snapshot after"));
    assert!(!outside.join("escape.txt").exists());
    let _ = fs::remove_dir_all(&root);
    let _ = fs::remove_dir_all(&outside);
}

#[cfg(unix)]
#[test]
fn symlink_inside_root_cannot_escape() {
    let root = test_root();
    let outside = test_root();
    std::os::unix::fs::symlink(&outside, root.join("link")).expect("must create symlink");

    let mut txn = Transaction::begin(&root).expect("must begin");
    let err = txn
        .add("link/escape.txt", b"x".to_vec())
        .expect_err("symlinked escape must fail");
    assert!(matches!(
        EskyError::find(&err),
        Some(EskyError::ScopeViolation { .. })
    ));
    drop(txn);

    assert!(!outside.join("escape.txt").exists());
    let _ = fs::remove_dir_all(&root);
    let _ = fs::remove_dir_all(&outside);
}

#[test]
fn staged_commit_never_exposes_mixed_directory_state() {
    let root = test_root();
    fs::create_dir_all(root.join("app")).expect("must create app");
    fs::write(root.join("app/a"), b"generation-0").expect("must write a");
    fs::write(root.join("app/b"), b"generation-0").expect("must write b");

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let stop = Arc::clone(&stop);
        let app = root.join("app");
        std::thread::spawn(move || {
            let mut consistent_samples = 0_u64;
            loop {
                let finished = stop.load(Ordering::Relaxed);
                if let (Ok(first), Ok(b), Ok(second)) = (
                    fs::read(app.join("a")),
                    fs::read(app.join("b")),
                    fs::read(app.join("a")),
                ) {
                    if first == second {
                        assert_eq!(first, b, "reader observed a mixed old/new app directory");
                        consistent_samples += 1;
                    }
                }
                if finished {
                    break;
                }
            }
            consistent_samples
        })
    };

    for generation in 1..=40 {
        let content = format!("generation-{generation}");
        let mut txn = Transaction::begin_with(&root, TxnStrategy::Staged).expect("must begin");
        let staging = txn.staging_dir("app").expect("must create staging dir");
        fs::write(staging.join("a"), &content).expect("must stage a");
        fs::write(staging.join("b"), &content).expect("must stage b");
        txn.move_path(&staging, "app").expect("must queue move");
        txn.commit().expect("commit must succeed");
    }

    stop.store(true, Ordering::Relaxed);
    let samples = reader.join().expect("reader must not panic");
    assert!(samples > 0, "reader must observe at least one consistent state");
    assert_eq!(fs::read(root.join("app/a")).expect("must read"), b"generation-40");
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn recovery_undoes_interrupted_transaction() {
    let root = test_root();
    let scratch = root.join(format!("{SCRATCH_PREFIX}crashed"));
    fs::create_dir_all(scratch.join("backup")).expect("must create backup dir");
    fs::write(root.join("config.txt"), b"half-written").expect("must write target");
    fs::write(scratch.join("backup/1"), b"original").expect("must write backup");
    fs::create_dir_all(root.join("added")).expect("must create added dir");
    fs::write(root.join("added/new.txt"), b"new").expect("must write added file");

    let journal = scratch.join("journal");
    for (seq, undo) in [
        (
            1,
            UndoRecord::Placed {
                target: root.join("added/new.txt"),
                backup: None,
                temp: None,
                created_dirs: vec![root.join("added")],
            },
        ),
        (
            2,
            UndoRecord::Placed {
                target: root.join("config.txt"),
                backup: Some(scratch.join("backup/1")),
                temp: None,
                created_dirs: Vec::new(),
            },
        ),
    ] {
        append_journal_entry(
            &journal,
            &TransactionJournalEntry {
                seq,
                step: "add".to_string(),
                state: JournalState::Applying,
                undo: Some(undo),
            },
        )
        .expect("must write journal");
    }
    fs::write(&journal, {
        let mut raw = fs::read(&journal).expect("must read journal");
        raw.extend_from_slice(b"{\"seq\":3,\"st");
        raw
    })
    .expect("must append torn line");

    let recovered = recover_stale_transactions(&root).expect("must recover");

    assert_eq!(recovered, vec![scratch.clone()]);
    assert!(!scratch.exists());
    assert_eq!(
        fs::read(root.join("config.txt")).expect("must read"),
        b"original"
    );
    assert!(!root.join("added").exists());
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn recovery_keeps_committed_transaction_effects() {
    let root = test_root();
    let scratch = root.join(format!("{SCRATCH_PREFIX}finished"));
    fs::create_dir_all(&scratch).expect("must create scratch");
    fs::write(root.join("kept.txt"), b"committed").expect("must write target");
    let journal = scratch.join("journal");
    append_journal_entry(
        &journal,
        &TransactionJournalEntry {
            seq: 1,
            step: "add".to_string(),
            state: JournalState::Applying,
            undo: Some(UndoRecord::Placed {
                target: root.join("kept.txt"),
                backup: None,
                temp: None,
                created_dirs: Vec::new(),
            }),
        },
    )
    .expect("must write journal");
    append_journal_entry(
        &journal,
        &TransactionJournalEntry {
            seq: 0,
            step: "commit".to_string(),
            state: JournalState::Committed,
            undo: None,
        },
    )
    .expect("must write journal");

    recover_stale_transactions(&root).expect("must recover");

    assert!(!scratch.exists());
    assert_eq!(
        fs::read(root.join("kept.txt")).expect("must read"),
        b"committed"
    );
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn recovery_skips_live_transactions() {
    let root = test_root();
    let mut txn = Transaction::begin(&root).expect("must begin");
    txn.add("pending.txt", b"x".to_vec()).expect("must queue");

    let recovered = recover_stale_transactions(&root).expect("must scan");
    assert!(recovered.is_empty(), "live transaction must be left alone");
    assert_eq!(scratch_dirs(&root).len(), 1);

    txn.commit().expect("commit must succeed");
    assert!(scratch_dirs(&root).is_empty());
    let _ = fs::remove_dir_all(&root);
}
