use super::*;
use esky_core::EskyError;
use esky_fstxn::snapshot_tree;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_dir() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!(
        "esky-patch-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&path).expect("must create test dir");
    path
}

fn write(root: &Path, rel: &str, data: &[u8]) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().expect("must have parent")).expect("must create parent");
    fs::write(path, data).expect("must write file");
}

fn library_bytes(seed: u32) -> Vec<u8> {
    (0..2048_u32)
        .flat_map(|value| (value ^ seed).wrapping_mul(2_246_822_519).to_le_bytes())
        .collect()
}

fn assert_round_trip(root: &Path, source: &Path, target: &Path) -> PatchSet {
    let patch = diff_trees(source, target).expect("must diff");
    let encoded = encode_patch(&patch).expect("must encode");
    let decoded = decode_patch(&encoded).expect("must decode");
    assert_eq!(decoded, patch);

    let out = root.join("out");
    apply_patch(&decoded, source, &out).expect("must apply");
    assert_eq!(
        snapshot_tree(&out).expect("must snapshot output"),
        snapshot_tree(target).expect("must snapshot target"),
        "patched tree must equal the target tree"
    );
    patch
}

fn has_op(patch: &PatchSet, kind: &str) -> bool {
    patch.ops().iter().any(|op| op.kind() == kind)
}

#[test]
fn plain_tree_round_trip_covers_every_change_kind() {
    let root = test_dir();
    let a = root.join("a");
    let b = root.join("b");

    write(&a, "bin/app", b"#!app v1");
    write(&a, "lib/core.so", &library_bytes(1));
    write(&a, "share/readme.txt", b"readme");
    write(&a, "old/nested/file", b"gone soon");
    write(&a, "became-dir", b"file in source");
    write(&a, "became-file/child", b"dir in source");

    write(&b, "bin/app", b"#!app v2");
    let mut core = library_bytes(1);
    core[100..108].copy_from_slice(b"patched!");
    write(&b, "lib/core.so", &core);
    write(&b, "share/readme.txt", b"readme");
    write(&b, "share/readme-copy.txt", b"readme");
    write(&b, "new/deeper/added.txt", b"brand new");
    write(&b, "became-dir/inner", b"dir in target");
    write(&b, "became-file", b"file in target");
    fs::create_dir_all(b.join("empty-dir")).expect("must create empty dir");

    let patch = assert_round_trip(&root, &a, &b);

    assert!(has_op(&patch, "copy"), "identical new file must be a copy");
    assert!(has_op(&patch, "add-dir"));
    assert!(has_op(&patch, "delete"));
    #[cfg(feature = "delta-generate")]
    assert!(has_op(&patch, "delta"), "small edit in a large file must be a delta");
    let _ = fs::remove_dir_all(&root);
}

#[cfg(unix)]
#[test]
fn round_trip_preserves_executable_bits() {
    use std::os::unix::fs::PermissionsExt;

    let root = test_dir();
    let a = root.join("a");
    let b = root.join("b");
    write(&a, "run.sh", b"echo one");
    write(&b, "run.sh", b"echo one");
    write(&b, "tool", b"#!tool");
    fs::set_permissions(b.join("run.sh"), fs::Permissions::from_mode(0o755))
        .expect("must chmod");
    fs::set_permissions(b.join("tool"), fs::Permissions::from_mode(0o755)).expect("must chmod");

    let patch = diff_trees(&a, &b).expect("must diff");
    let out = root.join("out");
    apply_patch(&patch, &a, &out).expect("must apply");

    for name in ["run.sh", "tool"] {
        let mode = fs::metadata(out.join(name))
            .expect("must stat")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755, "{name} must keep its mode");
    }
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn archive_round_trip_recurses_into_nested_containers() {
    let root = test_dir();
    let a = root.join("a");
    let b = root.join("b");

    let inner_v1 = build_container(
        [("mod/__init__.py", b"".to_vec()), ("mod/impl.py", library_bytes(3))],
        EntryCompression::Deflated,
    )
    .expect("must build inner v1");
    let inner_v2 = build_container(
        [
            ("mod/__init__.py", b"".to_vec()),
            ("mod/impl.py", library_bytes(4)),
            ("mod/extra.py", b"extra = 1".to_vec()),
        ],
        EntryCompression::Deflated,
    )
    .expect("must build inner v2");

    let outer_v1 = build_container(
        [
            ("pkg/", Vec::new()),
            ("pkg/main.py", b"print('v1')".to_vec()),
            ("pkg/removed.py", b"obsolete".to_vec()),
            ("pkg/bundle.zip", inner_v1),
            ("pkg/data.bin", library_bytes(9)),
        ],
        EntryCompression::Deflated,
    )
    .expect("must build outer v1");
    let outer_v2 = build_container(
        [
            ("pkg/", Vec::new()),
            ("pkg/main.py", b"print('v2')".to_vec()),
            ("pkg/bundle.zip", inner_v2),
            ("pkg/data.bin", library_bytes(9)),
            ("pkg/added.txt", b"added".to_vec()),
        ],
        EntryCompression::Stored,
    )
    .expect("must build outer v2");

    write(&a, "library.zip", &outer_v1);
    write(&b, "library.zip", &outer_v2);

    let patch = assert_round_trip(&root, &a, &b);

    let enters = patch
        .ops()
        .iter()
        .filter(|op| matches!(op, PatchOp::EnterContainer { .. }))
        .count();
    assert_eq!(enters, 2, "outer and nested archive must both be entered");
    assert!(
        patch.payload_size() < outer_v2.len(),
        "recursive patch must be smaller than the archive"
    );
    let _ = fs::remove_dir_all(&root);
}

fn timestamped_zip(entries: &[(&str, &[u8])], comment: Option<&str>) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default().last_modified_time(
        zip::DateTime::from_date_and_time(2021, 6, 1, 12, 0, 0).expect("valid date"),
    );
    for (name, body) in entries {
        writer.start_file(*name, options).expect("must start entry");
        writer.write_all(body).expect("must write entry");
    }
    if let Some(comment) = comment {
        writer.set_comment(comment);
    }
    writer.finish().expect("must finish").into_inner()
}

#[test]
fn timestamped_archive_round_trip_recurses() {
    let root = test_dir();
    let a = root.join("a");
    let b = root.join("b");
    let shared = library_bytes(21);
    let mut changed = library_bytes(22);
    write(
        &a,
        "library.zip",
        &timestamped_zip(&[("shared.pyc", &shared), ("changed.pyc", &changed)], None),
    );
    changed[64..70].copy_from_slice(b"edited");
    write(
        &b,
        "library.zip",
        &timestamped_zip(&[("shared.pyc", &shared), ("changed.pyc", &changed)], None),
    );

    let patch = assert_round_trip(&root, &a, &b);

    let enters = patch
        .ops()
        .iter()
        .filter(|op| matches!(op, PatchOp::EnterContainer { .. }))
        .count();
    assert_eq!(enters, 1, "timestamped archive must be entered");
    let layout = patch
        .ops()
        .iter()
        .find_map(|op| match op {
            PatchOp::LeaveContainer { layout } => Some(layout),
            _ => None,
        })
        .expect("must carry a container layout");
    assert!(layout.entries.iter().all(|entry| entry.modified.is_some()));
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn unreproducible_archive_is_patched_as_a_plain_file() {
    let root = test_dir();
    let a = root.join("a");
    let b = root.join("b");
    let commented = |body: &[u8]| timestamped_zip(&[("entry.txt", body)], Some("signed build"));
    write(&a, "foreign.zip", &commented(b"one".as_slice()));
    write(&b, "foreign.zip", &commented(b"two".as_slice()));

    let patch = assert_round_trip(&root, &a, &b);

    assert!(!has_op(&patch, "enter-container"));
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn failed_apply_leaves_no_target_directory() {
    let root = test_dir();
    let source = root.join("source");
    write(&source, "present.txt", b"present");
    let patch = PatchSet::from_ops(vec![
        PatchOp::Add {
            path: "first.txt".to_string(),
            data: b"first".to_vec(),
            mode: None,
        },
        PatchOp::Delete {
            path: "missing.txt".to_string(),
        },
    ]);
    let target = root.join("target");

    let err = apply_patch(&patch, &source, &target).expect_err("apply must fail");

    assert!(matches!(
        EskyError::find(&err),
        Some(EskyError::CorruptArtifact { .. })
    ));
    assert!(!target.exists());
    let leftovers: Vec<_> = fs::read_dir(&root)
        .expect("must list root")
        .map(|entry| entry.expect("must read entry").file_name())
        .collect();
    assert_eq!(leftovers, vec![std::ffi::OsString::from("source")]);
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn corrupt_delta_aborts_apply() {
    let root = test_dir();
    let source = root.join("source");
    write(&source, "data.bin", b"original contents");
    let patch = PatchSet::from_ops(vec![PatchOp::Delta {
        path: "data.bin".to_string(),
        delta: b"EDLT\x11\x05\x02\x05hello\x00not-a-checksum".to_vec(),
    }]);

    assert!(apply_patch(&patch, &source, &root.join("target")).is_err());
    assert!(!root.join("target").exists());
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn oversized_delta_header_is_an_error() {
    let mut delta = b"EDLT\x00".to_vec();
    delta.extend_from_slice(&[0xff; 8]);
    delta.push(0x7f);
    delta.push(0);

    let err = apply_delta(b"", &delta).expect_err("absurd target length must fail");
    assert!(err.to_string().contains("expected"));
}

#[test]
fn apply_refuses_existing_target() {
    let root = test_dir();
    let source = root.join("source");
    let target = root.join("target");
    fs::create_dir_all(&source).expect("must create source");
    fs::create_dir_all(&target).expect("must create target");

    assert!(apply_patch(&PatchSet::new(), &source, &target).is_err());
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn patch_paths_cannot_escape_the_tree() {
    let root = test_dir();
    let source = root.join("source");
    fs::create_dir_all(&source).expect("must create source");
    let patch = PatchSet::from_ops(vec![PatchOp::Add {
        path: "../escaped.txt".to_string(),
        data: b"x".to_vec(),
        mode: None,
    }]);

    assert!(apply_patch(&patch, &source, &root.join("target")).is_err());
    assert!(!root.join("escaped.txt").exists());
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn patch_file_round_trip_and_corruption() {
    let root = test_dir();
    let patch = PatchSet::from_ops(vec![
        PatchOp::AddDir {
            path: "bin".to_string(),
        },
        PatchOp::EnterContainer {
            path: "lib.zip".to_string(),
        },
        PatchOp::Copy {
            from: "a.py".to_string(),
            to: "b.py".to_string(),
        },
        PatchOp::LeaveContainer {
            layout: ContainerLayout {
                entries: vec![ContainerEntry {
                    name: "a.py".to_string(),
                    compression: EntryCompression::Deflated,
                    mode: Some(0o644),
                    modified: Some((0x52c1, 0x6000)),
                }],
            },
        },
    ]);
    let path = root.join("patches/demo.patch");
    write_patch_file(&patch, &path).expect("must write patch file");
    assert_eq!(read_patch_file(&path).expect("must read patch file"), patch);

    let mut bytes = fs::read(&path).expect("must read bytes");
    bytes.truncate(bytes.len() / 2);
    fs::write(&path, &bytes).expect("must write truncated patch");
    let err = read_patch_file(&path).expect_err("truncated patch must fail");
    assert!(matches!(
        EskyError::find(&err),
        Some(EskyError::CorruptArtifact { .. })
    ));

    assert!(decode_patch(b"NOTAPATCH").is_err());
    let _ = fs::remove_dir_all(&root);
}
