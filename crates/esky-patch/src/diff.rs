use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use esky_security::sha256_hex;
use tracing::debug;

use crate::apply::run_ops;
use crate::container::{is_container, ZipTree};
use crate::ops::{PatchOp, PatchSet};
use crate::tree::{is_within, load_dir, Entries, Node};

/// Computes the ops that turn the tree at `source` into the tree at `target`.
pub fn diff_trees(source: &Path, target: &Path) -> Result<PatchSet> {
    let source_entries = load_dir(source)?;
    let target_entries = load_dir(target)?;
    let mut ops = Vec::new();
    diff_entries(&source_entries, &target_entries, &mut ops);
    let patch = PatchSet::from_ops(ops);
    debug!(
        source = %source.display(),
        target = %target.display(),
        ops = patch.len(),
        payload = patch.payload_size(),
        "computed tree diff"
    );
    Ok(patch)
}

/// Files present unchanged on both sides, by content hash, usable as copy
/// sources.
struct CopySources<'a> {
    by_hash: HashMap<String, (&'a str, Option<u32>)>,
}

impl<'a> CopySources<'a> {
    fn collect(source: &'a Entries, target: &'a Entries) -> Self {
        let mut by_hash = HashMap::new();
        for (path, node) in source {
            let Node::File { data, mode } = node else {
                continue;
            };
            if data.is_empty() || target.get(path) != Some(node) {
                continue;
            }
            by_hash
                .entry(sha256_hex(data))
                .or_insert((path.as_str(), *mode));
        }
        Self { by_hash }
    }

    fn find(&self, data: &[u8], mode: Option<u32>) -> Option<&'a str> {
        if data.is_empty() {
            return None;
        }
        self.by_hash
            .get(&sha256_hex(data))
            .filter(|(_, source_mode)| *source_mode == mode)
            .map(|(path, _)| *path)
    }
}

fn diff_entries(source: &Entries, target: &Entries, ops: &mut Vec<PatchOp>) {
    let copies = CopySources::collect(source, target);
    let mut removed: Vec<&str> = Vec::new();

    for (path, node) in target {
        match (source.get(path), node) {
            (Some(Node::Dir), Node::Dir) => {}
            (None, Node::Dir) => ops.push(PatchOp::AddDir { path: path.clone() }),
            (Some(Node::File { .. }), Node::Dir) => {
                ops.push(PatchOp::Delete { path: path.clone() });
                removed.push(path);
                ops.push(PatchOp::AddDir { path: path.clone() });
            }
            (Some(Node::Dir), Node::File { data, mode }) => {
                ops.push(PatchOp::Delete { path: path.clone() });
                removed.push(path);
                push_new_file(path, data, *mode, &copies, ops);
            }
            (None, Node::File { data, mode }) => push_new_file(path, data, *mode, &copies, ops),
            (
                Some(Node::File {
                    data: old,
                    mode: old_mode,
                }),
                Node::File { data, mode },
            ) => {
                if old == data && old_mode == mode {
                    continue;
                }
                diff_changed_file(path, old, data, *mode, old_mode == mode, &copies, ops);
            }
        }
    }

    for path in source.keys() {
        if target.contains_key(path) || removed.iter().any(|dir| is_within(path, dir)) {
            continue;
        }
        ops.push(PatchOp::Delete { path: path.clone() });
        removed.push(path);
    }
}

fn push_new_file(
    path: &str,
    data: &[u8],
    mode: Option<u32>,
    copies: &CopySources<'_>,
    ops: &mut Vec<PatchOp>,
) {
    match copies.find(data, mode) {
        Some(from) => ops.push(PatchOp::Copy {
            from: from.to_string(),
            to: path.to_string(),
        }),
        None => ops.push(PatchOp::Add {
            path: path.to_string(),
            data: data.to_vec(),
            mode,
        }),
    }
}

fn diff_changed_file(
    path: &str,
    old: &[u8],
    new: &[u8],
    mode: Option<u32>,
    same_mode: bool,
    copies: &CopySources<'_>,
    ops: &mut Vec<PatchOp>,
) {
    if same_mode && is_container(old) && is_container(new) {
        if let Some(nested) = diff_container(path, old, new) {
            ops.extend(nested);
            return;
        }
    }
    if copies.find(new, mode).is_some() {
        push_new_file(path, new, mode, copies, ops);
        return;
    }

    #[cfg(feature = "delta-generate")]
    if same_mode {
        let delta = crate::delta::generate_delta(old, new);
        if delta.len() < new.len() {
            ops.push(PatchOp::Delta {
                path: path.to_string(),
                delta,
            });
            return;
        }
    }

    ops.push(PatchOp::Add {
        path: path.to_string(),
        data: new.to_vec(),
        mode,
    });
}

/// Diffs two archives entry by entry. Returns `None` when either side cannot
/// be opened or the rebuilt archive would not match `new` byte for byte.
fn diff_container(path: &str, old: &[u8], new: &[u8]) -> Option<Vec<PatchOp>> {
    let (Ok((old_tree, _)), Ok((new_tree, layout))) =
        (ZipTree::from_bytes(old), ZipTree::from_bytes(new))
    else {
        debug!(path, "archive cannot be opened, diffing it as a plain file");
        return None;
    };

    let mut nested = Vec::new();
    diff_entries(old_tree.entries(), new_tree.entries(), &mut nested);

    let mut replay = old_tree;
    let rebuilt = run_ops(&mut replay, &nested).and_then(|()| replay.to_bytes(&layout));
    match rebuilt {
        Ok(bytes) if bytes == new => {
            let mut ops = Vec::with_capacity(nested.len() + 2);
            ops.push(PatchOp::EnterContainer {
                path: path.to_string(),
            });
            ops.extend(nested);
            ops.push(PatchOp::LeaveContainer { layout });
            Some(ops)
        }
        _ => {
            debug!(path, "archive is not reproducible, diffing it as a plain file");
            None
        }
    }
}
