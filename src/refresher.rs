//! Re-reads a set of directories after a cleanup finishes. Grounded in
//! `original_source/src-unported/kdirtree.cpp:183-211`'s refresh
//! sequence: detach the stale subtree from its own parent, `stat()` its
//! path anew (so a changed mtime/permission/size on the directory itself
//! is actually picked up, not just its children), insert the replacement,
//! and hand the queue a fresh read job for it.

use std::collections::HashSet;
use std::path::PathBuf;

use tracing::warn;

use crate::queue::ReadJobQueue;
use crate::tree::{NodeId, Tree};

/// Normalises `items` to their parent directories: duplicate parents are
/// collapsed, and an item whose parent is the tree root is skipped just
/// like a normal subdirectory (the root itself gets requeued instead).
pub fn parents(tree: &Tree, items: &[NodeId]) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for &item in items {
        if let Some(parent) = tree.node(item).and_then(|n| n.parent) {
            if seen.insert(parent) {
                out.push(parent);
            }
        }
    }
    out
}

/// Filters `items` down to those that aren't a descendant of another item
/// already in the set — "ancestor wins" — so a cleanup whose selection
/// includes both a directory and something inside it doesn't try to act on
/// (or delete) the same subtree twice.
pub fn normalize_selection(tree: &Tree, items: &[NodeId]) -> Vec<NodeId> {
    let set: HashSet<NodeId> = items.iter().copied().collect();
    items
        .iter()
        .copied()
        .filter(|&item| {
            let mut current = tree.node(item).and_then(|n| n.parent);
            while let Some(id) = current {
                if set.contains(&id) {
                    return false;
                }
                current = tree.node(id).and_then(|n| n.parent);
            }
            true
        })
        .collect()
}

/// Re-reads each directory in `targets` from scratch: detaches it from its
/// own parent, re-`stat()`s its path, inserts a freshly-stat'd replacement
/// directory in its place, and enqueues a read job for the replacement.
///
/// A target with no parent (the tree root) has nothing to detach from, so
/// it's wiped and re-stat'd in place instead, keeping the same `NodeId`.
pub fn refresh(
    tree: &mut Tree,
    queue: &mut ReadJobQueue,
    targets: &[NodeId],
    one_file_system: bool,
    root_device: Option<u64>,
) {
    for &old in targets {
        let Some(node) = tree.node(old) else { continue };
        if !node.is_dir() {
            continue;
        }
        let path = PathBuf::from(tree.url(old));
        let parent = node.parent;

        let meta = match crate::readjob::meta_from_path(&path) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "refresh: stat failed");
                continue;
            }
        };

        let new_id = match parent {
            Some(parent_id) => {
                if tree.delete_child(parent_id, old).is_err() {
                    continue;
                }
                match tree.create_dir(parent_id, meta) {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(?e, "refresh: failed to re-insert directory");
                        continue;
                    }
                }
            }
            None => {
                tree.clear_children(old);
                if let Some(n) = tree.node_mut(old) {
                    n.meta = meta;
                }
                old
            }
        };

        queue.enqueue_local_dir(tree, new_id, path, one_file_system, root_device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exclude::ExcludeRules;
    use crate::tree::{mode, EntryMeta};

    fn dir_meta(name: &str) -> EntryMeta {
        EntryMeta {
            name: name.to_string(),
            mode: mode::S_IFDIR | 0o755,
            links: 1,
            size: 4096,
            blocks: 8,
            mtime: 0,
            device: 1,
            is_local_file: true,
            is_sparse_file: false,
        }
    }

    #[test]
    fn parents_deduplicates_siblings() {
        let mut tree = Tree::new();
        let root = tree.set_root(dir_meta("/t"));
        let a = tree.create_dir(root, dir_meta("a")).unwrap();
        let b = tree.create_dir(root, dir_meta("b")).unwrap();
        tree.finalize_local(a).unwrap();
        tree.finalize_local(b).unwrap();
        tree.finalize_local(root).unwrap();

        let result = parents(&tree, &[a, b]);
        assert_eq!(result, vec![root]);
    }

    #[test]
    fn normalize_selection_drops_descendants_of_a_selected_ancestor() {
        let mut tree = Tree::new();
        let root = tree.set_root(dir_meta("/t"));
        let a = tree.create_dir(root, dir_meta("a")).unwrap();
        let b = tree.create_dir(a, dir_meta("b")).unwrap();
        tree.finalize_local(b).unwrap();
        tree.finalize_local(a).unwrap();
        tree.finalize_local(root).unwrap();

        let result = normalize_selection(&tree, &[a, b]);
        assert_eq!(result, vec![a]);
    }

    #[test]
    fn refresh_detaches_and_rereads_a_changed_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let sub_path = tmp.path().join("sub");
        std::fs::create_dir(&sub_path).unwrap();
        std::fs::write(sub_path.join("a.txt"), b"hello").unwrap();

        let mut tree = Tree::new();
        let mut root_meta = dir_meta(&tmp.path().to_string_lossy());
        root_meta.name = tmp.path().to_string_lossy().to_string();
        let root = tree.set_root(root_meta);
        let mut queue = ReadJobQueue::new(ExcludeRules::new());
        queue.enqueue_local_dir(&mut tree, root, tmp.path().to_path_buf(), false, None);
        queue.run_until_idle(&mut tree);

        let sub = tree.locate(root, &["sub"], false).unwrap();
        assert_eq!(tree.total_files(sub), 1);

        std::fs::write(sub_path.join("b.txt"), b"world!!").unwrap();

        refresh(&mut tree, &mut queue, &[sub], false, None);
        queue.run_until_idle(&mut tree);

        // `sub`'s NodeId is stale now (detached + destroyed); re-locate it
        // from root to find the freshly re-stat'd replacement.
        let new_sub = tree.locate(root, &["sub"], false).unwrap();
        assert_ne!(new_sub, sub);
        assert_eq!(tree.total_files(new_sub), 2);
    }
}
