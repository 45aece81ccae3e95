//! Read jobs: transient units of directory-reading work queued on a
//! [`crate::queue::ReadJobQueue`]. Grounded in `kdirreadjob.{h,cpp}`'s
//! `KDirReadJob` hierarchy (`KLocalDirReadJob`, `KCacheReadJob`) plus the
//! teacher's `core::fs::build_tree`/`dir_size` traversal helpers for the
//! actual `lstat`-based walking.
//!
//! A job's entire job is to turn one directory's immediate children into
//! tree nodes and, for each subdirectory found, hand a new job back to the
//! queue — the queue never recurses itself.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::cache::{CacheReader, CACHE_SENTINEL_NAME};
use crate::exclude::ExcludeRules;
use crate::tree::{EntryMeta, NodeId, ReadState, Tree};

pub(crate) fn meta_from_path(path: &Path) -> std::io::Result<EntryMeta> {
    let m = fs::symlink_metadata(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string());
    let meta = EntryMeta {
        name,
        mode: m.mode(),
        links: m.nlink(),
        size: m.len(),
        blocks: m.blocks(),
        mtime: m.mtime(),
        device: m.dev(),
        is_local_file: true,
        is_sparse_file: false,
    };
    let mut meta = meta;
    meta.is_sparse_file = meta.looks_sparse();
    Ok(meta)
}

/// One step of work a [`crate::queue::ReadJobQueue`] can drive to
/// completion via [`ReadJob::step`]. Only [`CacheReadJob`] is genuinely
/// incremental (batched per line); a [`LocalDirReadJob`]'s `step()` always
/// finishes its whole directory in one non-yielding call, matching §5's
/// "read() runs an entire opendir/readdir/closedir pass as a single step"
/// contract — later calls on an already-finished local job are no-ops.
pub enum ReadJob {
    LocalDir(LocalDirReadJob),
    Cache(CacheReadJob),
}

impl ReadJob {
    pub fn dir(&self) -> NodeId {
        match self {
            ReadJob::LocalDir(j) => j.dir,
            ReadJob::Cache(j) => j.dir,
        }
    }

    /// Perform one bounded slice of work. Returns `true` when the job has
    /// more work left (should be re-queued), `false` when finished.
    pub fn step(&mut self, tree: &mut Tree, exclude: &ExcludeRules) -> bool {
        match self {
            ReadJob::LocalDir(j) => j.step(tree, exclude),
            ReadJob::Cache(j) => j.step(tree),
        }
    }

    /// New subdirectory jobs discovered during the last `step()`, if any.
    pub fn drain_pending_children(&mut self) -> Vec<(NodeId, PathBuf, bool, Option<u64>)> {
        match self {
            ReadJob::LocalDir(j) => {
                let one_fs = j.one_file_system();
                let root_dev = j.root_device();
                j.drain_pending_children()
                    .into_iter()
                    .map(|(id, path)| (id, path, one_fs, root_dev))
                    .collect()
            }
            ReadJob::Cache(_) => Vec::new(),
        }
    }

    /// Drains a pending cache-sentinel takeover, if the last `step()`
    /// discovered a `.qdirstat.cache.gz` whose own root matches this job's
    /// directory. The queue is responsible for killing any already-queued
    /// jobs under this dir, clearing its partial contents, and replacing
    /// this job with a [`CacheReadJob`] built from the returned reader.
    pub fn take_cache_takeover(&mut self) -> Option<CacheReader> {
        match self {
            ReadJob::LocalDir(j) => j.cache_takeover.take(),
            ReadJob::Cache(_) => None,
        }
    }
}

/// Reads one local directory's immediate children via `readdir`/`lstat` in
/// a single non-yielding `step()` call.
pub struct LocalDirReadJob {
    pub dir: NodeId,
    path: PathBuf,
    started: bool,
    one_file_system: bool,
    root_device: Option<u64>,
    /// Subdirectories discovered this step that still need their own
    /// job; drained by the queue after each `step()` call.
    pending_children: Vec<(NodeId, PathBuf)>,
    /// Set mid-step when a matching cache sentinel is found; drained by
    /// the queue via [`ReadJob::take_cache_takeover`].
    cache_takeover: Option<CacheReader>,
}

impl LocalDirReadJob {
    pub fn new(dir: NodeId, path: PathBuf, one_file_system: bool, root_device: Option<u64>) -> Self {
        Self {
            dir,
            path,
            started: false,
            one_file_system,
            root_device,
            pending_children: Vec::new(),
            cache_takeover: None,
        }
    }

    /// Drain any subdirectories discovered since the last drain, each
    /// paired with the filesystem path the queue should spawn a new
    /// [`LocalDirReadJob`] for.
    pub fn drain_pending_children(&mut self) -> Vec<(NodeId, PathBuf)> {
        std::mem::take(&mut self.pending_children)
    }

    pub fn one_file_system(&self) -> bool {
        self.one_file_system
    }

    pub fn root_device(&self) -> Option<u64> {
        self.root_device
    }

    /// Opens, reads, and closes the whole directory in one non-yielding
    /// pass, mirroring `KLocalDirReadJob::read()`. Later calls on an
    /// already-started job are no-ops — only `CacheReadJob` is meant to be
    /// called repeatedly.
    fn step(&mut self, tree: &mut Tree, exclude: &ExcludeRules) -> bool {
        if self.started {
            return false;
        }
        self.started = true;
        tree.set_read_state(self.dir, ReadState::Reading);

        let entries: Vec<fs::DirEntry> = match fs::read_dir(&self.path) {
            Ok(rd) => {
                let mut entries: Vec<fs::DirEntry> = rd.filter_map(Result::ok).collect();
                entries.sort_by_key(|e| e.file_name());
                entries
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "opendir failed");
                let state = if e.kind() == std::io::ErrorKind::PermissionDenied {
                    ReadState::PermissionDenied
                } else {
                    ReadState::Error
                };
                tree.set_read_state(self.dir, state);
                Vec::new()
            }
        };

        for entry in entries {
            if self.process_entry(tree, exclude, entry) {
                // A matching cache sentinel took over this directory;
                // the rest of the listing is superseded by the replay.
                break;
            }
        }

        self.finish(tree);
        false
    }

    /// Processes one directory entry. Returns `true` if a cache takeover
    /// was triggered and the remaining entries should not be processed.
    fn process_entry(&mut self, tree: &mut Tree, exclude: &ExcludeRules, entry: fs::DirEntry) -> bool {
        let child_path = entry.path();
        let meta = match meta_from_path(&child_path) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %child_path.display(), error = %e, "stat failed");
                return false;
            }
        };

        if !meta.is_dir() && meta.name == CACHE_SENTINEL_NAME {
            if self.try_cache_takeover(tree, &child_path) {
                return true;
            }
        }

        if meta.is_dir() {
            let dir_name = meta.name.clone();
            let children_names = if exclude.rules.iter().any(|r| r.check_any_file_child) {
                fs::read_dir(&child_path)
                    .map(|rd| {
                        rd.filter_map(Result::ok)
                            .map(|e| e.file_name().to_string_lossy().to_string())
                            .collect()
                    })
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            if exclude.is_excluded(&dir_name, &child_path, &children_names) {
                if let Ok(child_id) = tree.create_dir(self.dir, meta) {
                    if let Some(d) = tree.node_mut(child_id).and_then(|n| n.dir_mut()) {
                        d.is_excluded = true;
                    }
                    tree.set_read_state(child_id, ReadState::OnRequestOnly);
                    let _ = tree.finalize_local(child_id);
                }
                return false;
            }

            let crosses_mount = self
                .root_device
                .map(|root_dev| meta.device != root_dev)
                .unwrap_or(false);

            match tree.create_dir(self.dir, meta) {
                Ok(child_id) => {
                    if crosses_mount && self.one_file_system {
                        if let Some(d) = tree.node_mut(child_id).and_then(|n| n.dir_mut()) {
                            d.is_mount_point = true;
                        }
                        tree.set_read_state(child_id, ReadState::OnRequestOnly);
                        let _ = tree.finalize_local(child_id);
                    } else {
                        // The queue increments `pending_read_jobs` for this
                        // child once it turns `pending_children` into an
                        // actual queued job — see `ReadJobQueue::time_sliced_read`.
                        self.pending_children.push((child_id, child_path));
                    }
                }
                Err(e) => warn!(?e, "failed to insert directory node"),
            }
        } else if let Err(e) = tree.create_entry(self.dir, meta) {
            warn!(?e, "failed to insert file node");
        }
        false
    }

    /// Peeks the candidate cache file's own root directory; if it matches
    /// this job's directory, stashes an opened [`CacheReader`] as a
    /// pending takeover and returns `true`. Otherwise the sentinel is left
    /// to be inserted as an ordinary file by the caller.
    fn try_cache_takeover(&mut self, tree: &Tree, cache_path: &Path) -> bool {
        let this_url = tree.url(self.dir);
        match crate::cache::peek_root_path(cache_path) {
            Ok(Some(cached_root)) if cached_root == this_url => {
                match CacheReader::open(cache_path, self.dir) {
                    Ok(reader) => {
                        self.cache_takeover = Some(reader);
                        true
                    }
                    Err(e) => {
                        warn!(?e, path = %cache_path.display(), "failed to reopen cache sentinel");
                        false
                    }
                }
            }
            Ok(_) => false,
            Err(e) => {
                warn!(?e, path = %cache_path.display(), "cache sentinel is unreadable, treating as a plain file");
                false
            }
        }
    }

    fn finish(&mut self, tree: &mut Tree) {
        // A cache takeover leaves this dir's bookkeeping to the
        // CacheReadJob that replaces this job; don't finalize/finish here.
        if self.cache_takeover.is_some() {
            return;
        }
        if tree.read_state(self.dir) == Some(ReadState::Reading) {
            tree.set_read_state(self.dir, ReadState::Finished);
        }
        let _ = tree.finalize_local(self.dir);
        tree.read_job_finished(self.dir);
    }
}

/// Reads one directory's worth of records back out of an already-open
/// gzip cache stream. Grounded in `KCacheReadJob`/`KCacheReader`.
pub struct CacheReadJob {
    pub dir: NodeId,
    reader: CacheReader,
}

impl CacheReadJob {
    pub fn new(dir: NodeId, reader: CacheReader) -> Self {
        Self { dir, reader }
    }

    fn step(&mut self, tree: &mut Tree) -> bool {
        match self.reader.read_one(tree) {
            Ok(true) => true,
            Ok(false) => {
                tree.set_read_state(self.dir, ReadState::Finished);
                let _ = tree.finalize_local(self.dir);
                tree.read_job_finished(self.dir);
                false
            }
            Err(e) => {
                warn!(?e, "cache read error");
                tree.set_read_state(self.dir, ReadState::Error);
                tree.read_job_finished(self.dir);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheWriter;
    use crate::exclude::ExcludeRules;
    use crate::queue::ReadJobQueue;
    use crate::tree::mode;

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

    fn file_meta(name: &str, size: u64) -> EntryMeta {
        EntryMeta {
            name: name.to_string(),
            mode: mode::S_IFREG | 0o644,
            links: 1,
            size,
            blocks: size.div_ceil(512),
            mtime: 0,
            device: 1,
            is_local_file: true,
            is_sparse_file: false,
        }
    }

    #[test]
    fn cache_sentinel_takes_over_a_matching_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let root_path = tmp.path().to_path_buf();
        let root_url = root_path.to_string_lossy().to_string();
        fs::write(root_path.join("visible.txt"), b"should be shadowed by the cache").unwrap();

        // Build a cache whose own root matches `root_url` exactly, holding
        // a file that doesn't actually exist on disk.
        let mut source = Tree::new();
        let source_root = source.set_root(dir_meta(&root_url));
        source.create_entry(source_root, file_meta("from_cache.txt", 123)).unwrap();
        source.finalize_local(source_root).unwrap();
        CacheWriter::write_to_path(&mut source, source_root, &root_path.join(CACHE_SENTINEL_NAME)).unwrap();

        let mut tree = Tree::new();
        let root = tree.set_root(dir_meta(&root_url));
        let mut queue = ReadJobQueue::new(ExcludeRules::new());
        queue.enqueue_local_dir(&mut tree, root, root_path.clone(), false, None);
        queue.run_until_idle(&mut tree);

        assert!(tree.locate_path(&format!("{root_url}/from_cache.txt")).is_some());
        assert!(tree.locate_path(&format!("{root_url}/visible.txt")).is_none());
    }

    #[test]
    fn mismatched_cache_sentinel_is_treated_as_a_plain_file() {
        let tmp = tempfile::tempdir().unwrap();
        let root_path = tmp.path().to_path_buf();
        let root_url = root_path.to_string_lossy().to_string();
        fs::write(root_path.join("visible.txt"), b"stays visible").unwrap();

        let mut source = Tree::new();
        let source_root = source.set_root(dir_meta("/somewhere/else"));
        source.create_entry(source_root, file_meta("from_cache.txt", 123)).unwrap();
        source.finalize_local(source_root).unwrap();
        CacheWriter::write_to_path(&mut source, source_root, &root_path.join(CACHE_SENTINEL_NAME)).unwrap();

        let mut tree = Tree::new();
        let root = tree.set_root(dir_meta(&root_url));
        let mut queue = ReadJobQueue::new(ExcludeRules::new());
        queue.enqueue_local_dir(&mut tree, root, root_path.clone(), false, None);
        queue.run_until_idle(&mut tree);

        assert!(tree.locate_path(&format!("{root_url}/visible.txt")).is_some());
        assert!(tree.locate_path(&format!("{root_url}/{CACHE_SENTINEL_NAME}")).is_some());
    }
}
