//! Cooperative, single-threaded scheduler for [`ReadJob`]s. Grounded in
//! `kdirreadjob.h`'s `KDirReadJobQueue::timeSlicedRead()` — re-expressed
//! without a Qt timer: the host calls [`ReadJobQueue::time_sliced_read`]
//! (one bounded step) or [`ReadJobQueue::run_until_idle`] (drain
//! synchronously) instead of the queue scheduling itself against any
//! particular runtime, per the design notes.

use std::collections::VecDeque;
use std::path::PathBuf;

use tracing::debug;

use crate::exclude::ExcludeRules;
use crate::readjob::{CacheReadJob, LocalDirReadJob, ReadJob};
use crate::tree::{NodeId, Tree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    StartingReading,
    Finished,
}

pub struct ReadJobQueue {
    jobs: VecDeque<ReadJob>,
    exclude: ExcludeRules,
    was_empty: bool,
}

impl ReadJobQueue {
    pub fn new(exclude: ExcludeRules) -> Self {
        Self {
            jobs: VecDeque::new(),
            exclude,
            was_empty: true,
        }
    }

    pub fn exclude_rules(&self) -> &ExcludeRules {
        &self.exclude
    }

    pub fn exclude_rules_mut(&mut self) -> &mut ExcludeRules {
        &mut self.exclude
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Queue a directory for reading, starting time-sliced reading if the
    /// queue was idle (mirrors `enqueue()`'s "start reading if this was
    /// the first job" behaviour).
    pub fn enqueue_local_dir(
        &mut self,
        tree: &mut Tree,
        dir: NodeId,
        path: PathBuf,
        one_file_system: bool,
        root_device: Option<u64>,
    ) -> Option<QueueEvent> {
        tree.read_job_added(dir);
        self.jobs.push_back(ReadJob::LocalDir(LocalDirReadJob::new(
            dir,
            path,
            one_file_system,
            root_device,
        )));
        self.maybe_starting_event()
    }

    pub fn enqueue(&mut self, job: ReadJob, tree: &mut Tree) -> Option<QueueEvent> {
        tree.read_job_added(job.dir());
        self.jobs.push_back(job);
        self.maybe_starting_event()
    }

    fn maybe_starting_event(&mut self) -> Option<QueueEvent> {
        if self.was_empty && !self.jobs.is_empty() {
            self.was_empty = false;
            Some(QueueEvent::StartingReading)
        } else {
            None
        }
    }

    /// Abort every queued job (their `dir`s are marked `Aborted`, which
    /// takes priority over any later `Finished` per the read-state rule).
    pub fn abort(&mut self, tree: &mut Tree) {
        for job in self.jobs.drain(..) {
            tree.read_job_aborted(job.dir());
        }
        self.was_empty = true;
    }

    /// Drop every queued job belonging to `subtree` or one of its
    /// descendants, used when a subtree is deleted out from under an
    /// in-flight scan.
    pub fn kill_subtree(&mut self, tree: &Tree, subtree: NodeId) {
        self.jobs.retain(|job| !is_descendant_or_self(tree, job.dir(), subtree));
    }

    /// Process exactly one job's one step of work, matching
    /// `timeSlicedRead`'s "do a bit, yield" contract. Returns the event, if
    /// any, caused by this step (queue started empty→nonempty never
    /// happens here; only `Finished` can fire, when the queue drains).
    pub fn time_sliced_read(&mut self, tree: &mut Tree) -> Option<QueueEvent> {
        let Some(mut job) = self.jobs.pop_front() else {
            return None;
        };
        let dir = job.dir();

        let more = job.step(tree, &self.exclude);
        let new_children = job.drain_pending_children();

        if let Some(reader) = job.take_cache_takeover() {
            // A `.qdirstat.cache.gz` describing this very directory was
            // found mid-scan: drop whatever else was already queued under
            // it (while its nodes are still alive for the ancestor walk),
            // wipe its partial contents, and replay it from the cache
            // instead. `dir`'s pending-job count is left untouched — this
            // job is a continuation of the same logical read, not a new
            // one.
            self.kill_subtree(tree, dir);
            tree.clear_children(dir);
            self.jobs.push_front(ReadJob::Cache(CacheReadJob::new(dir, reader)));
        } else {
            if more {
                self.jobs.push_front(job);
            }
            for (child_id, child_path, one_fs, root_dev) in new_children {
                tree.read_job_added(child_id);
                self.jobs
                    .push_back(ReadJob::LocalDir(LocalDirReadJob::new(child_id, child_path, one_fs, root_dev)));
            }
        }

        if self.jobs.is_empty() {
            self.was_empty = true;
            debug!("read job queue drained");
            Some(QueueEvent::Finished)
        } else {
            None
        }
    }

    /// Drain the whole queue synchronously — the "host has no event loop"
    /// path the design notes call out explicitly.
    pub fn run_until_idle(&mut self, tree: &mut Tree) {
        while !self.jobs.is_empty() {
            self.time_sliced_read(tree);
        }
    }
}

fn is_descendant_or_self(tree: &Tree, candidate: NodeId, ancestor: NodeId) -> bool {
    let mut current = Some(candidate);
    while let Some(id) = current {
        if id == ancestor {
            return true;
        }
        current = tree.node(id).and_then(|n| n.parent);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{mode, EntryMeta};
    use std::fs;

    fn dir_meta(name: &str, mtime: i64) -> EntryMeta {
        EntryMeta {
            name: name.to_string(),
            mode: mode::S_IFDIR | 0o755,
            links: 1,
            size: 4096,
            blocks: 8,
            mtime,
            device: 1,
            is_local_file: true,
            is_sparse_file: false,
        }
    }

    #[test]
    fn run_until_idle_drains_a_real_tree() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("a.txt"), b"hello").unwrap();
        fs::write(tmp.path().join("sub/b.txt"), b"world!!").unwrap();

        let mut tree = Tree::new();
        let root = tree.set_root(dir_meta(&tmp.path().to_string_lossy(), 0));
        let mut queue = ReadJobQueue::new(ExcludeRules::new());
        queue.enqueue_local_dir(&mut tree, root, tmp.path().to_path_buf(), false, None);
        queue.run_until_idle(&mut tree);

        assert!(queue.is_empty());
        assert_eq!(tree.total_files(root), 2);
        assert_eq!(tree.total_sub_dirs(root), 1);
    }

    #[test]
    fn abort_marks_all_queued_dirs_aborted() {
        let tmp = tempfile::tempdir().unwrap();
        let mut tree = Tree::new();
        let root = tree.set_root(dir_meta(&tmp.path().to_string_lossy(), 0));
        let mut queue = ReadJobQueue::new(ExcludeRules::new());
        queue.enqueue_local_dir(&mut tree, root, tmp.path().to_path_buf(), false, None);
        queue.abort(&mut tree);

        assert!(queue.is_empty());
        assert_eq!(tree.read_state(root), Some(crate::tree::ReadState::Aborted));
    }
}
