//! The in-memory tree: an arena of [`Node`]s addressed by [`NodeId`], owned
//! exclusively by a single [`Tree`].
//!
//! Modelled on the arena-tree idiom (`Vec<Node>` + index-based child/parent
//! links) rather than boxed/linked allocations, so that observers can hold
//! a plain `NodeId` across tree mutations without use-after-free: freed
//! slots are tombstoned (`None`), never recycled, so a stale id is simply
//! absent rather than aliasing an unrelated node.

use std::path::PathBuf;
use std::time::SystemTime;

use crate::error::TreeError;

/// Stable index into [`Tree::nodes`]. Never reused once a node is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// POSIX type+permission bits, kept bit-for-bit as `st_mode` would report
/// them so `isBlockDevice` etc. can be derived without re-deriving a
/// separate enum.
pub mod mode {
    pub const S_IFMT: u32 = 0o170000;
    pub const S_IFSOCK: u32 = 0o140000;
    pub const S_IFLNK: u32 = 0o120000;
    pub const S_IFREG: u32 = 0o100000;
    pub const S_IFBLK: u32 = 0o060000;
    pub const S_IFDIR: u32 = 0o040000;
    pub const S_IFCHR: u32 = 0o020000;
    pub const S_IFIFO: u32 = 0o010000;
}

/// Leaf attributes shared by every node (C1 `Entry` in the spec).
#[derive(Debug, Clone)]
pub struct EntryMeta {
    /// Last path component only; the root node may carry a full path.
    pub name: String,
    pub mode: u32,
    pub links: u64,
    /// Logical byte size.
    pub size: u64,
    /// Allocated block count, 512-byte units.
    pub blocks: u64,
    /// Seconds since epoch.
    pub mtime: i64,
    pub device: u64,
    pub is_local_file: bool,
    pub is_sparse_file: bool,
}

impl EntryMeta {
    pub fn is_dir(&self) -> bool {
        self.mode & mode::S_IFMT == mode::S_IFDIR
    }
    pub fn is_file(&self) -> bool {
        self.mode & mode::S_IFMT == mode::S_IFREG
    }
    pub fn is_sym_link(&self) -> bool {
        self.mode & mode::S_IFMT == mode::S_IFLNK
    }
    pub fn is_block_device(&self) -> bool {
        self.mode & mode::S_IFMT == mode::S_IFBLK
    }
    pub fn is_char_device(&self) -> bool {
        self.mode & mode::S_IFMT == mode::S_IFCHR
    }
    pub fn is_fifo(&self) -> bool {
        self.mode & mode::S_IFMT == mode::S_IFIFO
    }
    pub fn is_socket(&self) -> bool {
        self.mode & mode::S_IFMT == mode::S_IFSOCK
    }
    pub fn is_special(&self) -> bool {
        self.is_block_device() || self.is_char_device() || self.is_fifo() || self.is_socket()
    }

    /// Sparse heuristic: allocated bytes (+ a one-block tolerance) fall
    /// short of the logical size.
    pub fn looks_sparse(&self) -> bool {
        self.is_file() && self.blocks.saturating_mul(512) + 512 < self.size
    }

    /// Accounts for hard links (divides by link count) and sparse files
    /// (uses allocated bytes instead of logical size).
    pub fn effective_size(&self) -> u64 {
        if self.is_sparse_file {
            self.blocks.saturating_mul(512)
        } else if self.links > 1 {
            self.size / self.links.max(1)
        } else {
            self.size
        }
    }

    pub fn mtime_as_system_time(&self) -> Option<SystemTime> {
        if self.mtime < 0 {
            None
        } else {
            Some(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(self.mtime as u64))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Queued,
    Reading,
    Finished,
    OnRequestOnly,
    Cached,
    Aborted,
    Error,
    PermissionDenied,
}

/// Directory-only state (C2 `Dir` in the spec).
#[derive(Debug, Clone)]
pub struct DirData {
    pub children: Vec<NodeId>,
    pub dot_entry: Option<NodeId>,
    pub pending_read_jobs: u32,
    pub read_state: ReadState,
    pub is_mount_point: bool,
    pub is_excluded: bool,
    pub is_pseudo_dir: bool,
    pub being_destroyed: bool,
    pub summary_dirty: bool,
    pub total_size: u64,
    pub total_blocks: u64,
    pub total_items: u64,
    pub total_sub_dirs: u64,
    pub total_files: u64,
    pub latest_mtime: i64,
    pub err_sub_dir_count: u64,
}

impl DirData {
    fn new(own_mtime: i64) -> Self {
        Self {
            children: Vec::new(),
            dot_entry: None,
            pending_read_jobs: 0,
            read_state: ReadState::Queued,
            is_mount_point: false,
            is_excluded: false,
            is_pseudo_dir: false,
            being_destroyed: false,
            summary_dirty: false,
            total_size: 0,
            total_blocks: 0,
            total_items: 0,
            total_sub_dirs: 0,
            total_files: 0,
            latest_mtime: own_mtime,
            err_sub_dir_count: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    File,
    Dir(DirData),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub meta: EntryMeta,
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir(_))
    }

    pub fn dir(&self) -> Option<&DirData> {
        match &self.kind {
            NodeKind::Dir(d) => Some(d),
            NodeKind::File => None,
        }
    }

    pub fn dir_mut(&mut self) -> Option<&mut DirData> {
        match &mut self.kind {
            NodeKind::Dir(d) => Some(d),
            NodeKind::File => None,
        }
    }

    pub fn is_pseudo_dir(&self) -> bool {
        self.dir().map(|d| d.is_pseudo_dir).unwrap_or(false)
    }
}

/// Notifications an observer can subscribe to. Handlers receive stable
/// [`NodeId`]s rather than references, per the design notes on decoupling
/// observers from direct tree pointers.
#[derive(Debug, Clone)]
pub enum TreeEvent {
    ChildAdded { parent: NodeId, child: NodeId },
    DeletingChild { parent: NodeId, child: NodeId },
    ChildDeleted { parent: NodeId, child: NodeId },
    StartingReading,
    Finished,
    Aborted,
    FinalizeLocal { dir: NodeId },
    ProgressInfo { path: PathBuf },
}

pub type Observer = Box<dyn FnMut(&TreeEvent)>;

/// Owns exactly one root [`Node`] and every descendant, arena-allocated.
pub struct Tree {
    nodes: Vec<Option<Node>>,
    root: Option<NodeId>,
    cross_filesystems: bool,
    observers: Vec<Observer>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
            cross_filesystems: false,
            observers: Vec::new(),
        }
    }

    pub fn cross_filesystems(&self) -> bool {
        self.cross_filesystems
    }

    pub fn set_cross_filesystems(&mut self, value: bool) {
        self.cross_filesystems = value;
    }

    pub fn subscribe(&mut self, observer: Observer) {
        self.observers.push(observer);
    }

    fn emit(&mut self, event: TreeEvent) {
        for observer in &mut self.observers {
            observer(&event);
        }
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(|n| n.as_ref())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0).and_then(|n| n.as_mut())
    }

    fn try_node(&self, id: NodeId) -> Result<&Node, TreeError> {
        self.node(id).ok_or(TreeError::UnknownNode(id))
    }

    /// Allocate a new node. If `as_dir` is set, a `Dir` is created; plain
    /// directories (not dot entries) automatically get a dot entry sibling
    /// allocated alongside them, matching the source's `KDirInfo`
    /// constructor — every real directory is born with a dot entry, which
    /// `finalize_local` may later discard.
    fn alloc(&mut self, meta: EntryMeta, parent: Option<NodeId>, as_dir: bool) -> NodeId {
        let mtime = meta.mtime;
        let kind = if as_dir {
            NodeKind::Dir(DirData::new(mtime))
        } else {
            NodeKind::File
        };
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(Node { meta, parent, kind }));
        id
    }

    /// Create the tree's root directory and return its id.
    pub fn set_root(&mut self, meta: EntryMeta) -> NodeId {
        assert!(self.root.is_none(), "set_root called on a non-empty tree");
        let root_id = self.alloc(meta, None, true);
        self.ensure_dot_entry(root_id);
        self.root = Some(root_id);
        root_id
    }

    /// Allocate a fresh directory node under `parent`'s appropriate child
    /// list (possibly its dot entry, though directories never land in a dot
    /// entry — see `insert_child`). Returns the new node's id.
    pub fn create_dir(&mut self, parent: NodeId, meta: EntryMeta) -> Result<NodeId, TreeError> {
        self.try_node(parent)?;
        let id = self.alloc(meta, None, true);
        self.ensure_dot_entry(id);
        self.insert_child(parent, id)?;
        Ok(id)
    }

    /// Allocate a fresh leaf (file-like) node and insert it under `parent`
    /// (through its dot entry if it has one).
    pub fn create_entry(&mut self, parent: NodeId, meta: EntryMeta) -> Result<NodeId, TreeError> {
        self.try_node(parent)?;
        let id = self.alloc(meta, None, false);
        self.insert_child(parent, id)?;
        Ok(id)
    }

    fn ensure_dot_entry(&mut self, dir_id: NodeId) {
        let is_pseudo = self.node(dir_id).map(|n| n.is_pseudo_dir()).unwrap_or(true);
        if is_pseudo {
            // A dot entry may never itself contain subdirectories, so it
            // never gets its own dot entry.
            return;
        }
        let dot_meta = EntryMeta {
            name: ".".to_string(),
            mode: mode::S_IFDIR | 0o755,
            links: 1,
            size: 0,
            blocks: 0,
            mtime: self.node(dir_id).map(|n| n.meta.mtime).unwrap_or(0),
            device: self.node(dir_id).map(|n| n.meta.device).unwrap_or(0),
            is_local_file: false,
            is_sparse_file: false,
        };
        let dot_id = self.alloc(dot_meta, Some(dir_id), true);
        if let Some(dot_dir) = self.node_mut(dot_id).and_then(|n| n.dir_mut()) {
            dot_dir.is_pseudo_dir = true;
        }
        if let Some(dir) = self.node_mut(dir_id).and_then(|n| n.dir_mut()) {
            dir.dot_entry = Some(dot_id);
        }
    }

    /// `insertChild`: a directory, a dot entry, or a directory that has no
    /// dot entry takes the child directly; otherwise the child is forwarded
    /// to the dot entry.
    pub fn insert_child(&mut self, target: NodeId, child: NodeId) -> Result<(), TreeError> {
        let target_node = self.try_node(target)?;
        let target_dir = target_node.dir().ok_or(TreeError::NotADirectory(target))?;
        let child_is_dir = self.try_node(child)?.is_dir();

        if child_is_dir || target_dir.is_pseudo_dir || target_dir.dot_entry.is_none() {
            let dir = self.node_mut(target).and_then(|n| n.dir_mut()).unwrap();
            dir.children.push(child);
            if let Some(c) = self.node_mut(child) {
                c.parent = Some(target);
            }
            self.child_added(target, child);
            self.emit(TreeEvent::ChildAdded { parent: target, child });
            Ok(())
        } else {
            let dot_entry = target_dir.dot_entry.unwrap();
            self.insert_child(dot_entry, child)
        }
    }

    /// Propagate a newly inserted leaf's raw stats up through every
    /// structural ancestor (dot entries included, transparently — they are
    /// never themselves passed up, only conduits), matching the source's
    /// `childAdded` walk.
    fn child_added(&mut self, first_parent: NodeId, child: NodeId) {
        let Some(child_node) = self.node(child) else { return };
        let c_is_dir = child_node.is_dir() && !child_node.is_pseudo_dir();
        let c_is_file = child_node.meta.is_file();
        // Directories aren't hard-link-deduped (a dir's own `nlink` counts
        // its subdirectories' `..` entries, not aliasing); only files go
        // through `effective_size`, matching how `recalc` bottoms out at
        // leaf nodes via `total_size()`.
        let c_size = if child_node.is_dir() {
            child_node.meta.size
        } else {
            child_node.meta.effective_size()
        };
        let c_blocks = child_node.meta.blocks;
        let c_mtime = child_node.meta.mtime;

        let mut current = Some(first_parent);
        while let Some(id) = current {
            if let Some(dir) = self.node_mut(id).and_then(|n| n.dir_mut()) {
                if !dir.summary_dirty {
                    dir.total_size += c_size;
                    dir.total_blocks += c_blocks;
                    dir.total_items += 1;
                    if c_is_dir {
                        dir.total_sub_dirs += 1;
                    }
                    if c_is_file {
                        dir.total_files += 1;
                    }
                    if c_mtime > dir.latest_mtime {
                        dir.latest_mtime = c_mtime;
                    }
                }
            }
            current = self.node(id).and_then(|n| n.parent);
        }
    }

    /// Mark `dir` (and every ancestor) as needing a full recalc, matching
    /// `deletingChild`'s "just mark dirty, don't re-derive now" policy.
    fn mark_dirty_upward(&mut self, start: NodeId) {
        let mut current = Some(start);
        while let Some(id) = current {
            if let Some(dir) = self.node_mut(id).and_then(|n| n.dir_mut()) {
                dir.summary_dirty = true;
            }
            current = self.node(id).and_then(|n| n.parent);
        }
    }

    /// Full recursive re-sum for a single dirty `Dir`, pulling fresh (and
    /// possibly recursively recomputed) totals from its children.
    fn recalc(&mut self, dir_id: NodeId) {
        let Some(node) = self.node(dir_id) else { return };
        let own_size = node.meta.size;
        let own_blocks = node.meta.blocks;
        let own_mtime = node.meta.mtime;
        let Some(dir) = node.dir() else { return };
        let children = dir.children.clone();
        let dot_entry = dir.dot_entry;

        let mut total_size = own_size;
        let mut total_blocks = own_blocks;
        let mut total_items: u64 = 0;
        let mut total_sub_dirs: u64 = 0;
        let mut total_files: u64 = 0;
        let mut latest_mtime = own_mtime;

        for c in &children {
            let c_total_size = self.total_size(*c);
            let c_total_blocks = self.total_blocks(*c);
            let c_total_items = self.total_items(*c);
            let c_total_sub_dirs = self.total_sub_dirs(*c);
            let c_total_files = self.total_files(*c);
            let c_latest_mtime = self.latest_mtime(*c);
            let c_is_dir = self.node(*c).map(|n| n.is_dir()).unwrap_or(false);
            let c_is_file = self.node(*c).map(|n| n.meta.is_file()).unwrap_or(false);

            total_size += c_total_size;
            total_blocks += c_total_blocks;
            total_items += c_total_items + 1;
            total_sub_dirs += c_total_sub_dirs;
            total_files += c_total_files;
            if c_is_dir {
                total_sub_dirs += 1;
            }
            if c_is_file {
                total_files += 1;
            }
            if c_latest_mtime > latest_mtime {
                latest_mtime = c_latest_mtime;
            }
        }

        if let Some(dot_id) = dot_entry {
            total_size += self.total_size(dot_id);
            total_blocks += self.total_blocks(dot_id);
            total_items += self.total_items(dot_id);
            total_sub_dirs += self.total_sub_dirs(dot_id);
            total_files += self.total_files(dot_id);
            let dot_latest = self.latest_mtime(dot_id);
            if dot_latest > latest_mtime {
                latest_mtime = dot_latest;
            }
        }

        if let Some(dir) = self.node_mut(dir_id).and_then(|n| n.dir_mut()) {
            dir.total_size = total_size;
            dir.total_blocks = total_blocks;
            dir.total_items = total_items;
            dir.total_sub_dirs = total_sub_dirs;
            dir.total_files = total_files;
            dir.latest_mtime = latest_mtime;
            dir.summary_dirty = false;
        }
    }

    fn ensure_fresh(&mut self, id: NodeId) {
        if self.node(id).and_then(|n| n.dir()).map(|d| d.summary_dirty).unwrap_or(false) {
            self.recalc(id);
        }
    }

    pub fn total_size(&mut self, id: NodeId) -> u64 {
        self.ensure_fresh(id);
        self.node(id)
            .map(|n| n.dir().map(|d| d.total_size).unwrap_or(n.meta.effective_size()))
            .unwrap_or(0)
    }

    pub fn total_blocks(&mut self, id: NodeId) -> u64 {
        self.ensure_fresh(id);
        self.node(id)
            .map(|n| n.dir().map(|d| d.total_blocks).unwrap_or(n.meta.blocks))
            .unwrap_or(0)
    }

    pub fn total_items(&mut self, id: NodeId) -> u64 {
        self.ensure_fresh(id);
        self.node(id).and_then(|n| n.dir()).map(|d| d.total_items).unwrap_or(0)
    }

    pub fn total_sub_dirs(&mut self, id: NodeId) -> u64 {
        self.ensure_fresh(id);
        self.node(id).and_then(|n| n.dir()).map(|d| d.total_sub_dirs).unwrap_or(0)
    }

    pub fn total_files(&mut self, id: NodeId) -> u64 {
        self.ensure_fresh(id);
        self.node(id).and_then(|n| n.dir()).map(|d| d.total_files).unwrap_or(0)
    }

    pub fn latest_mtime(&mut self, id: NodeId) -> i64 {
        self.ensure_fresh(id);
        self.node(id)
            .map(|n| n.dir().map(|d| d.latest_mtime).unwrap_or(n.meta.mtime))
            .unwrap_or(0)
    }

    /// `d.pendingReadJobs = (1 if d is queued/reading) + sum(child.pendingReadJobs)`.
    /// Maintained incrementally by `read_job_added`/`read_job_finished`, so
    /// this is a plain accessor, not a recompute.
    pub fn pending_read_jobs(&self, id: NodeId) -> u32 {
        self.node(id).and_then(|n| n.dir()).map(|d| d.pending_read_jobs).unwrap_or(0)
    }

    pub fn read_state(&self, id: NodeId) -> Option<ReadState> {
        let node = self.node(id)?;
        let dir = node.dir()?;
        if dir.is_pseudo_dir {
            node.parent.and_then(|p| self.read_state(p))
        } else {
            Some(dir.read_state)
        }
    }

    pub fn set_read_state(&mut self, id: NodeId, new_state: ReadState) {
        if let Some(dir) = self.node_mut(id).and_then(|n| n.dir_mut()) {
            // "Aborted" has priority over a later "Finished".
            if dir.read_state == ReadState::Aborted && new_state == ReadState::Finished {
                return;
            }
            dir.read_state = new_state;
        }
    }

    pub fn is_busy(&self, id: NodeId) -> bool {
        let Some(dir) = self.node(id).and_then(|n| n.dir()) else { return false };
        if dir.pending_read_jobs > 0 && dir.read_state != ReadState::Aborted {
            return true;
        }
        matches!(dir.read_state, ReadState::Queued | ReadState::Reading)
    }

    pub fn read_job_added(&mut self, id: NodeId) {
        let mut current = Some(id);
        while let Some(cur) = current {
            if let Some(dir) = self.node_mut(cur).and_then(|n| n.dir_mut()) {
                dir.pending_read_jobs += 1;
            }
            current = self.node(cur).and_then(|n| n.parent);
        }
    }

    pub fn read_job_finished(&mut self, id: NodeId) {
        let mut current = Some(id);
        while let Some(cur) = current {
            if let Some(dir) = self.node_mut(cur).and_then(|n| n.dir_mut()) {
                dir.pending_read_jobs = dir.pending_read_jobs.saturating_sub(1);
            }
            current = self.node(cur).and_then(|n| n.parent);
        }
    }

    pub fn read_job_aborted(&mut self, id: NodeId) {
        let mut current = Some(id);
        while let Some(cur) = current {
            if let Some(dir) = self.node_mut(cur).and_then(|n| n.dir_mut()) {
                dir.read_state = ReadState::Aborted;
            }
            current = self.node(cur).and_then(|n| n.parent);
        }
    }

    /// `finalizeLocal`: invoked once per Dir when its direct children are
    /// fully known. Reparents a lone dot entry's children up if this level
    /// turned out to have no real subdirectories, and drops empty dot
    /// entries either way.
    pub fn finalize_local(&mut self, dir_id: NodeId) -> Result<(), TreeError> {
        let node = self.try_node(dir_id)?;
        let dir = node.dir().ok_or(TreeError::NotADirectory(dir_id))?;
        if dir.is_pseudo_dir {
            return Ok(());
        }
        let Some(dot_id) = dir.dot_entry else {
            self.emit(TreeEvent::FinalizeLocal { dir: dir_id });
            return Ok(());
        };
        let has_real_children = !dir.children.is_empty();

        if !has_real_children {
            let dot_children = self
                .node(dot_id)
                .and_then(|n| n.dir())
                .map(|d| d.children.clone())
                .unwrap_or_default();
            for c in &dot_children {
                if let Some(c_node) = self.node_mut(*c) {
                    c_node.parent = Some(dir_id);
                }
            }
            if let Some(dir) = self.node_mut(dir_id).and_then(|n| n.dir_mut()) {
                dir.children = dot_children;
                dir.dot_entry = None;
            }
            self.free(dot_id);
        } else {
            let dot_empty = self
                .node(dot_id)
                .and_then(|n| n.dir())
                .map(|d| d.children.is_empty())
                .unwrap_or(true);
            if dot_empty {
                if let Some(dir) = self.node_mut(dir_id).and_then(|n| n.dir_mut()) {
                    dir.dot_entry = None;
                }
                self.free(dot_id);
            }
        }

        self.emit(TreeEvent::FinalizeLocal { dir: dir_id });
        Ok(())
    }

    /// Post-order `finalizeAll`: finalize every real (non-dot-entry)
    /// directory in the subtree, children before parent.
    pub fn finalize_all(&mut self, dir_id: NodeId) -> Result<(), TreeError> {
        let children = self
            .node(dir_id)
            .and_then(|n| n.dir())
            .map(|d| d.children.clone())
            .unwrap_or_default();
        for c in children {
            if self.node(c).map(|n| n.is_dir() && !n.is_pseudo_dir()).unwrap_or(false) {
                self.finalize_all(c)?;
            }
        }
        self.finalize_local(dir_id)
    }

    /// Free a node's arena slot without touching any parent/child linkage;
    /// callers must already have unlinked it. The slot is tombstoned, never
    /// reused, so any surviving `NodeId` referencing it becomes `None`
    /// rather than aliasing a future node.
    fn free(&mut self, id: NodeId) {
        if let Some(slot) = self.nodes.get_mut(id.0) {
            *slot = None;
        }
    }

    /// `deletingChild` + `unlinkChild` + drop: detach `child` from its
    /// current parent and recursively free it and its descendants. Emits
    /// `DeletingChild` before any storage is freed, and `ChildDeleted`
    /// after, per the ordering guarantee in §5.
    ///
    /// `parent` is the structural directory the caller thinks of `child` as
    /// belonging to, for the emitted event; `child` may actually be linked
    /// under `parent`'s dot entry, so the unlink itself always uses the
    /// child's real `.parent`, and dirtying starts there so the dot entry's
    /// own totals get recalculated too.
    pub fn delete_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), TreeError> {
        self.try_node(parent)?;
        self.try_node(child)?;
        self.emit(TreeEvent::DeletingChild { parent, child });
        let real_parent = self.node(child).and_then(|n| n.parent).unwrap_or(parent);
        self.mark_dirty_upward(real_parent);

        if let Some(dir) = self.node_mut(real_parent).and_then(|n| n.dir_mut()) {
            dir.children.retain(|&c| c != child);
        }
        self.destroy_subtree(child);
        self.emit(TreeEvent::ChildDeleted { parent, child });
        Ok(())
    }

    fn destroy_subtree(&mut self, id: NodeId) {
        let (children, dot_entry) = self
            .node(id)
            .and_then(|n| n.dir())
            .map(|d| (d.children.clone(), d.dot_entry))
            .unwrap_or_default();
        if let Some(dir) = self.node_mut(id).and_then(|n| n.dir_mut()) {
            dir.being_destroyed = true;
        }
        for c in children {
            self.destroy_subtree(c);
        }
        if let Some(dot_id) = dot_entry {
            self.destroy_subtree(dot_id);
        }
        self.free(id);
    }

    /// Wipes every child of `dir_id` (including its dot entry and
    /// everything under it) without freeing `dir_id` itself. Used when a
    /// cache sentinel found mid-scan replaces a directory's partial
    /// contents with a full cache replay, and when refreshing the tree
    /// root in place (it has no parent to detach and recreate).
    pub fn clear_children(&mut self, dir_id: NodeId) {
        for child in self.visible_children(dir_id) {
            let _ = self.delete_child(dir_id, child);
        }
        let dot_id = self.node(dir_id).and_then(|n| n.dir()).and_then(|d| d.dot_entry);
        if let Some(dot_id) = dot_id {
            self.emit(TreeEvent::DeletingChild { parent: dir_id, child: dot_id });
            self.destroy_subtree(dot_id);
            self.emit(TreeEvent::ChildDeleted { parent: dir_id, child: dot_id });
            if let Some(dir) = self.node_mut(dir_id).and_then(|n| n.dir_mut()) {
                dir.dot_entry = None;
            }
        }
        self.mark_dirty_upward(dir_id);
    }

    /// Discard the whole tree (used by `Tree::clear()`).
    pub fn clear(&mut self) {
        if let Some(root) = self.root {
            self.destroy_subtree(root);
        }
        self.root = None;
    }

    /// Computes the full path by walking to the root, skipping any
    /// dot-entry segment and avoiding duplicate slashes.
    pub fn url(&self, id: NodeId) -> String {
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(cur) = current {
            let Some(node) = self.node(cur) else { break };
            if !node.is_pseudo_dir() {
                segments.push(node.meta.name.clone());
            }
            current = node.parent;
        }
        segments.reverse();
        let mut out = String::new();
        for (i, seg) in segments.iter().enumerate() {
            if i == 0 {
                out.push_str(seg);
                if !out.ends_with('/') {
                    out.push('/');
                }
            } else {
                out.push_str(seg.trim_start_matches('/'));
                if i + 1 != segments.len() {
                    out.push('/');
                }
            }
        }
        if out.len() > 1 && out.ends_with('/') {
            out.pop();
        }
        out
    }

    /// Recursively locate a node by path components relative to `start`.
    /// If `find_dot_entries` and the last component is `"."`, returns the
    /// dot entry itself instead of descending further.
    pub fn locate(&self, start: NodeId, path: &[&str], find_dot_entries: bool) -> Option<NodeId> {
        let Some((head, rest)) = path.split_first() else {
            return Some(start);
        };
        let node = self.node(start)?;
        let dir = node.dir()?;

        if find_dot_entries && *head == "." && rest.is_empty() {
            return dir.dot_entry;
        }

        for &c in &dir.children {
            if self.node(c).map(|n| n.meta.name.as_str()) == Some(*head) {
                return self.locate(c, rest, find_dot_entries);
            }
        }
        if let Some(dot_id) = dir.dot_entry {
            if let Some(dot_dir) = self.node(dot_id).and_then(|n| n.dir()) {
                for &c in &dot_dir.children {
                    if self.node(c).map(|n| n.meta.name.as_str()) == Some(*head) {
                        return self.locate(c, rest, find_dot_entries);
                    }
                }
            }
        }
        None
    }

    pub fn locate_path(&self, path: &str) -> Option<NodeId> {
        let root = self.root?;
        let root_url = self.url(root);
        let rel = path.strip_prefix(&root_url).unwrap_or(path);
        let comps: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();
        self.locate(root, &comps, false)
    }

    /// All non-pseudo (real, structural) children of `id`, in storage
    /// order, followed by the dot entry's own children — i.e. the set a
    /// caller would see if dot entries were transparent.
    pub fn visible_children(&self, id: NodeId) -> Vec<NodeId> {
        let Some(dir) = self.node(id).and_then(|n| n.dir()) else { return Vec::new() };
        let mut out = dir.children.clone();
        if let Some(dot_id) = dir.dot_entry {
            if let Some(dot_dir) = self.node(dot_id).and_then(|n| n.dir()) {
                out.extend(dot_dir.children.iter().copied());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_meta(name: &str, size: u64) -> EntryMeta {
        EntryMeta {
            name: name.to_string(),
            mode: mode::S_IFREG | 0o644,
            links: 1,
            size,
            blocks: size.div_ceil(512),
            mtime: 1000,
            device: 1,
            is_local_file: true,
            is_sparse_file: false,
        }
    }

    fn dir_meta(name: &str) -> EntryMeta {
        EntryMeta {
            name: name.to_string(),
            mode: mode::S_IFDIR | 0o755,
            links: 1,
            size: 4096,
            blocks: 8,
            mtime: 1000,
            device: 1,
            is_local_file: true,
            is_sparse_file: false,
        }
    }

    #[test]
    fn dot_entry_holds_files_alongside_subdirs() {
        let mut tree = Tree::new();
        let root = tree.set_root(dir_meta("t"));
        let f1 = tree.create_entry(root, file_meta("f1", 100)).unwrap();
        let a = tree.create_dir(root, dir_meta("a")).unwrap();
        tree.finalize_local(a).unwrap();
        tree.finalize_local(root).unwrap();

        // root has a subdir, so f1 must live in the dot entry, not root directly.
        let root_dir = tree.node(root).unwrap().dir().unwrap();
        assert!(root_dir.children.contains(&a));
        assert!(!root_dir.children.contains(&f1));
        let dot_id = root_dir.dot_entry.unwrap();
        assert!(tree.node(dot_id).unwrap().dir().unwrap().children.contains(&f1));
    }

    #[test]
    fn dot_entry_discarded_when_no_subdirs() {
        let mut tree = Tree::new();
        let root = tree.set_root(dir_meta("t"));
        let _f1 = tree.create_entry(root, file_meta("f1", 100)).unwrap();
        tree.finalize_local(root).unwrap();

        let root_dir = tree.node(root).unwrap().dir().unwrap();
        assert!(root_dir.dot_entry.is_none());
        assert_eq!(root_dir.children.len(), 1);
    }

    #[test]
    fn aggregation_totals() {
        let mut tree = Tree::new();
        let root = tree.set_root(dir_meta("t"));
        let _f1 = tree.create_entry(root, file_meta("f1", 100)).unwrap();
        let a = tree.create_dir(root, dir_meta("a")).unwrap();
        tree.finalize_local(a).unwrap();
        tree.finalize_local(root).unwrap();

        assert_eq!(tree.total_size(root), 4096 + 100 + 4096);
        assert_eq!(tree.total_items(root), 2);
        assert_eq!(tree.total_sub_dirs(root), 1);
        assert_eq!(tree.total_files(root), 1);
    }

    #[test]
    fn url_skips_dot_entry_segment() {
        let mut tree = Tree::new();
        let mut root_meta = dir_meta("t");
        root_meta.name = "/t".to_string();
        let root = tree.set_root(root_meta);
        let f1 = tree.create_entry(root, file_meta("f1", 1)).unwrap();
        let a = tree.create_dir(root, dir_meta("a")).unwrap();
        tree.finalize_local(a).unwrap();
        tree.finalize_local(root).unwrap();

        assert_eq!(tree.url(f1), "/t/f1");
        assert_eq!(tree.url(a), "/t/a");
    }

    #[test]
    fn delete_child_marks_dirty_and_frees() {
        let mut tree = Tree::new();
        let root = tree.set_root(dir_meta("t"));
        let a = tree.create_dir(root, dir_meta("a")).unwrap();
        tree.finalize_local(a).unwrap();
        tree.finalize_local(root).unwrap();
        assert_eq!(tree.total_sub_dirs(root), 1);

        tree.delete_child(root, a).unwrap();
        assert!(tree.node(a).is_none());
        assert_eq!(tree.total_sub_dirs(root), 0);
    }

    #[test]
    fn stale_node_id_detected_not_aliased() {
        let mut tree = Tree::new();
        let root = tree.set_root(dir_meta("t"));
        let a = tree.create_dir(root, dir_meta("a")).unwrap();
        tree.finalize_local(a).unwrap();
        tree.delete_child(root, a).unwrap();

        // A new node allocated afterward must not reuse `a`'s slot, so the
        // stale id stays absent rather than aliasing the new node.
        let b = tree.create_dir(root, dir_meta("b")).unwrap();
        assert_ne!(a, b);
        assert!(tree.node(a).is_none());
        assert!(tree.node(b).is_some());
    }

    #[test]
    fn hard_link_effective_size() {
        let mut meta = file_meta("a", 1000);
        meta.links = 2;
        assert_eq!(meta.effective_size(), 500);
    }

    #[test]
    fn sparse_effective_size() {
        let mut meta = file_meta("big", 1_048_576);
        meta.blocks = 8;
        meta.is_sparse_file = true;
        assert_eq!(meta.effective_size(), 4096);
    }
}
