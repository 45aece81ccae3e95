//! User-defined cleanup actions: shell command templates with `%p`/`%n`/
//! `%d`-style variable expansion, run against selected tree items. Grounded
//! in `Cleanup.cpp` (expansion/shell-selection/execution) and
//! `CleanupCollection.cpp` (ordered list, `execute()` orchestration) plus
//! `StdCleanup.cpp` for the built-in default set.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CleanupError, ConfigError};
use crate::process;
use crate::queue::ReadJobQueue;
use crate::tree::{NodeId, Tree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    NoRefresh,
    RefreshThis,
    RefreshParent,
    AssumeDeleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputWindowPolicy {
    ShowAlways,
    ShowIfErrorOutput,
    ShowAfterTimeout,
    ShowNever,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cleanup {
    pub id: String,
    pub command: String,
    pub title: String,
    pub active: bool,
    pub works_for_dir: bool,
    pub works_for_file: bool,
    pub works_for_dot_entry: bool,
    pub recurse: bool,
    pub ask_for_confirmation: bool,
    pub output_window_policy: OutputWindowPolicy,
    pub output_window_auto_close: bool,
    pub output_window_timeout_secs: u32,
    pub refresh_policy: RefreshPolicy,
    /// Explicit shell override; empty means "use the default selection".
    #[serde(default)]
    pub shell: String,
}

impl Cleanup {
    pub fn new(id: impl Into<String>, command: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            title: title.into(),
            active: true,
            works_for_dir: true,
            works_for_file: true,
            works_for_dot_entry: true,
            recurse: false,
            ask_for_confirmation: false,
            output_window_policy: OutputWindowPolicy::ShowAfterTimeout,
            output_window_auto_close: false,
            output_window_timeout_secs: 0,
            refresh_policy: RefreshPolicy::NoRefresh,
            shell: String::new(),
        }
    }

    pub fn works_for(&self, tree: &Tree, item: NodeId) -> bool {
        let Some(node) = tree.node(item) else { return false };
        if node.is_pseudo_dir() {
            self.works_for_dot_entry
        } else if node.is_dir() {
            self.works_for_dir
        } else {
            self.works_for_file
        }
    }

    /// Expand `%p` (full path, quoted), `%n` (base name, quoted), `%d`
    /// (parent dir, quoted), `%terminal`, `%filemanager` in `self.command`
    /// for `item`.
    pub fn expand(&self, tree: &Tree, item: NodeId) -> String {
        let url = tree.url(item);
        let path = Path::new(&url);
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let dir = Self::item_dir(tree, item).to_string_lossy().to_string();

        let mut out = self.command.clone();
        out = out.replace("%terminal", terminal_command());
        out = out.replace("%filemanager", file_manager_command());
        out = out.replace("%p", &quoted(&url));
        out = out.replace("%n", &quoted(&name));
        out = out.replace("%d", &quoted(&dir));
        out
    }

    pub fn item_dir(tree: &Tree, item: NodeId) -> PathBuf {
        let url = tree.url(item);
        let is_dir = tree.node(item).map(|n| n.is_dir()).unwrap_or(false);
        let path = Path::new(&url);
        if is_dir {
            path.to_path_buf()
        } else {
            path.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| PathBuf::from("/"))
        }
    }

    /// Run this cleanup against one item, blocking until the process
    /// finishes. The caller drives refresh/deletion according to
    /// `refresh_policy` afterward.
    pub fn execute(&self, tree: &Tree, item: NodeId) -> Result<std::process::ExitStatus, CleanupError> {
        let shell = choose_shell(&self.shell)?;
        let command = self.expand(tree, item);
        let cwd = Self::item_dir(tree, item);
        process::run_to_completion(&shell, &command, &cwd).map_err(CleanupError::SpawnFailed)
    }

    /// Spawns this cleanup's command against one item without waiting for
    /// it, streaming output lines back over the returned receiver —
    /// `CleanupCollection::execute` uses this so an `AssumeDeleted` item
    /// can be removed from the tree immediately after the process starts,
    /// rather than after it finishes.
    fn spawn(&self, tree: &Tree, item: NodeId) -> Result<std::sync::mpsc::Receiver<process::OutputLine>, CleanupError> {
        let shell = choose_shell(&self.shell)?;
        let command = self.expand(tree, item);
        let cwd = Self::item_dir(tree, item);
        process::spawn_streamed(&shell, &command, &cwd).map_err(CleanupError::SpawnFailed)
    }

    /// Post-order walk of `item`'s subtree (descendants before `item`
    /// itself), keeping only nodes this cleanup applies to — used for
    /// `recurse`-enabled cleanups like "delete junk files".
    fn matching_descendants_then_self(tree: &Tree, cleanup: &Cleanup, item: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        fn walk(tree: &Tree, cleanup: &Cleanup, id: NodeId, out: &mut Vec<NodeId>) {
            if tree.node(id).map(|n| n.is_dir()).unwrap_or(false) {
                for child in tree.visible_children(id) {
                    walk(tree, cleanup, child, out);
                }
            }
            if cleanup.works_for(tree, id) {
                out.push(id);
            }
        }
        walk(tree, cleanup, item, &mut out);
        out
    }
}

/// Single-quotes `s`, escaping embedded single quotes as `'\''` — matches
/// `Cleanup::quoted()`/`escaped()`.
pub fn quoted(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path).map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0).unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Shell selection precedence: explicit per-cleanup override, then
/// `$SHELL` if it's an executable file, then `/bin/bash`, then `/bin/sh`.
pub fn choose_shell(explicit: &str) -> Result<String, CleanupError> {
    if !explicit.is_empty() && is_executable(Path::new(explicit)) {
        return Ok(explicit.to_string());
    }
    if let Ok(shell) = std::env::var("SHELL") {
        if is_executable(Path::new(&shell)) {
            return Ok(shell);
        }
    }
    for candidate in ["/bin/bash", "/bin/sh"] {
        if is_executable(Path::new(candidate)) {
            return Ok(candidate.to_string());
        }
    }
    Err(CleanupError::NoUsableShell)
}

fn desktop() -> String {
    std::env::var("QDIRSTAT_DESKTOP")
        .or_else(|_| std::env::var("XDG_CURRENT_DESKTOP"))
        .unwrap_or_default()
        .to_uppercase()
}

fn terminal_command() -> &'static str {
    match desktop().as_str() {
        d if d.contains("GNOME") => "gnome-terminal",
        d if d.contains("KDE") => "konsole",
        d if d.contains("XFCE") => "xfce4-terminal",
        d if d.contains("LXDE") || d.contains("LXQT") => "lxterminal",
        _ => "x-terminal-emulator",
    }
}

fn file_manager_command() -> &'static str {
    match desktop().as_str() {
        d if d.contains("GNOME") => "nautilus",
        d if d.contains("KDE") => "dolphin",
        d if d.contains("XFCE") => "thunar",
        d if d.contains("LXDE") || d.contains("LXQT") => "pcmanfm",
        _ => "xdg-open",
    }
}

/// Ordered collection of cleanups, persisted as `cleanups.toml`. Seeded
/// with `StdCleanup::stdCleanups()`'s defaults when no persisted config
/// exists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupCollection {
    pub cleanups: Vec<Cleanup>,
}

impl CleanupCollection {
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let parsed: Self = toml::from_str(&text)?;
                if parsed.cleanups.is_empty() {
                    Ok(Self::with_std_cleanups())
                } else {
                    Ok(parsed)
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::with_std_cleanups()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        fs::write(path, text)?;
        crate::config::chown_to_invoking_user(path);
        Ok(())
    }

    pub fn find(&self, id: &str) -> Option<&Cleanup> {
        self.cleanups.iter().find(|c| c.id == id)
    }

    /// Runs cleanup `id` against `selection`, following
    /// `CleanupCollection::execute()`'s six-step protocol: confirm (if
    /// required), skip items the cleanup doesn't apply to, run the
    /// command (recursing through matching descendants first when
    /// `recurse` is set), and finally apply the cleanup's `refresh_policy`
    /// against the tree. `confirm` is only invoked, and only once, when
    /// `ask_for_confirmation` is set; `sink` receives every line of output
    /// from every spawned process (except for `AssumeDeleted`, whose
    /// processes are detached since the tree moves on without waiting for
    /// them).
    pub fn execute(
        &self,
        tree: &mut Tree,
        queue: &mut ReadJobQueue,
        id: &str,
        selection: &[NodeId],
        confirm: impl FnOnce(&Cleanup) -> bool,
        mut sink: impl FnMut(process::OutputLine),
    ) -> Result<(), CleanupError> {
        let cleanup = self.find(id).ok_or_else(|| CleanupError::NotFound(id.to_string()))?;

        if cleanup.ask_for_confirmation && !confirm(cleanup) {
            return Err(CleanupError::Declined);
        }

        // Decide what refreshing means before anything is spawned or
        // mutated, since AssumeDeleted needs the original selection and
        // RefreshParent needs parents computed against the still-intact
        // tree.
        let refresh_targets: Vec<NodeId> = match cleanup.refresh_policy {
            RefreshPolicy::NoRefresh => Vec::new(),
            RefreshPolicy::RefreshThis => selection.to_vec(),
            RefreshPolicy::RefreshParent => crate::refresher::parents(tree, selection),
            RefreshPolicy::AssumeDeleted => crate::refresher::normalize_selection(tree, selection),
        };

        let mut receivers = Vec::new();
        for &item in selection {
            if !cleanup.works_for(tree, item) {
                continue;
            }
            let targets = if cleanup.recurse {
                Cleanup::matching_descendants_then_self(tree, cleanup, item)
            } else {
                vec![item]
            };
            for target in targets {
                receivers.push(cleanup.spawn(tree, target)?);
            }
        }

        match cleanup.refresh_policy {
            RefreshPolicy::AssumeDeleted => {
                // Don't wait on the spawned processes — remove the
                // (ancestor-normalised) selection from the tree right away.
                for item in refresh_targets {
                    if let Some(parent) = tree.node(item).and_then(|n| n.parent) {
                        let _ = tree.delete_child(parent, item);
                    }
                }
            }
            RefreshPolicy::NoRefresh => {
                for rx in receivers {
                    for line in rx {
                        sink(line);
                    }
                }
            }
            RefreshPolicy::RefreshThis | RefreshPolicy::RefreshParent => {
                for rx in receivers {
                    for line in rx {
                        sink(line);
                    }
                }
                crate::refresher::refresh(tree, queue, &refresh_targets, true, None);
                queue.run_until_idle(tree);
            }
        }

        Ok(())
    }

    pub fn with_std_cleanups() -> Self {
        let mut open_in_file_manager =
            Cleanup::new("open_in_file_manager", "xdg-open %p", "Open in File Manager");
        open_in_file_manager.works_for_dot_entry = true;

        let mut open_in_terminal = Cleanup::new("open_in_terminal", "%terminal %p", "Open in Terminal");
        open_in_terminal.works_for_file = false;

        let mut compress_subtree = Cleanup::new(
            "compress_subtree",
            "cd .. && tar cjvf %n.tar.bz2 %n && rm -rf %n",
            "Compress",
        );
        compress_subtree.works_for_file = false;
        compress_subtree.works_for_dot_entry = false;
        compress_subtree.refresh_policy = RefreshPolicy::RefreshParent;

        let mut make_clean = Cleanup::new("make_clean", "make clean", "make clean");
        make_clean.works_for_file = false;
        make_clean.refresh_policy = RefreshPolicy::RefreshThis;

        let mut delete_junk = Cleanup::new(
            "delete_junk",
            "rm -f *.o *~ *.bak *.auto core",
            "Delete Trash Files",
        );
        delete_junk.works_for_file = false;
        delete_junk.recurse = true;
        delete_junk.refresh_policy = RefreshPolicy::RefreshThis;

        let mut move_to_trash = Cleanup::new("move_to_trash", "gio trash %p", "Move to Trash");
        move_to_trash.works_for_dot_entry = false;
        move_to_trash.refresh_policy = RefreshPolicy::AssumeDeleted;

        let mut hard_delete = Cleanup::new("hard_delete", "rm -rf %p", "Delete (no undo!)");
        hard_delete.works_for_dot_entry = false;
        hard_delete.ask_for_confirmation = true;
        hard_delete.refresh_policy = RefreshPolicy::AssumeDeleted;

        let mut hard_link_identical =
            Cleanup::new("hardlink_identical_files", "rdfind -makehardlinks true %p", "Hard-Link Identical Files");
        hard_link_identical.works_for_file = false;
        hard_link_identical.refresh_policy = RefreshPolicy::RefreshThis;

        Self {
            cleanups: vec![
                open_in_file_manager,
                open_in_terminal,
                move_to_trash,
                hard_delete,
                compress_subtree,
                make_clean,
                delete_junk,
                hard_link_identical,
            ],
        }
    }
}

pub fn default_path() -> PathBuf {
    crate::config::config_dir().join("cleanups.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_escapes_embedded_single_quote() {
        assert_eq!(quoted("it's"), r"'it'\''s'");
    }

    #[test]
    fn std_cleanups_seed_eight_entries() {
        let coll = CleanupCollection::with_std_cleanups();
        assert_eq!(coll.cleanups.len(), 8);
        assert!(coll.find("hard_delete").unwrap().ask_for_confirmation);
    }

    #[test]
    fn choose_shell_falls_back_to_bin_sh_or_bash() {
        let shell = choose_shell("").unwrap();
        assert!(shell == "/bin/bash" || shell == "/bin/sh" || Path::new(&shell).exists());
    }

    #[test]
    fn expand_substitutes_path_name_and_dir() {
        use crate::tree::{mode, EntryMeta};
        let mut tree = Tree::new();
        let mut root_meta = EntryMeta {
            name: "/tmp/x".to_string(),
            mode: mode::S_IFDIR | 0o755,
            links: 1,
            size: 4096,
            blocks: 8,
            mtime: 0,
            device: 1,
            is_local_file: true,
            is_sparse_file: false,
        };
        root_meta.name = "/tmp/x".to_string();
        let root = tree.set_root(root_meta);
        let file_meta = EntryMeta {
            name: "f.txt".to_string(),
            mode: mode::S_IFREG | 0o644,
            links: 1,
            size: 10,
            blocks: 1,
            mtime: 0,
            device: 1,
            is_local_file: true,
            is_sparse_file: false,
        };
        let f = tree.create_entry(root, file_meta).unwrap();

        let cleanup = Cleanup::new("t", "echo %n in %d", "t");
        let expanded = cleanup.expand(&tree, f);
        assert!(expanded.contains("'f.txt'"));
        assert!(expanded.contains("'/tmp/x'"));
    }

    #[test]
    fn expand_uses_item_dir_for_percent_d_on_a_directory_target() {
        use crate::tree::{mode, EntryMeta};
        let mut tree = Tree::new();
        let root_meta = EntryMeta {
            name: "/tmp/x".to_string(),
            mode: mode::S_IFDIR | 0o755,
            links: 1,
            size: 4096,
            blocks: 8,
            mtime: 0,
            device: 1,
            is_local_file: true,
            is_sparse_file: false,
        };
        let root = tree.set_root(root_meta);
        let sub_meta = EntryMeta {
            name: "sub".to_string(),
            mode: mode::S_IFDIR | 0o755,
            links: 1,
            size: 4096,
            blocks: 8,
            mtime: 0,
            device: 1,
            is_local_file: true,
            is_sparse_file: false,
        };
        let sub = tree.create_dir(root, sub_meta).unwrap();
        tree.finalize_local(sub).unwrap();
        tree.finalize_local(root).unwrap();

        let cleanup = Cleanup::new("t", "echo %d", "t");
        // %d on a directory target must equal the directory's own path,
        // not its parent's — matching `item_dir`'s is_dir branch.
        assert_eq!(cleanup.expand(&tree, sub), format!("echo {}", quoted("/tmp/x/sub")));
    }

    #[test]
    fn assume_deleted_cleanup_removes_item_and_shrinks_total_size() {
        use crate::exclude::ExcludeRules;

        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("junk.txt"), b"0123456789").unwrap();
        fs::write(tmp.path().join("keep.txt"), b"xyz").unwrap();

        let mut tree = Tree::new();
        let mut root_meta = crate::tree::EntryMeta {
            name: tmp.path().to_string_lossy().to_string(),
            mode: crate::tree::mode::S_IFDIR | 0o755,
            links: 1,
            size: 4096,
            blocks: 8,
            mtime: 0,
            device: 1,
            is_local_file: true,
            is_sparse_file: false,
        };
        root_meta.name = tmp.path().to_string_lossy().to_string();
        let root = tree.set_root(root_meta);
        let mut queue = ReadJobQueue::new(ExcludeRules::new());
        queue.enqueue_local_dir(&mut tree, root, tmp.path().to_path_buf(), false, None);
        queue.run_until_idle(&mut tree);
        tree.finalize_all(root).unwrap();

        let before = tree.total_size(root);
        let junk = tree.locate(root, &["junk.txt"], false).unwrap();

        let mut action = Cleanup::new("delete_it", "true", "Delete It");
        action.refresh_policy = RefreshPolicy::AssumeDeleted;
        let collection = CleanupCollection { cleanups: vec![action] };

        let mut lines = Vec::new();
        collection
            .execute(&mut tree, &mut queue, "delete_it", &[junk], |_| true, |line| lines.push(line))
            .unwrap();

        assert!(tree.node(junk).is_none());
        let after = tree.total_size(root);
        assert!(after < before);
    }

    #[test]
    fn execute_returns_declined_when_confirmation_is_refused() {
        use crate::exclude::ExcludeRules;

        let mut tree = Tree::new();
        let root_meta = crate::tree::EntryMeta {
            name: "/tmp/x".to_string(),
            mode: crate::tree::mode::S_IFDIR | 0o755,
            links: 1,
            size: 4096,
            blocks: 8,
            mtime: 0,
            device: 1,
            is_local_file: true,
            is_sparse_file: false,
        };
        let root = tree.set_root(root_meta);
        tree.finalize_local(root).unwrap();
        let mut queue = ReadJobQueue::new(ExcludeRules::new());

        let mut action = Cleanup::new("ask_first", "true", "Ask First");
        action.ask_for_confirmation = true;
        let collection = CleanupCollection { cleanups: vec![action] };

        let result = collection.execute(&mut tree, &mut queue, "ask_first", &[root], |_| false, |_| {});
        assert!(matches!(result, Err(CleanupError::Declined)));
    }
}
