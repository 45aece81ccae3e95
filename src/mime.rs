//! File-type categorisation by suffix/pattern, used to colour or group
//! entries by kind (archives, images, video, ...). Grounded in
//! `MimeCategorizer.{h,cpp}`/`MimeCategory.h`: a suffix map gives an O(1)
//! hit for the common case, falling back to a pattern list for names
//! without a recognised suffix (e.g. `core`, `pack-*.pack`).
//!
//! Unlike the exclude rules and cleanups, categories carry no shell
//! command or path matching beyond the filename itself, so there's a
//! single `category_for()` entry point rather than separate `matches`/
//! `is_excluded` calls.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One named group of file types, e.g. "Images" or "Compressed Archives".
/// `color` is an RGB hex string (`"#rrggbb"`) so the type stays host/UI
/// agnostic instead of depending on a particular colour crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MimeCategory {
    pub name: String,
    pub color: String,
    /// Suffixes matched case-sensitively, without the leading dot.
    #[serde(default)]
    pub case_sensitive_suffixes: Vec<String>,
    /// Suffixes matched case-insensitively, without the leading dot.
    #[serde(default)]
    pub case_insensitive_suffixes: Vec<String>,
    /// Glob patterns tried, in order, against the whole filename when no
    /// suffix matches (e.g. `core`, `pack-*.pack`).
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl MimeCategory {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
            case_sensitive_suffixes: Vec::new(),
            case_insensitive_suffixes: Vec::new(),
            patterns: Vec::new(),
        }
    }

    pub fn with_suffixes(mut self, suffixes: &[&str]) -> Self {
        self.case_insensitive_suffixes.extend(suffixes.iter().map(|s| s.to_string()));
        self
    }

    pub fn with_case_sensitive_suffixes(mut self, suffixes: &[&str]) -> Self {
        self.case_sensitive_suffixes.extend(suffixes.iter().map(|s| s.to_string()));
        self
    }

    pub fn with_pattern(mut self, pattern: &str) -> Self {
        self.patterns.push(pattern.to_string());
        self
    }

    fn pattern_matches(&self, filename: &str) -> bool {
        self.patterns.iter().any(|p| {
            Glob::new(p)
                .ok()
                .map(|g| g.compile_matcher())
                .map(|m: GlobMatcher| m.is_match(filename))
                .unwrap_or(false)
        })
    }
}

pub const CATEGORY_SYMLINKS: &str = "Symlinks";
pub const CATEGORY_EXECUTABLES: &str = "Executables";

/// Classifies filenames against an ordered list of [`MimeCategory`]s.
/// Builds case-sensitive/insensitive suffix maps lazily and rebuilds them
/// whenever the category list changes, mirroring `_mapsDirty` in the
/// original — repeated lookups (hundreds of thousands in a big scan) hit
/// the map instead of re-walking every category's pattern list.
#[derive(Debug, Clone, Default)]
pub struct MimeCategorizer {
    categories: Vec<MimeCategory>,
    case_sensitive_suffix_map: HashMap<String, usize>,
    case_insensitive_suffix_map: HashMap<String, usize>,
    maps_dirty: bool,
}

impl MimeCategorizer {
    pub fn new(categories: Vec<MimeCategory>) -> Self {
        let mut this = Self {
            categories,
            case_sensitive_suffix_map: HashMap::new(),
            case_insensitive_suffix_map: HashMap::new(),
            maps_dirty: true,
        };
        this.build_maps();
        this
    }

    pub fn categories(&self) -> &[MimeCategory] {
        &self.categories
    }

    pub fn add(&mut self, category: MimeCategory) {
        self.categories.push(category);
        self.maps_dirty = true;
    }

    fn build_maps(&mut self) {
        self.case_sensitive_suffix_map.clear();
        self.case_insensitive_suffix_map.clear();
        for (i, cat) in self.categories.iter().enumerate() {
            for suffix in &cat.case_sensitive_suffixes {
                self.case_sensitive_suffix_map.entry(suffix.clone()).or_insert(i);
            }
            for suffix in &cat.case_insensitive_suffixes {
                self.case_insensitive_suffix_map.entry(suffix.to_lowercase()).or_insert(i);
            }
        }
        self.maps_dirty = false;
    }

    /// Category for a bare filename, trying progressively shorter
    /// dot-suffixes first (`tar.bz2`, then `bz2`) before falling back to
    /// whole-name pattern matching.
    pub fn category_for_name(&mut self, filename: &str) -> Option<&MimeCategory> {
        if self.maps_dirty {
            self.build_maps();
        }
        if filename.is_empty() {
            return None;
        }

        let mut rest = filename;
        while let Some(dot) = rest.find('.') {
            let suffix = &rest[dot + 1..];
            if suffix.is_empty() {
                break;
            }
            if let Some(&i) = self.case_sensitive_suffix_map.get(suffix) {
                return self.categories.get(i);
            }
            if let Some(&i) = self.case_insensitive_suffix_map.get(&suffix.to_lowercase()) {
                return self.categories.get(i);
            }
            rest = suffix;
        }

        self.categories.iter().find(|c| c.pattern_matches(filename))
    }

    /// Category for a tree entry: symlinks and executables are classified
    /// by their own fixed pseudo-categories ahead of name-based matching,
    /// matching `MimeCategorizer::category(FileInfo*)`.
    pub fn category_for_entry(&mut self, name: &str, is_sym_link: bool, is_executable: bool) -> Option<&MimeCategory> {
        if is_sym_link {
            return self.find_by_name(CATEGORY_SYMLINKS);
        }
        if let found @ Some(_) = self.category_for_name(name) {
            return found;
        }
        if is_executable {
            return self.find_by_name(CATEGORY_EXECUTABLES);
        }
        None
    }

    fn find_by_name(&self, name: &str) -> Option<&MimeCategory> {
        self.categories.iter().find(|c| c.name == name)
    }

    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let persisted: PersistedCategories = toml::from_str(&text)?;
                if persisted.categories.is_empty() {
                    Ok(Self::with_default_categories())
                } else {
                    Ok(Self::new(persisted.categories))
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::with_default_categories()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let persisted = PersistedCategories {
            categories: self.categories.clone(),
        };
        let text = toml::to_string_pretty(&persisted)?;
        fs::write(path, text)?;
        crate::config::chown_to_invoking_user(path);
        Ok(())
    }

    /// A representative trimmed-down set of `addDefaultCategories()`'s
    /// built-ins, plus the two mandatory pseudo-categories
    /// `ensureMandatoryCategories()` always guarantees exist.
    pub fn with_default_categories() -> Self {
        let categories = vec![
            MimeCategory::new("Junk", "#ff0000").with_suffixes(&["~", "bak"]).with_pattern("core"),
            MimeCategory::new("Compressed Archives", "#00ff00").with_suffixes(&[
                "7z", "arj", "cab", "deb", "jar", "rar", "rpm", "tar.bz2", "tar.gz", "tar.lz", "tar.xz", "tar.zst",
                "tbz2", "tgz", "txz", "zip", "zpaq",
            ]).with_pattern("pack-*.pack"),
            MimeCategory::new("Uncompressed Archives", "#808000").with_suffixes(&["tar", "cpio"]),
            MimeCategory::new("Compressed Files", "#00ff00").with_suffixes(&["bz2", "gz", "lz", "lzo", "xz", "zst"]),
            MimeCategory::new("Images", "#00ffff").with_suffixes(&[
                "gif", "jpeg", "jpg", "jxl", "png", "mng", "svg", "tif", "tiff", "webp", "xpm",
            ]),
            MimeCategory::new("Videos", "#a0ff00").with_suffixes(&[
                "avi", "flv", "m4v", "mkv", "mov", "mp4", "mpeg", "mpg", "ogv", "webm", "wmv",
            ]),
            MimeCategory::new("Music", "#ffff00").with_suffixes(&["flac", "m4a", "mp3", "ogg", "wav", "wma"]),
            MimeCategory::new("Documents", "#0000ff").with_suffixes(&[
                "doc", "docx", "odp", "ods", "odt", "pdf", "ppt", "pptx", "xls", "xlsx",
            ]),
            MimeCategory::new(CATEGORY_EXECUTABLES, "#ff00ff"),
            MimeCategory::new(CATEGORY_SYMLINKS, "#0000ff"),
        ];
        Self::new(categories)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedCategories {
    categories: Vec<MimeCategory>,
}

pub fn default_path() -> PathBuf {
    crate::config::config_dir().join("mime_categories.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_simple_suffix() {
        let mut cat = MimeCategorizer::with_default_categories();
        assert_eq!(cat.category_for_name("photo.PNG").unwrap().name, "Images");
    }

    #[test]
    fn prefers_longer_compound_suffix() {
        let mut cat = MimeCategorizer::with_default_categories();
        assert_eq!(cat.category_for_name("backup.tar.bz2").unwrap().name, "Compressed Archives");
    }

    #[test]
    fn falls_back_to_shorter_suffix() {
        let mut cat = MimeCategorizer::with_default_categories();
        assert_eq!(cat.category_for_name("weird.name.bz2").unwrap().name, "Compressed Files");
    }

    #[test]
    fn pattern_matches_suffixless_name() {
        let mut cat = MimeCategorizer::with_default_categories();
        assert_eq!(cat.category_for_name("core").unwrap().name, "Junk");
    }

    #[test]
    fn unmatched_name_is_none() {
        let mut cat = MimeCategorizer::with_default_categories();
        assert!(cat.category_for_name("README").is_none());
    }

    #[test]
    fn entry_classification_prefers_symlink_over_name() {
        let mut cat = MimeCategorizer::with_default_categories();
        let c = cat.category_for_entry("photo.png", true, false).unwrap();
        assert_eq!(c.name, CATEGORY_SYMLINKS);
    }

    #[test]
    fn entry_classification_falls_back_to_executable() {
        let mut cat = MimeCategorizer::with_default_categories();
        let c = cat.category_for_entry("run", false, true).unwrap();
        assert_eq!(c.name, CATEGORY_EXECUTABLES);
    }
}
