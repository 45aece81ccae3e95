//! Exclude rules: an ordered, first-match-wins list of patterns that keep
//! whole subtrees out of a scan. Grounded in `ExcludeRules.cpp`'s
//! `ExcludeRule::match()`/`ExcludeRules` singleton, reworked as owned state
//! instead of a singleton.

use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternSyntax {
    RegExp,
    Glob,
    FixedString,
}

/// A single rule. `use_full_path` matches against the absolute directory
/// path rather than just its name; `check_any_file_child` fires only when
/// at least one direct child of the candidate directory matches the
/// pattern, rather than matching the directory name itself (used for rules
/// like "exclude any dir containing a `.nobackup` file").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExcludeRule {
    pub pattern: String,
    pub syntax: PatternSyntax,
    pub case_sensitive: bool,
    pub use_full_path: bool,
    pub check_any_file_child: bool,
}

impl ExcludeRule {
    pub fn new(pattern: impl Into<String>, syntax: PatternSyntax) -> Self {
        Self {
            pattern: pattern.into(),
            syntax,
            case_sensitive: true,
            use_full_path: false,
            check_any_file_child: false,
        }
    }

    fn build_regex_matcher(&self) -> Option<Regex> {
        let mut pattern = match self.syntax {
            PatternSyntax::RegExp => self.pattern.clone(),
            PatternSyntax::FixedString => regex::escape(&self.pattern),
            PatternSyntax::Glob => return None,
        };
        if !self.case_sensitive {
            pattern = format!("(?i){pattern}");
        }
        Regex::new(&pattern).ok()
    }

    fn build_glob_matcher(&self) -> Option<GlobMatcher> {
        if self.syntax != PatternSyntax::Glob {
            return None;
        }
        Glob::new(&self.pattern).ok().map(|g| g.compile_matcher())
    }

    /// Does this rule match `dir_name` (or `full_path`, per
    /// `use_full_path`)? `children` is only consulted when
    /// `check_any_file_child` is set.
    pub fn matches(&self, dir_name: &str, full_path: &Path, children: &[String]) -> bool {
        let subject = if self.use_full_path {
            full_path.to_string_lossy().to_string()
        } else {
            dir_name.to_string()
        };

        if self.check_any_file_child {
            return children.iter().any(|child| self.matches_text(child));
        }
        self.matches_text(&subject)
    }

    fn matches_text(&self, text: &str) -> bool {
        match self.syntax {
            PatternSyntax::Glob => self
                .build_glob_matcher()
                .map(|m| m.is_match(text))
                .unwrap_or(false),
            PatternSyntax::RegExp | PatternSyntax::FixedString => self
                .build_regex_matcher()
                .map(|re| re.is_match(text))
                .unwrap_or(false),
        }
    }
}

/// Ordered rule list; first match wins. Owned by whoever drives a scan
/// (typically the `ReadJobQueue`), not a process-wide singleton.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExcludeRules {
    pub rules: Vec<ExcludeRule>,
}

impl ExcludeRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rule: ExcludeRule) {
        self.rules.push(rule);
    }

    /// Returns the first matching rule, if any.
    pub fn matching_rule(
        &self,
        dir_name: &str,
        full_path: &Path,
        children: &[String],
    ) -> Option<&ExcludeRule> {
        self.rules.iter().find(|r| r.matches(dir_name, full_path, children))
    }

    pub fn is_excluded(&self, dir_name: &str, full_path: &Path, children: &[String]) -> bool {
        self.matching_rule(dir_name, full_path, children).is_some()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(toml::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        fs::write(path, text)?;
        crate::config::chown_to_invoking_user(path);
        Ok(())
    }
}

/// Default config file location: `$XDG_CONFIG_HOME/dirstat/exclude_rules.toml`
/// or `$HOME/.config/dirstat/exclude_rules.toml`.
pub fn default_path() -> PathBuf {
    crate::config::config_dir().join("exclude_rules.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_string_matches_exact_name() {
        let rule = ExcludeRule::new("node_modules", PatternSyntax::FixedString);
        assert!(rule.matches("node_modules", Path::new("/a/node_modules"), &[]));
        assert!(!rule.matches("node_modules2", Path::new("/a/node_modules2"), &[]));
    }

    #[test]
    fn glob_matches_wildcard() {
        let rule = ExcludeRule::new("*.cache", PatternSyntax::Glob);
        assert!(rule.matches("foo.cache", Path::new("/a/foo.cache"), &[]));
        assert!(!rule.matches("foo.txt", Path::new("/a/foo.txt"), &[]));
    }

    #[test]
    fn regex_full_path_matches() {
        let mut rule = ExcludeRule::new(r"^/home/.*/\.cache$", PatternSyntax::RegExp);
        rule.use_full_path = true;
        assert!(rule.matches(".cache", Path::new("/home/u/.cache"), &[]));
        assert!(!rule.matches(".cache", Path::new("/var/.cache"), &[]));
    }

    #[test]
    fn check_any_file_child_ignores_dir_name() {
        let mut rule = ExcludeRule::new(r"^\.nobackup$", PatternSyntax::RegExp);
        rule.check_any_file_child = true;
        let children = vec!["a.txt".to_string(), ".nobackup".to_string()];
        assert!(rule.matches("build", Path::new("/x/build"), &children));
        assert!(!rule.matches("build", Path::new("/x/build"), &[]));
    }

    #[test]
    fn first_match_wins() {
        let mut rules = ExcludeRules::new();
        rules.add(ExcludeRule::new("a", PatternSyntax::FixedString));
        rules.add(ExcludeRule::new("a", PatternSyntax::FixedString));
        assert_eq!(rules.matching_rule("a", Path::new("/a"), &[]).unwrap().pattern, "a");
    }

    #[test]
    fn case_insensitive_regex() {
        let mut rule = ExcludeRule::new("cache", PatternSyntax::FixedString);
        rule.case_sensitive = false;
        assert!(rule.matches("CACHE", Path::new("/a/CACHE"), &[]));
    }
}
