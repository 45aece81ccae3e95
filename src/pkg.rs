//! Package-scan URL grammar (`pkg:/<regex>`, `unpkg:/<dir>`) carried over
//! from `UnpkgSettings.{h,cpp}`. Real package-manager querying is out of
//! scope (§1 Non-goals); what's in scope is the `PackageQuery` seam a host
//! could plug a real backend into, and the URL parsing that selects it.

use std::path::PathBuf;

/// What a scan was asked to cover, parsed from the CLI's positional
/// argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanTarget {
    Local(PathBuf),
    /// `pkg:/<regex>` — scan files owned by packages matching the regex.
    Pkg(String),
    /// `unpkg:/<dir>` — scan files under `dir` NOT owned by any package.
    Unpkg(PathBuf),
}

impl ScanTarget {
    pub fn parse(arg: &str) -> Self {
        if let Some(rest) = arg.strip_prefix("pkg:/") {
            ScanTarget::Pkg(rest.to_string())
        } else if let Some(rest) = arg.strip_prefix("unpkg:/") {
            ScanTarget::Unpkg(PathBuf::from(format!("/{rest}")))
        } else {
            ScanTarget::Local(PathBuf::from(arg))
        }
    }
}

/// One file a package manager claims ownership of.
#[derive(Debug, Clone)]
pub struct PackageFile {
    pub package: String,
    pub path: PathBuf,
}

/// Abstracts over a package manager's file-ownership database (`dpkg
/// -L`/`rpm -ql` and friends in the original). The core crate ships no
/// real implementation — only this seam and a no-op stand-in — since
/// querying actual package managers is explicitly out of scope.
pub trait PackageQuery: Send + Sync {
    /// All files owned by packages whose name matches `pattern`.
    fn files_for_packages(&self, pattern: &str) -> Vec<PackageFile>;

    /// Every path any installed package claims to own, used to compute the
    /// "unpackaged" complement under a directory.
    fn all_owned_paths(&self) -> Vec<PathBuf>;
}

/// Reports no packages at all. Lets `ScanTarget::Pkg`/`Unpkg` be wired up
/// and exercised without a real package database present.
pub struct NoPackageQuery;

impl PackageQuery for NoPackageQuery {
    fn files_for_packages(&self, _pattern: &str) -> Vec<PackageFile> {
        Vec::new()
    }

    fn all_owned_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_path() {
        assert_eq!(ScanTarget::parse("/home/user"), ScanTarget::Local(PathBuf::from("/home/user")));
    }

    #[test]
    fn parses_pkg_url() {
        assert_eq!(ScanTarget::parse("pkg:/^firefox.*"), ScanTarget::Pkg("^firefox.*".to_string()));
    }

    #[test]
    fn parses_unpkg_url() {
        assert_eq!(ScanTarget::parse("unpkg:/usr/local"), ScanTarget::Unpkg(PathBuf::from("/usr/local")));
    }

    #[test]
    fn no_package_query_is_empty() {
        let q = NoPackageQuery;
        assert!(q.files_for_packages("anything").is_empty());
        assert!(q.all_owned_paths().is_empty());
    }
}
