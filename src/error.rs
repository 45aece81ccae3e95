//! Typed errors for the parts of the core that are genuine failures rather
//! than per-node scan data (see `ReadState::Error` / `PermissionDenied` for
//! the latter — those never become a `Result::Err`).

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("node {0:?} does not belong to this tree")]
    UnknownNode(crate::tree::NodeId),
    #[error("node {0:?} is not a directory")]
    NotADirectory(crate::tree::NodeId),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error reading/writing cache: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache file has no recognised header")]
    MissingHeader,
    #[error("malformed cache line {line_no}: {text:?}")]
    MalformedLine { line_no: usize, text: String },
    #[error("directory path {0:?} in cache could not be located in the tree")]
    UnlocatableDir(PathBuf),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("TOML serialise error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("no usable shell found (checked override, $SHELL, /bin/bash, /bin/sh)")]
    NoUsableShell,
    #[error("failed to spawn cleanup command: {0}")]
    SpawnFailed(#[from] std::io::Error),
    #[error("cleanup action was declined by the user")]
    Declined,
    #[error("no cleanup named {0:?}")]
    NotFound(String),
}
