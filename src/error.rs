//! Crate error types.

use std::{
    io,
    path::{Path, PathBuf},
};

pub type Result<T, E = SpryError> = std::result::Result<T, E>;

/// An `io::Error` paired with the path at which it occurred.
#[derive(Debug, thiserror::Error)]
#[error("\"{}\": {io}", self.path.display())]
pub struct SpryIoError {
    io: io::Error,
    path: PathBuf,
}

impl SpryIoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path at which the error occurred.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl From<SpryIoError> for io::Error {
    fn from(err: SpryIoError) -> Self {
        err.io
    }
}

/// Various error types
#[derive(Debug, thiserror::Error)]
pub enum SpryError {
    /// Filesystem errors, including a missing walk root.
    #[error(transparent)]
    Io(#[from] SpryIoError),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    SerdeYaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
    #[error(transparent)]
    Glob(#[from] glob::GlobError),
    /// The module home handed to the path resolver is not an existing directory.
    #[error("invalid project root {}: not an existing directory", .0.display())]
    InvalidRoot(PathBuf),
    /// A relative artifact path resolved outside its store root.
    #[error("path {} escapes artifact root {}", .path.display(), .root.display())]
    PathEscape { root: PathBuf, path: PathBuf },
    #[error("{0}")]
    Message(String),
}

impl SpryError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        SpryIoError::new(err, path).into()
    }

    pub fn msg(msg: impl std::fmt::Display) -> Self {
        SpryError::Message(msg.to_string())
    }
}
