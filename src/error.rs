//! Error types for the build engine.

use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// Process exit code reported by the driver when a build fails for any reason
/// other than a clean run: a non-zero action, a cycle, a producer conflict or
/// a missing link output.
pub const OTHER_COMPILATION_ERROR_EXIT_CODE: i32 = 6;

/// Various error types for the build engine.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Deserialization error of the action graph JSON file.
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] BuildIoError),
    /// A produced item is claimed by two actions whose fields differ.
    #[error("conflicting actions both produce \"{}\"\n{diff}", item.display())]
    ConflictingProducers { item: PathBuf, diff: String },
    /// The producer relation over actions is not acyclic.
    #[error("cycle detected in action graph:\n{report}")]
    CyclicActions { report: String },
    /// A produced item's absolute path exceeds the platform limit.
    #[error("output path \"{}\" is {} characters, exceeding the limit of {max}", path.display(), path.as_os_str().len())]
    OutputPathTooLong { path: PathBuf, max: usize },
    /// A link step reported success but one of its declared outputs is not on
    /// disk; the toolchain failed silently.
    #[error("\"{description}\" succeeded but did not produce \"{}\"", item.display())]
    MissingLinkOutput { description: String, item: PathBuf },
    /// A persistent cache file has an unreadable or truncated payload.
    #[error("corrupt archive \"{}\": {message}", path.display())]
    CorruptArchive { path: PathBuf, message: String },
    #[error("{0}")]
    Message(String),
}

impl BuildError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        BuildIoError::new(err, path).into()
    }

    /// Create an error with a custom message.
    pub fn msg(msg: impl std::fmt::Display) -> Self {
        BuildError::Message(msg.to_string())
    }

    /// The exit code the driver process reports for this error.
    ///
    /// Every fatal build error surfaces as the "other compilation error" code
    /// so that wrapping tooling treats it like a failed compile.
    pub fn exit_code(&self) -> i32 {
        OTHER_COMPILATION_ERROR_EXIT_CODE
    }
}

/// An io error paired with the path that produced it.
#[derive(Debug, Error)]
#[error("\"{}\": {io}", path.display())]
pub struct BuildIoError {
    io: io::Error,
    path: PathBuf,
}

impl BuildIoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path at which the error occurred.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The underlying `io::Error`.
    pub fn source(&self) -> &io::Error {
        &self.io
    }
}

impl From<BuildIoError> for io::Error {
    fn from(err: BuildIoError) -> Self {
        err.io
    }
}
