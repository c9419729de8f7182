use std::path::PathBuf;

use thiserror::Error;

/// Run-aborting errors.
///
/// Anything returned as `Err(Error)` from the pipeline stops the run. Failures
/// that only affect one archive entry or one optional target are reported
/// through [`DeltaError`] inside the run report instead.
#[derive(Debug, Error)]
pub enum Error {
    // =========================================================================
    // Patch Bundle Errors
    // =========================================================================
    #[error("could not find patch file {0}")]
    ManifestNotFound(PathBuf),

    #[error("could not load patch file: {0}")]
    ManifestCorrupt(String),

    #[error("patch file has no patch for {0}")]
    PatchNotFound(String),

    // =========================================================================
    // Game Image Errors
    // =========================================================================
    #[error("the file {0} does not exist")]
    GameImageNotFound(PathBuf),

    #[error("the file {path} can not be opened: {source}")]
    GameImageUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("container parse error: {0}")]
    ContainerParse(String),

    #[error("container is encrypted: {0}")]
    ContainerEncrypted(String),

    #[error("could not find {entry} in {container}")]
    EntryNotFound { entry: String, container: String },

    // =========================================================================
    // Inner Archive Errors
    // =========================================================================
    #[error("archive parse error: {0}")]
    ArchiveParse(String),

    #[error("archive has no entry with index {0}")]
    ArchiveEntryMissing(usize),

    #[error("archive write error: {0}")]
    ArchiveWrite(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("background task failed: {0}")]
    Task(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

/// A delta payload could not be applied to its base.
///
/// Decoding is deterministic, so these are never retried.
#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("invalid delta: {0}")]
    InvalidDelta(String),

    #[error("unsupported delta feature: {0}")]
    Unsupported(String),

    #[error("target checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("could not read base content: {0}")]
    Base(String),

    #[error("delta read failed: {0}")]
    Io(#[from] std::io::Error),
}
