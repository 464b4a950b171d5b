#![forbid(unsafe_code)]
//! Error taxonomy for bad block discovery and remediation.
//!
//! Every stage of the engine returns [`Result`]. No stage downgrades a lower
//! stage's error to an empty success; the only non-error empty outcomes
//! (path not on a namespace, zero defects found) are expressed as values,
//! never as errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PmbbError {
    /// The path could not be `stat`-ed because it does not exist.
    #[error("no such file: {}", path.display())]
    NotFound { path: PathBuf },

    /// Path, file status or topology resolution failed.
    #[error("lookup failed for {}: {detail}", path.display())]
    LookupFailed { path: PathBuf, detail: String },

    /// The platform reported its "unknown" sentinel for an offset or size.
    #[error("cannot read {attribute} of {object}")]
    BoundsUnavailable {
        object: String,
        attribute: &'static str,
    },

    /// A defect or extent enumeration call failed.
    #[error("{what} query failed: {detail}")]
    QueryFailed { what: &'static str, detail: String },

    /// An internal record list could not grow.
    #[error("cannot grow {what} to {requested} records")]
    AllocationFailed { what: &'static str, requested: usize },

    /// Bus command submission or verification failed.
    #[error("bus command failed (bus '{provider}'): {detail}")]
    CommandFailed { provider: String, detail: String },

    /// A deallocate/reallocate call failed.
    #[error("{op} failed at offset {offset} length {length}: {source}")]
    IoFailed {
        op: &'static str,
        offset: u64,
        length: u64,
        #[source]
        source: io::Error,
    },

    /// Counted and produced records disagree. Programming fault.
    #[error("internal inconsistency: {detail}")]
    Inconsistent { detail: String },
}

impl PmbbError {
    pub fn lookup(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::LookupFailed {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub fn query(what: &'static str, detail: impl Into<String>) -> Self {
        Self::QueryFailed {
            what,
            detail: detail.into(),
        }
    }

    pub fn command(provider: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::CommandFailed {
            provider: provider.into(),
            detail: detail.into(),
        }
    }

    /// Classify a failed `stat` of `path`.
    #[must_use]
    pub fn from_stat(path: impl Into<PathBuf>, err: &io::Error) -> Self {
        let path = path.into();
        if err.kind() == io::ErrorKind::NotFound {
            Self::NotFound { path }
        } else {
            Self::LookupFailed {
                path,
                detail: format!("stat: {err}"),
            }
        }
    }

    /// Closest `io::ErrorKind` for callers that report errno-style codes.
    #[must_use]
    pub fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::NotFound { .. } => io::ErrorKind::NotFound,
            Self::LookupFailed { .. } => io::ErrorKind::Unsupported,
            Self::BoundsUnavailable { .. } | Self::QueryFailed { .. } => io::ErrorKind::InvalidData,
            Self::AllocationFailed { .. } => io::ErrorKind::OutOfMemory,
            Self::CommandFailed { .. } | Self::Inconsistent { .. } => io::ErrorKind::Other,
            Self::IoFailed { source, .. } => source.kind(),
        }
    }
}

impl From<PmbbError> for io::Error {
    fn from(err: PmbbError) -> Self {
        match err {
            PmbbError::IoFailed { source, .. } => source,
            other => Self::new(other.io_kind(), other),
        }
    }
}

pub type Result<T> = std::result::Result<T, PmbbError>;
