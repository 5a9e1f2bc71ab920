use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Error raised by transaction log operations.
///
/// Expected absence (a log file that does not exist yet, a rotated segment
/// that was already purged) is not an error: operations which can encounter
/// it return an `Option` or [`crate::OpenOutcome`] instead.
#[derive(Debug, Error)]
pub enum Error {
    /// A syscall failed. Transient; the operation may be retried.
    #[error("{}: {syscall}() failed: {source}", .path.display())]
    Io {
        path: PathBuf,
        syscall: &'static str,
        #[source]
        source: io::Error,
    },

    /// Header validation failed. The file stays unusable until repaired.
    #[error("{}: corrupt transaction log: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// The bounded wait for the whole-file lock expired.
    #[error("{}: timed out waiting for transaction log lock", .path.display())]
    LockTimeout { path: PathBuf },
}

impl Error {
    pub(crate) fn io(path: &Path, syscall: &'static str, source: io::Error) -> Self {
        Self::Io {
            path: path.to_owned(),
            syscall,
            source,
        }
    }

    pub(crate) fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.to_owned(),
            reason: reason.into(),
        }
    }

    /// `true` if the underlying failure was an absent file.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
