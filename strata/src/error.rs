//! Error taxonomy shared by every storage component.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::lock_manager::LockResource;
use crate::wal::Lsn;
use crate::{FileId, PageId, TxnId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// I/O failure against a page file. Fatal for the affected file.
    #[error("storage fault in {path:?}: {source}")]
    StorageFault {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A B-tree page violated a structural invariant. The file stays unusable until rebuilt.
    #[error("index corruption in file {file} page {page}: {reason}")]
    IndexCorruption {
        file: FileId,
        page: PageId,
        reason: String,
    },

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("timed out waiting for {mode:?} lock on {resource}")]
    LockTimeout {
        resource: LockResource,
        mode: crate::lock_manager::LockMode,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("transaction failure: {0}")]
    Transaction(String),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error("key of {actual} bytes exceeds the maximum of {max}")]
    KeyTooLarge { max: usize, actual: usize },

    #[error("page cache exhausted: all {capacity} frames are pinned or unlogged")]
    CacheExhausted { capacity: usize },

    #[error("unknown file id {0}")]
    UnknownFile(FileId),

    #[error("database is in read-only mode")]
    ReadOnly,

    #[error("database is shut down")]
    Shutdown,

    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Journal append/read failures.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("journal I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("journal directory {0:?} is locked by another process")]
    Locked(PathBuf),

    #[error("bad journal header in {0:?}")]
    BadHeader(PathBuf),

    #[error("unknown loggable type tag {0:#04x}")]
    UnknownType(u8),

    #[error("malformed payload for loggable type {tag:#04x}")]
    MalformedPayload { tag: u8 },

    #[error("journal corrupted at {lsn} (before last checkpoint {checkpoint})")]
    Corrupted { lsn: Lsn, checkpoint: Lsn },

    #[error("no record at {0}")]
    NoRecord(Lsn),

    #[error("journal is closed")]
    Closed,

    #[error("journal is unusable after a failed write")]
    Failed,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("deadlock detected while owner {owner} waited for {resource}")]
    Deadlock { owner: u64, resource: LockResource },

    #[error("owner {owner} does not hold a {mode:?} lock on {resource}")]
    NotHeld {
        owner: u64,
        resource: LockResource,
        mode: crate::lock_manager::LockMode,
    },
}

/// Failures that keep the database from starting.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("loggable at {lsn} references missing page {page} of file {file}")]
    MissingPage { lsn: Lsn, file: FileId, page: PageId },

    #[error("loggable at {lsn} references unregistered file {file}")]
    MissingFile { lsn: Lsn, file: FileId },

    #[error("undo of transaction {txn} failed at {lsn}: {reason}")]
    UndoFailed { txn: TxnId, lsn: Lsn, reason: String },
}

impl Error {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::StorageFault {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corruption(file: FileId, page: PageId, reason: impl Into<String>) -> Self {
        Error::IndexCorruption {
            file,
            page,
            reason: reason.into(),
        }
    }

    /// True for faults that threaten the write-ahead invariant and must take the
    /// whole database out of read-write mode.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Log(_) | Error::Transaction(_) | Error::Recovery(_)
        )
    }

    /// True for faults the caller may retry after aborting its transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockTimeout { .. } | Error::Lock(_))
    }
}
