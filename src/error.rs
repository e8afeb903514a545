//! Internal error types for the storage and index layers.
//!
//! These are not part of the public boundary: [`crate::storage::KvStorage`] and
//! [`crate::coordinator::CacheCoordinator`] collapse every `Result` here into a
//! plain `bool`/`Option` at the edge. Keeping typed errors internally means the
//! collapse point is the only place that has to decide what to log and what to
//! throw away.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("key must not be empty")]
    EmptyKey,
    #[error("value must not be empty")]
    EmptyValue,
    #[error("filename required for storage type File")]
    FilenameRequired,
    #[error("storage has entered the Failed state and rejects further operations")]
    Failed,
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
    #[error("index error: {source}")]
    Index {
        #[from]
        source: IndexError,
    },
    #[error("existing store at this path was created with a different storage type")]
    TypeMismatch,
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("sqlite error: {source}")]
    Sqlite {
        #[from]
        source: rusqlite::Error,
    },
    #[error("index schema is corrupted and could not be rebuilt")]
    Corrupted,
    #[error("existing store at this path was created with a different storage type")]
    TypeMismatch,
}

pub type IndexResult<T> = std::result::Result<T, IndexError>;
