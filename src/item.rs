//! The persisted record and the storage modes that govern where its value lives.

use std::time::{SystemTime, UNIX_EPOCH};

/// Where a [`KvStorage`](crate::storage::KvStorage) is permitted to put a value's bytes.
///
/// Fixed at directory creation; an existing store rejects being reopened with a
/// different type (see [`crate::error::StorageError::TypeMismatch`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StorageType {
    /// Every value must be external; saves without a filename are rejected.
    File,
    /// `filename` is ignored; every value is inlined in the index.
    Sqlite,
    /// Caller chooses per item via `filename`.
    Mixed,
}

/// A full persistent record, as returned by [`crate::storage::KvStorage::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub value: Vec<u8>,
    pub filename: Option<String>,
    pub size: i64,
    pub mod_time: i64,
    pub access_time: i64,
    pub extended_data: Option<Vec<u8>>,
}

impl Item {
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        let size = value.len() as i64;
        let now = now_secs();
        Self {
            key: key.into(),
            value,
            filename: None,
            size,
            mod_time: now,
            access_time: now,
            extended_data: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_extended_data(mut self, extended_data: Vec<u8>) -> Self {
        self.extended_data = Some(extended_data);
        self
    }
}

/// `Item` without `value`/`extended_data`, as returned by `get_info`. Fetching it
/// never touches `access_time`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    pub key: String,
    pub filename: Option<String>,
    pub size: i64,
    pub mod_time: i64,
    pub access_time: i64,
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Default filename for an externally-stored value: the hex-encoded MD5 of the key.
///
/// Gives a deterministic, filesystem-safe name without requiring the caller to
/// invent one.
pub fn default_filename(key: &str) -> String {
    use md_5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}
