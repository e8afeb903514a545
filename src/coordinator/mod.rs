//! Composes the in-memory front end ([`crate::memory::MemoryCache`]) with the
//! persistent back end ([`crate::storage::KvStorage`]) behind one typed API.
//! Every disk operation is dispatched to a single background worker thread
//! that owns the `KvStorage`; callers never touch it directly, so its
//! `&mut self` contract is upheld without a lock.
//!
//! Both a blocking and an `async` surface are exposed for every operation
//! that can miss the memory tier. Both send the same command and just differ
//! in how they wait for the reply: [`tokio::sync::oneshot::Receiver::blocking_recv`]
//! versus `.await`.

mod codec;
mod worker;

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;

pub use codec::{BytesCodec, Codec};

use crate::config::CoordinatorOptions;
use crate::item::{default_filename, Item, ItemInfo, StorageType};
use crate::memory::MemoryCache;
use worker::Command;

/// Failure constructing a [`CacheCoordinator`]. Mirrors the two construction
/// errors `KvStorage` can raise, plus the one unique to name-based opening.
#[derive(Error, Debug)]
pub enum ConstructError {
    #[error("no platform cache directory is available for this host")]
    InvalidPath,
    #[error("existing store at this path was created with a different storage type")]
    TypeMismatch,
    #[error("failed to open store: {0}")]
    Open(String),
}

/// A two-tier cache: an in-memory LRU in front of a crash-safe disk store,
/// addressed by string keys and holding values of type `V` via codec `C`.
///
/// Cheap to clone; every clone shares the same memory tier and the same
/// worker thread.
pub struct CacheCoordinator<V, C> {
    memory: MemoryCache<V>,
    commands: flume::Sender<Command>,
    codec: Arc<C>,
    storage_type: StorageType,
    inline_threshold: u64,
}

impl<V, C> Clone for CacheCoordinator<V, C> {
    fn clone(&self) -> Self {
        Self {
            memory: self.memory.clone(),
            commands: self.commands.clone(),
            codec: self.codec.clone(),
            storage_type: self.storage_type,
            inline_threshold: self.inline_threshold,
        }
    }
}

impl<V, C> CacheCoordinator<V, C>
where
    V: Clone + Send + Sync + 'static,
    C: Codec<V>,
{
    /// Open (or create) a cache rooted at `path`.
    pub fn open_at_path(
        path: impl AsRef<Path>,
        storage_type: StorageType,
        codec: C,
        options: CoordinatorOptions,
    ) -> Result<Self, ConstructError> {
        let storage = worker::open(path.as_ref().to_path_buf(), storage_type).map_err(|e| {
            match e {
                crate::error::StorageError::TypeMismatch => ConstructError::TypeMismatch,
                other => ConstructError::Open(other.to_string()),
            }
        })?;

        let (tx, rx) = flume::unbounded();
        worker::spawn(storage, options.disk, rx);

        Ok(Self {
            memory: MemoryCache::new(options.memory),
            commands: tx,
            codec: Arc::new(codec),
            storage_type,
            inline_threshold: options.disk.inline_threshold,
        })
    }

    /// Open (or create) a cache named `name` under the platform cache
    /// directory (`~/.cache/<name>` on Linux, etc., via the `dirs` crate).
    pub fn open_named(
        name: &str,
        storage_type: StorageType,
        codec: C,
        options: CoordinatorOptions,
    ) -> Result<Self, ConstructError> {
        let base = dirs::cache_dir().ok_or(ConstructError::InvalidPath)?;
        Self::open_at_path(base.join(name), storage_type, codec, options)
    }

    fn send<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> oneshot::Receiver<T> {
        let (reply, receiver) = oneshot::channel();
        // Disconnection only happens if the worker thread has already exited
        // (e.g. it failed to reopen storage after a fast wipe); the receiver
        // then yields `RecvError`, which every call site below maps to a miss
        // or a `false`, matching how `KvStorage` itself degrades once failed.
        let _ = self.commands.send(build(reply));
        receiver
    }

    fn item_for(&self, key: &str, value: &V) -> Item {
        let bytes = self.codec.encode(value);
        let mut item = Item::new(key, bytes);
        let needs_filename = self.storage_type == StorageType::File
            || item.size as u64 > self.inline_threshold;
        if needs_filename {
            item = item.with_filename(default_filename(key));
        }
        item
    }

    /// Look up `key`, checking the memory tier first and falling back to disk.
    /// A disk hit is promoted back into memory before returning.
    pub fn get(&self, key: &str) -> Option<V> {
        if let Some(value) = self.memory.get(key) {
            return Some(value);
        }
        let receiver = self.send(|reply| Command::Get {
            key: key.to_string(),
            reply,
        });
        let item = receiver.blocking_recv().ok().flatten()?;
        self.promote(key, item)
    }

    pub async fn get_async(&self, key: &str) -> Option<V> {
        if let Some(value) = self.memory.get(key) {
            return Some(value);
        }
        let receiver = self.send(|reply| Command::Get {
            key: key.to_string(),
            reply,
        });
        let item = receiver.await.ok().flatten()?;
        self.promote(key, item)
    }

    fn promote(&self, key: &str, item: Item) -> Option<V> {
        let value = self.codec.decode(&item.value)?;
        self.memory.set(key, value.clone(), item.size.max(0) as u64);
        Some(value)
    }

    /// Metadata for `key` without fetching or decoding the value, and
    /// without touching `access_time`.
    pub fn get_info(&self, key: &str) -> Option<ItemInfo> {
        let receiver = self.send(|reply| Command::GetInfo {
            key: key.to_string(),
            reply,
        });
        receiver.blocking_recv().ok().flatten()
    }

    pub async fn get_info_async(&self, key: &str) -> Option<ItemInfo> {
        let receiver = self.send(|reply| Command::GetInfo {
            key: key.to_string(),
            reply,
        });
        receiver.await.ok().flatten()
    }

    /// Save `value` under `key` in both tiers. Values larger than the
    /// configured inline threshold are routed to an external blob on disk;
    /// smaller ones are inlined in the index.
    pub fn set(&self, key: impl Into<String>, value: V) -> bool {
        let key = key.into();
        let item = self.item_for(&key, &value);
        let cost = item.size.max(0) as u64;
        self.memory.set(key, value, cost);
        let receiver = self.send(|reply| Command::Save { item, reply });
        receiver.blocking_recv().unwrap_or(false)
    }

    pub async fn set_async(&self, key: impl Into<String>, value: V) -> bool {
        let key = key.into();
        let item = self.item_for(&key, &value);
        let cost = item.size.max(0) as u64;
        self.memory.set(key, value, cost);
        let receiver = self.send(|reply| Command::Save { item, reply });
        receiver.await.unwrap_or(false)
    }

    pub fn contains(&self, key: &str) -> bool {
        if self.memory.contains(key) {
            return true;
        }
        let receiver = self.send(|reply| Command::Exists {
            key: key.to_string(),
            reply,
        });
        receiver.blocking_recv().unwrap_or(false)
    }

    pub async fn contains_async(&self, key: &str) -> bool {
        if self.memory.contains(key) {
            return true;
        }
        let receiver = self.send(|reply| Command::Exists {
            key: key.to_string(),
            reply,
        });
        receiver.await.unwrap_or(false)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.memory.remove(key);
        let receiver = self.send(|reply| Command::Remove {
            key: key.to_string(),
            reply,
        });
        receiver.blocking_recv().unwrap_or(false)
    }

    pub async fn remove_async(&self, key: &str) -> bool {
        self.memory.remove(key);
        let receiver = self.send(|reply| Command::Remove {
            key: key.to_string(),
            reply,
        });
        receiver.await.unwrap_or(false)
    }

    pub fn remove_batch(&self, keys: &[String]) -> bool {
        for key in keys {
            self.memory.remove(key);
        }
        let receiver = self.send(|reply| Command::RemoveBatch {
            keys: keys.to_vec(),
            reply,
        });
        receiver.blocking_recv().unwrap_or(false)
    }

    pub async fn remove_batch_async(&self, keys: &[String]) -> bool {
        for key in keys {
            self.memory.remove(key);
        }
        let receiver = self.send(|reply| Command::RemoveBatch {
            keys: keys.to_vec(),
            reply,
        });
        receiver.await.unwrap_or(false)
    }

    /// Fast wipe of both tiers.
    pub fn remove_all(&self) -> bool {
        self.memory.remove_all();
        let receiver = self.send(|reply| Command::RemoveAll { reply });
        receiver.blocking_recv().unwrap_or(false)
    }

    pub async fn remove_all_async(&self) -> bool {
        self.memory.remove_all();
        let receiver = self.send(|reply| Command::RemoveAll { reply });
        receiver.await.unwrap_or(false)
    }

    /// Slow, observable wipe: fetches every key, then removes them in chunks
    /// from the calling thread, reporting progress after each chunk and a
    /// final completion flag. Unlike the other operations this iterates on
    /// the caller, not the worker, so the callbacks never have to cross
    /// threads.
    pub fn remove_all_with_progress(
        &self,
        mut progress: impl FnMut(usize, usize),
        end: impl FnOnce(bool),
    ) {
        const CHUNK: usize = 32;

        let receiver = self.send(|reply| Command::AllKeys { reply });
        let keys = receiver.blocking_recv().unwrap_or_default();
        let total = keys.len();
        let mut removed = 0;
        for chunk in keys.chunks(CHUNK) {
            if !self.remove_batch(chunk) {
                end(true);
                return;
            }
            removed += chunk.len();
            progress(removed, total);
        }
        end(false);
    }

    pub fn count(&self) -> i64 {
        let receiver = self.send(|reply| Command::Count { reply });
        receiver.blocking_recv().unwrap_or(-1)
    }

    pub async fn count_async(&self) -> i64 {
        let receiver = self.send(|reply| Command::Count { reply });
        receiver.await.unwrap_or(-1)
    }

    pub fn total_size(&self) -> i64 {
        let receiver = self.send(|reply| Command::TotalSize { reply });
        receiver.blocking_recv().unwrap_or(-1)
    }

    pub async fn total_size_async(&self) -> i64 {
        let receiver = self.send(|reply| Command::TotalSize { reply });
        receiver.await.unwrap_or(-1)
    }

    /// Advisory hook; see [`crate::memory::MemoryCache::on_low_memory`].
    pub fn on_low_memory(&self) {
        self.memory.on_low_memory();
    }

    /// Advisory hook; see [`crate::memory::MemoryCache::on_backgrounded`].
    pub fn on_backgrounded(&self) {
        self.memory.on_backgrounded();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::CoordinatorOptions;

    fn open_tmp() -> (CacheCoordinator<Vec<u8>, BytesCodec>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut options = CoordinatorOptions::default();
        options.disk.auto_trim_interval = std::time::Duration::from_secs(3600);
        let coordinator = CacheCoordinator::open_at_path(
            dir.path(),
            StorageType::Mixed,
            BytesCodec,
            options,
        )
        .unwrap();
        (coordinator, dir)
    }

    #[test]
    fn set_then_get_hits_memory_without_touching_disk_path() {
        let (cache, _dir) = open_tmp();
        assert!(cache.set("a", vec![1, 2, 3]));
        assert_eq!(cache.get("a"), Some(vec![1, 2, 3]));
        assert!(cache.contains("a"));
    }

    #[test]
    fn get_after_memory_eviction_still_finds_it_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = CoordinatorOptions::default();
        options.memory.count_limit = 1;
        options.disk.auto_trim_interval = std::time::Duration::from_secs(3600);
        let cache = CacheCoordinator::open_at_path(
            dir.path(),
            StorageType::Mixed,
            BytesCodec,
            options,
        )
        .unwrap();

        assert!(cache.set("a", vec![1]));
        assert!(cache.set("b", vec![2])); // evicts "a" from memory, not disk

        assert_eq!(cache.get("a"), Some(vec![1]));
    }

    #[test]
    fn file_store_persists_small_values_with_a_filename() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = CoordinatorOptions::default();
        options.disk.auto_trim_interval = std::time::Duration::from_secs(3600);
        let cache = CacheCoordinator::open_at_path(
            dir.path(),
            StorageType::File,
            BytesCodec,
            options,
        )
        .unwrap();

        assert!(cache.set("a", vec![1, 2, 3]));
        assert!(cache.get_info("a").unwrap().filename.is_some());

        // reopen fresh so the read can only be satisfied from disk
        drop(cache);
        let reopened = CacheCoordinator::open_at_path(
            dir.path(),
            StorageType::File,
            BytesCodec,
            CoordinatorOptions::default(),
        )
        .unwrap();
        assert_eq!(reopened.get("a"), Some(vec![1, 2, 3]));
    }

    #[test]
    fn remove_clears_both_tiers() {
        let (cache, _dir) = open_tmp();
        cache.set("a", vec![1]);
        assert!(cache.remove("a"));
        assert!(!cache.contains("a"));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn remove_all_with_progress_reports_completion() {
        let (cache, _dir) = open_tmp();
        for i in 0..10 {
            cache.set(format!("k{i}"), vec![i as u8]);
        }
        let mut last = (0, 0);
        let mut errored = true;
        cache.remove_all_with_progress(
            |done, total| last = (done, total),
            |e| errored = e,
        );
        assert_eq!(last, (10, 10));
        assert!(!errored);
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn type_mismatch_on_reopen_surfaces_as_construct_error() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _c = CacheCoordinator::open_at_path(
                dir.path(),
                StorageType::Mixed,
                BytesCodec,
                CoordinatorOptions::default(),
            )
            .unwrap();
        }
        let reopened = CacheCoordinator::open_at_path(
            dir.path(),
            StorageType::Sqlite,
            BytesCodec,
            CoordinatorOptions::default(),
        );
        assert!(matches!(reopened, Err(ConstructError::TypeMismatch)));
    }

    #[tokio::test]
    async fn async_surface_round_trips() {
        let (cache, _dir) = open_tmp();
        assert!(cache.set_async("a", vec![9, 9]).await);
        assert_eq!(cache.get_async("a").await, Some(vec![9, 9]));
        assert!(cache.contains_async("a").await);
        assert!(cache.remove_async("a").await);
        assert_eq!(cache.get_async("a").await, None);
    }
}
