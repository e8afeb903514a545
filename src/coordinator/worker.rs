//! The dedicated disk-I/O thread. `KvStorage`'s contract requires a single
//! serialized caller; rather than wrap it in a mutex, this gives it exactly
//! one owner, a background thread, and routes every operation through a
//! `flume` channel, the same channel crate used elsewhere in this crate for
//! handing work between threads, turned around so a single consumer drains a
//! queue instead of many consumers draining a pool.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::config::DiskCacheOptions;
use crate::item::{now_secs, Item, ItemInfo, StorageType};
use crate::storage::KvStorage;

pub(super) enum Command {
    Save {
        item: Item,
        reply: oneshot::Sender<bool>,
    },
    Get {
        key: String,
        reply: oneshot::Sender<Option<Item>>,
    },
    GetInfo {
        key: String,
        reply: oneshot::Sender<Option<ItemInfo>>,
    },
    Exists {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    Remove {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    RemoveBatch {
        keys: Vec<String>,
        reply: oneshot::Sender<bool>,
    },
    RemoveAll {
        reply: oneshot::Sender<bool>,
    },
    AllKeys {
        reply: oneshot::Sender<Vec<String>>,
    },
    Count {
        reply: oneshot::Sender<i64>,
    },
    TotalSize {
        reply: oneshot::Sender<i64>,
    },
}

/// Spawn the worker thread, moving an already-opened `storage` into it. The
/// caller is expected to have opened (and thus validated) the store itself,
/// so construction errors surface synchronously instead of in the background.
pub(super) fn spawn(
    mut storage: KvStorage,
    options: DiskCacheOptions,
    commands: flume::Receiver<Command>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        storage.set_error_logs_enabled(options.error_logs_enabled);
        let mut last_trim = Instant::now();

        loop {
            let elapsed = last_trim.elapsed();
            let wait = options.auto_trim_interval.saturating_sub(elapsed);
            let wait = if wait.is_zero() {
                Duration::from_millis(1)
            } else {
                wait
            };

            match commands.recv_timeout(wait) {
                Ok(cmd) => handle(&mut storage, cmd),
                Err(flume::RecvTimeoutError::Timeout) => {
                    run_periodic_trim(&mut storage, &options);
                    last_trim = Instant::now();
                }
                Err(flume::RecvTimeoutError::Disconnected) => return,
            }
        }
    })
}

fn handle(storage: &mut KvStorage, cmd: Command) {
    match cmd {
        Command::Save { item, reply } => {
            let _ = reply.send(storage.save(item));
        }
        Command::Get { key, reply } => {
            let _ = reply.send(storage.get(&key));
        }
        Command::GetInfo { key, reply } => {
            let _ = reply.send(storage.get_info(&key));
        }
        Command::Exists { key, reply } => {
            let _ = reply.send(storage.exists(&key));
        }
        Command::Remove { key, reply } => {
            let _ = reply.send(storage.remove(&key));
        }
        Command::RemoveBatch { keys, reply } => {
            let _ = reply.send(storage.remove_batch(&keys));
        }
        Command::RemoveAll { reply } => {
            let _ = reply.send(storage.remove_all());
        }
        Command::AllKeys { reply } => {
            let _ = reply.send(storage.all_keys());
        }
        Command::Count { reply } => {
            let _ = reply.send(storage.count());
        }
        Command::TotalSize { reply } => {
            let _ = reply.send(storage.total_size());
        }
    }
}

fn run_periodic_trim(storage: &mut KvStorage, options: &DiskCacheOptions) {
    if options.size_limit != u64::MAX {
        let _ = storage.remove_to_fit_size(saturating_i64(options.size_limit));
    }
    if options.count_limit != u64::MAX {
        let _ = storage.remove_to_fit_count(saturating_i64(options.count_limit));
    }
    if let Some(age) = options.age_limit {
        let cutoff = now_secs() - age.as_secs() as i64;
        let _ = storage.remove_earlier_than(cutoff);
    }
}

/// `u64::MAX` is the "unlimited" sentinel and is handled separately by the
/// caller; for any other value this just saturates instead of wrapping
/// negative the way a plain `as i64` cast would above `i64::MAX`.
fn saturating_i64(n: u64) -> i64 {
    n.try_into().unwrap_or(i64::MAX)
}

pub(super) fn open(path: PathBuf, storage_type: StorageType) -> crate::error::Result<KvStorage> {
    KvStorage::open(path, storage_type)
}
