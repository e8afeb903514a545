#![deny(clippy::all)]
#![allow(clippy::too_many_arguments)]

//! A two-tier, crash-safe key-value cache: an in-memory LRU front end over a
//! SQLite-plus-external-blobs disk store, composed behind a single typed API
//! by [`coordinator::CacheCoordinator`].
//!
//! - [`memory::MemoryCache`] is the L1 tier: thread-safe, in-process, evicted
//!   by count, cost, and age.
//! - [`storage::KvStorage`] is the L2 tier: a relational index backed by
//!   SQLite plus a directory of blob files for values too large to inline,
//!   with LRU eviction and an async fast-wipe.
//! - [`coordinator::CacheCoordinator`] owns one of each, dispatches every
//!   disk operation to a dedicated worker thread, and exposes both a
//!   blocking and an `async` API.
//!
//! Most applications only need [`coordinator::CacheCoordinator`]; the tiers
//! are public so they can be used standalone (an in-memory-only cache with no
//! disk tier, or a disk store with an external eviction policy).

pub mod config;
pub mod coordinator;
pub mod error;
pub mod item;
pub mod memory;
pub mod storage;

pub use config::{CoordinatorOptions, DiskCacheOptions, MemoryCacheOptions};
pub use coordinator::{BytesCodec, CacheCoordinator, Codec, ConstructError};
pub use item::{Item, ItemInfo, StorageType};
