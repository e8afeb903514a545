//! The in-memory front end: a thread-safe LRU map with three independent
//! eviction limits (count, cost, age) enforced by a background thread, plus
//! manual `trim_to_*` escape hatches.
//!
//! A single [`parking_lot::Mutex`] guards the map and its recency order.
//! Ordering itself is delegated to [`lru::LruCache`] rather than a
//! hand-rolled intrusive list: the crate already gives us O(1) promote/evict,
//! and reimplementing it would just be the same data structure with extra
//! steps.

use std::sync::{Arc, Weak};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::MemoryCacheOptions;
use crate::item::now_secs;

struct Entry<V> {
    value: V,
    cost: u64,
    last_access: i64,
}

struct Inner<V> {
    map: LruCache<String, Entry<V>>,
    total_cost: u64,
}

/// A thread-safe, in-process LRU cache. Cloning is cheap and shares the
/// underlying map: every clone is a handle onto the same data, the way a
/// connection pool handle is a handle onto the same pool.
pub struct MemoryCache<V> {
    inner: Arc<Mutex<Inner<V>>>,
    options: MemoryCacheOptions,
}

impl<V> Clone for MemoryCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            options: self.options.clone(),
        }
    }
}

impl<V> MemoryCache<V>
where
    V: Clone + Send + 'static,
{
    pub fn new(options: MemoryCacheOptions) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            map: LruCache::unbounded(),
            total_cost: 0,
        }));

        let cache = Self { inner, options };
        cache.spawn_trim_thread();
        cache
    }

    fn spawn_trim_thread(&self) {
        let weak: Weak<Mutex<Inner<V>>> = Arc::downgrade(&self.inner);
        let interval = self.options.auto_trim_interval;
        let count_limit = self.options.count_limit;
        let cost_limit = self.options.cost_limit;
        let age_limit = self.options.age_limit;

        std::thread::spawn(move || loop {
            std::thread::sleep(interval);
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let victims = trim_locked(&inner, count_limit, cost_limit, age_limit);
            drop(victims);
        });
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().map.contains(key)
    }

    /// Fetch a value, promoting it to most-recently-used. Refreshes the
    /// entry's age so it survives the next age-based trim.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let now = now_secs();
        let entry = inner.map.get_mut(key)?;
        entry.last_access = now;
        Some(entry.value.clone())
    }

    /// Insert or replace a value with an associated cost (e.g. byte size),
    /// then immediately enforce the configured limits.
    pub fn set(&self, key: impl Into<String>, value: V, cost: u64) {
        let key = key.into();
        let now = now_secs();
        {
            let mut inner = self.inner.lock();
            if let Some(old) = inner.map.put(
                key,
                Entry {
                    value,
                    cost,
                    last_access: now,
                },
            ) {
                inner.total_cost = inner.total_cost.saturating_sub(old.cost);
            }
            inner.total_cost += cost;
        }
        let victims = trim_locked(
            &self.inner,
            self.options.count_limit,
            self.options.cost_limit,
            self.options.age_limit,
        );
        drop(victims);
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let entry = inner.map.pop(key)?;
        inner.total_cost = inner.total_cost.saturating_sub(entry.cost);
        Some(entry.value)
    }

    pub fn remove_all(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.total_cost = 0;
    }

    pub fn count(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn total_cost(&self) -> u64 {
        self.inner.lock().total_cost
    }

    /// Evict oldest-first until at most `n` entries remain, regardless of
    /// the configured `count_limit`.
    pub fn trim_to_count(&self, n: usize) {
        let victims = pop_while(&self.inner, |inner| inner.map.len() > n);
        drop(victims);
    }

    /// Evict oldest-first until total cost is at most `cost`, regardless of
    /// the configured `cost_limit`.
    pub fn trim_to_cost(&self, cost: u64) {
        let victims = pop_while(&self.inner, |inner| inner.total_cost > cost);
        drop(victims);
    }

    /// Evict every entry whose `last_access` is older than `age`, regardless
    /// of the configured `age_limit`.
    pub fn trim_to_age(&self, age: Duration) {
        let cutoff = now_secs() - age.as_secs() as i64;
        let victims = pop_while(&self.inner, |inner| {
            matches!(inner.map.peek_lru(), Some((_, e)) if e.last_access < cutoff)
        });
        drop(victims);
    }

    /// Advisory hook: call from a host's low-memory callback. Only acts if
    /// `evict_on_low_memory` is set in the options this cache was built with.
    pub fn on_low_memory(&self) {
        if self.options.evict_on_low_memory {
            self.remove_all();
        }
    }

    /// Advisory hook: call from a host's backgrounding callback. Only acts if
    /// `evict_on_backgrounded` is set in the options this cache was built with.
    pub fn on_backgrounded(&self) {
        if self.options.evict_on_backgrounded {
            self.remove_all();
        }
    }
}

/// Pop entries from the back of the LRU while `should_continue` holds,
/// collecting them under the lock then returning them so the caller drops
/// (and so destroys) them only after releasing it.
fn pop_while<V>(
    inner: &Arc<Mutex<Inner<V>>>,
    should_continue: impl Fn(&Inner<V>) -> bool,
) -> Vec<Entry<V>> {
    let mut guard = inner.lock();
    let mut victims = Vec::new();
    while should_continue(&guard) {
        let Some((_, entry)) = guard.map.pop_lru() else {
            break;
        };
        guard.total_cost = guard.total_cost.saturating_sub(entry.cost);
        victims.push(entry);
    }
    victims
}

fn trim_locked<V>(
    inner: &Arc<Mutex<Inner<V>>>,
    count_limit: usize,
    cost_limit: u64,
    age_limit: Option<Duration>,
) -> Vec<Entry<V>> {
    let mut victims = Vec::new();
    if let Some(age_limit) = age_limit {
        let cutoff = now_secs() - age_limit.as_secs() as i64;
        victims.extend(pop_while(inner, |inner| {
            matches!(inner.map.peek_lru(), Some((_, e)) if e.last_access < cutoff)
        }));
    }
    victims.extend(pop_while(inner, |inner| inner.map.len() > count_limit));
    victims.extend(pop_while(inner, |inner| inner.total_cost > cost_limit));
    victims
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn opts() -> MemoryCacheOptions {
        MemoryCacheOptions {
            count_limit: usize::MAX,
            cost_limit: u64::MAX,
            age_limit: None,
            auto_trim_interval: Duration::from_secs(3600),
            evict_on_low_memory: false,
            evict_on_backgrounded: false,
        }
    }

    #[test]
    fn set_then_get_round_trips() {
        let cache: MemoryCache<Vec<u8>> = MemoryCache::new(opts());
        cache.set("a", vec![1, 2, 3], 3);
        assert_eq!(cache.get("a"), Some(vec![1, 2, 3]));
        assert!(cache.contains("a"));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn count_limit_evicts_least_recently_used() {
        let mut o = opts();
        o.count_limit = 2;
        let cache: MemoryCache<i32> = MemoryCache::new(o);

        cache.set("a", 1, 1);
        cache.set("b", 2, 1);
        assert!(cache.get("a").is_some()); // promote a over b
        cache.set("c", 3, 1); // should evict b, the LRU entry

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.count(), 2);
    }

    #[test]
    fn cost_limit_evicts_until_under_budget() {
        let mut o = opts();
        o.cost_limit = 10;
        let cache: MemoryCache<i32> = MemoryCache::new(o);

        cache.set("a", 1, 6);
        cache.set("b", 2, 6);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.total_cost() <= 10);
    }

    #[test]
    fn overwrite_replaces_cost_not_adds_to_it() {
        let cache: MemoryCache<i32> = MemoryCache::new(opts());
        cache.set("a", 1, 5);
        cache.set("a", 2, 8);
        assert_eq!(cache.total_cost(), 8);
        assert_eq!(cache.get("a"), Some(2));
    }

    #[test]
    fn remove_and_remove_all() {
        let cache: MemoryCache<i32> = MemoryCache::new(opts());
        cache.set("a", 1, 1);
        cache.set("b", 2, 1);
        assert_eq!(cache.remove("a"), Some(1));
        assert!(!cache.contains("a"));
        cache.remove_all();
        assert_eq!(cache.count(), 0);
        assert_eq!(cache.total_cost(), 0);
    }

    #[test]
    fn manual_trim_to_count_ignores_configured_limit() {
        let cache: MemoryCache<i32> = MemoryCache::new(opts()); // no configured limit
        for i in 0..5 {
            cache.set(format!("k{i}"), i, 1);
        }
        cache.trim_to_count(2);
        assert_eq!(cache.count(), 2);
    }

    #[test]
    fn manual_trim_to_age_evicts_stale_entries() {
        let cache: MemoryCache<i32> = MemoryCache::new(opts());
        cache.set("old", 1, 1);
        std::thread::sleep(Duration::from_millis(1100));
        cache.set("new", 2, 1);

        cache.trim_to_age(Duration::from_secs(1));
        assert!(!cache.contains("old"));
        assert!(cache.contains("new"));
    }

    #[test]
    fn on_low_memory_is_noop_when_disabled() {
        let cache: MemoryCache<i32> = MemoryCache::new(opts());
        cache.set("a", 1, 1);
        cache.on_low_memory();
        assert!(cache.contains("a"));
    }

    #[test]
    fn on_low_memory_clears_when_enabled() {
        let mut o = opts();
        o.evict_on_low_memory = true;
        let cache: MemoryCache<i32> = MemoryCache::new(o);
        cache.set("a", 1, 1);
        cache.on_low_memory();
        assert!(!cache.contains("a"));
    }
}
