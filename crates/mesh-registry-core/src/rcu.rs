//! Double-buffered read-mostly map with deferred reclamation.
//!
//! Two maps back the structure: a read map served lock-free and a dirty map
//! behind a mutex. Reads that miss the read map consult the dirty map under
//! lock and bump a miss counter; once misses exceed the dirty map's size the
//! maps are swapped and the previous read map is queued for reclamation,
//! keyed by the swap timestamp. Reclamation deletes entries whose age
//! exceeds the configured grace window.
//!
//! `get` may briefly return a just-deleted value during the grace window;
//! consumers hold their own `Arc` so this is safe.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

struct Entry<V> {
    value: arc_swap::ArcSwapOption<V>,
    used_ms: AtomicU64,
}

impl<V> Entry<V> {
    fn new(value: Arc<V>, now_ms: u64) -> Self {
        Self {
            value: arc_swap::ArcSwapOption::new(Some(value)),
            used_ms: AtomicU64::new(now_ms),
        }
    }

    fn touch(&self, now_ms: u64) {
        self.used_ms.fetch_max(now_ms, Ordering::Relaxed);
    }
}

type ReadMap<K, V> = HashMap<K, Arc<Entry<V>>>;

struct Dirty<K, V> {
    map: HashMap<K, Arc<Entry<V>>>,
    /// Keys whose read-map entry was nulled by a delete; cleared on swap.
    deleted_keys: HashSet<K>,
    miss_count: usize,
    /// Old values awaiting the grace window, with their delete time.
    reclaim_values: VecDeque<(u64, Arc<V>)>,
    /// Swapped-out read maps awaiting the grace window.
    reclaim_maps: VecDeque<(u64, Arc<ReadMap<K, V>>)>,
}

/// `K → Arc<V>` map optimized for many readers and few writers.
pub struct RcuMap<K, V> {
    read: ArcSwap<ReadMap<K, V>>,
    dirty: Mutex<Dirty<K, V>>,
}

impl<K, V> Default for RcuMap<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> RcuMap<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            read: ArcSwap::from_pointee(HashMap::new()),
            dirty: Mutex::new(Dirty {
                map: HashMap::new(),
                deleted_keys: HashSet::new(),
                miss_count: 0,
                reclaim_values: VecDeque::new(),
                reclaim_maps: VecDeque::new(),
            }),
        }
    }

    /// Lock-free on the read-map fast path. A hit refreshes the entry's
    /// access time; a read-map miss consults the dirty map under lock.
    pub fn get(&self, key: &K, now_ms: u64) -> Option<Arc<V>> {
        let read = self.read.load();
        if let Some(entry) = read.get(key) {
            if let Some(value) = entry.value.load_full() {
                entry.touch(now_ms);
                return Some(value);
            }
            // Entry nulled by a delete; the dirty map is authoritative.
        }
        let mut dirty = self.dirty.lock();
        let found = dirty.map.get(key).cloned();
        match found {
            Some(entry) => {
                entry.touch(now_ms);
                let value = entry.value.load_full();
                dirty.miss_count += 1;
                Self::check_swap(&self.read, &mut dirty, now_ms);
                value
            }
            None => None,
        }
    }

    /// Inserts or replaces. The previous value, if any, is queued for
    /// reclamation rather than dropped immediately.
    pub fn update(&self, key: K, value: Arc<V>, now_ms: u64) {
        let mut dirty = self.dirty.lock();
        if let Some(entry) = dirty.map.get(&key) {
            let old = entry.value.swap(Some(value));
            entry.touch(now_ms);
            if let Some(old) = old {
                dirty.reclaim_values.push_back((now_ms, old));
            }
            return;
        }
        // Deleted-then-reinserted keys revive the shared read-map entry.
        let revived = self.read.load().get(&key).cloned();
        let entry = match revived {
            Some(entry) => {
                entry.value.store(Some(value));
                entry.touch(now_ms);
                dirty.deleted_keys.remove(&key);
                entry
            }
            None => Arc::new(Entry::new(value, now_ms)),
        };
        dirty.map.insert(key, entry);
    }

    /// Creates the value with `make` if absent, then returns the mapped
    /// value either way.
    pub fn upsert_with<F>(&self, key: K, now_ms: u64, make: F) -> Arc<V>
    where
        F: FnOnce() -> Arc<V>,
    {
        if let Some(existing) = self.get(&key, now_ms) {
            return existing;
        }
        let mut dirty = self.dirty.lock();
        if let Some(entry) = dirty.map.get(&key) {
            if let Some(value) = entry.value.load_full() {
                entry.touch(now_ms);
                return value;
            }
        }
        let value = make();
        let entry = Arc::new(Entry::new(value.clone(), now_ms));
        dirty.map.insert(key, entry);
        value
    }

    /// Removes the key; the value is queued for reclamation.
    pub fn remove(&self, key: &K, now_ms: u64) {
        let mut dirty = self.dirty.lock();
        let Some(entry) = dirty.map.remove(key) else {
            return;
        };
        if let Some(old) = entry.value.swap(None) {
            dirty.reclaim_values.push_back((now_ms, old));
        }
        if self.read.load().contains_key(key) {
            // The shared entry stays visible in the read map with a nulled
            // value until the next swap.
            dirty.deleted_keys.insert(key.clone());
        }
    }

    fn check_swap(read: &ArcSwap<ReadMap<K, V>>, dirty: &mut Dirty<K, V>, now_ms: u64) {
        if dirty.miss_count < dirty.map.len() {
            return;
        }
        let new_read = Arc::new(dirty.map.clone());
        let old_read = read.swap(new_read);
        dirty.reclaim_maps.push_back((now_ms, old_read));
        dirty.deleted_keys.clear();
        dirty.miss_count = 0;
    }

    /// Drops reclamation-pending values and maps older than
    /// `min_delete_ms`. Runs on the scheduler.
    pub fn check_gc(&self, min_delete_ms: u64) {
        let mut reclaimed = Vec::new();
        {
            let mut dirty = self.dirty.lock();
            while dirty
                .reclaim_values
                .front()
                .is_some_and(|(deleted_ms, _)| *deleted_ms < min_delete_ms)
            {
                if let Some((_, value)) = dirty.reclaim_values.pop_front() {
                    reclaimed.push(ReclaimItem::Value(value));
                }
            }
            while dirty
                .reclaim_maps
                .front()
                .is_some_and(|(swapped_ms, _)| *swapped_ms < min_delete_ms)
            {
                if let Some((_, map)) = dirty.reclaim_maps.pop_front() {
                    reclaimed.push(ReclaimItem::Map(map));
                }
            }
        }
        // Dropped outside the lock.
        drop(reclaimed);
    }

    /// Keys whose last access is at or before `min_access_ms`; candidates
    /// for expiry by the cache GC.
    pub fn expired_keys(&self, min_access_ms: u64) -> Vec<K> {
        let dirty = self.dirty.lock();
        dirty
            .map
            .iter()
            .filter(|(_, entry)| entry.used_ms.load(Ordering::Relaxed) <= min_access_ms)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Snapshot of all live values.
    pub fn values(&self) -> Vec<Arc<V>> {
        let dirty = self.dirty.lock();
        dirty
            .map
            .values()
            .filter_map(|entry| entry.value.load_full())
            .collect()
    }

    /// Snapshot of all live keys.
    pub fn keys(&self) -> Vec<K> {
        let dirty = self.dirty.lock();
        dirty.map.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.dirty.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum ReclaimItem<K, V> {
    Value(Arc<V>),
    Map(Arc<ReadMap<K, V>>),
}
