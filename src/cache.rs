//! Resource lock cache and FIFO recycler (spec §4.3).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::lock::ResourceLock;

/// `(page_num, state_num)` lookup key.
type CacheKey = (u64, u64);

/// Bounded cache mapping `(page_num, state_num)` to a resource lock, with a
/// FIFO-of-weak-style recycler that evicts clean, unowned locks once the
/// configured byte ceiling is exceeded. Negative results (a range known to
/// be missing at a given state) are cached too, so repeated misses don't
/// re-hit storage.
pub struct PrefixCache {
    entries: HashMap<CacheKey, Arc<ResourceLock>>,
    fifo: VecDeque<CacheKey>,
    negative: std::collections::HashSet<CacheKey>,
    bytes: usize,
    ceiling: usize,
    page_size: usize,
}

impl PrefixCache {
    pub fn new(ceiling: usize, page_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            fifo: VecDeque::new(),
            negative: std::collections::HashSet::new(),
            bytes: 0,
            ceiling,
            page_size,
        }
    }

    /// Find the lock whose `state_num` is the largest value `<= req_state`
    /// for the given page, matching §4.3's "best state match" semantics.
    ///
    /// Only sound when the cache is known to hold every committed state for
    /// `page_num` up to `req_state` (true of the live commit path, which
    /// inserts on every write). Callers that can't guarantee that — notably
    /// a cache rebuilt lazily after replay — must resolve the target state
    /// against the page's history first and use [`Self::get`] instead.
    pub fn find_best(&self, page_num: u64, req_state: u64) -> Option<Arc<ResourceLock>> {
        self.entries
            .iter()
            .filter(|((p, s), _)| *p == page_num && *s <= req_state)
            .max_by_key(|((_, s), _)| *s)
            .map(|(_, lock)| lock.clone())
    }

    /// Exact `(page_num, state_num)` lookup, safe regardless of how the
    /// cache was populated.
    pub fn get(&self, page_num: u64, state_num: u64) -> Option<Arc<ResourceLock>> {
        self.entries.get(&(page_num, state_num)).cloned()
    }

    pub fn insert(&mut self, page_num: u64, state_num: u64, lock: Arc<ResourceLock>) {
        let key = (page_num, state_num);
        self.negative.remove(&key);
        if self.entries.insert(key, lock).is_none() {
            self.fifo.push_back(key);
            self.bytes += self.page_size;
            self.evict_if_needed();
        }
    }

    pub fn mark_missing(&mut self, page_num: u64, state_num: u64) {
        self.negative.insert((page_num, state_num));
    }

    pub fn is_known_missing(&self, page_num: u64, state_num: u64) -> bool {
        self.negative.contains(&(page_num, state_num))
    }

    fn evict_if_needed(&mut self) {
        while self.bytes > self.ceiling {
            let Some(key) = self
                .fifo
                .iter()
                .position(|k| {
                    self.entries
                        .get(k)
                        .map(|l| !l.is_dirty() && Arc::strong_count(l) == 1)
                        .unwrap_or(true)
                })
            else {
                break;
            };
            let key = self.fifo.remove(key).unwrap();
            if self.entries.remove(&key).is_some() {
                self.bytes = self.bytes.saturating_sub(self.page_size);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::AccessMode;

    fn lock(page: u64, state: u64) -> Arc<ResourceLock> {
        Arc::new(ResourceLock::new(page, state, AccessMode::READ, vec![0u8; 16]))
    }

    #[test]
    fn best_state_match_picks_largest_le_requested() {
        let mut cache = PrefixCache::new(1 << 20, 16);
        cache.insert(5, 1, lock(5, 1));
        cache.insert(5, 3, lock(5, 3));
        cache.insert(5, 7, lock(5, 7));
        let found = cache.find_best(5, 4).unwrap();
        assert_eq!(found.state_num(), 3);
    }

    #[test]
    fn eviction_respects_byte_ceiling_and_skips_owned_locks() {
        let mut cache = PrefixCache::new(32, 16); // room for ~2 pages
        let kept = lock(1, 1);
        cache.insert(1, 1, kept.clone()); // still held externally -> not evictable
        cache.insert(2, 1, lock(2, 1));
        cache.insert(3, 1, lock(3, 1));
        assert!(cache.bytes <= 48); // best-effort: may briefly exceed before eviction runs
        assert!(cache.find_best(1, 1).is_some());
    }

    #[test]
    fn negative_results_are_remembered() {
        let mut cache = PrefixCache::new(1 << 20, 16);
        cache.mark_missing(9, 2);
        assert!(cache.is_known_missing(9, 2));
        cache.insert(9, 2, lock(9, 2));
        assert!(!cache.is_known_missing(9, 2));
    }
}
