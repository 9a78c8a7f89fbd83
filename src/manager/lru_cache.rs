//! LRU cache of tracked buffers.
//!
//! The recency list is a `VecDeque` with the most recently used id at the
//! front; moving an entry to the front is a linear scan, which stays cheap
//! at the bounded capacities the manager allows.
//!
//! The cache never pins anything itself. Entries pushed out by
//! [`insert`](LruCache::insert), [`set_capacity`](LruCache::set_capacity),
//! [`erase`](LruCache::erase) and [`remove_last`](LruCache::remove_last) are
//! handed back so the caller can pin them once the cache lock is released.

use std::collections::{HashMap, VecDeque};

use crate::common::config::{DEFAULT_LRU_CACHE_CAPACITY, MAX_LRU_CACHE_CAPACITY, MIN_LRU_CACHE_CAPACITY};
use crate::common::{BufferId, Error, Result};

use super::resource::ResourceHandle;

pub struct LruCache {
    capacity: usize,
    /// Recency order, most recent first.
    order: VecDeque<BufferId>,
    /// Handles by id for O(1) membership.
    entries: HashMap<BufferId, ResourceHandle>,
}

impl LruCache {
    /// Create a cache holding at most `capacity` buffers.
    pub fn new(capacity: usize) -> Result<Self> {
        validate_capacity(capacity)?;
        Ok(Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(64)),
            entries: HashMap::new(),
        })
    }

    /// Move `id` to the most recently used position. No-op if absent.
    pub fn visited(&mut self, id: BufferId) {
        if self.entries.contains_key(&id) {
            self.move_to_front(id);
        }
    }

    /// Track `handle` as most recently used.
    ///
    /// Re-inserting a tracked buffer only refreshes its position. Returns
    /// the least recently used entry if the insert pushed the cache over
    /// capacity.
    pub fn insert(&mut self, handle: ResourceHandle) -> Option<ResourceHandle> {
        let id = handle.id();
        if self.entries.contains_key(&id) {
            self.move_to_front(id);
            return None;
        }
        self.order.push_front(id);
        self.entries.insert(id, handle);
        if self.entries.len() > self.capacity {
            return self.remove_last();
        }
        None
    }

    /// Stop tracking `id`, returning its handle if it was tracked.
    pub fn erase(&mut self, id: BufferId) -> Option<ResourceHandle> {
        let handle = self.entries.remove(&id)?;
        if let Some(pos) = self.order.iter().position(|&x| x == id) {
            self.order.remove(pos);
        }
        Some(handle)
    }

    /// Drop the least recently used entry.
    pub fn remove_last(&mut self) -> Option<ResourceHandle> {
        let id = self.order.pop_back()?;
        self.entries.remove(&id)
    }

    /// Change the capacity, trimming from the tail until it holds.
    ///
    /// Out-of-range capacities are rejected and leave the cache untouched.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<Vec<ResourceHandle>> {
        validate_capacity(capacity)?;
        self.capacity = capacity;
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            match self.remove_last() {
                Some(handle) => evicted.push(handle),
                None => break,
            }
        }
        Ok(evicted)
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }

    /// Snapshot of the tracked handles, most recent first.
    pub fn resources(&self) -> Vec<ResourceHandle> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect()
    }

    /// Tracked ids, most recent first.
    pub fn ids(&self) -> Vec<BufferId> {
        self.order.iter().copied().collect()
    }

    /// Least recently used handle.
    pub fn last(&self) -> Option<ResourceHandle> {
        self.order.back().and_then(|id| self.entries.get(id).cloned())
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn move_to_front(&mut self, id: BufferId) {
        if self.order.front() == Some(&id) {
            return;
        }
        if let Some(pos) = self.order.iter().position(|&x| x == id) {
            self.order.remove(pos);
            self.order.push_front(id);
        }
    }
}

impl Default for LruCache {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LRU_CACHE_CAPACITY,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }
}

fn validate_capacity(capacity: usize) -> Result<()> {
    if !(MIN_LRU_CACHE_CAPACITY..=MAX_LRU_CACHE_CAPACITY).contains(&capacity) {
        return Err(Error::InvalidCapacity {
            capacity,
            min: MIN_LRU_CACHE_CAPACITY,
            max: MAX_LRU_CACHE_CAPACITY,
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::manager::PurgeableResource;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    /// Bookkeeping-only resource.
    #[derive(Debug)]
    pub(crate) struct FakeResource {
        id: BufferId,
        pins: AtomicU32,
        valid: AtomicBool,
        reads: AtomicU32,
    }

    impl FakeResource {
        pub(crate) fn handle() -> Arc<FakeResource> {
            Arc::new(FakeResource {
                id: BufferId::next(),
                pins: AtomicU32::new(0),
                valid: AtomicBool::new(true),
                reads: AtomicU32::new(0),
            })
        }

        pub(crate) fn reads(&self) -> u32 {
            self.reads.load(Ordering::SeqCst)
        }
    }

    impl PurgeableResource for FakeResource {
        fn id(&self) -> BufferId {
            self.id
        }
        fn pin(&self) -> bool {
            self.pins.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn unpin(&self) -> bool {
            self.pins.fetch_sub(1, Ordering::SeqCst);
            true
        }
        fn pin_status(&self) -> u32 {
            self.pins.load(Ordering::SeqCst)
        }
        fn set_data_valid(&self, valid: bool) {
            self.valid.store(valid, Ordering::SeqCst);
        }
        fn is_data_valid(&self) -> bool {
            self.valid.load(Ordering::SeqCst)
        }
        fn begin_read_with_data_lock(&self) -> bool {
            if !self.is_data_valid() {
                return false;
            }
            self.reads.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn end_read_with_data_lock(&self) {
            let _ = self
                .reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
    }

    #[test]
    fn test_insert_evicts_tail() {
        let mut cache = LruCache::new(2).unwrap();
        let (a, b, c) = (FakeResource::handle(), FakeResource::handle(), FakeResource::handle());

        assert!(cache.insert(a.clone()).is_none());
        assert!(cache.insert(b.clone()).is_none());
        let evicted = cache.insert(c.clone()).unwrap();

        assert_eq!(evicted.id(), a.id());
        assert_eq!(cache.ids(), vec![c.id(), b.id()]);
    }

    #[test]
    fn test_reinsert_refreshes_without_duplicate() {
        let mut cache = LruCache::new(3).unwrap();
        let (a, b) = (FakeResource::handle(), FakeResource::handle());
        cache.insert(a.clone());
        cache.insert(b.clone());
        assert!(cache.insert(a.clone()).is_none());

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.ids(), vec![a.id(), b.id()]);
        assert_eq!(cache.last().map(|h| h.id()), Some(b.id()));
    }

    #[test]
    fn test_visited_and_erase() {
        let mut cache = LruCache::new(3).unwrap();
        let (a, b, c) = (FakeResource::handle(), FakeResource::handle(), FakeResource::handle());
        cache.insert(a.clone());
        cache.insert(b.clone());
        cache.visited(a.id());
        cache.visited(c.id());
        assert_eq!(cache.ids(), vec![a.id(), b.id()]);

        assert!(cache.erase(c.id()).is_none());
        assert_eq!(cache.erase(a.id()).map(|h| h.id()), Some(a.id()));
        assert_eq!(cache.ids(), vec![b.id()]);
        assert!(!cache.contains(a.id()));
    }

    #[test]
    fn test_set_capacity() {
        let mut cache = LruCache::new(5).unwrap();
        let handles: Vec<_> = (0..5).map(|_| FakeResource::handle()).collect();
        for h in &handles {
            cache.insert(h.clone());
        }

        assert!(matches!(cache.set_capacity(0), Err(Error::InvalidCapacity { .. })));
        assert!(matches!(cache.set_capacity(2001), Err(Error::InvalidCapacity { .. })));
        assert_eq!(cache.len(), 5);

        let evicted = cache.set_capacity(2).unwrap();
        let evicted_ids: Vec<_> = evicted.iter().map(|h| h.id()).collect();
        assert_eq!(evicted_ids, vec![handles[0].id(), handles[1].id(), handles[2].id()]);
        assert_eq!(cache.ids(), vec![handles[4].id(), handles[3].id()]);
        assert_eq!(cache.capacity(), 2);
    }

    #[test]
    fn test_clear_and_remove_last() {
        let mut cache = LruCache::default();
        assert!(cache.remove_last().is_none());
        cache.insert(FakeResource::handle());
        cache.insert(FakeResource::handle());
        assert!(cache.remove_last().is_some());
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.resources().is_empty());
    }

    proptest! {
        #[test]
        fn prop_keeps_most_recent(cap in 1usize..6, ops in proptest::collection::vec((0usize..8, any::<bool>()), 1..60)) {
            let pool: Vec<_> = (0..8).map(|_| FakeResource::handle()).collect();
            let mut cache = LruCache::new(cap).unwrap();
            // Reference model: most recent first, no duplicates.
            let mut model: Vec<BufferId> = Vec::new();

            for &(idx, is_insert) in &ops {
                let id = pool[idx].id();
                if is_insert {
                    cache.insert(pool[idx].clone());
                    model.retain(|&x| x != id);
                    model.insert(0, id);
                    model.truncate(cap);
                } else {
                    cache.visited(id);
                    if let Some(pos) = model.iter().position(|&x| x == id) {
                        model.remove(pos);
                        model.insert(0, id);
                    }
                }
            }

            prop_assert!(cache.len() <= cap);
            prop_assert_eq!(cache.ids(), model);
        }
    }
}
