use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache as LruMap;
use rustc_hash::FxBuildHasher;
use tracing::{debug, warn};

use crate::api::{
    Index, IndexContents, StoreEngine, slice_value, validate_key, validate_value,
};
use crate::cache::{
    PendingBatch, ValueSet, apply_erase, apply_write, entry_size, record_lru_flush,
};
use crate::error::StoreError;

type CacheKey = (Index, Vec<u8>);

/// LRU-bounded cache layer, generic over the engine below it.
///
/// Entries are materialized per-key value sets. Reads populate clean
/// entries; mutations mark entries dirty and stay buffered until a flush or
/// until eviction writes them through. The cache holds at most
/// `max_entries` entries (0 = unbounded); accessing or inserting an entry
/// moves it to most-recently-used, and eviction takes the least-recently-used
/// entry, writing it to the engine below first when dirty.
///
/// Transactions are cache-level, exactly like the write-batch cache: `begin`
/// pushes a nested buffer, `commit` folds it into its parent (or into the
/// cache as dirty entries), `abort` drops it.
#[derive(Debug)]
pub struct LruCache<D: StoreEngine> {
    inner: D,
    state: Mutex<LruState>,
    max_entries: usize,
    flushes: AtomicU64,
}

#[derive(Debug)]
struct LruState {
    slots: LruMap<CacheKey, Slot, FxBuildHasher>,
    txns: Vec<PendingBatch>,
    closed: bool,
}

#[derive(Debug, Clone)]
struct Slot {
    values: ValueSet,
    dirty: bool,
}

impl<D: StoreEngine> LruCache<D> {
    /// Wraps `inner`, keeping at most `max_entries` cached entries. A
    /// `max_entries` of 0 means unbounded.
    pub fn new(inner: D, max_entries: usize) -> Self {
        Self {
            inner,
            // always unbounded underneath; capacity is enforced manually so
            // dirty evictions can write through first
            state: Mutex::new(LruState {
                slots: LruMap::unbounded_with_hasher(FxBuildHasher),
                txns: Vec::new(),
                closed: false,
            }),
            max_entries,
            flushes: AtomicU64::new(0),
        }
    }

    /// The engine below this cache.
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, LruState>, StoreError> {
        let state = self.state.lock().map_err(|_| StoreError::LockError)?;
        if state.closed {
            return Err(StoreError::Closed);
        }
        Ok(state)
    }

    /// Current value set for a key: nested transaction buffers first, then
    /// the cached slots (promoting to MRU), then the engine below (caching
    /// the answer as a clean slot).
    fn cached_values(
        &self,
        state: &mut LruState,
        index: Index,
        key: &[u8],
    ) -> Result<ValueSet, StoreError> {
        for batch in state.txns.iter().rev() {
            if let Some(values) = batch.get(index, key) {
                return Ok(values.clone());
            }
        }
        let cache_key = (index, key.to_vec());
        if let Some(slot) = state.slots.get(&cache_key) {
            return Ok(slot.values.clone());
        }
        let values = self.inner.read_multiple(index, key)?;
        state.slots.put(
            cache_key,
            Slot {
                values: values.clone(),
                dirty: false,
            },
        );
        self.evict_over_capacity(state)?;
        Ok(values)
    }

    /// Evicts least-recently-used entries down to `max_entries`, writing
    /// dirty ones through to the engine below first.
    fn evict_over_capacity(&self, state: &mut LruState) -> Result<(), StoreError> {
        if self.max_entries == 0 {
            return Ok(());
        }
        while state.slots.len() > self.max_entries {
            let Some(((index, key), slot)) = state.slots.pop_lru() else {
                break;
            };
            if slot.dirty {
                debug!(
                    index = index.table_name(),
                    key = %hex::encode(&key),
                    "evicting dirty entry; writing through"
                );
                if let Err(err) = self.write_through(index, &key, &slot.values) {
                    // keep the entry so its buffered state is not lost
                    state.slots.put((index, key), slot);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Replaces a key's state in the engine below with `values`.
    fn write_through(&self, index: Index, key: &[u8], values: &ValueSet) -> Result<(), StoreError> {
        self.inner.erase_all(index, key)?;
        for value in values {
            self.inner.write(index, key, value)?;
        }
        Ok(())
    }

    fn store_dirty(
        &self,
        state: &mut LruState,
        index: Index,
        key: &[u8],
        values: ValueSet,
    ) -> Result<(), StoreError> {
        if let Some(batch) = state.txns.last_mut() {
            batch.insert(index, key.to_vec(), values);
            return Ok(());
        }
        state.slots.put(
            (index, key.to_vec()),
            Slot {
                values,
                dirty: true,
            },
        );
        self.evict_over_capacity(state)
    }

    /// Writes every dirty slot through one transaction on the engine below.
    fn flush_locked(
        &self,
        state: &mut LruState,
        size_budget: Option<usize>,
    ) -> Result<bool, StoreError> {
        let dirty_bytes: usize = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.dirty)
            .map(|((_, key), slot)| entry_size(key, &slot.values))
            .sum();
        if let Some(budget) = size_budget {
            if budget > 0 && dirty_bytes < budget {
                return Ok(false);
            }
        }
        let dirty_keys: Vec<CacheKey> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.dirty)
            .map(|(key, _)| key.clone())
            .collect();
        if !dirty_keys.is_empty() {
            self.inner.begin_db_transaction(dirty_bytes)?;
            let replay = || -> Result<(), StoreError> {
                for cache_key in &dirty_keys {
                    let Some(slot) = state.slots.peek(cache_key) else {
                        continue;
                    };
                    let (index, key) = cache_key;
                    self.inner.erase_all(*index, key)?;
                    for value in &slot.values {
                        self.inner.write(*index, key, value)?;
                    }
                }
                Ok(())
            };
            match replay() {
                Ok(()) => self.inner.commit_db_transaction()?,
                Err(err) => {
                    let _ = self.inner.abort_db_transaction();
                    return Err(err);
                }
            }
            for cache_key in &dirty_keys {
                if let Some(slot) = state.slots.peek_mut(cache_key) {
                    slot.dirty = false;
                }
            }
        }
        self.flushes.fetch_add(1, Ordering::Relaxed);
        record_lru_flush();
        Ok(true)
    }
}

impl<D: StoreEngine> StoreEngine for LruCache<D> {
    fn write(&self, index: Index, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        validate_value(index, value)?;
        let mut state = self.lock_state()?;
        // single-valued writes replace; only duplicate sets need seeding
        let mut values = if index.duplicate_keys_allowed() {
            self.cached_values(&mut state, index, key)?
        } else {
            Vec::new()
        };
        apply_write(index, &mut values, value);
        self.store_dirty(&mut state, index, key, values)
    }

    fn read_slice(
        &self,
        index: Index,
        key: &[u8],
        offset: usize,
        size: Option<usize>,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        if validate_key(key).is_err() {
            return Ok(None);
        }
        let mut state = self.lock_state()?;
        let values = self.cached_values(&mut state, index, key)?;
        Ok(values.first().map(|value| slice_value(value, offset, size)))
    }

    fn read_multiple(&self, index: Index, key: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        if validate_key(key).is_err() {
            return Ok(Vec::new());
        }
        let mut state = self.lock_state()?;
        self.cached_values(&mut state, index, key)
    }

    fn read_all(&self, index: Index) -> Result<IndexContents, StoreError> {
        let state = self.lock_state()?;
        let mut contents = self.inner.read_all(index)?;
        // clean slots mirror the engine below; only dirty ones can differ
        for ((slot_index, key), slot) in state.slots.iter() {
            if *slot_index != index || !slot.dirty {
                continue;
            }
            if slot.values.is_empty() {
                contents.remove(key);
            } else {
                contents.insert(key.clone(), slot.values.clone());
            }
        }
        for batch in &state.txns {
            if let Some(entries) = batch.index_entries(index) {
                crate::cache::overlay_contents(&mut contents, entries);
            }
        }
        Ok(contents)
    }

    fn exists(&self, index: Index, key: &[u8]) -> Result<bool, StoreError> {
        if validate_key(key).is_err() {
            return Ok(false);
        }
        let mut state = self.lock_state()?;
        Ok(!self.cached_values(&mut state, index, key)?.is_empty())
    }

    fn erase(&self, index: Index, key: &[u8]) -> Result<(), StoreError> {
        if validate_key(key).is_err() {
            return Ok(());
        }
        let mut state = self.lock_state()?;
        let values = if index.duplicate_keys_allowed() {
            let mut values = self.cached_values(&mut state, index, key)?;
            apply_erase(&mut values);
            values
        } else {
            Vec::new()
        };
        self.store_dirty(&mut state, index, key, values)
    }

    fn erase_all(&self, index: Index, key: &[u8]) -> Result<(), StoreError> {
        if validate_key(key).is_err() {
            return Ok(());
        }
        let mut state = self.lock_state()?;
        self.store_dirty(&mut state, index, key, Vec::new())
    }

    fn clear_db(&self, index: Index) -> Result<(), StoreError> {
        let mut state = self.lock_state()?;
        let keys: Vec<CacheKey> = state
            .slots
            .iter()
            .filter(|((slot_index, _), _)| *slot_index == index)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            state.slots.pop(&key);
        }
        for batch in &mut state.txns {
            batch.remove_index(index);
        }
        self.inner.clear_db(index)
    }

    fn len(&self, index: Index) -> Result<usize, StoreError> {
        Ok(self.read_all(index)?.len())
    }

    fn begin_db_transaction(&self, _size_hint: usize) -> Result<(), StoreError> {
        let mut state = self.lock_state()?;
        state.txns.push(PendingBatch::default());
        Ok(())
    }

    fn commit_db_transaction(&self) -> Result<(), StoreError> {
        let mut state = self.lock_state()?;
        let Some(batch) = state.txns.pop() else {
            return Err(StoreError::TransactionState(
                "no open cache transaction".to_string(),
            ));
        };
        if let Some(parent) = state.txns.last_mut() {
            parent.merge_from(batch);
            return Ok(());
        }
        for (index, key, values) in batch.into_entries() {
            state.slots.put(
                (index, key),
                Slot {
                    values,
                    dirty: true,
                },
            );
        }
        self.evict_over_capacity(&mut state)
    }

    fn abort_db_transaction(&self) -> Result<(), StoreError> {
        let mut state = self.lock_state()?;
        if state.txns.pop().is_none() {
            return Err(StoreError::TransactionState(
                "no open cache transaction".to_string(),
            ));
        }
        Ok(())
    }

    fn flush(&self, size_budget: Option<usize>) -> Result<bool, StoreError> {
        let mut state = self.lock_state()?;
        self.flush_locked(&mut state, size_budget)
    }

    fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    fn clear_cache(&self) -> Result<(), StoreError> {
        let mut state = self.lock_state()?;
        state.slots.clear();
        for batch in &mut state.txns {
            batch.clear();
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(|_| StoreError::LockError)?;
        if !state.closed {
            if !state.txns.is_empty() {
                warn!("closing lru cache with open cache transactions; discarding them");
                state.txns.clear();
            }
            self.flush_locked(&mut state, None)?;
            state.closed = true;
        }
        drop(state);
        self.inner.close()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::in_memory::InMemoryBackend;

    #[test]
    fn test_reads_populate_and_serve() {
        let cache = LruCache::new(InMemoryBackend::new(), 0);
        cache.inner().write(Index::Main, b"key", b"value").unwrap();

        assert_eq!(cache.read(Index::Main, b"key").unwrap(), Some(b"value".to_vec()));
        assert!(cache.exists(Index::Main, b"key").unwrap());
    }

    #[test]
    fn test_writes_stay_dirty_until_flush() {
        let cache = LruCache::new(InMemoryBackend::new(), 0);
        cache.write(Index::Main, b"key", b"value").unwrap();

        assert!(cache.exists(Index::Main, b"key").unwrap());
        assert!(!cache.inner().exists(Index::Main, b"key").unwrap());

        assert!(cache.flush(None).unwrap());
        assert!(cache.inner().exists(Index::Main, b"key").unwrap());
        assert_eq!(cache.flush_count(), 1);

        // a second flush leaves the state unchanged
        cache.flush(None).unwrap();
        assert_eq!(
            cache.inner().read(Index::Main, b"key").unwrap(),
            Some(b"value".to_vec())
        );
    }

    #[test]
    fn test_eviction_writes_dirty_entries_through() {
        let cache = LruCache::new(InMemoryBackend::new(), 2);
        cache.write(Index::Main, b"a", b"1").unwrap();
        cache.write(Index::Main, b"b", b"2").unwrap();
        cache.write(Index::Main, b"c", b"3").unwrap();

        // "a" was least recently used; its dirty state reached the backend
        assert_eq!(cache.inner().read(Index::Main, b"a").unwrap(), Some(b"1".to_vec()));
        // the others are still only buffered
        assert!(!cache.inner().exists(Index::Main, b"b").unwrap());
        // every entry is still readable through the cache
        assert_eq!(cache.read(Index::Main, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(cache.read(Index::Main, b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(cache.read(Index::Main, b"c").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_erase_tombstone_applies_on_flush() {
        let cache = LruCache::new(InMemoryBackend::new(), 0);
        cache.inner().write(Index::Main, b"key", b"below").unwrap();

        cache.erase(Index::Main, b"key").unwrap();
        assert!(!cache.exists(Index::Main, b"key").unwrap());
        assert!(cache.inner().exists(Index::Main, b"key").unwrap());

        cache.flush(None).unwrap();
        assert!(!cache.inner().exists(Index::Main, b"key").unwrap());
    }

    #[test]
    fn test_transaction_commit_marks_dirty() {
        let cache = LruCache::new(InMemoryBackend::new(), 0);
        cache.begin_db_transaction(0).unwrap();
        cache.write(Index::Main, b"staged", b"value").unwrap();
        cache.commit_db_transaction().unwrap();

        assert!(cache.exists(Index::Main, b"staged").unwrap());
        assert!(!cache.inner().exists(Index::Main, b"staged").unwrap());

        cache.flush(None).unwrap();
        assert!(cache.inner().exists(Index::Main, b"staged").unwrap());
    }

    #[test]
    fn test_transaction_abort_discards_buffer() {
        let cache = LruCache::new(InMemoryBackend::new(), 0);
        cache.begin_db_transaction(0).unwrap();
        cache.write(Index::Main, b"staged", b"value").unwrap();
        assert!(cache.exists(Index::Main, b"staged").unwrap());

        cache.abort_db_transaction().unwrap();
        assert!(!cache.exists(Index::Main, b"staged").unwrap());
    }

    #[test]
    fn test_duplicate_values_merge_with_backend() {
        let cache = LruCache::new(InMemoryBackend::new(), 0);
        let index = Index::Ntp1TokenNames;
        cache.inner().write(index, b"token", b"below").unwrap();

        cache.write(index, b"token", b"above").unwrap();
        assert_eq!(
            cache.read_multiple(index, b"token").unwrap(),
            vec![b"above".to_vec(), b"below".to_vec()]
        );

        cache.flush(None).unwrap();
        assert_eq!(
            cache.inner().read_multiple(index, b"token").unwrap(),
            vec![b"above".to_vec(), b"below".to_vec()]
        );
    }
}
