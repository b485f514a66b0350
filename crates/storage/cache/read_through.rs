use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::api::{
    Index, IndexContents, StoreEngine, slice_value, validate_key, validate_value,
};
use crate::cache::{ValueSet, apply_erase, apply_write, entry_size};
use crate::error::StoreError;

/// Read-through cache.
///
/// Lookups populate a per-key cache from the engine below (including
/// confirmed-absent entries); mutations are write-through, applied below
/// immediately, and keep the affected entries in sync. Transactions
/// propagate to the engine below; entries touched while a transaction is
/// open are invalidated if it aborts, since they may have observed staged
/// state.
#[derive(Debug)]
pub struct ReadThroughCache<D: StoreEngine> {
    inner: D,
    state: RwLock<ReadState>,
    cache_max_size: usize,
}

#[derive(Debug, Default)]
struct ReadState {
    /// Cached value sets; an empty set records a confirmed-absent key.
    entries: BTreeMap<Index, BTreeMap<Vec<u8>, ValueSet>>,
    byte_size: usize,
    /// Keys populated or updated while the propagated transaction is open.
    touched: Option<Vec<(Index, Vec<u8>)>>,
    closed: bool,
}

impl ReadState {
    fn get(&self, index: Index, key: &[u8]) -> Option<&ValueSet> {
        self.entries.get(&index).and_then(|table| table.get(key))
    }

    fn note_touched(&mut self, index: Index, key: &[u8]) {
        if let Some(touched) = self.touched.as_mut() {
            touched.push((index, key.to_vec()));
        }
    }

    fn remove(&mut self, index: Index, key: &[u8]) {
        if let Some(table) = self.entries.get_mut(&index) {
            if let Some(values) = table.remove(key) {
                self.byte_size = self.byte_size.saturating_sub(entry_size(key, &values));
            }
        }
    }
}

impl<D: StoreEngine> ReadThroughCache<D> {
    /// Wraps `inner`. Once the cached byte estimate exceeds
    /// `cache_max_size` the whole cache is dropped and repopulated on
    /// demand; 0 means unbounded.
    pub fn new(inner: D, cache_max_size: usize) -> Self {
        Self {
            inner,
            state: RwLock::new(ReadState::default()),
            cache_max_size,
        }
    }

    /// The engine below this cache.
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, ReadState>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::LockError)?;
        if state.closed {
            return Err(StoreError::Closed);
        }
        Ok(state)
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, ReadState>, StoreError> {
        let state = self.state.write().map_err(|_| StoreError::LockError)?;
        if state.closed {
            return Err(StoreError::Closed);
        }
        Ok(state)
    }

    fn populate(state: &mut ReadState, max_size: usize, index: Index, key: &[u8], values: ValueSet) {
        if max_size > 0 && state.byte_size + entry_size(key, &values) > max_size {
            debug!(cached = state.byte_size, "read cache over budget; dropping it");
            state.entries.clear();
            state.byte_size = 0;
        }
        state.byte_size += entry_size(key, &values);
        state
            .entries
            .entry(index)
            .or_default()
            .insert(key.to_vec(), values);
        state.note_touched(index, key);
    }

    /// Cached value set for a key, querying the engine below on a miss.
    fn cached_values(&self, index: Index, key: &[u8]) -> Result<ValueSet, StoreError> {
        {
            let state = self.read_state()?;
            if let Some(values) = state.get(index, key) {
                return Ok(values.clone());
            }
        }
        let values = self.inner.read_multiple(index, key)?;
        let mut state = self.write_state()?;
        Self::populate(&mut state, self.cache_max_size, index, key, values.clone());
        Ok(values)
    }

    /// Applies `update` to the cached entry, if any, keeping the byte
    /// estimate current.
    fn update_entry(
        state: &mut ReadState,
        index: Index,
        key: &[u8],
        update: impl FnOnce(&mut ValueSet),
    ) {
        if let Some(table) = state.entries.get_mut(&index) {
            if let Some(values) = table.get_mut(key) {
                let old = entry_size(key, values);
                update(values);
                let new = entry_size(key, values);
                state.byte_size = state.byte_size.saturating_sub(old) + new;
            }
        }
        state.note_touched(index, key);
    }
}

impl<D: StoreEngine> StoreEngine for ReadThroughCache<D> {
    fn write(&self, index: Index, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        validate_value(index, value)?;
        self.inner.write(index, key, value)?;
        let mut state = self.write_state()?;
        Self::update_entry(&mut state, index, key, |values| {
            apply_write(index, values, value);
        });
        Ok(())
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
        let values = self.cached_values(index, key)?;
        Ok(values.first().map(|value| slice_value(value, offset, size)))
    }

    fn read_multiple(&self, index: Index, key: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        if validate_key(key).is_err() {
            return Ok(Vec::new());
        }
        self.cached_values(index, key)
    }

    fn read_all(&self, index: Index) -> Result<IndexContents, StoreError> {
        // Bulk reads bypass the per-key cache; the engine below is
        // authoritative since every mutation is written through.
        self.read_state()?;
        self.inner.read_all(index)
    }

    fn exists(&self, index: Index, key: &[u8]) -> Result<bool, StoreError> {
        if validate_key(key).is_err() {
            return Ok(false);
        }
        Ok(!self.cached_values(index, key)?.is_empty())
    }

    fn erase(&self, index: Index, key: &[u8]) -> Result<(), StoreError> {
        if validate_key(key).is_err() {
            return Ok(());
        }
        self.inner.erase(index, key)?;
        let mut state = self.write_state()?;
        if index.duplicate_keys_allowed() {
            Self::update_entry(&mut state, index, key, apply_erase);
        } else {
            Self::update_entry(&mut state, index, key, Vec::clear);
        }
        Ok(())
    }

    fn erase_all(&self, index: Index, key: &[u8]) -> Result<(), StoreError> {
        if validate_key(key).is_err() {
            return Ok(());
        }
        self.inner.erase_all(index, key)?;
        let mut state = self.write_state()?;
        Self::update_entry(&mut state, index, key, Vec::clear);
        Ok(())
    }

    fn clear_db(&self, index: Index) -> Result<(), StoreError> {
        self.inner.clear_db(index)?;
        let mut state = self.write_state()?;
        if let Some(table) = state.entries.remove(&index) {
            for (key, values) in &table {
                state.byte_size = state.byte_size.saturating_sub(entry_size(key, values));
            }
        }
        Ok(())
    }

    fn len(&self, index: Index) -> Result<usize, StoreError> {
        self.read_state()?;
        self.inner.len(index)
    }

    fn begin_db_transaction(&self, size_hint: usize) -> Result<(), StoreError> {
        {
            self.read_state()?;
        }
        self.inner.begin_db_transaction(size_hint)?;
        let mut state = self.write_state()?;
        if state.touched.is_none() {
            state.touched = Some(Vec::new());
        }
        Ok(())
    }

    fn commit_db_transaction(&self) -> Result<(), StoreError> {
        self.inner.commit_db_transaction()?;
        let mut state = self.write_state()?;
        state.touched = None;
        Ok(())
    }

    fn abort_db_transaction(&self) -> Result<(), StoreError> {
        self.inner.abort_db_transaction()?;
        let mut state = self.write_state()?;
        if let Some(touched) = state.touched.take() {
            // Entries refreshed during the transaction may hold staged state.
            for (index, key) in touched {
                state.remove(index, &key);
            }
        }
        Ok(())
    }

    fn flush(&self, size_budget: Option<usize>) -> Result<bool, StoreError> {
        self.read_state()?;
        self.inner.flush(size_budget)
    }

    fn flush_count(&self) -> u64 {
        self.inner.flush_count()
    }

    fn clear_cache(&self) -> Result<(), StoreError> {
        let mut state = self.write_state()?;
        state.entries.clear();
        state.byte_size = 0;
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::LockError)?;
        state.entries.clear();
        state.byte_size = 0;
        state.closed = true;
        drop(state);
        self.inner.close()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::in_memory::InMemoryBackend;

    fn cache() -> ReadThroughCache<InMemoryBackend> {
        ReadThroughCache::new(InMemoryBackend::new(), 0)
    }

    #[test]
    fn test_miss_populates_and_serves() {
        let cache = cache();
        cache.inner().write(Index::Main, b"key", b"value").unwrap();

        assert_eq!(cache.read(Index::Main, b"key").unwrap(), Some(b"value".to_vec()));
        // mutate below the cache's back; the cached entry still answers
        cache.inner().erase(Index::Main, b"key").unwrap();
        assert_eq!(cache.read(Index::Main, b"key").unwrap(), Some(b"value".to_vec()));

        cache.clear_cache().unwrap();
        assert_eq!(cache.read(Index::Main, b"key").unwrap(), None);
    }

    #[test]
    fn test_absence_is_cached() {
        let cache = cache();
        assert!(!cache.exists(Index::Main, b"missing").unwrap());
        cache.inner().write(Index::Main, b"missing", b"appeared").unwrap();
        // the confirmed-absent entry still answers
        assert!(!cache.exists(Index::Main, b"missing").unwrap());
    }

    #[test]
    fn test_writes_go_through_and_update_cache() {
        let cache = cache();
        assert_eq!(cache.read(Index::Main, b"key").unwrap(), None);

        cache.write(Index::Main, b"key", b"value").unwrap();
        assert_eq!(cache.read(Index::Main, b"key").unwrap(), Some(b"value".to_vec()));
        assert_eq!(
            cache.inner().read(Index::Main, b"key").unwrap(),
            Some(b"value".to_vec())
        );
    }

    #[test]
    fn test_duplicate_erase_updates_entry() {
        let cache = cache();
        let index = Index::AddrsVsPubKeys;
        cache.write(index, b"addr", b"k1").unwrap();
        cache.write(index, b"addr", b"k2").unwrap();
        assert_eq!(
            cache.read_multiple(index, b"addr").unwrap(),
            vec![b"k1".to_vec(), b"k2".to_vec()]
        );

        cache.erase(index, b"addr").unwrap();
        assert_eq!(cache.read_multiple(index, b"addr").unwrap(), vec![b"k2".to_vec()]);
        assert_eq!(
            cache.inner().read_multiple(index, b"addr").unwrap(),
            vec![b"k2".to_vec()]
        );
    }

    #[test]
    fn test_abort_invalidates_touched_entries() {
        let cache = cache();
        cache.begin_db_transaction(0).unwrap();
        cache.write(Index::Main, b"staged", b"value").unwrap();
        assert!(cache.exists(Index::Main, b"staged").unwrap());

        cache.abort_db_transaction().unwrap();
        assert!(!cache.exists(Index::Main, b"staged").unwrap());
    }

    #[test]
    fn test_commit_keeps_entries() {
        let cache = cache();
        cache.begin_db_transaction(0).unwrap();
        cache.write(Index::Main, b"key", b"value").unwrap();
        cache.commit_db_transaction().unwrap();

        assert_eq!(cache.read(Index::Main, b"key").unwrap(), Some(b"value".to_vec()));
        assert_eq!(
            cache.inner().read(Index::Main, b"key").unwrap(),
            Some(b"value".to_vec())
        );
    }
}
