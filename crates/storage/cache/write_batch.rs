use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use crate::api::{
    Index, IndexContents, StoreEngine, slice_value, validate_key, validate_value,
};
use crate::cache::{
    PendingBatch, ValueSet, apply_erase, apply_write, overlay_contents, record_write_batch_flush,
};
use crate::error::StoreError;

/// Write-buffering cache.
///
/// Mutations accumulate in an in-memory buffer; reads serve from the buffer
/// when the key was touched and delegate downward otherwise. The buffer
/// drains into the engine below through a single write transaction, either
/// explicitly via [`flush`](StoreEngine::flush) or automatically once the
/// buffered byte estimate exceeds `cache_max_size` (0 disables auto-flush).
///
/// Transactions on this layer are purely cache-level: `begin` pushes a
/// nested buffer, `commit` folds it into its parent, `abort` drops it. The
/// engine below sees a single transaction per flush, sized by the buffered
/// byte count.
#[derive(Debug)]
pub struct WriteBatchCache<D: StoreEngine> {
    inner: D,
    state: RwLock<BatchState>,
    cache_max_size: usize,
    flushes: AtomicU64,
}

#[derive(Debug, Default)]
struct BatchState {
    base: PendingBatch,
    txns: Vec<PendingBatch>,
    closed: bool,
}

impl BatchState {
    /// Topmost buffered state for a key, nested transactions first.
    fn lookup(&self, index: Index, key: &[u8]) -> Option<&ValueSet> {
        self.txns
            .iter()
            .rev()
            .find_map(|batch| batch.get(index, key))
            .or_else(|| self.base.get(index, key))
    }
}

impl<D: StoreEngine> WriteBatchCache<D> {
    /// Wraps `inner`, auto-flushing once the buffer exceeds `cache_max_size`
    /// bytes. A `cache_max_size` of 0 means flush only on demand and close.
    pub fn new(inner: D, cache_max_size: usize) -> Self {
        Self {
            inner,
            state: RwLock::new(BatchState::default()),
            cache_max_size,
            flushes: AtomicU64::new(0),
        }
    }

    /// The engine below this cache.
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, BatchState>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::LockError)?;
        if state.closed {
            return Err(StoreError::Closed);
        }
        Ok(state)
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, BatchState>, StoreError> {
        let state = self.state.write().map_err(|_| StoreError::LockError)?;
        if state.closed {
            return Err(StoreError::Closed);
        }
        Ok(state)
    }

    /// Current value set for a key, seeding from the engine below when the
    /// key has not been touched at this layer yet.
    fn seeded_values(&self, state: &BatchState, index: Index, key: &[u8]) -> Result<ValueSet, StoreError> {
        match state.lookup(index, key) {
            Some(values) => Ok(values.clone()),
            None => self.inner.read_multiple(index, key),
        }
    }

    fn store_entry(state: &mut BatchState, index: Index, key: Vec<u8>, values: ValueSet) {
        match state.txns.last_mut() {
            Some(batch) => batch.insert(index, key, values),
            None => state.base.insert(index, key, values),
        }
    }

    fn maybe_auto_flush(&self, state: &mut BatchState) -> Result<(), StoreError> {
        if self.cache_max_size > 0 && state.base.byte_size() > self.cache_max_size {
            debug!(
                buffered = state.base.byte_size(),
                threshold = self.cache_max_size,
                "write buffer over threshold; flushing"
            );
            self.flush_locked(state, None)?;
        }
        Ok(())
    }

    /// Replays the base buffer into one transaction on the engine below. On
    /// failure the buffer is preserved so the caller can retry.
    fn flush_locked(
        &self,
        state: &mut BatchState,
        size_budget: Option<usize>,
    ) -> Result<bool, StoreError> {
        if let Some(budget) = size_budget {
            if budget > 0 && state.base.byte_size() < budget {
                return Ok(false);
            }
        }
        if !state.base.is_empty() {
            self.inner.begin_db_transaction(state.base.byte_size())?;
            let replay = || -> Result<(), StoreError> {
                for (index, key, values) in state.base.iter() {
                    self.inner.erase_all(index, key)?;
                    for value in values {
                        self.inner.write(index, key, value)?;
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
            state.base.clear();
        }
        self.flushes.fetch_add(1, Ordering::Relaxed);
        record_write_batch_flush();
        Ok(true)
    }
}

impl<D: StoreEngine> StoreEngine for WriteBatchCache<D> {
    fn write(&self, index: Index, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        validate_value(index, value)?;
        let mut state = self.write_state()?;
        // single-valued writes replace; only duplicate sets need seeding
        let mut values = if index.duplicate_keys_allowed() {
            self.seeded_values(&state, index, key)?
        } else {
            Vec::new()
        };
        apply_write(index, &mut values, value);
        Self::store_entry(&mut state, index, key.to_vec(), values);
        self.maybe_auto_flush(&mut state)
    }

    fn read_slice(
        &self,
        index: Index,
        key: &[u8],
        offset: usize,
        size: Option<usize>,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let state = self.read_state()?;
        if let Some(values) = state.lookup(index, key) {
            return Ok(values.first().map(|value| slice_value(value, offset, size)));
        }
        drop(state);
        self.inner.read_slice(index, key, offset, size)
    }

    fn read_multiple(&self, index: Index, key: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let state = self.read_state()?;
        if let Some(values) = state.lookup(index, key) {
            return Ok(values.clone());
        }
        drop(state);
        self.inner.read_multiple(index, key)
    }

    fn read_all(&self, index: Index) -> Result<IndexContents, StoreError> {
        let state = self.read_state()?;
        let mut contents = self.inner.read_all(index)?;
        if let Some(entries) = state.base.index_entries(index) {
            overlay_contents(&mut contents, entries);
        }
        for batch in &state.txns {
            if let Some(entries) = batch.index_entries(index) {
                overlay_contents(&mut contents, entries);
            }
        }
        Ok(contents)
    }

    fn exists(&self, index: Index, key: &[u8]) -> Result<bool, StoreError> {
        let state = self.read_state()?;
        if let Some(values) = state.lookup(index, key) {
            return Ok(!values.is_empty());
        }
        drop(state);
        self.inner.exists(index, key)
    }

    fn erase(&self, index: Index, key: &[u8]) -> Result<(), StoreError> {
        if validate_key(key).is_err() {
            return Ok(());
        }
        let mut state = self.write_state()?;
        let values = if index.duplicate_keys_allowed() {
            let mut values = self.seeded_values(&state, index, key)?;
            apply_erase(&mut values);
            values
        } else {
            Vec::new()
        };
        Self::store_entry(&mut state, index, key.to_vec(), values);
        self.maybe_auto_flush(&mut state)
    }

    fn erase_all(&self, index: Index, key: &[u8]) -> Result<(), StoreError> {
        if validate_key(key).is_err() {
            return Ok(());
        }
        let mut state = self.write_state()?;
        Self::store_entry(&mut state, index, key.to_vec(), Vec::new());
        self.maybe_auto_flush(&mut state)
    }

    fn clear_db(&self, index: Index) -> Result<(), StoreError> {
        let mut state = self.write_state()?;
        state.base.remove_index(index);
        for batch in &mut state.txns {
            batch.remove_index(index);
        }
        self.inner.clear_db(index)
    }

    fn len(&self, index: Index) -> Result<usize, StoreError> {
        Ok(self.read_all(index)?.len())
    }

    fn begin_db_transaction(&self, _size_hint: usize) -> Result<(), StoreError> {
        // Cache-level only; the engine below sees one transaction per flush
        // and the size hint is derived from the buffer at that point.
        let mut state = self.write_state()?;
        state.txns.push(PendingBatch::default());
        Ok(())
    }

    fn commit_db_transaction(&self) -> Result<(), StoreError> {
        let mut state = self.write_state()?;
        let Some(batch) = state.txns.pop() else {
            return Err(StoreError::TransactionState(
                "no open cache transaction".to_string(),
            ));
        };
        match state.txns.last_mut() {
            Some(parent) => parent.merge_from(batch),
            None => state.base.merge_from(batch),
        }
        // Folding into the base buffer may push it over the auto-flush
        // threshold.
        self.maybe_auto_flush(&mut state)
    }

    fn abort_db_transaction(&self) -> Result<(), StoreError> {
        let mut state = self.write_state()?;
        if state.txns.pop().is_none() {
            return Err(StoreError::TransactionState(
                "no open cache transaction".to_string(),
            ));
        }
        Ok(())
    }

    fn flush(&self, size_budget: Option<usize>) -> Result<bool, StoreError> {
        let mut state = self.write_state()?;
        self.flush_locked(&mut state, size_budget)
    }

    fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    fn clear_cache(&self) -> Result<(), StoreError> {
        let mut state = self.write_state()?;
        state.base.clear();
        for batch in &mut state.txns {
            batch.clear();
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::LockError)?;
        if !state.closed {
            if !state.txns.is_empty() {
                warn!("closing write-batch cache with open cache transactions; discarding them");
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

    fn cache() -> WriteBatchCache<InMemoryBackend> {
        WriteBatchCache::new(InMemoryBackend::new(), 0)
    }

    #[test]
    fn test_writes_are_buffered_until_flush() {
        let cache = cache();
        cache.write(Index::Main, b"key", b"value").unwrap();

        // visible through the cache, not yet below it
        assert!(cache.exists(Index::Main, b"key").unwrap());
        assert!(!cache.inner().exists(Index::Main, b"key").unwrap());

        assert!(cache.flush(None).unwrap());
        assert!(cache.inner().exists(Index::Main, b"key").unwrap());
        assert_eq!(cache.flush_count(), 1);
    }

    #[test]
    fn test_tombstone_hides_lower_layer_value() {
        let cache = cache();
        cache.inner().write(Index::Main, b"key", b"below").unwrap();

        cache.erase(Index::Main, b"key").unwrap();
        assert!(!cache.exists(Index::Main, b"key").unwrap());
        assert!(cache.inner().exists(Index::Main, b"key").unwrap());

        cache.flush(None).unwrap();
        assert!(!cache.inner().exists(Index::Main, b"key").unwrap());
    }

    #[test]
    fn test_duplicate_append_merges_lower_values() {
        let cache = cache();
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

    #[test]
    fn test_nested_transaction_merges_on_commit() {
        let cache = cache();
        cache.write(Index::Main, b"outer", b"v0").unwrap();

        cache.begin_db_transaction(0).unwrap();
        cache.write(Index::Main, b"staged", b"v1").unwrap();
        assert!(cache.exists(Index::Main, b"staged").unwrap());
        assert!(cache.exists(Index::Main, b"outer").unwrap());
        cache.commit_db_transaction().unwrap();

        assert!(cache.exists(Index::Main, b"staged").unwrap());
        // no lower-layer transaction was involved
        assert!(!cache.inner().exists(Index::Main, b"staged").unwrap());
    }

    #[test]
    fn test_aborted_transaction_leaves_no_trace() {
        let cache = cache();
        cache.begin_db_transaction(0).unwrap();
        cache.write(Index::Main, b"staged", b"v").unwrap();
        cache.abort_db_transaction().unwrap();

        assert!(!cache.exists(Index::Main, b"staged").unwrap());
        cache.flush(None).unwrap();
        assert!(!cache.inner().exists(Index::Main, b"staged").unwrap());
    }

    #[test]
    fn test_auto_flush_on_threshold() {
        let cache = WriteBatchCache::new(InMemoryBackend::new(), 64);
        cache.write(Index::Main, b"key1", &[0u8; 128]).unwrap();
        // the oversized write crossed the threshold and flushed on its own
        assert_eq!(cache.flush_count(), 1);
        assert!(cache.inner().exists(Index::Main, b"key1").unwrap());
    }

    #[test]
    fn test_budgeted_flush_skips_small_buffers() {
        let cache = cache();
        cache.write(Index::Main, b"key", b"small").unwrap();
        assert!(!cache.flush(Some(1024 * 1024)).unwrap());
        assert_eq!(cache.flush_count(), 0);
        assert!(!cache.inner().exists(Index::Main, b"key").unwrap());
    }

    #[test]
    fn test_close_flushes_buffer() {
        let cache = cache();
        cache.write(Index::Main, b"key", b"value").unwrap();
        cache.close().unwrap();
        assert!(matches!(
            cache.read(Index::Main, b"key"),
            Err(StoreError::Closed)
        ));
    }

    #[test]
    fn test_clear_cache_discards_buffer() {
        let cache = cache();
        cache.inner().write(Index::Main, b"key", b"below").unwrap();
        cache.write(Index::Main, b"key", b"buffered").unwrap();

        cache.clear_cache().unwrap();
        assert_eq!(
            cache.read(Index::Main, b"key").unwrap(),
            Some(b"below".to_vec())
        );
    }
}
