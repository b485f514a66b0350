use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

use crate::api::{
    Index, IndexContents, StoreEngine, insert_sorted, slice_value, validate_key, validate_value,
};
use crate::error::StoreError;

type Table = BTreeMap<Vec<u8>, Vec<Vec<u8>>>;
type Tables = BTreeMap<Index, Table>;

/// In-memory engine with the exact semantics of the persistent backend.
///
/// Tables never hold empty value sets: erasing the last value of a key
/// removes the key. Transactions snapshot the tables on begin; abort
/// restores the snapshot, commit drops it.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    inner: Arc<RwLock<MemInner>>,
}

#[derive(Debug, Default)]
struct MemInner {
    tables: Tables,
    /// Pre-transaction snapshot; restored on abort.
    snapshot: Option<Tables>,
    closed: bool,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_inner(&self) -> Result<RwLockReadGuard<'_, MemInner>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::LockError)?;
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(inner)
    }

    fn write_inner(&self) -> Result<RwLockWriteGuard<'_, MemInner>, StoreError> {
        let inner = self.inner.write().map_err(|_| StoreError::LockError)?;
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(inner)
    }
}

impl StoreEngine for InMemoryBackend {
    fn write(&self, index: Index, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        validate_value(index, value)?;
        let mut inner = self.write_inner()?;
        let table = inner.tables.entry(index).or_default();
        let values = table.entry(key.to_vec()).or_default();
        if index.duplicate_keys_allowed() {
            insert_sorted(values, value.to_vec());
        } else {
            values.clear();
            values.push(value.to_vec());
        }
        Ok(())
    }

    fn read_slice(
        &self,
        index: Index,
        key: &[u8],
        offset: usize,
        size: Option<usize>,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.read_inner()?;
        Ok(inner
            .tables
            .get(&index)
            .and_then(|table| table.get(key))
            .and_then(|values| values.first())
            .map(|value| slice_value(value, offset, size)))
    }

    fn read_multiple(&self, index: Index, key: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let inner = self.read_inner()?;
        Ok(inner
            .tables
            .get(&index)
            .and_then(|table| table.get(key))
            .cloned()
            .unwrap_or_default())
    }

    fn read_all(&self, index: Index) -> Result<IndexContents, StoreError> {
        let inner = self.read_inner()?;
        Ok(inner.tables.get(&index).cloned().unwrap_or_default())
    }

    fn exists(&self, index: Index, key: &[u8]) -> Result<bool, StoreError> {
        let inner = self.read_inner()?;
        Ok(inner
            .tables
            .get(&index)
            .is_some_and(|table| table.contains_key(key)))
    }

    fn erase(&self, index: Index, key: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.write_inner()?;
        if let Some(table) = inner.tables.get_mut(&index) {
            if index.duplicate_keys_allowed() {
                if let Some(values) = table.get_mut(key) {
                    values.remove(0);
                    if values.is_empty() {
                        table.remove(key);
                    }
                }
            } else {
                table.remove(key);
            }
        }
        Ok(())
    }

    fn erase_all(&self, index: Index, key: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.write_inner()?;
        if let Some(table) = inner.tables.get_mut(&index) {
            table.remove(key);
        }
        Ok(())
    }

    fn clear_db(&self, index: Index) -> Result<(), StoreError> {
        let mut inner = self.write_inner()?;
        if let Some(table) = inner.tables.get_mut(&index) {
            table.clear();
        }
        Ok(())
    }

    fn len(&self, index: Index) -> Result<usize, StoreError> {
        let inner = self.read_inner()?;
        Ok(inner.tables.get(&index).map_or(0, BTreeMap::len))
    }

    fn begin_db_transaction(&self, _size_hint: usize) -> Result<(), StoreError> {
        let mut inner = self.write_inner()?;
        if inner.snapshot.is_some() {
            return Err(StoreError::TransactionState(
                "write transaction already open".to_string(),
            ));
        }
        inner.snapshot = Some(inner.tables.clone());
        Ok(())
    }

    fn commit_db_transaction(&self) -> Result<(), StoreError> {
        let mut inner = self.write_inner()?;
        if inner.snapshot.take().is_none() {
            return Err(StoreError::TransactionState(
                "no open write transaction".to_string(),
            ));
        }
        Ok(())
    }

    fn abort_db_transaction(&self) -> Result<(), StoreError> {
        let mut inner = self.write_inner()?;
        match inner.snapshot.take() {
            Some(snapshot) => {
                inner.tables = snapshot;
                Ok(())
            }
            None => Err(StoreError::TransactionState(
                "no open write transaction".to_string(),
            )),
        }
    }

    fn flush(&self, _size_budget: Option<usize>) -> Result<bool, StoreError> {
        self.read_inner()?;
        Ok(false)
    }

    fn flush_count(&self) -> u64 {
        0
    }

    fn clear_cache(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockError)?;
        if let Some(snapshot) = inner.snapshot.take() {
            warn!("closing in-memory store with an open transaction; discarding staged writes");
            inner.tables = snapshot;
        }
        inner.closed = true;
        Ok(())
    }
}
