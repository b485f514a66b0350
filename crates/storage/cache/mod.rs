//! Stackable caching layers.
//!
//! Every layer implements [`StoreEngine`](crate::api::StoreEngine) and
//! exclusively owns the engine below it, so caches compose arbitrarily
//! (LRU-over-read-through-over-persistent) while every stack observes the
//! same semantics as the bare backend.
//!
//! Buffered state is *materialized*: the first mutation of a key seeds its
//! buffer entry with the full value set from the layer below, so lookups are
//! strict first-hit-wins and a flush replays one `erase_all` plus the
//! rewrites per touched key.

pub mod lru;
pub mod read_through;
pub mod write_batch;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::api::{Index, IndexContents, insert_sorted};

/// The buffered state of one key: the full value set this layer answers
/// with. An empty set is a tombstone ("absent at this layer").
pub(crate) type ValueSet = Vec<Vec<u8>>;

/// Estimated per-entry bookkeeping overhead (map node + vec headers).
const ENTRY_OVERHEAD: usize = 24;

// Process-wide flush tallies, one per cache type (kept for tests).
static WRITE_BATCH_FLUSHES: AtomicU64 = AtomicU64::new(0);
static LRU_FLUSHES: AtomicU64 = AtomicU64::new(0);

/// Total flushes performed by every write-batch cache in the process.
pub fn total_write_batch_flushes() -> u64 {
    WRITE_BATCH_FLUSHES.load(Ordering::Relaxed)
}

/// Total flushes performed by every LRU cache in the process.
pub fn total_lru_flushes() -> u64 {
    LRU_FLUSHES.load(Ordering::Relaxed)
}

pub(crate) fn record_write_batch_flush() {
    WRITE_BATCH_FLUSHES.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_lru_flush() {
    LRU_FLUSHES.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn entry_size(key: &[u8], values: &ValueSet) -> usize {
    key.len() + values.iter().map(Vec::len).sum::<usize>() + ENTRY_OVERHEAD
}

/// Applies a write to a materialized value set.
pub(crate) fn apply_write(index: Index, values: &mut ValueSet, value: &[u8]) {
    if index.duplicate_keys_allowed() {
        insert_sorted(values, value.to_vec());
    } else {
        values.clear();
        values.push(value.to_vec());
    }
}

/// Applies a single-value erase to a materialized value set.
pub(crate) fn apply_erase(values: &mut ValueSet) {
    if !values.is_empty() {
        values.remove(0);
    }
}

/// Overlays buffered entries onto index contents read from a lower layer.
pub(crate) fn overlay_contents(
    contents: &mut IndexContents,
    entries: &BTreeMap<Vec<u8>, ValueSet>,
) {
    for (key, values) in entries {
        if values.is_empty() {
            contents.remove(key);
        } else {
            contents.insert(key.clone(), values.clone());
        }
    }
}

/// A buffer of materialized per-key states, grouped by index, with a running
/// byte estimate. Used both for the write-batch buffer and for cache-level
/// nested transactions.
#[derive(Debug, Default, Clone)]
pub(crate) struct PendingBatch {
    entries: BTreeMap<Index, BTreeMap<Vec<u8>, ValueSet>>,
    byte_size: usize,
}

impl PendingBatch {
    pub fn get(&self, index: Index, key: &[u8]) -> Option<&ValueSet> {
        self.entries.get(&index).and_then(|table| table.get(key))
    }

    pub fn insert(&mut self, index: Index, key: Vec<u8>, values: ValueSet) {
        let table = self.entries.entry(index).or_default();
        if let Some(old) = table.get(&key) {
            self.byte_size = self.byte_size.saturating_sub(entry_size(&key, old));
        }
        self.byte_size += entry_size(&key, &values);
        table.insert(key, values);
    }

    pub fn remove_index(&mut self, index: Index) {
        if let Some(table) = self.entries.remove(&index) {
            for (key, values) in &table {
                self.byte_size = self.byte_size.saturating_sub(entry_size(key, values));
            }
        }
    }

    pub fn index_entries(&self, index: Index) -> Option<&BTreeMap<Vec<u8>, ValueSet>> {
        self.entries.get(&index)
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(BTreeMap::is_empty)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.byte_size = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Index, &Vec<u8>, &ValueSet)> {
        self.entries
            .iter()
            .flat_map(|(&index, table)| table.iter().map(move |(key, values)| (index, key, values)))
    }

    pub fn into_entries(self) -> impl Iterator<Item = (Index, Vec<u8>, ValueSet)> {
        self.entries.into_iter().flat_map(|(index, table)| {
            table
                .into_iter()
                .map(move |(key, values)| (index, key, values))
        })
    }

    /// Folds `other` on top of this batch (used when a nested transaction
    /// commits into its parent).
    pub fn merge_from(&mut self, other: PendingBatch) {
        for (index, key, values) in other.into_entries() {
            self.insert(index, key, values);
        }
    }
}
