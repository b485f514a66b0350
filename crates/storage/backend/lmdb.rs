use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use fs4::FileExt;
use heed3::types::Bytes;
use heed3::{DatabaseFlags, DatabaseOpenOptions, EnvOpenOptions, WithoutTls};
use tracing::{debug, error, info, warn};

use crate::api::{
    Index, IndexContents, StoreEngine, slice_value, validate_key, validate_value,
};
use crate::error::StoreError;

// We don't use TLS so read transactions can be served from any thread.
type Env = heed3::Env<WithoutTls>;
type Db = heed3::Database<Bytes, Bytes>;

/// Initial map size, grown on demand.
const INITIAL_MAP_SIZE: usize = 64 * 1024 * 1024;

/// Upper bound on map doublings for a single operation before surfacing
/// [`StoreError::OutOfSpace`].
const MAX_MAP_GROWTHS: usize = 16;

/// Advisory lock sentinel keeping the directory exclusive to one process.
const LOCK_FILE: &str = "store.lock";

/// Persistent backend: a B+Tree store on a memory-mapped file (LMDB), one
/// named sub-database per [`Index`], with `DUP_SORT` on duplicate-allowed
/// indexes.
///
/// Writes that hit a full map abort the internal transaction, double the map
/// size and replay the staged operations from the transaction journal, up to
/// [`MAX_MAP_GROWTHS`] times. Readers open throwaway snapshot transactions
/// and never block each other; the single writer is serialized by the
/// instance lock.
#[derive(Debug)]
pub struct LmdbBackend {
    shared: RwLock<Shared>,
    writer: Mutex<Writer>,
    /// Fast-path flag letting readers skip the writer lock when no write
    /// transaction is open.
    has_txn: AtomicBool,
}

#[derive(Debug)]
struct Shared {
    env: Option<Env>,
    dbs: HashMap<Index, Db>,
    lock_file: Option<File>,
    path: PathBuf,
}

#[derive(Debug)]
struct Writer {
    txn: Option<OpenTxn>,
    map_size: usize,
}

/// An open write transaction. The env reference is a leaked clone so the
/// transaction can be stored with a `'static` lifetime; `Drop` releases it.
struct OpenTxn {
    env: &'static Env,
    wtxn: Option<heed3::RwTxn<'static>>,
    /// Staged operations, replayed into a fresh transaction after a map
    /// resize.
    journal: Vec<StagedOp>,
    growths: usize,
}

#[derive(Debug, Clone)]
enum StagedOp {
    Write {
        index: Index,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Erase {
        index: Index,
        key: Vec<u8>,
    },
    EraseAll {
        index: Index,
        key: Vec<u8>,
    },
    Clear {
        index: Index,
    },
}

impl StagedOp {
    fn index(&self) -> Index {
        match self {
            StagedOp::Write { index, .. }
            | StagedOp::Erase { index, .. }
            | StagedOp::EraseAll { index, .. }
            | StagedOp::Clear { index } => *index,
        }
    }
}

impl OpenTxn {
    fn open(env: Env) -> Result<Self, StoreError> {
        let env: &'static Env = Box::leak(Box::new(env));
        match env.write_txn() {
            Ok(wtxn) => Ok(OpenTxn {
                env,
                wtxn: Some(wtxn),
                journal: Vec::new(),
                growths: 0,
            }),
            Err(err) => {
                unsafe {
                    drop(Box::from_raw(env as *const Env as *mut Env));
                }
                Err(err.into())
            }
        }
    }
}

impl Drop for OpenTxn {
    fn drop(&mut self) {
        if let Some(wtxn) = self.wtxn.take() {
            wtxn.abort();
        }
        unsafe {
            drop(Box::from_raw(self.env as *const Env as *mut Env));
        }
    }
}

impl fmt::Debug for OpenTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenTxn")
            .field("staged_ops", &self.journal.len())
            .field("growths", &self.growths)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn env(&self) -> Result<&Env, StoreError> {
        self.env.as_ref().ok_or(StoreError::Closed)
    }

    fn db(&self, index: Index) -> Result<Db, StoreError> {
        self.dbs.get(&index).copied().ok_or_else(|| {
            StoreError::Custom(format!("sub-database {} not found", index.table_name()))
        })
    }
}

fn round_to_page_size(size: usize) -> usize {
    let page = page_size::get();
    size.div_ceil(page) * page
}

fn is_map_full(err: &heed3::Error) -> bool {
    matches!(err, heed3::Error::Mdb(heed3::MdbError::MapFull))
}

fn open_error(err: heed3::Error) -> StoreError {
    match err {
        heed3::Error::Io(io) if io.kind() == std::io::ErrorKind::WouldBlock => StoreError::Conflict,
        other => other.into(),
    }
}

impl LmdbBackend {
    /// Opens (or creates) the store in `path`. With `clear_before_open`, any
    /// existing data files in the directory are removed first.
    pub fn open(path: impl AsRef<Path>, clear_before_open: bool) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if clear_before_open && path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;

        // LMDB itself allows multi-process envs; the store's contract is one
        // process per directory, enforced with an advisory lock sentinel.
        let lock_file = File::create(path.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Conflict)?;

        let map_size = round_to_page_size(INITIAL_MAP_SIZE);
        let mut env_opts = EnvOpenOptions::new().read_txn_without_tls();
        env_opts.max_dbs(Index::ALL.len() as u32);
        env_opts.map_size(map_size);
        let env = unsafe { env_opts.open(&path) }.map_err(open_error)?;

        let mut wtxn = env.write_txn().map_err(StoreError::from)?;
        let mut dbs = HashMap::new();
        for index in Index::ALL {
            let mut opts = DatabaseOpenOptions::new(&env).types::<Bytes, Bytes>();
            opts.name(index.table_name());
            if index.duplicate_keys_allowed() {
                opts.flags(DatabaseFlags::DUP_SORT);
            }
            let db: Db = opts.create(&mut wtxn).map_err(StoreError::from)?;
            dbs.insert(index, db);
        }
        wtxn.commit().map_err(StoreError::from)?;

        info!(path = %path.display(), map_size, "opened lmdb store");
        Ok(Self {
            shared: RwLock::new(Shared {
                env: Some(env),
                dbs,
                lock_file: Some(lock_file),
                path,
            }),
            writer: Mutex::new(Writer {
                txn: None,
                map_size,
            }),
            has_txn: AtomicBool::new(false),
        })
    }

    fn env_clone(&self) -> Result<Env, StoreError> {
        let shared = self.shared.read().map_err(|_| StoreError::LockError)?;
        Ok(shared.env()?.clone())
    }

    /// Grows the mapped file to at least `new_size` (rounded up to the page
    /// size). The caller must hold the writer lock with no open write
    /// transaction; the shared write lock taken here excludes readers so no
    /// transaction is active during the remap.
    fn resize_map(&self, writer: &mut Writer, new_size: usize) -> Result<(), StoreError> {
        let new_size = round_to_page_size(new_size);
        if new_size <= writer.map_size {
            return Ok(());
        }
        let shared = self.shared.write().map_err(|_| StoreError::LockError)?;
        let env = shared.env()?;
        unsafe { env.resize(new_size) }.map_err(StoreError::from)?;
        debug!(old = writer.map_size, new = new_size, "grew lmdb map");
        writer.map_size = new_size;
        Ok(())
    }

    /// Reads through the open write transaction when one is active (so
    /// staged writes are visible), otherwise through a throwaway snapshot.
    fn with_snapshot<R>(
        &self,
        f: impl FnOnce(&Shared, &heed3::RoTxn<WithoutTls>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        if self.has_txn.load(Ordering::Acquire) {
            let writer = self.writer.lock().map_err(|_| StoreError::LockError)?;
            if let Some(txn) = writer.txn.as_ref() {
                let wtxn = txn.wtxn.as_ref().ok_or_else(|| {
                    StoreError::TransactionState("write transaction already consumed".to_string())
                })?;
                let shared = self.shared.read().map_err(|_| StoreError::LockError)?;
                return f(&shared, wtxn);
            }
        }
        let shared = self.shared.read().map_err(|_| StoreError::LockError)?;
        let env = shared.env()?;
        let rtxn = env.read_txn().map_err(StoreError::from)?;
        f(&shared, &rtxn)
    }

    /// Applies a mutation outside any user transaction: one internal
    /// transaction per call, retried with a doubled map on `MDB_MAP_FULL`.
    fn mutate(&self, op: StagedOp) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().map_err(|_| StoreError::LockError)?;
        if writer.txn.is_some() {
            return self.mutate_in_txn(&mut writer, op);
        }

        let (env, db) = {
            let shared = self.shared.read().map_err(|_| StoreError::LockError)?;
            (shared.env()?.clone(), shared.db(op.index())?)
        };
        let mut growths = 0usize;
        loop {
            let mut wtxn = env.write_txn().map_err(StoreError::from)?;
            let step = match apply_op(db, &mut wtxn, &op) {
                Ok(()) => wtxn.commit(),
                Err(err) => {
                    wtxn.abort();
                    Err(err)
                }
            };
            match step {
                Ok(()) => return Ok(()),
                Err(err) if is_map_full(&err) => {
                    if growths == MAX_MAP_GROWTHS {
                        error!("lmdb map growth budget exhausted");
                        return Err(StoreError::OutOfSpace);
                    }
                    growths += 1;
                    let target = writer.map_size.saturating_mul(2);
                    self.resize_map(&mut writer, target)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Applies a mutation inside the open user transaction, journaling it so
    /// the transaction can be replayed after a map resize.
    fn mutate_in_txn(&self, writer: &mut Writer, op: StagedOp) -> Result<(), StoreError> {
        let db = {
            let shared = self.shared.read().map_err(|_| StoreError::LockError)?;
            shared.db(op.index())?
        };
        {
            let txn = writer.txn.as_mut().ok_or_else(|| {
                StoreError::TransactionState("no open write transaction".to_string())
            })?;
            txn.journal.push(op.clone());
            let wtxn = txn.wtxn.as_mut().ok_or_else(|| {
                StoreError::TransactionState("write transaction already consumed".to_string())
            })?;
            match apply_op(db, wtxn, &op) {
                Ok(()) => return Ok(()),
                Err(err) if is_map_full(&err) => {}
                Err(err) => {
                    txn.journal.pop();
                    return Err(err.into());
                }
            }
        }
        // The staged write no longer fits: abort, grow, replay the journal.
        let Some(mut txn) = writer.txn.take() else {
            return Err(StoreError::TransactionState(
                "no open write transaction".to_string(),
            ));
        };
        if let Some(wtxn) = txn.wtxn.take() {
            wtxn.abort();
        }
        let journal = std::mem::take(&mut txn.journal);
        let growths = txn.growths;
        drop(txn);
        self.rebuild_txn(writer, journal, growths)
    }

    /// Doubles the map and rebuilds the open transaction by replaying
    /// `journal` into a fresh one, growing again if the replay still does
    /// not fit. On success the rebuilt transaction is installed back into
    /// `writer`.
    fn rebuild_txn(
        &self,
        writer: &mut Writer,
        journal: Vec<StagedOp>,
        mut growths: usize,
    ) -> Result<(), StoreError> {
        loop {
            growths += 1;
            if growths > MAX_MAP_GROWTHS {
                error!(
                    staged_ops = journal.len(),
                    "lmdb map growth budget exhausted while replaying transaction"
                );
                return Err(StoreError::OutOfSpace);
            }
            let target = writer.map_size.saturating_mul(2);
            self.resize_map(writer, target)?;

            let env = self.env_clone()?;
            let mut txn = OpenTxn::open(env)?;
            txn.growths = growths;
            let mut map_full = false;
            {
                let shared = self.shared.read().map_err(|_| StoreError::LockError)?;
                let wtxn = txn.wtxn.as_mut().ok_or_else(|| {
                    StoreError::TransactionState("write transaction already consumed".to_string())
                })?;
                for op in &journal {
                    let db = shared.db(op.index())?;
                    match apply_op(db, wtxn, op) {
                        Ok(()) => {}
                        Err(err) if is_map_full(&err) => {
                            map_full = true;
                            break;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
            if map_full {
                continue;
            }
            debug!(
                staged_ops = journal.len(),
                growths, "replayed write transaction after map growth"
            );
            txn.journal = journal;
            writer.txn = Some(txn);
            return Ok(());
        }
    }
}

fn apply_op(db: Db, wtxn: &mut heed3::RwTxn, op: &StagedOp) -> Result<(), heed3::Error> {
    match op {
        StagedOp::Write { key, value, .. } => db.put(wtxn, key, value),
        StagedOp::Erase { index, key } => {
            if index.duplicate_keys_allowed() {
                // DUP_SORT `get` yields the smallest duplicate; erase removes
                // exactly that one.
                let first = db.get(wtxn, key)?.map(<[u8]>::to_vec);
                if let Some(value) = first {
                    db.delete_one_duplicate(wtxn, key, &value)?;
                }
                Ok(())
            } else {
                db.delete(wtxn, key).map(|_| ())
            }
        }
        StagedOp::EraseAll { key, .. } => db.delete(wtxn, key).map(|_| ()),
        StagedOp::Clear { .. } => db.clear(wtxn),
    }
}

fn read_first(
    db: Db,
    txn: &heed3::RoTxn<WithoutTls>,
    key: &[u8],
) -> Result<Option<Vec<u8>>, StoreError> {
    Ok(db.get(txn, key).map_err(StoreError::from)?.map(<[u8]>::to_vec))
}

fn read_values(
    db: Db,
    txn: &heed3::RoTxn<WithoutTls>,
    index: Index,
    key: &[u8],
) -> Result<Vec<Vec<u8>>, StoreError> {
    if index.duplicate_keys_allowed() {
        let mut values = Vec::new();
        if let Some(iter) = db.get_duplicates(txn, key).map_err(StoreError::from)? {
            for item in iter {
                let (_, value) = item.map_err(StoreError::from)?;
                values.push(value.to_vec());
            }
        }
        Ok(values)
    } else {
        Ok(read_first(db, txn, key)?.into_iter().collect())
    }
}

fn read_table(db: Db, txn: &heed3::RoTxn<WithoutTls>) -> Result<IndexContents, StoreError> {
    let mut contents = IndexContents::new();
    for item in db.iter(txn).map_err(StoreError::from)? {
        let (key, value) = item.map_err(StoreError::from)?;
        contents
            .entry(key.to_vec())
            .or_default()
            .push(value.to_vec());
    }
    Ok(contents)
}

fn count_keys(db: Db, txn: &heed3::RoTxn<WithoutTls>, index: Index) -> Result<usize, StoreError> {
    if !index.duplicate_keys_allowed() {
        return Ok(db.len(txn).map_err(StoreError::from)? as usize);
    }
    // DUP_SORT entry counts include duplicates; walk the keys instead.
    let mut count = 0usize;
    let mut prev: Option<Vec<u8>> = None;
    for item in db.iter(txn).map_err(StoreError::from)? {
        let (key, _) = item.map_err(StoreError::from)?;
        if prev.as_deref() != Some(key) {
            count += 1;
            prev = Some(key.to_vec());
        }
    }
    Ok(count)
}

impl StoreEngine for LmdbBackend {
    fn write(&self, index: Index, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        validate_value(index, value)?;
        self.mutate(StagedOp::Write {
            index,
            key: key.to_vec(),
            value: value.to_vec(),
        })
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
        self.with_snapshot(|shared, txn| {
            let db = shared.db(index)?;
            Ok(read_first(db, txn, key)?.map(|value| slice_value(&value, offset, size)))
        })
    }

    fn read_multiple(&self, index: Index, key: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        if validate_key(key).is_err() {
            return Ok(Vec::new());
        }
        self.with_snapshot(|shared, txn| read_values(shared.db(index)?, txn, index, key))
    }

    fn read_all(&self, index: Index) -> Result<IndexContents, StoreError> {
        self.with_snapshot(|shared, txn| read_table(shared.db(index)?, txn))
    }

    fn exists(&self, index: Index, key: &[u8]) -> Result<bool, StoreError> {
        if validate_key(key).is_err() {
            return Ok(false);
        }
        self.with_snapshot(|shared, txn| {
            let db = shared.db(index)?;
            Ok(db.get(txn, key).map_err(StoreError::from)?.is_some())
        })
    }

    fn erase(&self, index: Index, key: &[u8]) -> Result<(), StoreError> {
        if validate_key(key).is_err() {
            return Ok(());
        }
        self.mutate(StagedOp::Erase {
            index,
            key: key.to_vec(),
        })
    }

    fn erase_all(&self, index: Index, key: &[u8]) -> Result<(), StoreError> {
        if validate_key(key).is_err() {
            return Ok(());
        }
        self.mutate(StagedOp::EraseAll {
            index,
            key: key.to_vec(),
        })
    }

    fn clear_db(&self, index: Index) -> Result<(), StoreError> {
        self.mutate(StagedOp::Clear { index })
    }

    fn len(&self, index: Index) -> Result<usize, StoreError> {
        self.with_snapshot(|shared, txn| count_keys(shared.db(index)?, txn, index))
    }

    fn begin_db_transaction(&self, size_hint: usize) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().map_err(|_| StoreError::LockError)?;
        if writer.txn.is_some() {
            return Err(StoreError::TransactionState(
                "write transaction already open".to_string(),
            ));
        }
        if size_hint > 0 {
            let wanted = size_hint.saturating_mul(2);
            if wanted > writer.map_size {
                self.resize_map(&mut writer, wanted)?;
            }
        }
        let env = self.env_clone()?;
        writer.txn = Some(OpenTxn::open(env)?);
        self.has_txn.store(true, Ordering::Release);
        Ok(())
    }

    fn commit_db_transaction(&self) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().map_err(|_| StoreError::LockError)?;
        loop {
            let Some(mut txn) = writer.txn.take() else {
                return Err(StoreError::TransactionState(
                    "no open write transaction".to_string(),
                ));
            };
            let journal = std::mem::take(&mut txn.journal);
            let growths = txn.growths;
            let Some(wtxn) = txn.wtxn.take() else {
                return Err(StoreError::TransactionState(
                    "write transaction already consumed".to_string(),
                ));
            };
            match wtxn.commit() {
                Ok(()) => {
                    drop(txn);
                    self.has_txn.store(false, Ordering::Release);
                    return Ok(());
                }
                Err(err) if is_map_full(&err) => {
                    drop(txn);
                    debug!(
                        staged_ops = journal.len(),
                        "commit hit a full map; growing and replaying"
                    );
                    if let Err(err) = self.rebuild_txn(&mut writer, journal, growths) {
                        self.has_txn.store(false, Ordering::Release);
                        return Err(err);
                    }
                    // retry the commit on the rebuilt transaction
                }
                Err(err) => {
                    drop(txn);
                    self.has_txn.store(false, Ordering::Release);
                    return Err(err.into());
                }
            }
        }
    }

    fn abort_db_transaction(&self) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().map_err(|_| StoreError::LockError)?;
        let Some(mut txn) = writer.txn.take() else {
            return Err(StoreError::TransactionState(
                "no open write transaction".to_string(),
            ));
        };
        if let Some(wtxn) = txn.wtxn.take() {
            wtxn.abort();
        }
        drop(txn);
        self.has_txn.store(false, Ordering::Release);
        Ok(())
    }

    fn flush(&self, _size_budget: Option<usize>) -> Result<bool, StoreError> {
        let shared = self.shared.read().map_err(|_| StoreError::LockError)?;
        shared.env()?.force_sync().map_err(StoreError::from)?;
        Ok(false)
    }

    fn flush_count(&self) -> u64 {
        0
    }

    fn clear_cache(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().map_err(|_| StoreError::LockError)?;
        if let Some(mut txn) = writer.txn.take() {
            warn!("closing lmdb store with an open write transaction; aborting it");
            if let Some(wtxn) = txn.wtxn.take() {
                wtxn.abort();
            }
        }
        self.has_txn.store(false, Ordering::Release);
        let mut shared = self.shared.write().map_err(|_| StoreError::LockError)?;
        if let Some(env) = shared.env.take() {
            env.force_sync().map_err(StoreError::from)?;
            info!(path = %shared.path.display(), "closed lmdb store");
        }
        shared.dbs.clear();
        shared.lock_file = None;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn open_store(dir: &TempDir, clear: bool) -> LmdbBackend {
        LmdbBackend::open(dir.path().join("db"), clear).unwrap()
    }

    #[test]
    fn test_round_trip_and_erase() {
        let dir = TempDir::new("lmdb-round-trip").unwrap();
        let store = open_store(&dir, true);

        store.write(Index::Main, b"key1", b"val1").unwrap();
        assert_eq!(store.read(Index::Main, b"key1").unwrap(), Some(b"val1".to_vec()));
        assert!(store.exists(Index::Main, b"key1").unwrap());

        store.erase(Index::Main, b"key1").unwrap();
        assert_eq!(store.read(Index::Main, b"key1").unwrap(), None);
        assert!(!store.exists(Index::Main, b"key1").unwrap());
    }

    #[test]
    fn test_reopen_preserves_committed_state() {
        let dir = TempDir::new("lmdb-reopen").unwrap();
        {
            let store = open_store(&dir, true);
            store.write(Index::Blocks, b"height", b"42").unwrap();
            store.close().unwrap();
        }
        let store = open_store(&dir, false);
        assert_eq!(
            store.read(Index::Blocks, b"height").unwrap(),
            Some(b"42".to_vec())
        );
    }

    #[test]
    fn test_clear_before_open_wipes_data() {
        let dir = TempDir::new("lmdb-clear").unwrap();
        {
            let store = open_store(&dir, true);
            store.write(Index::Main, b"key", b"value").unwrap();
            store.close().unwrap();
        }
        let store = open_store(&dir, true);
        assert!(!store.exists(Index::Main, b"key").unwrap());
    }

    #[test]
    fn test_second_open_conflicts() {
        let dir = TempDir::new("lmdb-conflict").unwrap();
        let _store = open_store(&dir, true);
        assert!(matches!(
            LmdbBackend::open(dir.path().join("db"), false),
            Err(StoreError::Conflict)
        ));
    }

    #[test]
    fn test_duplicate_index_semantics() {
        let dir = TempDir::new("lmdb-dup").unwrap();
        let store = open_store(&dir, true);
        let index = Index::Ntp1TokenNames;

        store.write(index, b"token", b"beta").unwrap();
        store.write(index, b"token", b"alpha").unwrap();
        store.write(index, b"token", b"gamma").unwrap();
        store.write(index, b"token", b"alpha").unwrap();

        assert_eq!(
            store.read_multiple(index, b"token").unwrap(),
            vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]
        );
        assert_eq!(store.read(index, b"token").unwrap(), Some(b"alpha".to_vec()));
        assert_eq!(store.len(index).unwrap(), 1);

        store.erase(index, b"token").unwrap();
        assert_eq!(
            store.read_multiple(index, b"token").unwrap(),
            vec![b"beta".to_vec(), b"gamma".to_vec()]
        );
        store.erase_all(index, b"token").unwrap();
        assert!(!store.exists(index, b"token").unwrap());
    }

    #[test]
    fn test_oversized_duplicate_value_rejected() {
        let dir = TempDir::new("lmdb-dup-limit").unwrap();
        let store = open_store(&dir, true);
        let oversized = vec![0u8; 509];
        assert!(matches!(
            store.write(Index::AddrsVsPubKeys, b"addr", &oversized),
            Err(StoreError::InvalidArgument(_))
        ));
        // single-valued indexes accept large values
        store.write(Index::Blocks, b"block", &vec![0u8; 10 * 1024]).unwrap();
    }

    #[test]
    fn test_transaction_visibility_and_abort() {
        let dir = TempDir::new("lmdb-txn").unwrap();
        let store = open_store(&dir, true);

        store.write(Index::Main, b"before", b"kept").unwrap();
        store.begin_db_transaction(0).unwrap();
        store.write(Index::Main, b"staged", b"value").unwrap();
        // read-your-writes inside the transaction
        assert!(store.exists(Index::Main, b"staged").unwrap());
        store.abort_db_transaction().unwrap();

        assert!(!store.exists(Index::Main, b"staged").unwrap());
        assert!(store.exists(Index::Main, b"before").unwrap());
    }

    #[test]
    fn test_nested_begin_fails() {
        let dir = TempDir::new("lmdb-nested").unwrap();
        let store = open_store(&dir, true);
        store.begin_db_transaction(0).unwrap();
        assert!(matches!(
            store.begin_db_transaction(0),
            Err(StoreError::TransactionState(_))
        ));
        store.abort_db_transaction().unwrap();
    }

    #[test]
    fn test_commit_without_begin_fails() {
        let dir = TempDir::new("lmdb-no-txn").unwrap();
        let store = open_store(&dir, true);
        assert!(matches!(
            store.commit_db_transaction(),
            Err(StoreError::TransactionState(_))
        ));
    }
}
