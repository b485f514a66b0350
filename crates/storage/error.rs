use thiserror::Error;

/// Errors surfaced by every storage engine and cache layer.
///
/// Cache layers never swallow errors from the layer below; they convert and
/// propagate them unchanged.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("map growth budget exhausted")]
    OutOfSpace,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("transaction state: {0}")]
    TransactionState(String),
    #[error("store is locked by another writer")]
    Conflict,
    #[error("store already closed")]
    Closed,
    #[error("failed to lock engine state")]
    LockError,
    #[error("{0}")]
    Custom(String),
}

impl From<heed3::Error> for StoreError {
    fn from(err: heed3::Error) -> Self {
        match err {
            heed3::Error::Io(io) => StoreError::Io(io),
            heed3::Error::Mdb(mdb) => match mdb {
                heed3::MdbError::MapFull => StoreError::OutOfSpace,
                heed3::MdbError::Corrupted
                | heed3::MdbError::Invalid
                | heed3::MdbError::PageNotFound
                | heed3::MdbError::VersionMismatch => StoreError::Corruption(mdb.to_string()),
                heed3::MdbError::BadValSize => StoreError::InvalidArgument(
                    "key or value exceeds the backend size limits".to_string(),
                ),
                heed3::MdbError::BadTxn => {
                    StoreError::TransactionState("write transaction must be aborted".to_string())
                }
                other => StoreError::Custom(other.to_string()),
            },
            heed3::Error::EnvAlreadyOpened => StoreError::Conflict,
            other => StoreError::Custom(other.to_string()),
        }
    }
}
