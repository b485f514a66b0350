mod api;
mod cache;
mod error;

pub mod backend;

pub use api::{Index, IndexContents, MAX_DUP_VALUE_SIZE, MAX_KEY_SIZE, StoreEngine};
pub use backend::in_memory::InMemoryBackend;
pub use backend::lmdb::LmdbBackend;
pub use cache::lru::LruCache;
pub use cache::read_through::ReadThroughCache;
pub use cache::write_batch::WriteBatchCache;
pub use cache::{total_lru_flushes, total_write_batch_flushes};
pub use error::StoreError;
