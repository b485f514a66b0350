//! This module contains the [`StoreEngine`](crate::api::StoreEngine)
//! implementations backed by actual storage.

/// In memory backend - also the ground-truth oracle in tests
pub mod in_memory;
/// LMDB backend
pub mod lmdb;
