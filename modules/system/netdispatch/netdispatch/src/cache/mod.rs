//! HTTP response cache sitting in front of the network dispatchers.

mod dispatcher;
mod entry;
mod handler;
pub mod policy;
mod storage;

pub use dispatcher::CacheDispatcher;
pub use entry::CachedRequest;
pub use policy::{CacheControl, CachePolicy, PolicyRequest, PolicyResponse, Revalidated};
pub use storage::{
    CacheStorage, JsonCacheStorage, MemoryStorage, StorageAdapter, StorageError, cache_key,
};
