//! Persistence of cached responses.
//!
//! [`StorageAdapter`] is the two-method contract a backing store has to meet.
//! [`JsonCacheStorage`] turns dispatch options into keys and entries into JSON
//! on top of any adapter. Concurrent writers of the same key are not
//! serialized: two requests that both miss will both write, and the last
//! write wins.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::Method;
use pingora_memory_cache::MemoryCache;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::entry::CachedRequest;
use crate::clock::Clock;
use crate::options::{DispatchOptions, RequestBody};

/// Errors from a storage backend. Never fatal to a dispatch.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("corrupt cache entry: {0}")]
    Corrupt(String),
}

/// Key/value store holding serialized entries.
#[async_trait::async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError>;

    /// Stores `value` for at least `ttl`.
    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StorageError>;
}

/// Entry lookup keyed by dispatch options.
#[async_trait::async_trait]
pub trait CacheStorage: Send + Sync {
    /// Read failures and undecodable entries are reported as a miss.
    async fn get(&self, opts: &DispatchOptions) -> Option<CachedRequest>;

    /// Write failures are logged and otherwise ignored.
    async fn put(&self, opts: &DispatchOptions, entry: CachedRequest);
}

/// Cache key for `opts`, or `None` when the request cannot be cached.
///
/// The key is `METHOD:url`; POST, PATCH and PUT requests with a buffered or
/// form body get a `:sha256` suffix over the body. Streamed bodies are never
/// cached.
#[must_use]
pub fn cache_key(opts: &DispatchOptions) -> Option<String> {
    let url = opts.url().ok()?;
    let mut key = format!("{}:{url}", opts.method);

    if matches!(opts.method, Method::POST | Method::PATCH | Method::PUT) {
        let mut hash = Sha256::new();
        match &opts.body {
            RequestBody::Empty => return Some(key),
            RequestBody::Stream(_) => return None,
            RequestBody::Bytes(bytes) => hash.update(bytes),
            RequestBody::Form(fields) => {
                for field in fields {
                    hash.update(field.name.as_bytes());
                    hash.update(field.value_bytes());
                }
            }
        }
        key.push(':');
        key.push_str(&STANDARD.encode(hash.finalize()));
    } else if opts.body.is_stream() {
        return None;
    }
    Some(key)
}

/// JSON entries over a [`StorageAdapter`].
pub struct JsonCacheStorage<A> {
    adapter: A,
    clock: std::sync::Arc<dyn Clock>,
    /// Extra time stale entries are kept for revalidation and degraded answers.
    stale_retention: Duration,
}

impl<A: StorageAdapter> JsonCacheStorage<A> {
    pub fn new(adapter: A, clock: std::sync::Arc<dyn Clock>, stale_retention: Duration) -> Self {
        Self {
            adapter,
            clock,
            stale_retention,
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }
}

#[async_trait::async_trait]
impl<A: StorageAdapter> CacheStorage for JsonCacheStorage<A> {
    async fn get(&self, opts: &DispatchOptions) -> Option<CachedRequest> {
        let key = cache_key(opts)?;
        match self.adapter.get(&key).await {
            Ok(Some(bytes)) => match CachedRequest::from_json(&bytes) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(target: "netdispatch::cache", %key, error = %e, "discarding unreadable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(target: "netdispatch::cache", %key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn put(&self, opts: &DispatchOptions, entry: CachedRequest) {
        let Some(key) = cache_key(opts) else {
            return;
        };
        let ttl = entry.policy().time_to_live(self.clock.now()) + self.stale_retention;
        if ttl.is_zero() {
            return;
        }
        let value = match entry.to_json() {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(target: "netdispatch::cache", %key, error = %e, "cache entry not serializable");
                return;
            }
        };
        if let Err(e) = self.adapter.put(&key, value, ttl).await {
            tracing::warn!(target: "netdispatch::cache", %key, error = %e, "cache write failed");
        }
    }
}

/// In-process adapter on top of `pingora-memory-cache`.
///
/// The underlying cache indexes by key hash, so the original key is stored
/// alongside the value and checked on read.
pub struct MemoryStorage {
    cache: MemoryCache<String, (String, Bytes)>,
}

impl MemoryStorage {
    /// `capacity` is the number of entries kept before eviction.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: MemoryCache::new(capacity),
        }
    }
}

#[async_trait::async_trait]
impl StorageAdapter for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        let (hit, _status) = self.cache.get(&key.to_owned());
        Ok(hit.and_then(|(stored_key, value)| (stored_key == key).then_some(value)))
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StorageError> {
        let key = key.to_owned();
        self.cache.put(&key, (key.clone(), value), Some(ttl));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use http::StatusCode;

    use super::*;
    use crate::cache::policy::{CachePolicy, PolicyRequest, PolicyResponse};
    use crate::clock::SystemClock;
    use crate::headers::HeaderRecord;
    use crate::options::FormField;

    struct BrokenAdapter;

    #[async_trait::async_trait]
    impl StorageAdapter for BrokenAdapter {
        async fn get(&self, _key: &str) -> Result<Option<Bytes>, StorageError> {
            Err(StorageError::Backend("disk on fire".into()))
        }

        async fn put(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<(), StorageError> {
            Err(StorageError::Backend("disk on fire".into()))
        }
    }

    fn entry_for(url: &str, now: SystemTime) -> CachedRequest {
        let req = HeaderRecord::new();
        let res: HeaderRecord = [("cache-control", "max-age=60")].into_iter().collect();
        let policy = CachePolicy::new(
            PolicyRequest {
                method: &Method::GET,
                url,
                headers: &req,
            },
            PolicyResponse {
                status: StatusCode::OK,
                headers: &res,
            },
            now,
        );
        CachedRequest::new(policy, Bytes::from_static(b"hello"), vec![])
    }

    #[test]
    fn key_includes_method_and_full_url() {
        let opts = DispatchOptions::get("https://a.example/x?y=1").unwrap();
        assert_eq!(cache_key(&opts).as_deref(), Some("GET:https://a.example/x?y=1"));
    }

    #[test]
    fn post_key_depends_on_body() {
        let mut a = DispatchOptions::get("https://a.example/api").unwrap();
        a.method = Method::POST;
        a.body = RequestBody::from("one");
        let mut b = a.try_clone().unwrap();
        b.body = RequestBody::from("two");

        let ka = cache_key(&a).unwrap();
        let kb = cache_key(&b).unwrap();
        assert!(ka.starts_with("POST:https://a.example/api:"));
        assert_ne!(ka, kb);
    }

    #[test]
    fn form_bodies_hash_names_and_values() {
        let mut a = DispatchOptions::get("https://a.example/form").unwrap();
        a.method = Method::PUT;
        a.body = RequestBody::Form(vec![FormField::text("k", "v")]);
        let mut b = a.try_clone().unwrap();
        b.body = RequestBody::Form(vec![FormField::text("k", "w")]);
        assert_ne!(cache_key(&a), cache_key(&b));
    }

    #[test]
    fn streamed_bodies_have_no_key() {
        let mut opts = DispatchOptions::get("https://a.example/upload").unwrap();
        opts.method = Method::POST;
        opts.body = RequestBody::Stream(Box::pin(futures::stream::empty()));
        assert_eq!(cache_key(&opts), None);
    }

    #[tokio::test]
    async fn memory_storage_round_trip() {
        let storage = JsonCacheStorage::new(
            MemoryStorage::new(16),
            Arc::new(SystemClock),
            Duration::from_secs(60),
        );
        let opts = DispatchOptions::get("https://a.example/x").unwrap();
        assert!(storage.get(&opts).await.is_none());

        let entry = entry_for("https://a.example/x", SystemTime::now());
        storage.put(&opts, entry.clone()).await;
        assert_eq!(storage.get(&opts).await, Some(entry));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn backend_failures_degrade_to_miss() {
        let storage = JsonCacheStorage::new(BrokenAdapter, Arc::new(SystemClock), Duration::ZERO);
        let opts = DispatchOptions::get("https://a.example/x").unwrap();

        storage
            .put(&opts, entry_for("https://a.example/x", SystemTime::now()))
            .await;
        assert!(storage.get(&opts).await.is_none());
        assert!(logs_contain("cache write failed"));
        assert!(logs_contain("cache read failed"));
    }

    #[tokio::test]
    async fn expired_entry_without_retention_is_not_written() {
        let storage = JsonCacheStorage::new(MemoryStorage::new(16), Arc::new(SystemClock), Duration::ZERO);
        let opts = DispatchOptions::get("https://a.example/x").unwrap();

        storage
            .put(&opts, entry_for("https://a.example/x", UNIX_EPOCH))
            .await;
        assert!(storage.get(&opts).await.is_none());
    }
}
