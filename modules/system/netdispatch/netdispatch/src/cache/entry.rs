use std::time::SystemTime;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::StorageError;
use super::policy::{CachePolicy, PolicyRequest};
use crate::headers::HeaderRecord;
use crate::options::DispatchOptions;

/// A stored response: policy, body and trailers.
///
/// Serialized as a three element JSON array `[policy, base64 body, trailers]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireEntry", try_from = "WireEntry")]
pub struct CachedRequest {
    policy: CachePolicy,
    body: Bytes,
    trailers: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct WireEntry(CachePolicy, String, Vec<String>);

impl From<CachedRequest> for WireEntry {
    fn from(entry: CachedRequest) -> Self {
        WireEntry(entry.policy, STANDARD.encode(&entry.body), entry.trailers)
    }
}

impl TryFrom<WireEntry> for CachedRequest {
    type Error = base64::DecodeError;

    fn try_from(WireEntry(policy, body, trailers): WireEntry) -> Result<Self, Self::Error> {
        Ok(Self {
            policy,
            body: Bytes::from(STANDARD.decode(body)?),
            trailers,
        })
    }
}

impl CachedRequest {
    #[must_use]
    pub fn new(policy: CachePolicy, body: Bytes, trailers: Vec<String>) -> Self {
        Self {
            policy,
            body,
            trailers,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    #[must_use]
    pub fn trailers(&self) -> &[String] {
        &self.trailers
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.policy.status()
    }

    /// Headers as they should be replayed at `now`.
    #[must_use]
    pub fn headers(&self, now: SystemTime) -> HeaderRecord {
        self.policy.response_headers(now)
    }

    /// Whether `opts` needs a network round trip before this entry can answer it.
    #[must_use]
    pub fn is_expired(&self, opts: &DispatchOptions, now: SystemTime) -> bool {
        let Ok(url) = opts.url() else {
            return true;
        };
        !self.policy.satisfies_without_revalidation(
            PolicyRequest {
                method: &opts.method,
                url: url.as_str(),
                headers: &opts.headers,
            },
            now,
        )
    }

    /// Decodes the body as JSON; an empty body is `None`.
    ///
    /// # Errors
    /// Returns the `serde_json` error for a non-empty body that does not decode.
    pub fn body_json<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        if self.body.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&self.body).map(Some)
    }

    /// Serialized storage form.
    ///
    /// # Errors
    /// Returns [`StorageError::Corrupt`] when serialization fails.
    pub fn to_json(&self) -> Result<Bytes, StorageError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| StorageError::Corrupt(e.to_string()))
    }

    /// # Errors
    /// Returns [`StorageError::Corrupt`] for bytes that are not a stored entry.
    pub fn from_json(bytes: &[u8]) -> Result<Self, StorageError> {
        serde_json::from_slice(bytes).map_err(|e| StorageError::Corrupt(e.to_string()))
    }

    #[must_use]
    pub fn into_parts(self) -> (CachePolicy, Bytes, Vec<String>) {
        (self.policy, self.body, self.trailers)
    }
}
