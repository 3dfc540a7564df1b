use std::fmt;

use http::StatusCode;
use thiserror::Error;

use crate::cache::{CachedRequest, StorageError};
use crate::options::RequestSummary;

/// Which bounded wait ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Connect,
    Headers,
    Body,
    /// The cache layer's overall wait for response headers.
    Revalidation,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutPhase::Connect => "connect",
            TimeoutPhase::Headers => "headers",
            TimeoutPhase::Body => "body",
            TimeoutPhase::Revalidation => "revalidation",
        })
    }
}

/// Coarse classification used by retry and degrade decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connect,
    Protocol,
    Timeout(TimeoutPhase),
    Socket,
    CacheStorage,
    SecurityViolation,
    Aborted,
    InvalidRequest,
    NotSupported,
}

/// Errors delivered through `on_error`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("connect error: {0}")]
    Connect(String),

    /// The proxy answered the `CONNECT` with something other than `200`.
    #[error("tunnel not established: proxy answered {status}")]
    TunnelNotEstablished { status: StatusCode },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{phase} timeout")]
    Timeout { phase: TimeoutPhase },

    #[error("socket error: {0}")]
    Socket(String),

    #[error("cache storage error: {0}")]
    CacheStorage(#[from] StorageError),

    #[error("security violation: {0}")]
    SecurityViolation(String),

    #[error("request aborted")]
    Aborted,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    /// Failure of a pooled request, tagged with what was being sent.
    #[error("{request}: {source}")]
    WithRequest {
        request: RequestSummary,
        #[source]
        source: Box<DispatchError>,
    },

    /// Failure that still has a usable (possibly stale) cached response.
    #[error("{source} (cached response available)")]
    WithCache {
        cached: Box<CachedRequest>,
        #[source]
        source: Box<DispatchError>,
    },
}

impl DispatchError {
    pub(crate) fn timeout(phase: TimeoutPhase) -> Self {
        DispatchError::Timeout { phase }
    }

    #[must_use]
    pub fn with_request(self, request: RequestSummary) -> Self {
        DispatchError::WithRequest {
            request,
            source: Box::new(self),
        }
    }

    #[must_use]
    pub fn with_cache(self, cached: CachedRequest) -> Self {
        DispatchError::WithCache {
            cached: Box::new(cached),
            source: Box::new(self),
        }
    }

    /// The underlying error with all decorations peeled off.
    #[must_use]
    pub fn root(&self) -> &DispatchError {
        match self {
            DispatchError::WithRequest { source, .. } | DispatchError::WithCache { source, .. } => {
                source.root()
            }
            other => other,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            DispatchError::Connect(_) => ErrorKind::Connect,
            DispatchError::TunnelNotEstablished { .. } | DispatchError::Protocol(_) => {
                ErrorKind::Protocol
            }
            DispatchError::Timeout { phase } => ErrorKind::Timeout(*phase),
            DispatchError::Socket(_) => ErrorKind::Socket,
            DispatchError::CacheStorage(_) => ErrorKind::CacheStorage,
            DispatchError::SecurityViolation(_) => ErrorKind::SecurityViolation,
            DispatchError::Aborted => ErrorKind::Aborted,
            DispatchError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            DispatchError::NotSupported(_)
            | DispatchError::WithRequest { .. }
            | DispatchError::WithCache { .. } => ErrorKind::NotSupported,
        }
    }

    /// The request summary attached by the pool router, if any.
    #[must_use]
    pub fn request(&self) -> Option<&RequestSummary> {
        match self {
            DispatchError::WithRequest { request, .. } => Some(request),
            DispatchError::WithCache { source, .. } => source.request(),
            _ => None,
        }
    }

    /// The cached response attached by the cache layer, if any.
    #[must_use]
    pub fn cached(&self) -> Option<&CachedRequest> {
        match self {
            DispatchError::WithCache { cached, .. } => Some(cached),
            DispatchError::WithRequest { source, .. } => source.cached(),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.kind() == ErrorKind::Aborted
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout(_))
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => DispatchError::timeout(TimeoutPhase::Connect),
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::AddrNotAvailable
            | std::io::ErrorKind::NotFound => DispatchError::Connect(err.to_string()),
            _ => DispatchError::Socket(err.to_string()),
        }
    }
}

impl From<hyper::Error> for DispatchError {
    fn from(err: hyper::Error) -> Self {
        if err.is_parse() || err.is_parse_status() || err.is_user() {
            DispatchError::Protocol(err.to_string())
        } else if err.is_timeout() {
            DispatchError::timeout(TimeoutPhase::Body)
        } else if err.is_canceled() {
            DispatchError::Aborted
        } else {
            DispatchError::Socket(err.to_string())
        }
    }
}
