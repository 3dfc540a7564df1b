//! Per-origin HTTP/1.1 connection pool.
//!
//! One request runs on a connection at a time. Finished connections go back
//! to an idle list and are reused until `keep_alive` passes. The open
//! connection cap is read from [`SharedSettings`] each time a connection is
//! about to be opened.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::TryStreamExt;
use http::header::{CONTENT_TYPE, HOST};
use http::{HeaderMap, HeaderValue, Request, StatusCode, Uri};
use http_body::Frame;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{BoxedIo, Connect, ConnectTarget};
use crate::config::{ConnectionLimit, PoolConfig, SharedSettings};
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, TimeoutPhase};
use crate::handler::{AbortSignal, DispatchHandler, Flow, Resume};
use crate::headers::HeaderRecord;
use crate::options::{BoxError, DispatchOptions, RequestBody, encode_multipart};

type OutgoingBody = UnsyncBoxBody<Bytes, BoxError>;

/// Point-in-time counters of one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Open connections, busy or idle.
    pub connected: usize,
    /// Idle connections ready for reuse.
    pub free: usize,
    /// Connections being established.
    pub pending: usize,
    /// Requests waiting for a connection.
    pub queued: usize,
    /// Requests in flight.
    pub running: usize,
    /// `queued + running`.
    pub size: usize,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<IdleConnection>,
    connected: usize,
    connecting: usize,
    queued: usize,
    running: usize,
    closed: bool,
}

struct IdleConnection {
    sender: SendRequest<OutgoingBody>,
    since: Instant,
}

enum Step {
    Reuse(SendRequest<OutgoingBody>),
    Open,
    Wait,
}

enum Outcome {
    Complete(Vec<String>),
    Upgrade(StatusCode, HeaderRecord, BoxedIo),
}

struct PoolInner {
    origin: String,
    target: ConnectTarget,
    host_header: String,
    connector: Arc<dyn Connect>,
    config: PoolConfig,
    settings: SharedSettings,
    state: Mutex<PoolState>,
    available: Notify,
}

/// Connection pool for a single origin.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("origin", &self.inner.origin)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// # Errors
    /// Returns [`DispatchError::InvalidRequest`] when `origin` is not an
    /// http(s) URL with a host.
    pub fn new(
        origin: &Url,
        connector: Arc<dyn Connect>,
        mut config: PoolConfig,
        settings: SharedSettings,
    ) -> Result<Self, DispatchError> {
        let target = ConnectTarget::from_origin(origin)?;
        let host = origin.host_str().unwrap_or(&target.host);
        let host_header = match origin.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };
        if config.pipelining > 1 {
            tracing::warn!(
                origin = %origin.origin().ascii_serialization(),
                pipelining = config.pipelining,
                "HTTP/1.1 pipelining is not supported, using one request per connection"
            );
            config.pipelining = 1;
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                origin: origin.origin().ascii_serialization(),
                target,
                host_header,
                connector,
                config,
                settings,
                state: Mutex::new(PoolState::default()),
                available: Notify::new(),
            }),
        })
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            connected: state.connected,
            free: state.idle.len(),
            pending: state.connecting,
            queued: state.queued,
            running: state.running,
            size: state.queued + state.running,
        }
    }

    /// Drops idle connections and fails every later request. Requests in
    /// flight finish on their connections.
    pub fn close(&self) {
        let idle = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        drop(idle);
        self.inner.available.notify_waiters();
    }
}

impl Dispatcher for Pool {
    fn dispatch(&self, opts: DispatchOptions, handler: Box<dyn DispatchHandler>) {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run(opts, handler).await });
    }
}

impl PoolInner {
    fn limit(&self) -> Option<usize> {
        match self.config.connections {
            ConnectionLimit::MaxSockets => self.settings.load().socket_limit(),
            ConnectionLimit::Unbounded => None,
            ConnectionLimit::Fixed(n) => Some(n),
        }
    }

    async fn run(self: Arc<Self>, opts: DispatchOptions, mut handler: Box<dyn DispatchHandler>) {
        let abort = AbortSignal::from(
            opts.signal
                .as_ref()
                .map(CancellationToken::child_token)
                .unwrap_or_default(),
        );
        handler.on_connect(abort.clone());

        let outcome = tokio::select! {
            biased;
            () = abort.token().cancelled() => Err(DispatchError::Aborted),
            outcome = self.exchange(opts, handler.as_mut()) => outcome,
        };
        match outcome {
            Ok(Outcome::Complete(trailers)) => handler.on_complete(trailers),
            Ok(Outcome::Upgrade(status, headers, io)) => handler.on_upgrade(status, &headers, io),
            Err(err) => handler.on_error(err),
        }
    }

    async fn exchange(
        self: &Arc<Self>,
        opts: DispatchOptions,
        handler: &mut dyn DispatchHandler,
    ) -> Result<Outcome, DispatchError> {
        let (request, sent) = self.build_request(opts)?;
        let (mut sender, lease) = self.acquire().await?;

        let mut response =
            match tokio::time::timeout(self.config.headers_timeout, sender.send_request(request)).await {
                Err(_) => return Err(DispatchError::timeout(TimeoutPhase::Headers)),
                Ok(response) => response?,
            };
        if let Some(sent) = sent {
            handler.on_body_sent(sent.load(Ordering::Relaxed));
        }

        let status = response.status();
        let headers = HeaderRecord::from_header_map(response.headers());
        if status == StatusCode::SWITCHING_PROTOCOLS {
            let upgraded = hyper::upgrade::on(&mut response).await?;
            drop(lease);
            return Ok(Outcome::Upgrade(status, headers, Box::new(TokioIo::new(upgraded))));
        }

        let notify = Arc::new(Notify::new());
        let mut flow = handler.on_headers(status, &headers, Resume::new(notify.clone()));
        let mut body = response.into_body();
        let mut trailers = Vec::new();
        loop {
            if flow == Flow::Pause {
                notify.notified().await;
            }
            let frame = match tokio::time::timeout(self.config.body_timeout, body.frame()).await {
                Err(_) => return Err(DispatchError::timeout(TimeoutPhase::Body)),
                Ok(None) => break,
                Ok(Some(frame)) => frame?,
            };
            flow = match frame.into_data() {
                Ok(chunk) if chunk.is_empty() => Flow::Continue,
                Ok(chunk) => handler.on_data(chunk),
                Err(frame) => {
                    if let Ok(map) = frame.into_trailers() {
                        trailers.extend(flat_trailers(&map));
                    }
                    Flow::Continue
                }
            };
        }

        lease.release(sender);
        Ok(Outcome::Complete(trailers))
    }

    #[allow(clippy::type_complexity)]
    fn build_request(
        &self,
        opts: DispatchOptions,
    ) -> Result<(Request<OutgoingBody>, Option<Arc<AtomicUsize>>), DispatchError> {
        let mut headers = opts.headers.to_header_map()?;
        if !headers.contains_key(HOST) {
            let host = HeaderValue::from_str(&self.host_header)
                .map_err(|e| DispatchError::InvalidRequest(format!("invalid host: {e}")))?;
            headers.insert(HOST, host);
        }

        let uri: Uri = opts
            .path_and_query()
            .parse()
            .map_err(|e| DispatchError::InvalidRequest(format!("invalid request path: {e}")))?;

        let sent = Arc::new(AtomicUsize::new(0));
        let (body, sent) = match opts.body {
            RequestBody::Empty => (empty(), None),
            RequestBody::Bytes(bytes) => {
                sent.store(bytes.len(), Ordering::Relaxed);
                (full(bytes), Some(sent))
            }
            RequestBody::Form(fields) => {
                let boundary = multipart_boundary();
                let content_type = HeaderValue::from_str(&format!("multipart/form-data; boundary={boundary}"))
                    .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;
                headers.insert(CONTENT_TYPE, content_type);
                let bytes = encode_multipart(&fields, &boundary);
                sent.store(bytes.len(), Ordering::Relaxed);
                (full(bytes), Some(sent))
            }
            RequestBody::Stream(stream) => {
                let counter = sent.clone();
                let frames = stream.map_ok(move |chunk| {
                    counter.fetch_add(chunk.len(), Ordering::Relaxed);
                    Frame::data(chunk)
                });
                (StreamBody::new(frames).boxed_unsync(), Some(sent))
            }
        };

        let mut request = Request::builder()
            .method(opts.method)
            .uri(uri)
            .body(body)
            .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;
        *request.headers_mut() = headers;
        Ok((request, sent))
    }

    /// Waits for a usable connection and takes a running slot.
    async fn acquire(self: &Arc<Self>) -> Result<(SendRequest<OutgoingBody>, Lease), DispatchError> {
        loop {
            let step = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(DispatchError::Connect(format!("pool for {} is closed", self.origin)));
                }
                let keep_alive = self.config.keep_alive;
                state
                    .idle
                    .retain(|c| !c.sender.is_closed() && c.since.elapsed() < keep_alive);
                if let Some(conn) = state.idle.pop() {
                    Step::Reuse(conn.sender)
                } else if self.limit().is_none_or(|max| state.connected < max) {
                    state.connected += 1;
                    state.connecting += 1;
                    Step::Open
                } else {
                    state.queued += 1;
                    Step::Wait
                }
            };

            match step {
                Step::Reuse(mut sender) => {
                    if sender.ready().await.is_ok() {
                        return Ok((sender, Lease::take(self)));
                    }
                }
                Step::Open => {
                    let opening = Opening { pool: self, armed: true };
                    let sender = self.open().await?;
                    opening.disarm();
                    return Ok((sender, Lease::take(self)));
                }
                Step::Wait => {
                    let _queued = Queued { pool: self };
                    self.available.notified().await;
                }
            }
        }
    }

    async fn open(self: &Arc<Self>) -> Result<SendRequest<OutgoingBody>, DispatchError> {
        let io = tokio::time::timeout(self.config.connect_timeout, self.connector.connect(&self.target))
            .await
            .map_err(|_| DispatchError::timeout(TimeoutPhase::Connect))??;
        let (sender, conn) = http1::Builder::new()
            .handshake::<_, OutgoingBody>(TokioIo::new(io))
            .await?;
        tracing::debug!(origin = %self.origin, "connection established");

        let pool = self.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                tracing::debug!(origin = %pool.origin, error = %e, "connection closed with error");
            }
            pool.state.lock().connected -= 1;
            pool.available.notify_one();
        });
        Ok(sender)
    }
}

/// A running slot; frees it on drop.
struct Lease {
    pool: Arc<PoolInner>,
}

impl Lease {
    fn take(pool: &Arc<PoolInner>) -> Self {
        pool.state.lock().running += 1;
        Self { pool: pool.clone() }
    }

    /// Returns a still-open connection to the idle list.
    fn release(self, sender: SendRequest<OutgoingBody>) {
        let mut state = self.pool.state.lock();
        if !state.closed && !sender.is_closed() {
            state.idle.push(IdleConnection {
                sender,
                since: Instant::now(),
            });
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.state.lock().running -= 1;
        self.pool.available.notify_one();
    }
}

/// Connection being opened; undoes the slot reservation unless disarmed.
struct Opening<'a> {
    pool: &'a PoolInner,
    armed: bool,
}

impl Opening<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Opening<'_> {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        state.connecting -= 1;
        if self.armed {
            state.connected -= 1;
            drop(state);
            self.pool.available.notify_one();
        }
    }
}

struct Queued<'a> {
    pool: &'a PoolInner,
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.pool.state.lock().queued -= 1;
    }
}

fn empty() -> OutgoingBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| match never {})
        .boxed_unsync()
}

fn full(bytes: Bytes) -> OutgoingBody {
    Full::new(bytes)
        .map_err(|never: Infallible| match never {})
        .boxed_unsync()
}

fn flat_trailers(map: &HeaderMap) -> Vec<String> {
    let mut flat = Vec::with_capacity(map.len() * 2);
    for (name, value) in map {
        flat.push(name.as_str().to_owned());
        flat.push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    flat
}

fn multipart_boundary() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    format!(
        "----netdispatch{:08x}{:08x}",
        nanos,
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}
