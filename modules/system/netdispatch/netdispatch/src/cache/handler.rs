//! Per-dispatch cache state machine.
//!
//! ```text
//! no entry ─────────► Direct ──────────────► store if storable
//! stale entry ──────► Revalidating ─┬─ 304 ─► reconcile, serve, store
//!                                   ├─ 2xx ─► Modified (as Direct)
//!                                   ├─ error before headers ─► serve stale
//!                                   └─ no headers in time ───► serve stale
//! ```
//!
//! The downstream handler is shared with a timer task so a stalled
//! revalidation can be answered from the stale entry while the network
//! request keeps running and may still refresh the store.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use dashmap::DashSet;
use http::{Method, StatusCode};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::entry::CachedRequest;
use super::policy::{CachePolicy, PolicyRequest, PolicyResponse};
use super::storage::CacheStorage;
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::dispatcher::SharedDispatcher;
use crate::error::{DispatchError, ErrorKind, TimeoutPhase};
use crate::handler::{AbortSignal, DecoratorHandler, DispatchHandler, Flow, Resume};
use crate::headers::HeaderRecord;
use crate::options::{DispatchOptions, RequestSummary};

/// Collaborators shared by every handler a [`super::CacheDispatcher`] creates.
#[derive(Clone)]
pub(crate) struct CacheContext {
    pub(crate) inner: SharedDispatcher,
    pub(crate) storage: Arc<dyn CacheStorage>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: CacheConfig,
    /// Origins that answered a `HEAD` preflight with `405`.
    pub(crate) no_head: Arc<DashSet<String>>,
}

impl CacheContext {
    /// Sends `opts` through the inner dispatcher, adding conditional headers
    /// when `stored` is set and choosing a `HEAD` preflight when allowed.
    pub(crate) fn dispatch(
        &self,
        opts: DispatchOptions,
        handler: Box<dyn DispatchHandler>,
        stored: Option<CachedRequest>,
    ) {
        let Some(snapshot) = opts.try_clone() else {
            self.inner.dispatch(opts, handler);
            return;
        };
        let Ok(url) = opts.url() else {
            self.inner.dispatch(opts, handler);
            return;
        };

        let preflight = stored.is_some()
            && self.config.preflight_head
            && opts.method == Method::GET
            && !self.no_head.contains(&opts.origin_key());

        let cache_handler = CacheHandler::new(
            DecoratorHandler::new(handler),
            snapshot,
            url.to_string(),
            stored,
            preflight,
            self.clone(),
        );
        let outgoing = cache_handler.outgoing(opts);
        self.inner.dispatch(outgoing, Box::new(cache_handler));
    }
}

/// Downstream handler plus the transport abort handle, shared with the timer.
struct Downstream {
    handler: Mutex<Option<DecoratorHandler>>,
    abort: Mutex<Option<AbortSignal>>,
}

impl Downstream {
    fn take(&self) -> Option<DecoratorHandler> {
        self.handler.lock().take()
    }

    fn with<R>(&self, f: impl FnOnce(&mut DecoratorHandler) -> R) -> Option<R> {
        self.handler.lock().as_mut().map(f)
    }

    fn on_timeout(&self, stale: Option<CachedRequest>, now: SystemTime, request: &RequestSummary) {
        let Some(handler) = self.take() else {
            return;
        };
        match stale {
            Some(entry) => {
                tracing::debug!(
                    target: "netdispatch::cache",
                    %request,
                    recovered = true,
                    "no response headers in time, serving stale entry"
                );
                handler.replay(
                    entry.status(),
                    &entry.headers(now),
                    entry.body().clone(),
                    entry.trailers().to_vec(),
                );
            }
            None => {
                tracing::debug!(
                    target: "netdispatch::cache",
                    %request,
                    recovered = false,
                    "no response headers in time"
                );
                handler.error(DispatchError::timeout(TimeoutPhase::Revalidation));
                if let Some(abort) = self.abort.lock().as_ref() {
                    abort.abort();
                }
            }
        }
    }
}

/// Decorates the downstream handler with caching.
pub(crate) struct CacheHandler {
    downstream: Arc<Downstream>,
    /// The caller's request, without conditional headers.
    opts: DispatchOptions,
    url: String,
    /// Entry being revalidated.
    stored: Option<CachedRequest>,
    /// Policy of the response currently being received.
    policy: Option<CachePolicy>,
    buffer: BytesMut,
    buffering: bool,
    /// The answer was taken from the store; ignore the rest of the network response.
    skip: bool,
    preflight: bool,
    connect_forwarded: bool,
    timer: CancellationToken,
    ctx: CacheContext,
}

impl CacheHandler {
    fn new(
        downstream: DecoratorHandler,
        opts: DispatchOptions,
        url: String,
        stored: Option<CachedRequest>,
        preflight: bool,
        ctx: CacheContext,
    ) -> Self {
        let mut handler = Self {
            downstream: Arc::new(Downstream {
                handler: Mutex::new(Some(downstream)),
                abort: Mutex::new(None),
            }),
            opts,
            url,
            stored,
            policy: None,
            buffer: BytesMut::new(),
            buffering: false,
            skip: false,
            preflight,
            connect_forwarded: false,
            timer: CancellationToken::new(),
            ctx,
        };
        handler.arm_timer();
        handler
    }

    /// The request actually sent: conditional headers for a stored entry,
    /// `HEAD` for a preflight.
    fn outgoing(&self, mut opts: DispatchOptions) -> DispatchOptions {
        if let Some(stored) = &self.stored {
            opts.headers = stored.policy().revalidation_headers(self.policy_request(&opts.method));
            tracing::debug!(
                target: "netdispatch::cache",
                request = %self.opts.summary(),
                preflight = self.preflight,
                "entry is stale, revalidating"
            );
        }
        if self.preflight {
            opts.method = Method::HEAD;
        }
        opts
    }

    fn policy_request<'a>(&'a self, method: &'a Method) -> PolicyRequest<'a> {
        PolicyRequest {
            method,
            url: &self.url,
            headers: &self.opts.headers,
        }
    }

    fn arm_timer(&mut self) {
        self.timer.cancel();
        self.timer = CancellationToken::new();

        let guard = self.timer.clone();
        let downstream = self.downstream.clone();
        let stale = self.stored.clone();
        let clock = self.ctx.clock.clone();
        let timeout = self.ctx.config.revalidation_timeout;
        let request = self.opts.summary();
        tokio::spawn(async move {
            tokio::select! {
                () = guard.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    downstream.on_timeout(stale, clock.now(), &request);
                }
            }
        });
    }

    /// Writes `entry`, then runs `then`. Callers see completion only after the
    /// store holds the entry.
    fn store_then(&self, entry: CachedRequest, then: impl FnOnce() + Send + 'static) {
        let Some(opts) = self.opts.try_clone() else {
            then();
            return;
        };
        let storage = self.ctx.storage.clone();
        tokio::spawn(async move {
            storage.put(&opts, entry).await;
            then();
        });
    }

    /// Answers with the stored body under revalidated headers.
    fn reconcile(&mut self, policy: CachePolicy, resume: &Resume) {
        let Some(stored) = self.stored.take() else {
            return;
        };
        self.skip = true;
        let (_, body, trailers) = stored.into_parts();
        let entry = CachedRequest::new(policy, body, trailers);
        let now = self.ctx.clock.now();

        let handler = self.downstream.take();
        let status = entry.status();
        let headers = entry.headers(now);
        let body = entry.body().clone();
        let trailers = entry.trailers().to_vec();
        self.store_then(entry, move || {
            if let Some(handler) = handler {
                handler.replay(status, &headers, body, trailers);
            }
        });
        resume.resume();
    }

    fn snapshot(&self) -> Option<CachedRequest> {
        self.policy
            .as_ref()
            .map(|p| CachedRequest::new(p.clone(), Bytes::copy_from_slice(&self.buffer), Vec::new()))
    }
}

impl Drop for CacheHandler {
    fn drop(&mut self) {
        self.timer.cancel();
    }
}

impl DispatchHandler for CacheHandler {
    fn on_connect(&mut self, abort: AbortSignal) {
        *self.downstream.abort.lock() = Some(abort.clone());
        if !self.connect_forwarded {
            self.connect_forwarded = true;
            self.downstream.with(|h| h.on_connect(abort));
        }
    }

    fn on_headers(&mut self, status: StatusCode, headers: &HeaderRecord, resume: Resume) -> Flow {
        self.timer.cancel();
        let now = self.ctx.clock.now();
        let response = PolicyResponse { status, headers };

        if let Some(stored) = &self.stored {
            // A preflight stands in for the caller's GET.
            let method = if self.preflight {
                Method::GET
            } else {
                self.opts.method.clone()
            };
            let revalidated =
                stored
                    .policy()
                    .revalidated_policy(self.policy_request(&method), response, now);

            tracing::debug!(
                target: "netdispatch::cache",
                request = %self.opts.summary(),
                status = status.as_u16(),
                modified = revalidated.modified,
                matches = revalidated.matches,
                "revalidation answered"
            );

            if !revalidated.modified {
                self.reconcile(revalidated.policy, &resume);
                return Flow::Continue;
            }
            if self.preflight {
                if status == StatusCode::METHOD_NOT_ALLOWED {
                    self.ctx.no_head.insert(self.opts.origin_key());
                }
                // The GET leg follows once the preflight completes.
                return Flow::Continue;
            }
            self.stored = None;
            self.policy = Some(revalidated.policy);
        } else {
            self.policy = Some(CachePolicy::new(
                self.policy_request(&self.opts.method),
                response,
                now,
            ));
        }

        self.buffering = self.policy.as_ref().is_some_and(CachePolicy::storable);
        self.buffer.clear();
        self.downstream
            .with(|h| h.on_headers(status, headers, resume))
            .unwrap_or(Flow::Continue)
    }

    fn on_data(&mut self, chunk: Bytes) -> Flow {
        if self.skip || self.preflight {
            return Flow::Continue;
        }
        if self.buffering {
            if self.buffer.len() + chunk.len() > self.ctx.config.max_entry_bytes {
                tracing::debug!(
                    target: "netdispatch::cache",
                    request = %self.opts.summary(),
                    limit = self.ctx.config.max_entry_bytes,
                    "response too large to cache"
                );
                self.buffering = false;
                self.buffer = BytesMut::new();
            } else {
                self.buffer.extend_from_slice(&chunk);
            }
        }
        self.downstream
            .with(|h| h.on_data(chunk))
            .unwrap_or(Flow::Continue)
    }

    fn on_body_sent(&mut self, len: usize) {
        if !self.preflight {
            self.downstream.with(|h| h.on_body_sent(len));
        }
    }

    fn on_complete(mut self: Box<Self>, trailers: Vec<String>) {
        if self.skip {
            return;
        }

        if self.preflight {
            self.preflight = false;
            self.policy = None;
            let Some(get) = self.opts.try_clone() else {
                return;
            };
            let outgoing = self.outgoing(get);
            self.arm_timer();
            let inner = self.ctx.inner.clone();
            inner.dispatch(outgoing, self);
            return;
        }

        let storable = self.buffering && self.policy.as_ref().is_some_and(CachePolicy::storable);
        tracing::debug!(
            target: "netdispatch::cache",
            request = %self.opts.summary(),
            storable,
            "response complete"
        );
        let handler = self.downstream.take();
        if storable && let Some(policy) = self.policy.take() {
            let body = std::mem::take(&mut self.buffer).freeze();
            self.store_then(CachedRequest::new(policy, body, trailers.clone()), move || {
                if let Some(handler) = handler {
                    handler.complete(trailers);
                }
            });
        } else if let Some(handler) = handler {
            handler.complete(trailers);
        }
    }

    fn on_error(mut self: Box<Self>, err: DispatchError) {
        self.timer.cancel();
        if self.skip {
            tracing::debug!(target: "netdispatch::cache", error = %err, "error after answering from cache");
            return;
        }
        let Some(handler) = self.downstream.take() else {
            return;
        };

        let headers_forwarded = self.policy.is_some();
        let degradable = !matches!(
            err.kind(),
            ErrorKind::Aborted | ErrorKind::SecurityViolation | ErrorKind::InvalidRequest
        );

        if let Some(stored) = self.stored.take() {
            if !headers_forwarded && degradable {
                tracing::debug!(
                    target: "netdispatch::cache",
                    request = %self.opts.summary(),
                    error = %err,
                    recovered = true,
                    "revalidation failed, serving stale entry"
                );
                let now = self.ctx.clock.now();
                handler.replay(
                    stored.status(),
                    &stored.headers(now),
                    stored.body().clone(),
                    stored.trailers().to_vec(),
                );
                return;
            }
            handler.error(err.with_cache(stored));
            return;
        }

        match self.snapshot() {
            Some(snapshot) => {
                tracing::debug!(
                    target: "netdispatch::cache",
                    request = %self.opts.summary(),
                    error = %err,
                    "response failed mid-body"
                );
                handler.error(err.with_cache(snapshot));
            }
            None => handler.error(err),
        }
    }
}
