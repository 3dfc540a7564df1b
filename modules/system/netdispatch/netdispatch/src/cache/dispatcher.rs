use std::sync::Arc;

use dashmap::DashSet;

use super::handler::CacheContext;
use super::storage::{CacheStorage, cache_key};
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::dispatcher::{Dispatcher, SharedDispatcher};
use crate::handler::{DecoratorHandler, DispatchHandler};
use crate::options::{CacheStrategy, DispatchOptions};
use crate::proxy::reject_proxy_authorization;

/// Serves fresh entries from storage, revalidates stale ones, and stores
/// cacheable responses coming back from `inner`.
///
/// `network-only` requests and requests without a cache key (streamed
/// bodies) pass straight through.
pub struct CacheDispatcher {
    ctx: CacheContext,
}

impl CacheDispatcher {
    pub fn new(
        inner: SharedDispatcher,
        storage: Arc<dyn CacheStorage>,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
    ) -> Self {
        Self {
            ctx: CacheContext {
                inner,
                storage,
                clock,
                config,
                no_head: Arc::new(DashSet::new()),
            },
        }
    }
}

impl Dispatcher for CacheDispatcher {
    fn dispatch(&self, opts: DispatchOptions, handler: Box<dyn DispatchHandler>) {
        // Checked before lookup: a hit or revalidation must not bypass it.
        if let Err(err) = reject_proxy_authorization(&opts) {
            handler.on_error(err);
            return;
        }
        if opts.extensions.cache_strategy == CacheStrategy::NetworkOnly || cache_key(&opts).is_none() {
            self.ctx.inner.dispatch(opts, handler);
            return;
        }

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let stored = ctx.storage.get(&opts).await;
            let now = ctx.clock.now();
            match stored {
                Some(entry) if !entry.is_expired(&opts, now) => {
                    tracing::debug!(
                        target: "netdispatch::cache",
                        request = %opts.summary(),
                        "fresh entry, answering without network"
                    );
                    DecoratorHandler::new(handler).replay(
                        entry.status(),
                        &entry.headers(now),
                        entry.body().clone(),
                        entry.trailers().to_vec(),
                    );
                }
                stored => ctx.dispatch(opts, handler, stored),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use http::{Method, StatusCode};

    use super::*;
    use crate::cache::{JsonCacheStorage, MemoryStorage};
    use crate::dispatcher::DispatchExt;
    use crate::error::{DispatchError, ErrorKind, TimeoutPhase};
    use crate::test_support::{Event, ManualClock, MockDispatcher, MockReply, RecordingHandler};

    const URL: &str = "https://a/x";

    struct Harness {
        mock: MockDispatcher,
        clock: Arc<ManualClock>,
        cache: CacheDispatcher,
    }

    fn harness(config: CacheConfig) -> Harness {
        let mock = MockDispatcher::new();
        let clock = Arc::new(ManualClock::default());
        let storage = Arc::new(JsonCacheStorage::new(
            MemoryStorage::new(64),
            clock.clone(),
            Duration::from_secs(7 * 24 * 3600),
        ));
        let cache = CacheDispatcher::new(Arc::new(mock.clone()), storage, clock.clone(), config);
        Harness { mock, clock, cache }
    }

    fn hello() -> MockReply {
        MockReply::ok("hello")
            .header("cache-control", "max-age=60")
            .header("etag", "\"v1\"")
    }

    fn get() -> DispatchOptions {
        DispatchOptions::get(URL).unwrap()
    }

    #[tokio::test]
    async fn fresh_then_conditional_revalidation_keeps_body() {
        let h = harness(CacheConfig::default());
        h.mock.push(hello());

        let first = h.cache.request(get()).await.unwrap();
        assert_eq!(first.text(), "hello");
        assert_eq!(h.mock.calls(), 1);

        // Within max-age: no network.
        let second = h.cache.request(get()).await.unwrap();
        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(second.text(), "hello");
        assert_eq!(second.headers.first("etag"), Some("\"v1\""));
        assert_eq!(h.mock.calls(), 1);

        h.clock.advance(Duration::from_secs(61));
        h.mock.push(MockReply::status(304).header("etag", "\"v1\""));

        let third = h.cache.request(get()).await.unwrap();
        assert_eq!(h.mock.calls(), 2);
        let conditional = &h.mock.requests()[1];
        assert_eq!(conditional.method, Method::GET);
        assert_eq!(conditional.headers.first("if-none-match"), Some("\"v1\""));
        assert_eq!(third.status, StatusCode::OK);
        assert_eq!(third.text(), "hello");

        // The merged entry is fresh again.
        let fourth = h.cache.request(get()).await.unwrap();
        assert_eq!(fourth.text(), "hello");
        assert_eq!(h.mock.calls(), 2);
    }

    #[tokio::test]
    async fn modified_response_replaces_stored_body() {
        let h = harness(CacheConfig::default());
        h.mock.push(hello());
        h.cache.request(get()).await.unwrap();

        h.clock.advance(Duration::from_secs(61));
        h.mock.push(
            MockReply::ok("world")
                .header("cache-control", "max-age=60")
                .header("etag", "\"v2\""),
        );
        let revalidated = h.cache.request(get()).await.unwrap();
        assert_eq!(revalidated.text(), "world");

        let cached = h.cache.request(get()).await.unwrap();
        assert_eq!(cached.text(), "world");
        assert_eq!(cached.headers.first("etag"), Some("\"v2\""));
        assert_eq!(h.mock.calls(), 2);
    }

    #[tokio::test]
    async fn cached_replay_has_canonical_event_order() {
        let h = harness(CacheConfig::default());
        h.mock.push(hello().trailers(vec!["x-sum".into(), "1".into()]));
        h.cache.request(get()).await.unwrap();

        let (recorder, log) = RecordingHandler::new();
        h.cache.dispatch(get(), Box::new(recorder));
        log.wait().await;

        assert_eq!(
            log.events(),
            vec![
                Event::Headers(200),
                Event::Data(Bytes::from_static(b"hello")),
                Event::Complete(vec!["x-sum".into(), "1".into()]),
            ]
        );
    }

    #[tokio::test]
    async fn uncacheable_response_is_not_stored() {
        let h = harness(CacheConfig::default());
        h.mock.push(MockReply::ok("a").header("cache-control", "no-store"));
        h.mock.push(MockReply::ok("b").header("cache-control", "no-store"));

        assert_eq!(h.cache.request(get()).await.unwrap().text(), "a");
        assert_eq!(h.cache.request(get()).await.unwrap().text(), "b");
        assert_eq!(h.mock.calls(), 2);
    }

    #[tokio::test]
    async fn oversized_body_is_not_stored() {
        let h = harness(CacheConfig {
            max_entry_bytes: 3,
            ..CacheConfig::default()
        });
        h.mock.push(hello());
        h.mock.push(hello());

        h.cache.request(get()).await.unwrap();
        h.cache.request(get()).await.unwrap();
        assert_eq!(h.mock.calls(), 2);
    }

    #[tokio::test]
    async fn network_only_bypasses_fresh_entry() {
        let h = harness(CacheConfig::default());
        h.mock.push(hello());
        h.cache.request(get()).await.unwrap();

        h.mock.push(MockReply::ok("direct"));
        let opts = DispatchOptions::builder()
            .url(URL)
            .unwrap()
            .cache_strategy(CacheStrategy::NetworkOnly)
            .build()
            .unwrap();
        assert_eq!(h.cache.request(opts).await.unwrap().text(), "direct");
        assert_eq!(h.mock.calls(), 2);
        assert!(h.mock.requests()[1].headers.first("if-none-match").is_none());
    }

    #[tokio::test]
    async fn proxy_authorization_is_rejected_for_fresh_and_stale_entries() {
        let h = harness(CacheConfig::default());
        h.mock.push(hello());
        h.cache.request(get()).await.unwrap();

        let with_credentials = || {
            DispatchOptions::builder()
                .url(URL)
                .unwrap()
                .header("proxy-authorization", "Basic Zm9vOmJhcg==")
                .build()
                .unwrap()
        };

        // Fresh: the stored body must not be replayed.
        let err = h.cache.request(with_credentials()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecurityViolation);

        // Stale: no revalidation goes out with the header stripped.
        h.clock.advance(Duration::from_secs(61));
        let (recorder, log) = RecordingHandler::new();
        h.cache.dispatch(with_credentials(), Box::new(recorder));
        log.wait().await;
        assert_eq!(log.error_kind(), Some(ErrorKind::SecurityViolation));
        assert!(log.headers().is_none());

        assert_eq!(h.mock.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_revalidation_serves_stale_entry() {
        let h = harness(CacheConfig::default());
        h.mock.push(hello());
        h.cache.request(get()).await.unwrap();

        h.clock.advance(Duration::from_secs(61));
        h.mock.push(MockReply::hang());

        let stale = h.cache.request(get()).await.unwrap();
        assert_eq!(stale.status, StatusCode::OK);
        assert_eq!(stale.text(), "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_request_without_entry_times_out() {
        let h = harness(CacheConfig::default());
        h.mock.push(MockReply::hang());

        let err = h.cache.request(get()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout(TimeoutPhase::Revalidation));
        // The transport was aborted.
        h.mock.wait_aborted(0).await;
    }

    #[tokio::test]
    async fn connect_failure_during_revalidation_degrades_to_stale() {
        let h = harness(CacheConfig::default());
        h.mock.push(hello());
        h.cache.request(get()).await.unwrap();

        h.clock.advance(Duration::from_secs(61));
        h.mock.push(MockReply::error(DispatchError::Connect("refused".into())));

        let degraded = h.cache.request(get()).await.unwrap();
        assert_eq!(degraded.text(), "hello");
    }

    #[tokio::test]
    async fn aborted_revalidation_carries_stale_entry() {
        let h = harness(CacheConfig::default());
        h.mock.push(hello());
        h.cache.request(get()).await.unwrap();

        h.clock.advance(Duration::from_secs(61));
        h.mock.push(MockReply::error(DispatchError::Aborted));

        let err = h.cache.request(get()).await.unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(err.cached().map(|c| c.body().clone()), Some(Bytes::from_static(b"hello")));
    }

    #[tokio::test]
    async fn failure_mid_body_attaches_partial_snapshot() {
        let h = harness(CacheConfig::default());
        h.mock.push(
            MockReply::ok("par")
                .header("cache-control", "max-age=60")
                .fail_after_body(DispatchError::Socket("reset".into())),
        );

        let err = h.cache.request(get()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Socket);
        let snapshot = err.cached().unwrap();
        assert_eq!(snapshot.body(), &Bytes::from_static(b"par"));
        assert_eq!(snapshot.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn preflight_405_falls_back_to_get_and_is_remembered() {
        let h = harness(CacheConfig {
            preflight_head: true,
            ..CacheConfig::default()
        });
        h.mock.push(hello());
        h.cache.request(get()).await.unwrap();

        h.clock.advance(Duration::from_secs(61));
        h.mock.push(MockReply::status(405));
        h.mock.push(
            MockReply::ok("fresh")
                .header("cache-control", "max-age=60")
                .header("etag", "\"v2\""),
        );

        let resp = h.cache.request(get()).await.unwrap();
        assert_eq!(resp.text(), "fresh");
        let requests = h.mock.requests();
        assert_eq!(requests[1].method, Method::HEAD);
        assert_eq!(requests[2].method, Method::GET);
        assert_eq!(requests[2].headers.first("if-none-match"), Some("\"v1\""));

        // The origin is no longer preflighted.
        h.clock.advance(Duration::from_secs(61));
        h.mock.push(MockReply::status(304).header("etag", "\"v2\""));
        assert_eq!(h.cache.request(get()).await.unwrap().text(), "fresh");
        assert_eq!(h.mock.requests()[3].method, Method::GET);
    }

    #[tokio::test]
    async fn preflight_not_modified_skips_body_download() {
        let h = harness(CacheConfig {
            preflight_head: true,
            ..CacheConfig::default()
        });
        h.mock.push(hello());
        h.cache.request(get()).await.unwrap();

        h.clock.advance(Duration::from_secs(61));
        h.mock.push(MockReply::status(304).header("etag", "\"v1\""));

        let resp = h.cache.request(get()).await.unwrap();
        assert_eq!(resp.text(), "hello");
        assert_eq!(h.mock.calls(), 2);
        assert_eq!(h.mock.requests()[1].method, Method::HEAD);
    }

    #[tokio::test]
    async fn post_entries_are_keyed_by_body() {
        let h = harness(CacheConfig::default());
        let post = |body: &'static str| {
            DispatchOptions::builder()
                .url(URL)
                .unwrap()
                .method(Method::POST)
                .body(body)
                .build()
                .unwrap()
        };
        h.mock.push(MockReply::ok("one").header("cache-control", "max-age=60"));
        h.mock.push(MockReply::ok("two").header("cache-control", "max-age=60"));

        assert_eq!(h.cache.request(post("a")).await.unwrap().text(), "one");
        assert_eq!(h.cache.request(post("b")).await.unwrap().text(), "two");
        assert_eq!(h.cache.request(post("a")).await.unwrap().text(), "one");
        assert_eq!(h.mock.calls(), 2);
    }
}
