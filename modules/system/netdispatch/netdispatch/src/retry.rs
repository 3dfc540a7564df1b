//! Retries of failed idempotent requests below the pool router.
//!
//! A request is retried only while nothing has been forwarded past
//! `on_connect`: once response headers reach the caller the outcome is final.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::dispatcher::{Dispatcher, SharedDispatcher};
use crate::error::{DispatchError, ErrorKind, TimeoutPhase};
use crate::handler::{AbortSignal, DecoratorHandler, DispatchHandler, Flow, Resume};
use crate::headers::HeaderRecord;
use crate::options::DispatchOptions;
use crate::transport::BoxedIo;

/// Re-dispatches idempotent requests with replayable bodies on transient
/// failures and on the configured status codes.
pub struct RetryDispatcher {
    inner: SharedDispatcher,
    config: Arc<RetryConfig>,
}

impl RetryDispatcher {
    #[must_use]
    pub fn new(inner: SharedDispatcher, config: RetryConfig) -> Self {
        Self {
            inner,
            config: Arc::new(config),
        }
    }
}

impl Dispatcher for RetryDispatcher {
    fn dispatch(&self, mut opts: DispatchOptions, handler: Box<dyn DispatchHandler>) {
        if self.config.max_retries == 0 || !opts.method.is_idempotent() || opts.body.is_stream() {
            self.inner.dispatch(opts, handler);
            return;
        }

        // Every attempt runs under one token so the caller's abort reaches
        // whichever attempt is current.
        let cancel = opts
            .signal
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        opts.signal = Some(cancel.clone());
        let Some(template) = opts.try_clone() else {
            self.inner.dispatch(opts, handler);
            return;
        };

        let handler = RetryHandler {
            inner: self.inner.clone(),
            config: self.config.clone(),
            template,
            cancel,
            attempt: 0,
            connected: false,
            phase: Phase::Pending,
            downstream: DecoratorHandler::new(handler),
        };
        self.inner.dispatch(opts, Box::new(handler));
    }
}

/// Delay before attempt `attempt + 1`: `min_delay * 2^attempt`, capped.
fn backoff(config: &RetryConfig, attempt: u32) -> Duration {
    config
        .min_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(config.max_delay)
}

/// `retry-after` as delta seconds or an HTTP date.
fn retry_after(headers: &HeaderRecord) -> Option<Duration> {
    let value = headers.first("retry-after")?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(SystemTime::now()).unwrap_or_default())
}

fn is_transient(err: &DispatchError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Connect
            | ErrorKind::Socket
            | ErrorKind::Timeout(TimeoutPhase::Connect | TimeoutPhase::Headers | TimeoutPhase::Body)
    )
}

/// Where the current attempt's response stands.
#[derive(Clone, Copy)]
enum Phase {
    Pending,
    /// Headers went to the caller; the attempt is final.
    Forwarded,
    /// A retryable status is being drained, with its `retry-after` hint.
    Draining(Option<Duration>),
}

struct RetryHandler {
    inner: SharedDispatcher,
    config: Arc<RetryConfig>,
    template: DispatchOptions,
    cancel: CancellationToken,
    attempt: u32,
    connected: bool,
    phase: Phase,
    downstream: DecoratorHandler,
}

impl RetryHandler {
    fn attempts_left(&self) -> bool {
        self.attempt < self.config.max_retries
    }

    fn retry(self, hint: Option<Duration>) {
        let delay = hint
            .map_or_else(|| backoff(&self.config, self.attempt), |hint| hint.min(self.config.max_delay));
        tracing::debug!(
            method = %self.template.method,
            origin = %self.template.origin_key(),
            path = %self.template.path,
            attempt = self.attempt + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "retrying request"
        );

        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    self.downstream.error(DispatchError::Aborted);
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
            let Some(opts) = self.template.try_clone() else {
                self.downstream.error(DispatchError::InvalidRequest(
                    "request body cannot be replayed".into(),
                ));
                return;
            };
            let next = RetryHandler {
                attempt: self.attempt + 1,
                phase: Phase::Pending,
                ..self
            };
            let inner = next.inner.clone();
            inner.dispatch(opts, Box::new(next));
        });
    }
}

impl DispatchHandler for RetryHandler {
    fn on_connect(&mut self, _abort: AbortSignal) {
        if !self.connected {
            self.connected = true;
            self.downstream.on_connect(AbortSignal::from(self.cancel.clone()));
        }
    }

    fn on_headers(&mut self, status: StatusCode, headers: &HeaderRecord, resume: Resume) -> Flow {
        if self.attempts_left() && self.config.status_codes.contains(&status.as_u16()) {
            self.phase = Phase::Draining(retry_after(headers));
            return Flow::Continue;
        }
        self.phase = Phase::Forwarded;
        self.downstream.on_headers(status, headers, resume)
    }

    fn on_data(&mut self, chunk: Bytes) -> Flow {
        if let Phase::Draining(_) = self.phase {
            return Flow::Continue;
        }
        self.downstream.on_data(chunk)
    }

    fn on_body_sent(&mut self, len: usize) {
        self.downstream.on_body_sent(len);
    }

    fn on_complete(self: Box<Self>, trailers: Vec<String>) {
        match self.phase {
            Phase::Draining(hint) => self.retry(hint),
            Phase::Pending | Phase::Forwarded => self.downstream.complete(trailers),
        }
    }

    fn on_error(self: Box<Self>, err: DispatchError) {
        match self.phase {
            Phase::Draining(hint) => self.retry(hint),
            Phase::Pending if self.attempts_left() && is_transient(&err) => {
                tracing::debug!(error = %err, "transient failure");
                self.retry(None);
            }
            Phase::Pending | Phase::Forwarded => self.downstream.error(err),
        }
    }

    fn on_upgrade(self: Box<Self>, status: StatusCode, headers: &HeaderRecord, io: BoxedIo) {
        self.downstream.upgrade(status, headers, io);
    }
}

#[cfg(test)]
mod tests {
    use http::Method;
    use tokio::time::Instant;

    use super::*;
    use crate::test_support::{Event, MockDispatcher, MockReply, RecordingHandler};

    fn retrying(mock: &MockDispatcher) -> RetryDispatcher {
        RetryDispatcher::new(Arc::new(mock.clone()), RetryConfig::default())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = RetryConfig::default();
        assert_eq!(backoff(&config, 0), Duration::from_millis(500));
        assert_eq!(backoff(&config, 1), Duration::from_secs(1));
        assert_eq!(backoff(&config, 3), Duration::from_secs(4));
        assert_eq!(backoff(&config, 12), Duration::from_secs(30));
    }

    #[test]
    fn retry_after_accepts_seconds() {
        let mut headers = HeaderRecord::new();
        headers.insert("retry-after", "7");
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert("retry-after", "Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(retry_after(&headers), Some(Duration::ZERO));
        headers.insert("retry-after", "later");
        assert_eq!(retry_after(&headers), None);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_is_retried_transparently() {
        let mock = MockDispatcher::new();
        mock.push(MockReply::error(DispatchError::Connect("refused".into())));
        mock.push(MockReply::ok("ok"));

        let (recorder, log) = RecordingHandler::new();
        retrying(&mock).dispatch(DispatchOptions::get("https://api.example/x").unwrap(), Box::new(recorder));
        log.wait().await;

        assert_eq!(mock.calls(), 2);
        assert_eq!(
            log.events(),
            vec![
                Event::Connect,
                Event::Headers(200),
                Event::Data(Bytes::from_static(b"ok")),
                Event::Complete(vec![]),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_status_is_not_forwarded() {
        let mock = MockDispatcher::new();
        mock.push(MockReply::status(503).body("busy"));
        mock.push(MockReply::ok("fine"));

        let (recorder, log) = RecordingHandler::new();
        retrying(&mock).dispatch(DispatchOptions::get("https://api.example/x").unwrap(), Box::new(recorder));
        log.wait().await;

        assert_eq!(log.status(), Some(200));
        assert_eq!(log.body(), Bytes::from_static(b"fine"));
    }

    #[tokio::test(start_paused = true)]
    async fn last_attempt_is_forwarded_as_is() {
        let mock = MockDispatcher::new();
        for _ in 0..4 {
            mock.push(MockReply::status(502));
        }

        let (recorder, log) = RecordingHandler::new();
        retrying(&mock).dispatch(DispatchOptions::get("https://api.example/x").unwrap(), Box::new(recorder));
        log.wait().await;

        assert_eq!(mock.calls(), 4);
        assert_eq!(log.status(), Some(502));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_overrides_backoff() {
        let mock = MockDispatcher::new();
        mock.push(MockReply::status(429).header("retry-after", "5"));
        mock.push(MockReply::ok("ok"));

        let started = Instant::now();
        let (recorder, log) = RecordingHandler::new();
        retrying(&mock).dispatch(DispatchOptions::get("https://api.example/x").unwrap(), Box::new(recorder));
        log.wait().await;

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(log.status(), Some(200));
    }

    #[tokio::test(start_paused = true)]
    async fn non_idempotent_requests_are_not_retried() {
        let mock = MockDispatcher::new();
        mock.push(MockReply::error(DispatchError::Connect("refused".into())));

        let opts = DispatchOptions::builder()
            .url("https://api.example/login")
            .unwrap()
            .method(Method::POST)
            .body("{}")
            .build()
            .unwrap();
        let (recorder, log) = RecordingHandler::new();
        retrying(&mock).dispatch(opts, Box::new(recorder));
        log.wait().await;

        assert_eq!(mock.calls(), 1);
        assert_eq!(log.error_kind(), Some(ErrorKind::Connect));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_headers_is_final() {
        let mock = MockDispatcher::new();
        mock.push(MockReply::ok("part").fail_after_body(DispatchError::Socket("reset".into())));

        let (recorder, log) = RecordingHandler::new();
        retrying(&mock).dispatch(DispatchOptions::get("https://cdn.example/a.jar").unwrap(), Box::new(recorder));
        log.wait().await;

        assert_eq!(mock.calls(), 1);
        assert_eq!(log.error_kind(), Some(ErrorKind::Socket));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_during_backoff_ends_with_aborted() {
        let mock = MockDispatcher::new();
        mock.push(MockReply::error(DispatchError::Connect("refused".into())));

        let (recorder, log) = RecordingHandler::new();
        retrying(&mock).dispatch(DispatchOptions::get("https://api.example/x").unwrap(), Box::new(recorder));
        while log.events().is_empty() {
            tokio::task::yield_now().await;
        }
        log.abort();
        log.wait().await;

        assert_eq!(log.error_kind(), Some(ErrorKind::Aborted));
        assert_eq!(mock.calls(), 1);
    }
}
