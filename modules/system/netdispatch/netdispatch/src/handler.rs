//! Response lifecycle handlers.
//!
//! A dispatch reports progress through a [`DispatchHandler`]:
//! `on_connect`, then `on_headers`, zero or more `on_data`, and finally exactly
//! one terminal event (`on_complete`, `on_error` or `on_upgrade`). Terminal
//! events take `self: Box<Self>`, so a handler cannot be completed twice.
//!
//! Every layer of the stack decorates the handler it is given. The
//! [`DecoratorHandler`] is the plain forwarding base those layers build on.

use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;
use crate::headers::HeaderRecord;
use crate::transport::BoxedIo;

/// Whether the producer may keep pushing body chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stop reading the body until the [`Resume`] given in `on_headers` fires.
    Pause,
}

/// Wakes a paused body reader.
#[derive(Debug, Clone, Default)]
pub struct Resume {
    notify: Option<Arc<Notify>>,
}

impl Resume {
    /// A resume callback that does nothing, for responses replayed from memory.
    #[must_use]
    pub fn noop() -> Self {
        Self::default()
    }

    pub(crate) fn new(notify: Arc<Notify>) -> Self {
        Self {
            notify: Some(notify),
        }
    }

    pub fn resume(&self) {
        if let Some(notify) = &self.notify {
            notify.notify_one();
        }
    }
}

/// Abort handle passed to `on_connect`.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
}

impl AbortSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Aborts the transport; the dispatch ends with [`DispatchError::Aborted`].
    pub fn abort(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl From<CancellationToken> for AbortSignal {
    fn from(token: CancellationToken) -> Self {
        Self { token }
    }
}

/// Sink for the lifecycle events of one dispatch.
pub trait DispatchHandler: Send {
    fn on_connect(&mut self, abort: AbortSignal) {
        let _ = abort;
    }

    fn on_headers(&mut self, status: StatusCode, headers: &HeaderRecord, resume: Resume) -> Flow;

    fn on_data(&mut self, chunk: Bytes) -> Flow;

    /// The request body was fully written.
    fn on_body_sent(&mut self, len: usize) {
        let _ = len;
    }

    /// Trailers are a flat name/value list.
    fn on_complete(self: Box<Self>, trailers: Vec<String>);

    fn on_error(self: Box<Self>, err: DispatchError);

    /// A `101 Switching Protocols` answer handed over the raw connection.
    fn on_upgrade(self: Box<Self>, status: StatusCode, headers: &HeaderRecord, io: BoxedIo) {
        let _ = (status, headers, io);
        self.on_error(DispatchError::NotSupported(
            "handler does not accept protocol upgrades".into(),
        ));
    }
}

/// Forwards every event unchanged to the wrapped handler.
///
/// Decorating handlers keep one of these as their downstream and call the
/// consuming `complete`/`error`/`upgrade` methods for terminal events.
pub struct DecoratorHandler {
    inner: Box<dyn DispatchHandler>,
}

impl std::fmt::Debug for DecoratorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DecoratorHandler(..)")
    }
}

impl DecoratorHandler {
    #[must_use]
    pub fn new(inner: Box<dyn DispatchHandler>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn into_inner(self) -> Box<dyn DispatchHandler> {
        self.inner
    }

    pub fn complete(self, trailers: Vec<String>) {
        self.inner.on_complete(trailers);
    }

    pub fn error(self, err: DispatchError) {
        self.inner.on_error(err);
    }

    pub fn upgrade(self, status: StatusCode, headers: &HeaderRecord, io: BoxedIo) {
        self.inner.on_upgrade(status, headers, io);
    }

    /// Replays a complete buffered response: headers, one data chunk when the
    /// body is non-empty, then completion.
    pub fn replay(
        mut self,
        status: StatusCode,
        headers: &HeaderRecord,
        body: Bytes,
        trailers: Vec<String>,
    ) {
        self.on_headers(status, headers, Resume::noop());
        if !body.is_empty() {
            self.on_data(body);
        }
        self.complete(trailers);
    }
}

impl DispatchHandler for DecoratorHandler {
    fn on_connect(&mut self, abort: AbortSignal) {
        self.inner.on_connect(abort);
    }

    fn on_headers(&mut self, status: StatusCode, headers: &HeaderRecord, resume: Resume) -> Flow {
        self.inner.on_headers(status, headers, resume)
    }

    fn on_data(&mut self, chunk: Bytes) -> Flow {
        self.inner.on_data(chunk)
    }

    fn on_body_sent(&mut self, len: usize) {
        self.inner.on_body_sent(len);
    }

    fn on_complete(self: Box<Self>, trailers: Vec<String>) {
        self.complete(trailers);
    }

    fn on_error(self: Box<Self>, err: DispatchError) {
        self.error(err);
    }

    fn on_upgrade(self: Box<Self>, status: StatusCode, headers: &HeaderRecord, io: BoxedIo) {
        self.upgrade(status, headers, io);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Event, RecordingHandler};

    #[test]
    fn decorator_preserves_event_order() {
        let (recorder, log) = RecordingHandler::new();
        let mut handler = DecoratorHandler::new(Box::new(recorder));

        handler.on_connect(AbortSignal::new());
        let mut headers = HeaderRecord::new();
        headers.insert("etag", "\"v1\"");
        assert_eq!(
            handler.on_headers(StatusCode::OK, &headers, Resume::noop()),
            Flow::Continue
        );
        handler.on_data(Bytes::from_static(b"he"));
        handler.on_data(Bytes::from_static(b"llo"));
        handler.complete(vec!["x-checksum".into(), "abc".into()]);

        assert_eq!(
            log.events(),
            vec![
                Event::Connect,
                Event::Headers(200),
                Event::Data(Bytes::from_static(b"he")),
                Event::Data(Bytes::from_static(b"llo")),
                Event::Complete(vec!["x-checksum".into(), "abc".into()]),
            ]
        );
        assert_eq!(log.body(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn default_upgrade_is_reported_as_error() {
        let (recorder, log) = RecordingHandler::new();
        let handler: Box<dyn DispatchHandler> = Box::new(DecoratorHandler::new(Box::new(recorder)));

        let (io, _peer) = tokio::io::duplex(8);
        handler.on_upgrade(StatusCode::SWITCHING_PROTOCOLS, &HeaderRecord::new(), Box::new(io));

        assert!(matches!(
            log.take_error(),
            Some(DispatchError::NotSupported(_))
        ));
    }

    #[test]
    fn replay_skips_empty_body() {
        let (recorder, log) = RecordingHandler::new();
        DecoratorHandler::new(Box::new(recorder)).replay(
            StatusCode::NO_CONTENT,
            &HeaderRecord::new(),
            Bytes::new(),
            Vec::new(),
        );
        assert_eq!(log.events(), vec![Event::Headers(204), Event::Complete(vec![])]);
    }

    #[tokio::test]
    async fn resume_wakes_waiter() {
        let notify = Arc::new(Notify::new());
        let resume = Resume::new(notify.clone());
        let waiter = tokio::spawn(async move { notify.notified().await });
        tokio::task::yield_now().await;
        resume.resume();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
