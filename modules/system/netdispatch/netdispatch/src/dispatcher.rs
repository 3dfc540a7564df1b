//! The dispatch primitive shared by every layer, plus a buffering adapter for
//! callers that just want the whole response.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::error::DispatchError;
use crate::handler::{DispatchHandler, Flow, Resume};
use crate::headers::HeaderRecord;
use crate::options::DispatchOptions;

/// Something that can carry out a request and report it to a handler.
///
/// `dispatch` returns immediately; the work runs on the ambient tokio runtime
/// and every call ends in exactly one terminal handler event.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, opts: DispatchOptions, handler: Box<dyn DispatchHandler>);
}

impl<T: Dispatcher + ?Sized> Dispatcher for Arc<T> {
    fn dispatch(&self, opts: DispatchOptions, handler: Box<dyn DispatchHandler>) {
        (**self).dispatch(opts, handler);
    }
}

pub type SharedDispatcher = Arc<dyn Dispatcher>;

/// Fully buffered response.
#[derive(Debug, Clone)]
pub struct CollectedResponse {
    pub status: StatusCode,
    pub headers: HeaderRecord,
    pub body: Bytes,
    pub trailers: Vec<String>,
}

impl CollectedResponse {
    /// Body decoded as UTF-8, lossily.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserialize the body as JSON
    ///
    /// # Errors
    /// Returns the `serde_json` error when the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Handler that buffers a response and hands it over through a oneshot.
pub struct CollectingHandler {
    status: Option<StatusCode>,
    headers: HeaderRecord,
    body: BytesMut,
    tx: oneshot::Sender<Result<CollectedResponse, DispatchError>>,
}

impl CollectingHandler {
    #[must_use]
    pub fn new() -> (Self, oneshot::Receiver<Result<CollectedResponse, DispatchError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                status: None,
                headers: HeaderRecord::new(),
                body: BytesMut::new(),
                tx,
            },
            rx,
        )
    }
}

impl DispatchHandler for CollectingHandler {
    fn on_headers(&mut self, status: StatusCode, headers: &HeaderRecord, _resume: Resume) -> Flow {
        self.status = Some(status);
        self.headers = headers.clone();
        Flow::Continue
    }

    fn on_data(&mut self, chunk: Bytes) -> Flow {
        self.body.extend_from_slice(&chunk);
        Flow::Continue
    }

    fn on_complete(self: Box<Self>, trailers: Vec<String>) {
        let this = *self;
        let result = match this.status {
            Some(status) => Ok(CollectedResponse {
                status,
                headers: this.headers,
                body: this.body.freeze(),
                trailers,
            }),
            None => Err(DispatchError::Protocol(
                "response completed without headers".into(),
            )),
        };
        let _ = this.tx.send(result);
    }

    fn on_error(self: Box<Self>, err: DispatchError) {
        let _ = self.tx.send(Err(err));
    }
}

/// Convenience API on top of [`Dispatcher::dispatch`].
#[async_trait::async_trait]
pub trait DispatchExt: Dispatcher {
    /// Dispatch and buffer the whole response.
    ///
    /// # Errors
    /// Returns whatever error the dispatch ended with.
    async fn request(&self, opts: DispatchOptions) -> Result<CollectedResponse, DispatchError> {
        let (handler, rx) = CollectingHandler::new();
        self.dispatch(opts, Box::new(handler));
        rx.await.unwrap_or_else(|_| {
            Err(DispatchError::Protocol(
                "dispatch dropped its handler without a terminal event".into(),
            ))
        })
    }
}

impl<T: Dispatcher + ?Sized> DispatchExt for T {}
