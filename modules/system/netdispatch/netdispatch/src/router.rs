//! Routes each request to the download or the API pool set.

use bytes::Bytes;
use http::StatusCode;

use crate::dispatcher::{Dispatcher, SharedDispatcher};
use crate::error::DispatchError;
use crate::handler::{AbortSignal, DecoratorHandler, DispatchHandler, Flow, Resume};
use crate::headers::HeaderRecord;
use crate::options::{DispatchOptions, RequestSummary};
use crate::transport::BoxedIo;

/// Sends `use_download_pool == Some(true)` requests to `download`, the rest
/// to `api`.
pub struct BiDispatcher {
    download: SharedDispatcher,
    api: SharedDispatcher,
}

impl BiDispatcher {
    #[must_use]
    pub fn new(download: SharedDispatcher, api: SharedDispatcher) -> Self {
        Self { download, api }
    }
}

impl Dispatcher for BiDispatcher {
    fn dispatch(&self, opts: DispatchOptions, handler: Box<dyn DispatchHandler>) {
        let handler = Box::new(ErrorContextHandler {
            request: opts.summary(),
            inner: DecoratorHandler::new(handler),
        });
        if opts.extensions.use_download_pool == Some(true) {
            self.download.dispatch(opts, handler);
        } else {
            self.api.dispatch(opts, handler);
        }
    }
}

/// Tags errors with the request they belong to.
struct ErrorContextHandler {
    request: RequestSummary,
    inner: DecoratorHandler,
}

impl DispatchHandler for ErrorContextHandler {
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
        self.inner.complete(trailers);
    }

    fn on_error(self: Box<Self>, err: DispatchError) {
        let this = *self;
        this.inner.error(err.with_request(this.request));
    }

    fn on_upgrade(self: Box<Self>, status: StatusCode, headers: &HeaderRecord, io: BoxedIo) {
        self.inner.upgrade(status, headers, io);
    }
}
