//! Test doubles for code built on [`Dispatcher`].
//!
//! Enabled for this crate's own tests and, through the `test-utils` feature,
//! for downstream crates.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::clock::Clock;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, ErrorKind};
use crate::handler::{AbortSignal, DispatchHandler, Flow, Resume};
use crate::headers::HeaderRecord;
use crate::options::{DispatchOptions, Extensions, RequestBody};

/// Scripted answer for one [`MockDispatcher`] call.
#[derive(Debug)]
pub struct MockReply {
    outcome: Outcome,
    status: StatusCode,
    headers: HeaderRecord,
    body: Bytes,
    trailers: Vec<String>,
    delay: Option<Duration>,
    fail_after_body: Option<DispatchError>,
}

#[derive(Debug)]
enum Outcome {
    Respond,
    Fail(DispatchError),
    /// Never answers; ends with `Aborted` once the transport is aborted.
    Hang,
}

impl MockReply {
    fn with_outcome(outcome: Outcome) -> Self {
        Self {
            outcome,
            status: StatusCode::OK,
            headers: HeaderRecord::new(),
            body: Bytes::new(),
            trailers: Vec::new(),
            delay: None,
            fail_after_body: None,
        }
    }

    /// `200` with `body`.
    #[must_use]
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::with_outcome(Outcome::Respond).body(body)
    }

    /// Empty response with `status`; invalid codes become `500`.
    #[must_use]
    pub fn status(status: u16) -> Self {
        let mut reply = Self::with_outcome(Outcome::Respond);
        reply.status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        reply
    }

    /// Fails before any response headers.
    #[must_use]
    pub fn error(err: DispatchError) -> Self {
        Self::with_outcome(Outcome::Fail(err))
    }

    #[must_use]
    pub fn hang() -> Self {
        Self::with_outcome(Outcome::Hang)
    }

    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn trailers(mut self, trailers: Vec<String>) -> Self {
        self.trailers = trailers;
        self
    }

    /// Waits `delay` before answering.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sends headers and body, then fails instead of completing.
    #[must_use]
    pub fn fail_after_body(mut self, err: DispatchError) -> Self {
        self.fail_after_body = Some(err);
        self
    }
}

/// What a [`MockDispatcher`] was asked to send.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderRecord,
    pub extensions: Extensions,
    /// Buffered body; `None` for forms and streams.
    pub body: Option<Bytes>,
    pub abort: AbortSignal,
}

#[derive(Default)]
struct MockState {
    replies: VecDeque<MockReply>,
    requests: Vec<RecordedRequest>,
}

/// Dispatcher answering from a queue of [`MockReply`]s.
///
/// Calls with nothing queued fail with a connect error.
#[derive(Clone, Default)]
pub struct MockDispatcher {
    state: Arc<Mutex<MockState>>,
}

impl MockDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reply: MockReply) {
        self.state.lock().replies.push_back(reply);
    }

    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Resolves once call number `index` has been aborted.
    ///
    /// # Panics
    /// Panics when fewer than `index + 1` calls were made.
    pub async fn wait_aborted(&self, index: usize) {
        let abort = self.state.lock().requests[index].abort.clone();
        abort.token().cancelled().await;
    }
}

impl Dispatcher for MockDispatcher {
    fn dispatch(&self, opts: DispatchOptions, mut handler: Box<dyn DispatchHandler>) {
        let abort = AbortSignal::from(
            opts.signal
                .as_ref()
                .map(tokio_util::sync::CancellationToken::child_token)
                .unwrap_or_default(),
        );
        let reply = {
            let mut state = self.state.lock();
            state.requests.push(RecordedRequest {
                method: opts.method.clone(),
                url: opts.url().map(|u| u.to_string()).unwrap_or_default(),
                headers: opts.headers.clone(),
                extensions: opts.extensions,
                body: match &opts.body {
                    RequestBody::Bytes(bytes) => Some(bytes.clone()),
                    _ => None,
                },
                abort: abort.clone(),
            });
            state.replies.pop_front()
        };

        tokio::spawn(async move {
            handler.on_connect(abort.clone());
            let Some(reply) = reply else {
                handler.on_error(DispatchError::Connect("no reply queued".into()));
                return;
            };
            if let Some(delay) = reply.delay {
                tokio::select! {
                    () = abort.token().cancelled() => {
                        handler.on_error(DispatchError::Aborted);
                        return;
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
            match reply.outcome {
                Outcome::Hang => {
                    abort.token().cancelled().await;
                    handler.on_error(DispatchError::Aborted);
                }
                Outcome::Fail(err) => handler.on_error(err),
                Outcome::Respond => {
                    handler.on_headers(reply.status, &reply.headers, Resume::noop());
                    if !reply.body.is_empty() {
                        handler.on_data(reply.body);
                    }
                    match reply.fail_after_body {
                        Some(err) => handler.on_error(err),
                        None => handler.on_complete(reply.trailers),
                    }
                }
            }
        });
    }
}

/// Handler event as seen by a [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect,
    Headers(u16),
    Data(Bytes),
    BodySent(usize),
    Complete(Vec<String>),
    Error(ErrorKind),
}

#[derive(Default)]
struct LogState {
    events: Vec<Event>,
    headers: Option<HeaderRecord>,
    error: Option<DispatchError>,
    abort: Option<AbortSignal>,
    resume: Option<Resume>,
}

/// Read side of a [`RecordingHandler`].
#[derive(Clone)]
pub struct EventLog {
    state: Arc<Mutex<LogState>>,
    done: watch::Receiver<bool>,
}

impl EventLog {
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    /// Concatenated data chunks.
    #[must_use]
    pub fn body(&self) -> Bytes {
        let state = self.state.lock();
        let mut body = BytesMut::new();
        for event in &state.events {
            if let Event::Data(chunk) = event {
                body.extend_from_slice(chunk);
            }
        }
        body.freeze()
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.state.lock().events.iter().find_map(|e| match e {
            Event::Headers(status) => Some(*status),
            _ => None,
        })
    }

    #[must_use]
    pub fn headers(&self) -> Option<HeaderRecord> {
        self.state.lock().headers.clone()
    }

    #[must_use]
    pub fn take_error(&self) -> Option<DispatchError> {
        self.state.lock().error.take()
    }

    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.state.lock().events.iter().find_map(|e| match e {
            Event::Error(kind) => Some(*kind),
            _ => None,
        })
    }

    /// Aborts the transport through the signal received in `on_connect`.
    pub fn abort(&self) {
        if let Some(abort) = &self.state.lock().abort {
            abort.abort();
        }
    }

    /// Fires the resume callback received in `on_headers`.
    pub fn resume(&self) {
        if let Some(resume) = &self.state.lock().resume {
            resume.resume();
        }
    }

    /// Resolves after the terminal event.
    pub async fn wait(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|done| *done).await;
    }
}

/// Handler that records every event it receives.
pub struct RecordingHandler {
    state: Arc<Mutex<LogState>>,
    done: watch::Sender<bool>,
    data_flow: Flow,
}

impl RecordingHandler {
    #[must_use]
    pub fn new() -> (Self, EventLog) {
        let state = Arc::new(Mutex::new(LogState::default()));
        let (done, rx) = watch::channel(false);
        (
            Self {
                state: state.clone(),
                done,
                data_flow: Flow::Continue,
            },
            EventLog { state, done: rx },
        )
    }

    /// Answers every `on_data` with `Flow::Pause`.
    #[must_use]
    pub fn pausing(mut self) -> Self {
        self.data_flow = Flow::Pause;
        self
    }

    fn finish(&self, event: Event) {
        self.state.lock().events.push(event);
        let _ = self.done.send(true);
    }
}

impl DispatchHandler for RecordingHandler {
    fn on_connect(&mut self, abort: AbortSignal) {
        let mut state = self.state.lock();
        state.events.push(Event::Connect);
        state.abort = Some(abort);
    }

    fn on_headers(&mut self, status: StatusCode, headers: &HeaderRecord, resume: Resume) -> Flow {
        let mut state = self.state.lock();
        state.events.push(Event::Headers(status.as_u16()));
        state.headers = Some(headers.clone());
        state.resume = Some(resume);
        Flow::Continue
    }

    fn on_data(&mut self, chunk: Bytes) -> Flow {
        self.state.lock().events.push(Event::Data(chunk));
        self.data_flow
    }

    fn on_body_sent(&mut self, len: usize) {
        self.state.lock().events.push(Event::BodySent(len));
    }

    fn on_complete(self: Box<Self>, trailers: Vec<String>) {
        self.finish(Event::Complete(trailers));
    }

    fn on_error(self: Box<Self>, err: DispatchError) {
        let kind = err.kind();
        self.state.lock().error = Some(err);
        self.finish(Event::Error(kind));
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }
}

impl ManualClock {
    #[must_use]
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, now: SystemTime) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}
