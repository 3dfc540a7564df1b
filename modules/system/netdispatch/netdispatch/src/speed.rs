//! Download throughput tracking.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http::StatusCode;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::dispatcher::{Dispatcher, SharedDispatcher};
use crate::error::DispatchError;
use crate::handler::{AbortSignal, DecoratorHandler, DispatchHandler, Flow, Resume};
use crate::headers::HeaderRecord;
use crate::options::DispatchOptions;
use crate::transport::BoxedIo;

/// Counts received body bytes.
#[derive(Debug)]
pub struct SpeedMonitor {
    bytes: AtomicU64,
    last_sample: Mutex<Instant>,
}

impl Default for SpeedMonitor {
    fn default() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            last_sample: Mutex::new(Instant::now()),
        }
    }
}

impl SpeedMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, len: usize) {
        self.bytes
            .fetch_add(u64::try_from(len).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Bytes per second received since the previous sample.
    #[must_use]
    pub fn sample(&self) -> u64 {
        let now = Instant::now();
        let elapsed = {
            let mut last = self.last_sample.lock();
            let elapsed = now.saturating_duration_since(*last);
            *last = now;
            elapsed
        };
        let bytes = self.bytes.swap(0, Ordering::Relaxed);
        let per_second = u128::from(bytes)
            .saturating_mul(1000)
            .checked_div(elapsed.as_millis())
            .unwrap_or_default();
        u64::try_from(per_second).unwrap_or(u64::MAX)
    }
}

/// Feeds every body chunk into a [`SpeedMonitor`].
pub struct TrackSpeedHandler {
    monitor: Arc<SpeedMonitor>,
    inner: DecoratorHandler,
}

impl TrackSpeedHandler {
    #[must_use]
    pub fn new(monitor: Arc<SpeedMonitor>, inner: Box<dyn DispatchHandler>) -> Self {
        Self {
            monitor,
            inner: DecoratorHandler::new(inner),
        }
    }
}

impl DispatchHandler for TrackSpeedHandler {
    fn on_connect(&mut self, abort: AbortSignal) {
        self.inner.on_connect(abort);
    }

    fn on_headers(&mut self, status: StatusCode, headers: &HeaderRecord, resume: Resume) -> Flow {
        self.inner.on_headers(status, headers, resume)
    }

    fn on_data(&mut self, chunk: Bytes) -> Flow {
        self.monitor.record(chunk.len());
        self.inner.on_data(chunk)
    }

    fn on_body_sent(&mut self, len: usize) {
        self.inner.on_body_sent(len);
    }

    fn on_complete(self: Box<Self>, trailers: Vec<String>) {
        self.inner.complete(trailers);
    }

    fn on_error(self: Box<Self>, err: DispatchError) {
        self.inner.error(err);
    }

    fn on_upgrade(self: Box<Self>, status: StatusCode, headers: &HeaderRecord, io: BoxedIo) {
        self.inner.upgrade(status, headers, io);
    }
}

pub struct TrackSpeedDispatcher {
    inner: SharedDispatcher,
    monitor: Arc<SpeedMonitor>,
}

impl TrackSpeedDispatcher {
    #[must_use]
    pub fn new(inner: SharedDispatcher, monitor: Arc<SpeedMonitor>) -> Self {
        Self { inner, monitor }
    }
}

impl Dispatcher for TrackSpeedDispatcher {
    fn dispatch(&self, opts: DispatchOptions, handler: Box<dyn DispatchHandler>) {
        self.inner
            .dispatch(opts, Box::new(TrackSpeedHandler::new(self.monitor.clone(), handler)));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dispatcher::DispatchExt;
    use crate::test_support::{MockDispatcher, MockReply};

    #[tokio::test(start_paused = true)]
    async fn sample_reports_bytes_per_second() {
        let monitor = SpeedMonitor::new();
        monitor.record(3000);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(monitor.sample(), 1500);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(monitor.sample(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatcher_counts_body_bytes() {
        let mock = MockDispatcher::new();
        mock.push(MockReply::ok(vec![0u8; 4096]));
        let monitor = Arc::new(SpeedMonitor::new());
        let tracked = TrackSpeedDispatcher::new(Arc::new(mock), monitor.clone());

        let resp = tracked
            .request(DispatchOptions::get("https://cdn.example/a.bin").unwrap())
            .await
            .unwrap();
        assert_eq!(resp.body.len(), 4096);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(monitor.sample(), 1024);
    }
}
