use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;

use super::ProxyClient;
use crate::error::DispatchError;
use crate::transport::{BoxedIo, Connect, ConnectTarget, DirectConnector};

/// Connects directly, or through a `CONNECT` tunnel while a proxy is enabled
/// and configured.
///
/// The proxy client is swapped, never mutated: a connect that already picked
/// up a client keeps using it after a replacement.
pub struct ProxyConnector {
    direct: DirectConnector,
    enabled: AtomicBool,
    client: ArcSwapOption<ProxyClient>,
}

impl std::fmt::Debug for ProxyConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConnector")
            .field("enabled", &self.is_enabled())
            .field("client", &self.client.load_full())
            .finish_non_exhaustive()
    }
}

impl ProxyConnector {
    #[must_use]
    pub fn new(direct: DirectConnector, enabled: bool) -> Self {
        Self {
            direct,
            enabled: AtomicBool::new(enabled),
            client: ArcSwapOption::empty(),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Installs `client`, dropping the previous one afterwards.
    pub fn set_client(&self, client: Option<Arc<ProxyClient>>) {
        let previous = self.client.swap(client);
        drop(previous);
    }

    #[must_use]
    pub fn client(&self) -> Option<Arc<ProxyClient>> {
        self.client.load_full()
    }

    /// The proxy new connections go through, if any.
    #[must_use]
    pub fn active(&self) -> Option<Arc<ProxyClient>> {
        if self.is_enabled() { self.client() } else { None }
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.direct.set_connect_timeout(timeout);
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.direct.connect_timeout()
    }
}

#[async_trait::async_trait]
impl Connect for ProxyConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<BoxedIo, DispatchError> {
        match self.active() {
            Some(proxy) => proxy.tunnel(&self.direct, target).await,
            None => self.direct.connect(target).await,
        }
    }
}
