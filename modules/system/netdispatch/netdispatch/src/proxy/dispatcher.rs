use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use super::{ProxyClient, ProxyConnector};
use crate::dispatcher::{Dispatcher, SharedDispatcher};
use crate::error::DispatchError;
use crate::handler::DispatchHandler;
use crate::options::DispatchOptions;

/// Something whose proxy can be changed at runtime.
pub trait ProxySettings: Send + Sync {
    fn set_proxy_enabled(&self, enabled: bool);

    fn set_proxy(&self, proxy: Option<Arc<ProxyClient>>);
}

/// Front of the transport stack that owns the proxy-aware connector.
///
/// Rejects requests carrying their own `proxy-authorization` and sets `host`
/// from the request origin before handing over to `inner`, whose pools are
/// expected to connect through `connector`.
pub struct ProxyDispatcher {
    connector: Arc<ProxyConnector>,
    inner: SharedDispatcher,
}

impl ProxyDispatcher {
    #[must_use]
    pub fn new(connector: Arc<ProxyConnector>, inner: SharedDispatcher) -> Self {
        Self { connector, inner }
    }

    #[must_use]
    pub fn connector(&self) -> &Arc<ProxyConnector> {
        &self.connector
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.connector.set_connect_timeout(timeout);
    }
}

impl ProxySettings for ProxyDispatcher {
    fn set_proxy_enabled(&self, enabled: bool) {
        self.connector.set_enabled(enabled);
    }

    fn set_proxy(&self, proxy: Option<Arc<ProxyClient>>) {
        self.connector.set_client(proxy);
    }
}

impl Dispatcher for ProxyDispatcher {
    fn dispatch(&self, mut opts: DispatchOptions, handler: Box<dyn DispatchHandler>) {
        if let Err(err) = reject_proxy_authorization(&opts) {
            handler.on_error(err);
            return;
        }
        opts.headers.insert("host", host_header(&opts.origin));
        self.inner.dispatch(opts, handler);
    }
}

/// Proxy credentials belong to the proxy configuration; a request carrying
/// its own `proxy-authorization` is refused.
///
/// # Errors
/// Returns [`DispatchError::SecurityViolation`] when the header is present.
pub fn reject_proxy_authorization(opts: &DispatchOptions) -> Result<(), DispatchError> {
    if opts.headers.contains("proxy-authorization") {
        return Err(DispatchError::SecurityViolation(
            "proxy-authorization must be configured on the proxy, not sent with requests".into(),
        ));
    }
    Ok(())
}

fn host_header(origin: &url::Url) -> String {
    let host = origin.host_str().unwrap_or_default();
    match origin.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    }
}

/// Fans proxy changes out to every registered [`ProxySettings`].
#[derive(Default)]
pub struct ProxySettingController {
    targets: RwLock<Vec<Arc<dyn ProxySettings>>>,
}

impl ProxySettingController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, target: Arc<dyn ProxySettings>) {
        self.targets.write().push(target);
    }

    pub fn set_proxy_enabled(&self, enabled: bool) {
        for target in self.targets.read().iter() {
            target.set_proxy_enabled(enabled);
        }
    }

    pub fn set_proxy(&self, proxy: Option<ProxyClient>) {
        let proxy = proxy.map(Arc::new);
        for target in self.targets.read().iter() {
            target.set_proxy(proxy.clone());
        }
    }
}
