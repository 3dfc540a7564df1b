//! Assembly of the full dispatch stack.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use url::Url;

use crate::cache::{CacheDispatcher, CacheStorage, JsonCacheStorage, MemoryStorage};
use crate::clock::{Clock, SystemClock};
use crate::config::{DispatchConfig, NetworkSettings, SharedSettings};
use crate::dispatcher::SharedDispatcher;
use crate::error::DispatchError;
use crate::interceptor::{DefaultUserAgent, DispatchInterceptor, InteroperableDispatcher, PoolTag};
use crate::proxy::{ProxyClient, ProxyConnector, ProxyDispatcher, ProxySettingController};
use crate::retry::RetryDispatcher;
use crate::router::BiDispatcher;
use crate::speed::{SpeedMonitor, TrackSpeedDispatcher};
use crate::transport::{Agent, DirectConnector, OriginFactory, PoolStats, TlsSettings};

/// Snapshot of both agents and the download speed.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStatus {
    pub download: BTreeMap<String, PoolStats>,
    pub api: BTreeMap<String, PoolStats>,
    /// Bytes per second since the previous status call.
    pub download_speed: u64,
}

/// The API and download dispatchers with everything they share.
///
/// API requests go through the interceptors, the response cache, the proxy
/// and the API pools; downloads skip the cache and use the download pools.
pub struct NetworkInterface {
    settings: SharedSettings,
    proxy: Arc<ProxyDispatcher>,
    proxy_controller: Arc<ProxySettingController>,
    download_agent: Arc<Agent>,
    api_agent: Arc<Agent>,
    speed: Arc<SpeedMonitor>,
    api: Arc<InteroperableDispatcher>,
    download: Arc<InteroperableDispatcher>,
}

impl NetworkInterface {
    /// Builds the stack with an in-memory response cache.
    ///
    /// # Errors
    /// Returns [`DispatchError::Connect`] when TLS cannot be set up.
    pub fn in_memory(config: DispatchConfig) -> Result<Self, DispatchError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let storage = JsonCacheStorage::new(
            MemoryStorage::new(config.cache.capacity),
            clock.clone(),
            config.cache.stale_retention,
        );
        Self::build(config, Arc::new(storage), clock)
    }

    /// # Errors
    /// Returns [`DispatchError::Connect`] when TLS cannot be set up.
    pub fn build(
        config: DispatchConfig,
        storage: Arc<dyn CacheStorage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DispatchError> {
        let tls = TlsSettings::native_roots()?;
        Ok(Self::with_tls(config, storage, clock, tls))
    }

    #[must_use]
    pub fn with_tls(
        config: DispatchConfig,
        storage: Arc<dyn CacheStorage>,
        clock: Arc<dyn Clock>,
        tls: TlsSettings,
    ) -> Self {
        let DispatchConfig {
            user_agent,
            settings: initial,
            cache,
            pools,
            retry,
        } = config;

        let connect_timeout = pools.download.connect_timeout.max(pools.api.connect_timeout);
        let connector = Arc::new(ProxyConnector::new(
            DirectConnector::new(connect_timeout, tls),
            initial.http_proxy_enabled,
        ));
        connector.set_client(parse_proxy(initial.http_proxy.as_ref()).map(Arc::new));

        let settings = SharedSettings::new(initial);
        let download_agent = Arc::new(Agent::new(
            "download",
            connector.clone(),
            pools.download,
            settings.clone(),
        ));
        let api_agent = Arc::new(Agent::new("api", connector.clone(), pools.api, settings.clone()));
        let speed = Arc::new(SpeedMonitor::new());

        let bi = BiDispatcher::new(
            Arc::new(RetryDispatcher::new(
                Arc::new(TrackSpeedDispatcher::new(download_agent.clone(), speed.clone())),
                retry.clone(),
            )),
            Arc::new(RetryDispatcher::new(api_agent.clone(), retry)),
        );
        let proxy = Arc::new(ProxyDispatcher::new(connector, Arc::new(bi)));
        let proxy_controller = Arc::new(ProxySettingController::new());
        proxy_controller.add(proxy.clone());

        let default_ua: Arc<dyn DispatchInterceptor> = Arc::new(DefaultUserAgent(user_agent));
        let api_tag: Arc<dyn DispatchInterceptor> = Arc::new(PoolTag { download: false });
        let download_tag: Arc<dyn DispatchInterceptor> = Arc::new(PoolTag { download: true });
        let api = Arc::new(InteroperableDispatcher::new(
            vec![api_tag, default_ua.clone()],
            Arc::new(CacheDispatcher::new(proxy.clone(), storage, clock, cache)),
        ));
        let download = Arc::new(InteroperableDispatcher::new(
            vec![download_tag, default_ua],
            proxy.clone(),
        ));

        Self {
            settings,
            proxy,
            proxy_controller,
            download_agent,
            api_agent,
            speed,
            api,
            download,
        }
    }

    /// Cached, interceptable dispatcher for API calls.
    #[must_use]
    pub fn api_dispatcher(&self) -> SharedDispatcher {
        self.api.clone()
    }

    /// Uncached dispatcher for file transfers.
    #[must_use]
    pub fn download_dispatcher(&self) -> SharedDispatcher {
        self.download.clone()
    }

    /// Runs `interceptor` on API requests, before every earlier registration.
    pub fn register_dispatch_interceptor(&self, interceptor: Arc<dyn DispatchInterceptor>) {
        self.api.register(interceptor);
    }

    /// Lets `factory` supply the dispatcher for API origins it recognizes.
    pub fn register_api_factory(&self, factory: OriginFactory) {
        self.api_agent.register_factory(factory);
    }

    #[must_use]
    pub fn settings(&self) -> Arc<NetworkSettings> {
        self.settings.load()
    }

    /// Applies new network settings. A changed proxy closes every pool so no
    /// connection opened under the old route is reused.
    pub fn apply_settings(&self, settings: NetworkSettings) {
        let previous = self.settings.load();
        if previous.max_sockets != settings.max_sockets {
            tracing::info!(
                from = previous.max_sockets,
                to = settings.max_sockets,
                "max sockets changed"
            );
        }

        let proxy_changed = previous.http_proxy_enabled != settings.http_proxy_enabled
            || !same_proxy(previous.http_proxy.as_ref(), settings.http_proxy.as_ref());
        if proxy_changed {
            self.proxy_controller
                .set_proxy_enabled(settings.http_proxy_enabled);
            self.proxy_controller
                .set_proxy(parse_proxy(settings.http_proxy.as_ref()));
            self.download_agent.reset();
            self.api_agent.reset();
            tracing::info!(
                enabled = settings.http_proxy_enabled,
                configured = settings.http_proxy.is_some(),
                "proxy settings changed, pools reset"
            );
        }
        self.settings.store(settings);
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.proxy.set_connect_timeout(timeout);
    }

    #[must_use]
    pub fn network_status(&self) -> NetworkStatus {
        NetworkStatus {
            download: self.download_agent.stats(),
            api: self.api_agent.stats(),
            download_speed: self.speed.sample(),
        }
    }

    /// Closes the pools for `origin` in both agents. Returns whether any existed.
    pub fn destroy_pool(&self, origin: &Url) -> bool {
        let download = self.download_agent.destroy_pool(origin);
        let api = self.api_agent.destroy_pool(origin);
        download || api
    }

    #[must_use]
    pub fn proxy_controller(&self) -> &Arc<ProxySettingController> {
        &self.proxy_controller
    }
}

fn same_proxy(a: Option<&SecretString>, b: Option<&SecretString>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.expose_secret() == b.expose_secret(),
        (None, None) => true,
        _ => false,
    }
}

fn parse_proxy(raw: Option<&SecretString>) -> Option<ProxyClient> {
    let raw = raw?;
    match ProxyClient::parse(raw.expose_secret()) {
        Ok(client) => Some(client),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring invalid proxy setting");
            None
        }
    }
}
