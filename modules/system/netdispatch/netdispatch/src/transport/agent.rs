use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use url::Url;

use super::{Connect, Pool, PoolStats};
use crate::config::{PoolConfig, SharedSettings};
use crate::dispatcher::{Dispatcher, SharedDispatcher};
use crate::error::DispatchError;
use crate::handler::DispatchHandler;
use crate::options::DispatchOptions;

/// Supplies a custom dispatcher for an origin, or `None` to use a regular pool.
pub type OriginFactory = Arc<dyn Fn(&Url) -> Option<SharedDispatcher> + Send + Sync>;

#[derive(Clone)]
enum Slot {
    Pool(Pool),
    Custom(SharedDispatcher),
}

impl Slot {
    fn dispatcher(&self) -> SharedDispatcher {
        match self {
            Slot::Pool(pool) => Arc::new(pool.clone()),
            Slot::Custom(custom) => custom.clone(),
        }
    }
}

/// Origin to pool map; every pool shares one profile.
pub struct Agent {
    name: &'static str,
    connector: Arc<dyn Connect>,
    config: PoolConfig,
    settings: SharedSettings,
    slots: DashMap<String, Slot>,
    factories: RwLock<Vec<OriginFactory>>,
}

impl Agent {
    #[must_use]
    pub fn new(
        name: &'static str,
        connector: Arc<dyn Connect>,
        config: PoolConfig,
        settings: SharedSettings,
    ) -> Self {
        Self {
            name,
            connector,
            config,
            settings,
            slots: DashMap::new(),
            factories: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Consulted before creating a pool for a new origin. The most recently
    /// registered factory is asked first.
    pub fn register_factory(&self, factory: OriginFactory) {
        self.factories.write().insert(0, factory);
    }

    fn slot_for(&self, origin: &Url) -> Result<SharedDispatcher, DispatchError> {
        let key = origin.origin().ascii_serialization();
        if let Some(slot) = self.slots.get(&key) {
            return Ok(slot.dispatcher());
        }

        let custom = self.factories.read().iter().find_map(|factory| factory(origin));
        let slot = match custom {
            Some(dispatcher) => Slot::Custom(dispatcher),
            None => Slot::Pool(Pool::new(
                origin,
                self.connector.clone(),
                self.config.clone(),
                self.settings.clone(),
            )?),
        };
        tracing::debug!(agent = self.name, origin = %key, custom = matches!(slot, Slot::Custom(_)), "created pool");
        let slot = self.slots.entry(key).or_insert(slot).clone();
        Ok(slot.dispatcher())
    }

    /// Closes and forgets the pool for `origin`. Returns whether one existed.
    pub fn destroy_pool(&self, origin: &Url) -> bool {
        let key = origin.origin().ascii_serialization();
        match self.slots.remove(&key) {
            Some((_, Slot::Pool(pool))) => {
                pool.close();
                tracing::debug!(agent = self.name, origin = %key, "pool destroyed");
                true
            }
            Some((_, Slot::Custom(_))) => true,
            None => false,
        }
    }

    /// Closes every pool; later requests get fresh ones.
    pub fn reset(&self) {
        let keys: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, Slot::Pool(pool))) = self.slots.remove(&key) {
                pool.close();
            }
        }
    }

    /// Stats of every regular pool, by origin.
    #[must_use]
    pub fn stats(&self) -> BTreeMap<String, PoolStats> {
        self.slots
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Pool(pool) => Some((entry.key().clone(), pool.stats())),
                Slot::Custom(_) => None,
            })
            .collect()
    }
}

impl Dispatcher for Agent {
    fn dispatch(&self, opts: DispatchOptions, handler: Box<dyn DispatchHandler>) {
        match self.slot_for(&opts.origin) {
            Ok(dispatcher) => dispatcher.dispatch(opts, handler),
            Err(err) => handler.on_error(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::config::NetworkSettings;
    use crate::dispatcher::DispatchExt;
    use crate::test_support::{MockDispatcher, MockReply, RecordingHandler};
    use crate::transport::{DirectConnector, TlsSettings};

    fn agent() -> Agent {
        Agent::new(
            "api",
            Arc::new(DirectConnector::new(
                Duration::from_secs(1),
                TlsSettings::native_roots().unwrap(),
            )),
            PoolConfig::api(),
            SharedSettings::default(),
        )
    }

    #[tokio::test]
    async fn latest_factory_wins_for_its_origin() {
        let agent = agent();
        let older = MockDispatcher::new();
        let newer = MockDispatcher::new();
        newer.push(MockReply::ok("custom"));

        let (o, n) = (older.clone(), newer.clone());
        agent.register_factory(Arc::new(move |_: &Url| Some(Arc::new(o.clone()) as SharedDispatcher)));
        agent.register_factory(Arc::new(move |url: &Url| {
            (url.host_str() == Some("plugin.example")).then(|| Arc::new(n.clone()) as SharedDispatcher)
        }));

        let resp = agent
            .request(DispatchOptions::get("https://plugin.example/x").unwrap())
            .await
            .unwrap();
        assert_eq!(resp.text(), "custom");
        assert_eq!(older.calls(), 0);
        assert!(agent.stats().is_empty());
    }

    #[tokio::test]
    async fn pools_are_created_lazily_and_destroyed() {
        let agent = agent();
        let origin = Url::parse("http://127.0.0.1:9").unwrap();
        assert!(agent.stats().is_empty());

        // The request fails to connect but leaves a pool behind.
        let _ = agent
            .request(DispatchOptions::get("http://127.0.0.1:9/x").unwrap())
            .await;
        assert_eq!(agent.stats().len(), 1);
        assert!(agent.stats().contains_key("http://127.0.0.1:9"));

        assert!(agent.destroy_pool(&origin));
        assert!(!agent.destroy_pool(&origin));
        assert!(agent.stats().is_empty());
    }

    #[tokio::test]
    async fn api_pools_follow_max_sockets() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and hold every socket without answering.
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let agent = Agent::new(
            "api",
            Arc::new(DirectConnector::new(
                Duration::from_secs(1),
                TlsSettings::native_roots().unwrap(),
            )),
            PoolConfig::api(),
            SharedSettings::new(NetworkSettings {
                max_sockets: 1,
                ..NetworkSettings::default()
            }),
        );
        let mut logs = Vec::new();
        for i in 0..4 {
            let (recorder, log) = RecordingHandler::new();
            agent.dispatch(
                DispatchOptions::get(&format!("http://{addr}/v1/{i}")).unwrap(),
                Box::new(recorder),
            );
            logs.push(log);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stats = agent.stats()[&format!("http://{addr}")];
        assert_eq!(stats.connected, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.queued, 3);
    }

    #[tokio::test]
    async fn invalid_origin_fails_through_handler() {
        let agent = agent();
        let mut opts = DispatchOptions::get("https://a.example/x").unwrap();
        opts.origin = Url::parse("ftp://a.example").unwrap();
        let err = agent.request(opts).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidRequest);
    }
}
