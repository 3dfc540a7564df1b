//! Configuration for the dispatch stack.
//!
//! Sources, lowest priority first: built-in defaults, an optional YAML file,
//! then `NETDISPATCH_*` environment variables (`__` separates nesting levels,
//! e.g. `NETDISPATCH_CACHE__REVALIDATION_TIMEOUT=5s`). Durations are
//! humantime strings or plain seconds.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_PREFIX: &str = "NETDISPATCH_";

/// Proxy environment variables consulted when no proxy is configured.
const PROXY_ENV_VARS: [&str; 2] = ["HTTPS_PROXY", "https_proxy"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    MissingFile(String),
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom),
        }
    }
}

mod secret_serde {
    use secrecy::SecretString;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<String>::deserialize(deserializer)?
            .filter(|s| !s.trim().is_empty())
            .map(SecretString::from))
    }
}

/// Process-wide network settings that can change at runtime.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Connection cap for pools that follow it; zero or negative is unbounded.
    pub max_sockets: i64,
    pub http_proxy_enabled: bool,
    /// Proxy URL, optionally with `user:password@` credentials.
    #[serde(skip_serializing, deserialize_with = "secret_serde::deserialize")]
    pub http_proxy: Option<SecretString>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            max_sockets: 64,
            http_proxy_enabled: true,
            http_proxy: None,
        }
    }
}

impl Clone for NetworkSettings {
    fn clone(&self) -> Self {
        Self {
            max_sockets: self.max_sockets,
            http_proxy_enabled: self.http_proxy_enabled,
            http_proxy: self
                .http_proxy
                .as_ref()
                .map(|p| SecretString::from(p.expose_secret().to_owned())),
        }
    }
}

impl NetworkSettings {
    /// `None` when `max_sockets` is unbounded.
    #[must_use]
    pub fn socket_limit(&self) -> Option<usize> {
        usize::try_from(self.max_sockets).ok().filter(|n| *n > 0)
    }
}

/// Shared, atomically replaceable [`NetworkSettings`].
#[derive(Debug, Clone)]
pub struct SharedSettings {
    inner: Arc<ArcSwap<NetworkSettings>>,
}

impl Default for SharedSettings {
    fn default() -> Self {
        Self::new(NetworkSettings::default())
    }
}

impl SharedSettings {
    #[must_use]
    pub fn new(settings: NetworkSettings) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(settings)),
        }
    }

    #[must_use]
    pub fn load(&self) -> Arc<NetworkSettings> {
        self.inner.load_full()
    }

    pub fn store(&self, settings: NetworkSettings) {
        self.inner.store(Arc::new(settings));
    }
}

/// Response cache tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries kept by the in-memory store.
    pub capacity: usize,
    /// Responses with larger bodies are passed through but not stored.
    pub max_entry_bytes: usize,
    /// How long entries outlive their freshness in the store.
    #[serde(with = "duration_serde")]
    pub stale_retention: Duration,
    /// Revalidate stale `GET` entries with a `HEAD` first.
    pub preflight_head: bool,
    /// Longest wait for response headers before falling back to a stale entry.
    #[serde(with = "duration_serde")]
    pub revalidation_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            max_entry_bytes: 16 * 1024 * 1024,
            stale_retention: Duration::from_secs(7 * 24 * 60 * 60),
            preflight_head: false,
            revalidation_timeout: Duration::from_secs(15),
        }
    }
}

/// Open-connection cap of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionLimit {
    /// Follow `settings.max_sockets`, read each time a connection is opened.
    MaxSockets,
    Unbounded,
    Fixed(usize),
}

/// Profile of every per-origin pool one agent creates.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub headers_timeout: Duration,
    /// Longest gap between two body chunks.
    #[serde(with = "duration_serde")]
    pub body_timeout: Duration,
    /// Idle connections are closed after this long.
    #[serde(with = "duration_serde")]
    pub keep_alive: Duration,
    /// Requests in flight per connection. HTTP/1.1 connections here carry one at a time.
    pub pipelining: u32,
    pub connections: ConnectionLimit,
}

impl PoolConfig {
    #[must_use]
    pub fn download() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            headers_timeout: Duration::from_secs(10),
            body_timeout: Duration::from_secs(15),
            keep_alive: Duration::from_secs(4),
            pipelining: 1,
            connections: ConnectionLimit::MaxSockets,
        }
    }

    #[must_use]
    pub fn api() -> Self {
        Self {
            body_timeout: Duration::from_secs(20),
            ..Self::download()
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolsConfig {
    pub download: PoolConfig,
    pub api: PoolConfig,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            download: PoolConfig::download(),
            api: PoolConfig::api(),
        }
    }
}

/// Retry behaviour below the router.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "duration_serde")]
    pub min_delay: Duration,
    #[serde(with = "duration_serde")]
    pub max_delay: Duration,
    pub status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            status_codes: vec![429, 500, 502, 503, 504, 567],
        }
    }
}

/// Everything needed to assemble a [`crate::NetworkInterface`].
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Sent when the caller set no `user-agent`.
    pub user_agent: String,
    pub settings: NetworkSettings,
    pub cache: CacheConfig,
    pub pools: PoolsConfig,
    pub retry: RetryConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("netdispatch/", env!("CARGO_PKG_VERSION")).to_owned(),
            settings: NetworkSettings::default(),
            cache: CacheConfig::default(),
            pools: PoolsConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Loads defaults, then `path` when given, then the environment.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when the file is missing, a source does not
    /// parse, or the result fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigError::MissingFile(path.display().to_string()));
            }
            figment = figment.merge(Yaml::file(path));
        }
        let mut config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        config.apply_proxy_env_fallback();
        config.validate()?;
        Ok(config)
    }

    fn apply_proxy_env_fallback(&mut self) {
        if self.settings.http_proxy.is_some() {
            return;
        }
        let from_env = PROXY_ENV_VARS
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .find(|value| !value.trim().is_empty());
        if let Some(proxy) = from_env {
            tracing::info!("using proxy from environment");
            self.settings.http_proxy = Some(SecretString::from(proxy));
        }
    }

    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::Invalid("user_agent must not be empty".into()));
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid("cache.capacity must be positive".into()));
        }
        if self.cache.revalidation_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "cache.revalidation_timeout must be positive".into(),
            ));
        }
        for (name, pool) in [("download", &self.pools.download), ("api", &self.pools.api)] {
            if pool.connect_timeout.is_zero() || pool.headers_timeout.is_zero() || pool.body_timeout.is_zero() {
                return Err(ConfigError::Invalid(format!("pools.{name}: timeouts must be positive")));
            }
            if pool.pipelining == 0 {
                return Err(ConfigError::Invalid(format!("pools.{name}.pipelining must be at least 1")));
            }
            if pool.connections == ConnectionLimit::Fixed(0) {
                return Err(ConfigError::Invalid(format!("pools.{name}.connections must be positive")));
            }
        }
        if self.retry.min_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid("retry.min_delay exceeds retry.max_delay".into()));
        }
        Ok(())
    }
}
