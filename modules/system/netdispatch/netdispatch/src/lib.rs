//! Outbound HTTP dispatch layer for the launcher.
//!
//! Every request flows through a stack of [`Dispatcher`]s, each wrapping the
//! next and reporting back through a [`DispatchHandler`]:
//!
//! - interceptors that tag the request and fill defaults
//!   ([`interceptor::InteroperableDispatcher`])
//! - the response cache, API requests only ([`cache::CacheDispatcher`])
//! - the proxy layer that owns the upstream route ([`proxy::ProxyDispatcher`])
//! - the download/API split ([`router::BiDispatcher`]) with retries below it
//! - per-origin HTTP/1.1 connection pools ([`transport::Agent`])
//!
//! [`NetworkInterface`] assembles the whole stack from a [`DispatchConfig`].
//!
//! # Example
//!
//! ```no_run
//! use netdispatch::{DispatchConfig, DispatchExt, DispatchOptions, NetworkInterface};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DispatchConfig::load(None)?;
//! let network = NetworkInterface::in_memory(config)?;
//!
//! let versions = network
//!     .api_dispatcher()
//!     .request(DispatchOptions::get("https://launchermeta.example/versions.json")?)
//!     .await?;
//! println!("{} ({} bytes)", versions.status, versions.body.len());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod headers;
pub mod interceptor;
pub mod network;
pub mod options;
pub mod proxy;
pub mod retry;
pub mod router;
pub mod speed;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use config::{ConfigError, DispatchConfig, NetworkSettings};
pub use dispatcher::{CollectedResponse, DispatchExt, Dispatcher, SharedDispatcher};
pub use error::{DispatchError, ErrorKind, TimeoutPhase};
pub use handler::{AbortSignal, DecoratorHandler, DispatchHandler, Flow, Resume};
pub use headers::{HeaderRecord, Headers};
pub use network::{NetworkInterface, NetworkStatus};
pub use options::{CacheStrategy, DispatchOptions, RequestBody};
