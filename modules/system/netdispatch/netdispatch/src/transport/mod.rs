//! HTTP/1.1 transport below the dispatch layer.
//!
//! A [`Connect`] implementation opens byte streams, a [`Pool`] runs requests
//! over connections to one origin, and an [`Agent`] keeps one pool per origin.

mod agent;
mod connector;
mod pool;

pub use agent::{Agent, OriginFactory};
pub use connector::{Connect, ConnectTarget, DirectConnector, TlsSettings};
pub use pool::{Pool, PoolStats};

use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream: plain TCP, TLS, or TLS inside a proxy tunnel.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub type BoxedIo = Box<dyn Io>;
