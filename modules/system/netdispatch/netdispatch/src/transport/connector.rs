use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use url::{Host, Url};

use super::BoxedIo;
use crate::error::{DispatchError, TimeoutPhase};

/// Where a connection should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// `http` or `https`.
    pub protocol: String,
    /// Host name or IP literal, without brackets.
    pub host: String,
    pub port: u16,
    /// TLS server name; defaults to `host`.
    pub servername: Option<String>,
}

impl ConnectTarget {
    /// # Errors
    /// Returns [`DispatchError::InvalidRequest`] for non-http(s) origins or
    /// origins without a host.
    pub fn from_origin(origin: &Url) -> Result<Self, DispatchError> {
        let protocol = origin.scheme();
        if protocol != "http" && protocol != "https" {
            return Err(DispatchError::InvalidRequest(format!(
                "unsupported scheme: {protocol}"
            )));
        }
        let host = match origin.host() {
            Some(Host::Domain(domain)) => domain.to_owned(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(DispatchError::InvalidRequest("origin has no host".into())),
        };
        let port = origin
            .port_or_known_default()
            .unwrap_or(if protocol == "https" { 443 } else { 80 });
        Ok(Self {
            protocol: protocol.to_owned(),
            servername: Some(host.clone()),
            host,
            port,
        })
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.protocol == "https"
    }

    /// `host:port`, with IPv6 literals bracketed.
    #[must_use]
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    #[must_use]
    pub fn servername(&self) -> &str {
        self.servername.as_deref().unwrap_or(&self.host)
    }
}

/// Opens transport streams for pools.
#[async_trait::async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self, target: &ConnectTarget) -> Result<BoxedIo, DispatchError>;
}

/// Client TLS configuration shared by direct and tunneled connections.
#[derive(Clone)]
pub struct TlsSettings {
    connector: TlsConnector,
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings").finish_non_exhaustive()
    }
}

impl TlsSettings {
    /// Trusts the platform's root certificates.
    ///
    /// # Errors
    /// Returns [`DispatchError::Connect`] when no TLS configuration can be built.
    pub fn native_roots() -> Result<Self, DispatchError> {
        let loaded = rustls_native_certs::load_native_certs();
        for err in &loaded.errors {
            tracing::warn!(error = %err, "failed to load a native root certificate");
        }
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
        tracing::debug!(added, ignored, "loaded native root certificates");

        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| DispatchError::Connect(format!("tls setup: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
        Ok(Self::from_config(config))
    }

    #[must_use]
    pub fn from_config(mut config: ClientConfig) -> Self {
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Runs a client handshake over `io` using `servername` for SNI.
    ///
    /// # Errors
    /// Returns [`DispatchError::Connect`] for invalid names or failed handshakes.
    pub async fn handshake(&self, io: BoxedIo, servername: &str) -> Result<BoxedIo, DispatchError> {
        let name = ServerName::try_from(servername.to_owned())
            .map_err(|e| DispatchError::Connect(format!("invalid server name {servername}: {e}")))?;
        let stream = self
            .connector
            .connect(name, io)
            .await
            .map_err(|e| DispatchError::Connect(format!("tls handshake with {servername}: {e}")))?;
        Ok(Box::new(stream))
    }
}

/// TCP, plus TLS for `https` targets.
#[derive(Debug)]
pub struct DirectConnector {
    connect_timeout_ms: AtomicU64,
    tls: TlsSettings,
}

impl DirectConnector {
    #[must_use]
    pub fn new(connect_timeout: Duration, tls: TlsSettings) -> Self {
        Self {
            connect_timeout_ms: AtomicU64::new(millis(connect_timeout)),
            tls,
        }
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.connect_timeout_ms.store(millis(timeout), Ordering::Relaxed);
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn tls(&self) -> &TlsSettings {
        &self.tls
    }

    /// Plain TCP connection bounded by the connect timeout.
    ///
    /// # Errors
    /// Returns a connect timeout or the mapped socket error.
    pub async fn open_tcp(&self, host: &str, port: u16) -> Result<TcpStream, DispatchError> {
        let stream = tokio::time::timeout(self.connect_timeout(), TcpStream::connect((host, port)))
            .await
            .map_err(|_| DispatchError::timeout(TimeoutPhase::Connect))??;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(host, port, error = %e, "failed to set TCP_NODELAY");
        }
        Ok(stream)
    }
}

#[async_trait::async_trait]
impl Connect for DirectConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<BoxedIo, DispatchError> {
        let tcp = self.open_tcp(&target.host, target.port).await?;
        if target.is_tls() {
            self.tls.handshake(Box::new(tcp), target.servername()).await
        } else {
            Ok(Box::new(tcp))
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
