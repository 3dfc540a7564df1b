use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::header::{HOST, PROXY_AUTHORIZATION};
use http::{HeaderValue, Method, Request, StatusCode};
use http_body_util::Empty;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::{DispatchError, TimeoutPhase};
use crate::transport::{BoxedIo, ConnectTarget, DirectConnector};

/// An HTTP proxy reachable over `http` or `https`, with optional Basic
/// credentials taken from the URL's userinfo.
pub struct ProxyClient {
    /// Proxy URL with the credentials stripped.
    url: Url,
    target: ConnectTarget,
    authorization: Option<SecretString>,
}

impl std::fmt::Debug for ProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClient")
            .field("url", &self.url.as_str())
            .field("authorization", &self.authorization.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl ProxyClient {
    /// # Errors
    /// Returns [`DispatchError::InvalidRequest`] for unparsable URLs.
    pub fn parse(raw: &str) -> Result<Self, DispatchError> {
        let url = Url::parse(raw.trim())
            .map_err(|e| DispatchError::InvalidRequest(format!("invalid proxy url: {e}")))?;
        Self::from_url(url)
    }

    /// Credentials in `url` become a `Basic` authorization; they are removed
    /// from the stored URL.
    ///
    /// # Errors
    /// Returns [`DispatchError::InvalidRequest`] for non-http(s) proxies or
    /// credentials that are not valid percent-encoded UTF-8.
    pub fn from_url(mut url: Url) -> Result<Self, DispatchError> {
        let target = ConnectTarget::from_origin(&url)?;
        let authorization = if url.username().is_empty() && url.password().is_none() {
            None
        } else {
            let user = decode_userinfo(url.username())?;
            let password = decode_userinfo(url.password().unwrap_or_default())?;
            url.set_username("")
                .and_then(|()| url.set_password(None))
                .map_err(|()| {
                    DispatchError::InvalidRequest("proxy url cannot carry credentials".into())
                })?;
            Some(basic_authorization(&user, &password))
        };
        Ok(Self {
            url,
            target,
            authorization,
        })
    }

    /// Uses an explicit credential instead of the URL's userinfo.
    #[must_use]
    pub fn with_authorization(mut self, authorization: SecretString) -> Self {
        self.authorization = Some(authorization);
        self
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.authorization.is_some()
    }

    /// Opens a `CONNECT` tunnel to `target` through this proxy.
    ///
    /// For `https` targets the TLS handshake runs inside the tunnel with the
    /// target's server name.
    ///
    /// # Errors
    /// [`DispatchError::TunnelNotEstablished`] when the proxy answers anything
    /// but `200`; connect and TLS errors otherwise.
    pub async fn tunnel(
        &self,
        direct: &DirectConnector,
        target: &ConnectTarget,
    ) -> Result<BoxedIo, DispatchError> {
        let tunneled = tokio::time::timeout(direct.connect_timeout(), self.open_tunnel(direct, target))
            .await
            .map_err(|_| DispatchError::timeout(TimeoutPhase::Connect))??;

        if target.is_tls() {
            direct.tls().handshake(tunneled, target.servername()).await
        } else {
            Ok(tunneled)
        }
    }

    async fn open_tunnel(
        &self,
        direct: &DirectConnector,
        target: &ConnectTarget,
    ) -> Result<BoxedIo, DispatchError> {
        let tcp = direct.open_tcp(&self.target.host, self.target.port).await?;
        let io: BoxedIo = if self.target.is_tls() {
            direct.tls().handshake(Box::new(tcp), self.target.servername()).await?
        } else {
            Box::new(tcp)
        };

        let (mut sender, conn) = http1::Builder::new()
            .handshake::<_, Empty<Bytes>>(TokioIo::new(io))
            .await?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                tracing::debug!(error = %e, "proxy connection closed with error");
            }
        });

        let request = self.connect_request(target)?;
        let response = sender.send_request(request).await?;
        let status = response.status();
        if status != StatusCode::OK {
            tracing::debug!(proxy = %self.url, target = %target.authority(), %status, "proxy refused tunnel");
            return Err(DispatchError::TunnelNotEstablished { status });
        }

        let upgraded = hyper::upgrade::on(response).await?;
        tracing::debug!(proxy = %self.url, target = %target.authority(), "tunnel established");
        Ok(Box::new(TokioIo::new(upgraded)))
    }

    fn connect_request(&self, target: &ConnectTarget) -> Result<Request<Empty<Bytes>>, DispatchError> {
        let authority = target.authority();
        let mut request = Request::builder()
            .method(Method::CONNECT)
            .uri(authority.as_str())
            .header(HOST, authority.as_str())
            .body(Empty::new())
            .map_err(|e| DispatchError::InvalidRequest(format!("invalid tunnel target: {e}")))?;
        if let Some(authorization) = &self.authorization {
            let mut value = HeaderValue::from_str(authorization.expose_secret())
                .map_err(|_| DispatchError::InvalidRequest("invalid proxy credentials".into()))?;
            value.set_sensitive(true);
            request.headers_mut().insert(PROXY_AUTHORIZATION, value);
        }
        Ok(request)
    }
}

fn decode_userinfo(raw: &str) -> Result<String, DispatchError> {
    urlencoding::decode(raw)
        .map(std::borrow::Cow::into_owned)
        .map_err(|_| DispatchError::InvalidRequest("proxy credentials are not valid UTF-8".into()))
}

fn basic_authorization(user: &str, password: &str) -> SecretString {
    let encoded = STANDARD.encode(format!("{user}:{password}"));
    SecretString::from(format!("Basic {encoded}"))
}
