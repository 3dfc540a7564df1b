//! Per-call dispatch descriptor.

use std::fmt;
use std::pin::Pin;

use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::Stream;
use http::Method;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::DispatchError;
use crate::headers::{HeaderRecord, Headers, normalize_headers};

/// Boxed error type for body stream errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Streaming request body.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send + Sync>>;

/// One multipart form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub name: String,
    pub value: FormValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormValue {
    Text(String),
    File {
        filename: Option<String>,
        content_type: Option<String>,
        data: Bytes,
    },
}

impl FormField {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: FormValue::Text(value.into()),
        }
    }

    pub fn file(name: impl Into<String>, filename: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: FormValue::File {
                filename: Some(filename.into()),
                content_type: None,
                data: data.into(),
            },
        }
    }

    /// Raw bytes of the value, as hashed into cache keys.
    #[must_use]
    pub fn value_bytes(&self) -> &[u8] {
        match &self.value {
            FormValue::Text(text) => text.as_bytes(),
            FormValue::File { data, .. } => data,
        }
    }
}

/// Request body.
#[derive(Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Bytes),
    Form(Vec<FormField>),
    Stream(BodyStream),
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => write!(f, "RequestBody::Empty"),
            RequestBody::Bytes(bytes) => f.debug_tuple("RequestBody::Bytes").field(&bytes.len()).finish(),
            RequestBody::Form(fields) => f.debug_tuple("RequestBody::Form").field(&fields.len()).finish(),
            RequestBody::Stream(_) => write!(f, "RequestBody::Stream(..)"),
        }
    }
}

impl RequestBody {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, RequestBody::Empty)
    }

    #[must_use]
    pub fn is_stream(&self) -> bool {
        matches!(self, RequestBody::Stream(_))
    }

    /// Copies a replayable body; streams cannot be replayed.
    #[must_use]
    pub fn try_clone(&self) -> Option<Self> {
        match self {
            RequestBody::Empty => Some(RequestBody::Empty),
            RequestBody::Bytes(b) => Some(RequestBody::Bytes(b.clone())),
            RequestBody::Form(fields) => Some(RequestBody::Form(fields.clone())),
            RequestBody::Stream(_) => None,
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        RequestBody::Bytes(bytes)
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        RequestBody::Bytes(Bytes::from(s))
    }
}

impl From<&'static str> for RequestBody {
    fn from(s: &'static str) -> Self {
        RequestBody::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(v: Vec<u8>) -> Self {
        RequestBody::Bytes(Bytes::from(v))
    }
}

impl From<Vec<FormField>> for RequestBody {
    fn from(fields: Vec<FormField>) -> Self {
        RequestBody::Form(fields)
    }
}

/// Encodes form fields as `multipart/form-data` with the given boundary.
#[must_use]
pub fn encode_multipart(fields: &[FormField], boundary: &str) -> Bytes {
    let mut out = BytesMut::new();
    for field in fields {
        out.put_slice(b"--");
        out.put_slice(boundary.as_bytes());
        out.put_slice(b"\r\n");
        match &field.value {
            FormValue::Text(text) => {
                out.put_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", field.name).as_bytes(),
                );
                out.put_slice(text.as_bytes());
            }
            FormValue::File {
                filename,
                content_type,
                data,
            } => {
                let mut disposition = format!("Content-Disposition: form-data; name=\"{}\"", field.name);
                if let Some(filename) = filename {
                    disposition.push_str("; filename=\"");
                    disposition.push_str(filename);
                    disposition.push('"');
                }
                out.put_slice(disposition.as_bytes());
                out.put_slice(b"\r\nContent-Type: ");
                out.put_slice(
                    content_type
                        .as_deref()
                        .unwrap_or("application/octet-stream")
                        .as_bytes(),
                );
                out.put_slice(b"\r\n\r\n");
                out.put_slice(data);
            }
        }
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"--");
    out.put_slice(boundary.as_bytes());
    out.put_slice(b"--\r\n");
    out.freeze()
}

/// How the cache layer treats a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    #[default]
    Default,
    /// Skip the cache entirely.
    NetworkOnly,
}

/// Routing flags carried alongside a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Extensions {
    /// `Some(true)` routes to the download pool, anything else to the API pool.
    pub use_download_pool: Option<bool>,
    pub cache_strategy: CacheStrategy,
}

/// What a request was, for error reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSummary {
    pub method: Method,
    pub origin: Url,
    pub path: String,
}

impl fmt::Display for RequestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{}",
            self.method,
            self.origin.origin().ascii_serialization(),
            self.path
        )
    }
}

/// One dispatch call.
#[derive(Debug)]
pub struct DispatchOptions {
    pub method: Method,
    /// Scheme, host and port; any path on it is ignored.
    pub origin: Url,
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Normalized; callers holding a flat list go through [`DispatchOptionsBuilder::headers`].
    pub headers: HeaderRecord,
    pub body: RequestBody,
    pub extensions: Extensions,
    /// Caller-side cancellation.
    pub signal: Option<CancellationToken>,
}

impl DispatchOptions {
    /// Create a new options builder
    #[must_use]
    pub fn builder() -> DispatchOptionsBuilder {
        DispatchOptionsBuilder::default()
    }

    /// Parses `url` into origin, path and query.
    ///
    /// # Errors
    /// Returns [`DispatchError::InvalidRequest`] for unparsable or non-http(s) URLs.
    pub fn get(url: &str) -> Result<Self, DispatchError> {
        Self::builder().url(url)?.build()
    }

    /// Path plus encoded query string.
    #[must_use]
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&self.query)
            .finish();
        let sep = if self.path.contains('?') { '&' } else { '?' };
        format!("{}{sep}{query}", self.path)
    }

    /// Absolute request URL.
    ///
    /// # Errors
    /// Returns [`DispatchError::InvalidRequest`] when the path does not join onto the origin.
    pub fn url(&self) -> Result<Url, DispatchError> {
        self.origin
            .join(&self.path_and_query())
            .map_err(|e| DispatchError::InvalidRequest(format!("invalid request path: {e}")))
    }

    #[must_use]
    pub fn summary(&self) -> RequestSummary {
        RequestSummary {
            method: self.method.clone(),
            origin: self.origin.clone(),
            path: self.path.clone(),
        }
    }

    /// Origin key used by pools: `scheme://host:port`.
    #[must_use]
    pub fn origin_key(&self) -> String {
        self.origin.origin().ascii_serialization()
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.signal.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Copies the options when the body is replayable.
    #[must_use]
    pub fn try_clone(&self) -> Option<Self> {
        Some(Self {
            method: self.method.clone(),
            origin: self.origin.clone(),
            path: self.path.clone(),
            query: self.query.clone(),
            headers: self.headers.clone(),
            body: self.body.try_clone()?,
            extensions: self.extensions,
            signal: self.signal.clone(),
        })
    }
}

/// Builder for [`DispatchOptions`].
#[derive(Debug, Default)]
pub struct DispatchOptionsBuilder {
    method: Option<Method>,
    origin: Option<Url>,
    path: Option<String>,
    query: Vec<(String, String)>,
    headers: HeaderRecord,
    body: RequestBody,
    extensions: Extensions,
    signal: Option<CancellationToken>,
}

impl DispatchOptionsBuilder {
    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Set origin, path and query from one absolute URL.
    ///
    /// # Errors
    /// Returns [`DispatchError::InvalidRequest`] when the URL does not parse.
    pub fn url(mut self, url: &str) -> Result<Self, DispatchError> {
        let parsed = Url::parse(url)
            .map_err(|e| DispatchError::InvalidRequest(format!("invalid url {url:?}: {e}")))?;
        self.path = Some(parsed.path().to_owned());
        self.query = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let mut origin = parsed;
        origin.set_path("/");
        origin.set_query(None);
        origin.set_fragment(None);
        self.origin = Some(origin);
        Ok(self)
    }

    #[must_use]
    pub fn origin(mut self, origin: Url) -> Self {
        self.origin = Some(origin);
        self
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Merges a header set in either shape.
    #[must_use]
    pub fn headers(mut self, headers: impl Into<Headers>) -> Self {
        for (name, values) in normalize_headers(&headers.into()).iter() {
            for value in values.as_slice() {
                self.headers.append(name, value.clone());
            }
        }
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn download(mut self) -> Self {
        self.extensions.use_download_pool = Some(true);
        self
    }

    #[must_use]
    pub fn cache_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.extensions.cache_strategy = strategy;
        self
    }

    #[must_use]
    pub fn signal(mut self, token: CancellationToken) -> Self {
        self.signal = Some(token);
        self
    }

    /// Build the options
    ///
    /// # Errors
    /// Returns [`DispatchError::InvalidRequest`] when the origin is missing or
    /// is not an `http`/`https` URL.
    pub fn build(self) -> Result<DispatchOptions, DispatchError> {
        let origin = self
            .origin
            .ok_or_else(|| DispatchError::InvalidRequest("request origin is required".into()))?;
        if !matches!(origin.scheme(), "http" | "https") || origin.host_str().is_none() {
            return Err(DispatchError::InvalidRequest(format!(
                "unsupported origin {origin}"
            )));
        }
        let path = self.path.unwrap_or_else(|| "/".to_owned());

        Ok(DispatchOptions {
            method: self.method.unwrap_or(Method::GET),
            origin,
            path,
            query: self.query,
            headers: self.headers,
            body: self.body,
            extensions: self.extensions,
            signal: self.signal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_splits_into_origin_path_query() {
        let opts = DispatchOptions::get("https://a.example/x/y?v=1&w=two").unwrap();
        assert_eq!(opts.origin_key(), "https://a.example");
        assert_eq!(opts.path, "/x/y");
        assert_eq!(opts.query, vec![("v".into(), "1".into()), ("w".into(), "two".into())]);
        assert_eq!(opts.url().unwrap().as_str(), "https://a.example/x/y?v=1&w=two");
    }

    #[test]
    fn path_and_query_without_query() {
        let opts = DispatchOptions::get("http://127.0.0.1:8080/plain").unwrap();
        assert_eq!(opts.path_and_query(), "/plain");
        assert_eq!(opts.origin_key(), "http://127.0.0.1:8080");
    }

    #[test]
    fn builder_rejects_non_http_origin() {
        let err = DispatchOptions::builder()
            .origin(Url::parse("ftp://files.example").unwrap())
            .build()
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequest(_)));
    }

    #[test]
    fn builder_accepts_flat_headers() {
        let opts = DispatchOptions::builder()
            .url("https://a.example/")
            .unwrap()
            .headers(vec!["User-Agent".to_owned(), "probe".to_owned()])
            .header("X-Extra", "1")
            .build()
            .unwrap();
        assert_eq!(opts.headers.first("user-agent"), Some("probe"));
        assert_eq!(opts.headers.first("x-extra"), Some("1"));
    }

    #[test]
    fn stream_bodies_cannot_be_cloned() {
        let mut opts = DispatchOptions::get("https://a.example/upload").unwrap();
        opts.body = RequestBody::Stream(Box::pin(futures::stream::empty()));
        assert!(opts.try_clone().is_none());

        opts.body = RequestBody::from("payload");
        let copy = opts.try_clone().unwrap();
        assert!(matches!(copy.body, RequestBody::Bytes(b) if b == "payload"));
    }

    #[test]
    fn multipart_encoding_frames_each_field() {
        let body = encode_multipart(
            &[
                FormField::text("name", "world"),
                FormField::file("file", "a.txt", Bytes::from_static(b"abc")),
            ],
            "XYZ",
        );
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.starts_with("--XYZ\r\nContent-Disposition: form-data; name=\"name\"\r\n\r\nworld\r\n"));
        assert!(text.contains("filename=\"a.txt\"\r\nContent-Type: application/octet-stream\r\n\r\nabc\r\n"));
        assert!(text.ends_with("--XYZ--\r\n"));
    }
}
