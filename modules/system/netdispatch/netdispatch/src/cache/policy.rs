//! HTTP caching rules (RFC 7234) for one stored request/response pair.
//!
//! A [`CachePolicy`] is computed once when a response arrives and never
//! mutated afterwards; revalidation produces a new value through
//! [`CachePolicy::revalidated_policy`]. All time-dependent queries take the
//! current time explicitly so they can be driven by a test clock.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::headers::HeaderRecord;

/// Statuses whose semantics the cache understands well enough to store.
const UNDERSTOOD_STATUSES: &[u16] = &[
    200, 203, 204, 300, 301, 302, 303, 307, 308, 404, 405, 410, 414, 501,
];

/// Statuses that may be stored even without explicit freshness information.
const CACHEABLE_BY_DEFAULT: &[u16] = &[
    200, 203, 204, 206, 300, 301, 308, 404, 405, 410, 414, 501,
];

const HOP_BY_HOP: &[&str] = &[
    "date",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers a `304` must not overwrite on the stored response.
const EXCLUDED_FROM_REVALIDATION_UPDATE: &[&str] = &[
    "content-length",
    "content-encoding",
    "transfer-encoding",
    "content-range",
];

const ERROR_STATUSES: &[u16] = &[500, 502, 503, 504];

const IMMUTABLE_MIN_TTL: Duration = Duration::from_secs(24 * 3600);

/// Divisor applied to `Date - Last-Modified` for heuristic freshness.
const HEURISTIC_DIVISOR: u32 = 10;

/// Parsed `Cache-Control` directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    directives: BTreeMap<String, Option<String>>,
}

impl CacheControl {
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let mut directives = BTreeMap::new();
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (name, arg) = match part.split_once('=') {
                Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"').to_owned())),
                None => (part, None),
            };
            directives.insert(name.to_ascii_lowercase(), arg);
        }
        Self { directives }
    }

    fn from_headers(headers: &HeaderRecord) -> Self {
        headers
            .joined("cache-control")
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.directives.contains_key(name)
    }

    /// Numeric argument of a directive; malformed numbers read as zero.
    #[must_use]
    pub fn seconds(&self, name: &str) -> Option<u64> {
        self.directives
            .get(name)
            .map(|arg| arg.as_deref().and_then(|a| a.parse().ok()).unwrap_or(0))
    }

    fn duration(&self, name: &str) -> Duration {
        Duration::from_secs(self.seconds(name).unwrap_or(0))
    }
}

/// The request half of a policy computation.
#[derive(Debug, Clone, Copy)]
pub struct PolicyRequest<'a> {
    pub method: &'a Method,
    pub url: &'a str,
    pub headers: &'a HeaderRecord,
}

/// The response half of a policy computation.
#[derive(Debug, Clone, Copy)]
pub struct PolicyResponse<'a> {
    pub status: StatusCode,
    pub headers: &'a HeaderRecord,
}

/// Outcome of [`CachePolicy::revalidated_policy`].
#[derive(Debug, Clone)]
pub struct Revalidated {
    pub policy: CachePolicy,
    /// The stored body is no longer valid.
    pub modified: bool,
    /// The answer carried validators matching the stored response.
    pub matches: bool,
}

/// Cache semantics of one stored response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    method: String,
    url: String,
    status: u16,
    /// Milliseconds since the Unix epoch.
    response_time: u64,
    response_headers: HeaderRecord,
    /// Only kept when the response varies on request headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_headers: Option<HeaderRecord>,
    #[serde(default)]
    host: Option<String>,
    no_authorization: bool,
    request_no_store: bool,
    shared: bool,
}

impl CachePolicy {
    /// Policy for a shared cache, as used by the dispatch stack.
    #[must_use]
    pub fn new(req: PolicyRequest<'_>, res: PolicyResponse<'_>, now: SystemTime) -> Self {
        Self::with_sharing(req, res, now, true)
    }

    #[must_use]
    pub fn with_sharing(
        req: PolicyRequest<'_>,
        res: PolicyResponse<'_>,
        now: SystemTime,
        shared: bool,
    ) -> Self {
        let request_cc = CacheControl::from_headers(req.headers);
        Self {
            method: req.method.as_str().to_owned(),
            url: req.url.to_owned(),
            status: res.status.as_u16(),
            response_time: to_millis(now),
            response_headers: res.headers.clone(),
            request_headers: res.headers.contains("vary").then(|| req.headers.clone()),
            host: req.headers.first("host").map(str::to_owned),
            no_authorization: !req.headers.contains("authorization"),
            request_no_store: request_cc.has("no-store"),
            shared,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK)
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Headers exactly as received (or as merged by revalidation).
    #[must_use]
    pub fn stored_headers(&self) -> &HeaderRecord {
        &self.response_headers
    }

    /// Whether any validator exists for a conditional request.
    #[must_use]
    pub fn has_validators(&self) -> bool {
        self.response_headers.contains("etag") || self.response_headers.contains("last-modified")
    }

    fn response_cc(&self) -> CacheControl {
        let mut cc = CacheControl::from_headers(&self.response_headers);
        if !self.response_headers.contains("cache-control")
            && self
                .response_headers
                .joined("pragma")
                .is_some_and(|p| p.contains("no-cache"))
        {
            cc.directives.insert("no-cache".into(), None);
        }
        cc
    }

    fn response_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.response_time)
    }

    fn has_explicit_expiration(&self, cc: &CacheControl) -> bool {
        (self.shared && cc.has("s-maxage"))
            || cc.has("max-age")
            || self.response_headers.contains("expires")
    }

    /// Whether the response may be stored at all.
    #[must_use]
    pub fn storable(&self) -> bool {
        let cc = self.response_cc();
        let method_ok = self.method == "GET"
            || self.method == "HEAD"
            || (self.method == "POST" && self.has_explicit_expiration(&cc));
        let allows_authenticated =
            cc.has("must-revalidate") || cc.has("public") || cc.has("s-maxage");

        !self.request_no_store
            && method_ok
            && UNDERSTOOD_STATUSES.contains(&self.status)
            && !cc.has("no-store")
            && (!self.shared || !cc.has("private"))
            && (!self.shared || self.no_authorization || allows_authenticated)
            && (self.response_headers.contains("expires")
                || cc.has("max-age")
                || (self.shared && cc.has("s-maxage"))
                || cc.has("public")
                || CACHEABLE_BY_DEFAULT.contains(&self.status))
    }

    /// Server `Date`, falling back to the local receive time.
    fn date(&self) -> SystemTime {
        self.response_headers
            .first("date")
            .and_then(|d| httpdate::parse_http_date(d).ok())
            .unwrap_or_else(|| self.response_time())
    }

    /// Current age: the `Age` header plus time resident in this cache.
    #[must_use]
    pub fn age(&self, now: SystemTime) -> Duration {
        let header_age = self
            .response_headers
            .first("age")
            .and_then(|a| a.trim().parse::<u64>().ok())
            .unwrap_or(0);
        let resident = now.duration_since(self.response_time()).unwrap_or_default();
        Duration::from_secs(header_age) + resident
    }

    /// Freshness lifetime.
    #[must_use]
    pub fn max_age(&self) -> Duration {
        let cc = self.response_cc();
        if !self.storable() || cc.has("no-cache") {
            return Duration::ZERO;
        }
        if self.shared
            && self.response_headers.contains("set-cookie")
            && !cc.has("public")
            && !cc.has("immutable")
        {
            return Duration::ZERO;
        }
        if self.response_headers.first("vary").map(str::trim) == Some("*") {
            return Duration::ZERO;
        }
        if self.shared {
            if cc.has("proxy-revalidate") {
                return Duration::ZERO;
            }
            if cc.has("s-maxage") {
                return cc.duration("s-maxage");
            }
        }
        if cc.has("max-age") {
            return cc.duration("max-age");
        }

        let default_min = if cc.has("immutable") {
            IMMUTABLE_MIN_TTL
        } else {
            Duration::ZERO
        };
        let server_date = self.date();
        if let Some(expires) = self.response_headers.first("expires") {
            return match httpdate::parse_http_date(expires) {
                Ok(expires) => expires
                    .duration_since(server_date)
                    .map_or(Duration::ZERO, |d| d.max(default_min)),
                Err(_) => Duration::ZERO,
            };
        }
        if let Some(last_modified) = self
            .response_headers
            .first("last-modified")
            .and_then(|lm| httpdate::parse_http_date(lm).ok())
            && let Ok(since) = server_date.duration_since(last_modified)
            && !since.is_zero()
        {
            return (since / HEURISTIC_DIVISOR).max(default_min);
        }
        default_min
    }

    #[must_use]
    pub fn stale(&self, now: SystemTime) -> bool {
        self.max_age() <= self.age(now)
    }

    /// How long the entry stays useful, counting stale-if-error and
    /// stale-while-revalidate allowances.
    #[must_use]
    pub fn time_to_live(&self, now: SystemTime) -> Duration {
        let cc = self.response_cc();
        let allowance = cc
            .duration("stale-if-error")
            .max(cc.duration("stale-while-revalidate"));
        (self.max_age() + allowance).saturating_sub(self.age(now))
    }

    fn use_stale_if_error(&self, now: SystemTime) -> bool {
        self.max_age() + self.response_cc().duration("stale-if-error") > self.age(now)
    }

    fn vary_matches(&self, req: &PolicyRequest<'_>) -> bool {
        let Some(vary) = self.response_headers.joined("vary") else {
            return true;
        };
        if vary.trim() == "*" {
            return false;
        }
        let stored = self.request_headers.as_ref();
        vary.split(',')
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .all(|name| {
                req.headers.joined(&name) == stored.and_then(|h| h.joined(&name))
            })
    }

    fn request_matches(&self, req: &PolicyRequest<'_>, allow_head: bool) -> bool {
        self.url == req.url
            && self.host.as_deref() == req.headers.first("host")
            && (self.method == req.method.as_str() || (allow_head && *req.method == Method::HEAD))
            && self.vary_matches(req)
    }

    /// Whether the stored response may answer `req` without contacting the
    /// origin.
    #[must_use]
    pub fn satisfies_without_revalidation(&self, req: PolicyRequest<'_>, now: SystemTime) -> bool {
        let request_cc = CacheControl::from_headers(req.headers);
        if request_cc.has("no-cache")
            || req
                .headers
                .joined("pragma")
                .is_some_and(|p| p.contains("no-cache"))
        {
            return false;
        }
        let age = self.age(now);
        if let Some(max_age) = request_cc.seconds("max-age")
            && age > Duration::from_secs(max_age)
        {
            return false;
        }
        if let Some(min_fresh) = request_cc.seconds("min-fresh")
            && self.time_to_live(now) < Duration::from_secs(min_fresh)
        {
            return false;
        }
        if self.stale(now) {
            let allows_stale = request_cc.has("max-stale")
                && !self.response_cc().has("must-revalidate")
                && match request_cc.directives.get("max-stale") {
                    Some(None) => true,
                    _ => {
                        let over = age.saturating_sub(self.max_age());
                        Duration::from_secs(request_cc.seconds("max-stale").unwrap_or(0)) > over
                    }
                };
            if !allows_stale {
                return false;
            }
        }
        self.request_matches(&req, false)
    }

    /// Headers to replay to a caller: hop-by-hop headers removed, `age` and
    /// `date` refreshed.
    #[must_use]
    pub fn response_headers(&self, now: SystemTime) -> HeaderRecord {
        let mut headers = without_hop_by_hop(&self.response_headers);
        let age = self.age(now);
        if age > IMMUTABLE_MIN_TTL
            && !self.has_explicit_expiration(&self.response_cc())
            && self.max_age() > IMMUTABLE_MIN_TTL
        {
            headers.append("warning", "113 - \"rfc7234 5.5.4\"");
        }
        headers.insert("age", age.as_secs().to_string());
        headers.insert("date", httpdate::fmt_http_date(now));
        headers
    }

    /// Request headers for a conditional request revalidating this entry.
    #[must_use]
    pub fn revalidation_headers(&self, req: PolicyRequest<'_>) -> HeaderRecord {
        let mut headers = without_hop_by_hop(req.headers);
        headers.remove("if-range");

        if !self.request_matches(&req, true) || !self.storable() {
            headers.remove("if-none-match");
            headers.remove("if-modified-since");
            return headers;
        }

        if let Some(etag) = self.response_headers.first("etag") {
            let merged = match headers.joined("if-none-match") {
                Some(existing) => format!("{existing}, {etag}"),
                None => etag.to_owned(),
            };
            headers.insert("if-none-match", merged);
        }

        let forbids_weak = headers.contains("accept-ranges")
            || headers.contains("if-match")
            || headers.contains("if-unmodified-since")
            || self.method != "GET";

        if forbids_weak {
            headers.remove("if-modified-since");
            if let Some(inm) = headers.joined("if-none-match") {
                let strong: Vec<&str> = inm
                    .split(',')
                    .filter(|etag| !etag.trim_start().starts_with("W/"))
                    .collect();
                if strong.is_empty() {
                    headers.remove("if-none-match");
                } else {
                    headers.insert("if-none-match", strong.join(",").trim().to_owned());
                }
            }
        } else if let Some(last_modified) = self.response_headers.first("last-modified")
            && !headers.contains("if-modified-since")
        {
            headers.insert("if-modified-since", last_modified.to_owned());
        }

        headers
    }

    /// Applies the answer to a conditional request.
    ///
    /// A 5xx inside the stale-if-error window keeps this policy. Any other
    /// non-`304` replaces it. A `304` keeps the stored status and merges the
    /// new headers onto the stored ones; the origin asserted the stored body
    /// is current, so the merge happens even when no validator matched.
    #[must_use]
    pub fn revalidated_policy(
        &self,
        req: PolicyRequest<'_>,
        res: PolicyResponse<'_>,
        now: SystemTime,
    ) -> Revalidated {
        if self.use_stale_if_error(now) && ERROR_STATUSES.contains(&res.status.as_u16()) {
            return Revalidated {
                policy: self.clone(),
                modified: false,
                matches: false,
            };
        }

        if res.status != StatusCode::NOT_MODIFIED {
            return Revalidated {
                policy: Self::with_sharing(req, res, now, self.shared),
                modified: true,
                matches: false,
            };
        }

        let matches = self.validators_match(res.headers);

        let mut merged = HeaderRecord::new();
        for (name, stored) in self.response_headers.iter() {
            let value = match res.headers.get(name) {
                Some(fresh) if !EXCLUDED_FROM_REVALIDATION_UPDATE.contains(&name) => fresh,
                _ => stored,
            };
            merged.insert(name, value.clone());
        }
        for (name, fresh) in res.headers.iter() {
            if !merged.contains(name) && !EXCLUDED_FROM_REVALIDATION_UPDATE.contains(&name) {
                merged.insert(name, fresh.clone());
            }
        }

        let policy = Self::with_sharing(
            req,
            PolicyResponse {
                status: self.status(),
                headers: &merged,
            },
            now,
            self.shared,
        );
        Revalidated {
            policy,
            modified: false,
            matches,
        }
    }

    fn validators_match(&self, fresh: &HeaderRecord) -> bool {
        let stored_etag = self.response_headers.first("etag");
        let fresh_etag = fresh.first("etag");
        match (stored_etag, fresh_etag) {
            (Some(stored), Some(fresh)) => strip_weak(stored) == strip_weak(fresh),
            (None, Some(_)) => false,
            (_, None) => match self.response_headers.first("last-modified") {
                Some(lm) => fresh.first("last-modified") == Some(lm),
                None => stored_etag.is_none() && !fresh.contains("last-modified"),
            },
        }
    }
}

fn strip_weak(etag: &str) -> &str {
    let etag = etag.trim_start();
    etag.strip_prefix("W/").unwrap_or(etag)
}

fn without_hop_by_hop(headers: &HeaderRecord) -> HeaderRecord {
    let listed: Vec<String> = headers
        .joined("connection")
        .map(|c| {
            c.split(',')
                .map(|n| n.trim().to_ascii_lowercase())
                .filter(|n| !n.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let mut out = HeaderRecord::new();
    for (name, values) in headers.iter() {
        if HOP_BY_HOP.contains(&name) || listed.iter().any(|l| l == name) {
            continue;
        }
        if name == "warning" {
            // 1xx warnings describe freshness and must not survive a refresh.
            let kept: Vec<&String> = values
                .as_slice()
                .iter()
                .filter(|w| !w.trim_start().starts_with('1'))
                .collect();
            for w in kept {
                out.append(name, w.clone());
            }
            continue;
        }
        out.insert(name, values.clone());
    }
    out
}

fn to_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
