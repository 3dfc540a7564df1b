//! Conversions between the two header shapes used across the dispatch stack.
//!
//! Request options may carry headers either as a flat `[k0, v0, k1, v1, ...]`
//! list or as a map. Everything that reads headers (cache keys, policy
//! evaluation, proxy host substitution) works on the normalized
//! [`HeaderRecord`] instead.

use std::collections::BTreeMap;
use std::collections::btree_map;

use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// One header value, or several when the name repeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    Single(String),
    Multi(Vec<String>),
}

impl HeaderValues {
    /// All values in arrival order.
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        match self {
            HeaderValues::Single(v) => std::slice::from_ref(v),
            HeaderValues::Multi(vs) => vs,
        }
    }

    /// Values joined with `", "`, the way a single-line header would read.
    #[must_use]
    pub fn joined(&self) -> String {
        match self {
            HeaderValues::Single(v) => v.clone(),
            HeaderValues::Multi(vs) => vs.join(", "),
        }
    }

    fn push(&mut self, value: String) {
        match self {
            HeaderValues::Single(first) => {
                let first = std::mem::take(first);
                *self = HeaderValues::Multi(vec![first, value]);
            }
            HeaderValues::Multi(vs) => vs.push(value),
        }
    }
}

impl From<String> for HeaderValues {
    fn from(value: String) -> Self {
        HeaderValues::Single(value)
    }
}

impl From<&str> for HeaderValues {
    fn from(value: &str) -> Self {
        HeaderValues::Single(value.to_owned())
    }
}

/// Case-insensitive header map: names are stored lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, HeaderValues>", into = "BTreeMap<String, HeaderValues>")]
pub struct HeaderRecord {
    entries: BTreeMap<String, HeaderValues>,
}

impl HeaderRecord {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&HeaderValues> {
        self.entries.get(&name.to_ascii_lowercase())
    }

    /// First value of `name`.
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|v| v.as_slice().first())
            .map(String::as_str)
    }

    /// All values of `name` joined with `", "`.
    #[must_use]
    pub fn joined(&self, name: &str) -> Option<String> {
        self.get(name).map(HeaderValues::joined)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// Replaces any existing value of `name`.
    pub fn insert(&mut self, name: &str, value: impl Into<HeaderValues>) {
        self.entries.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Adds a value, turning an existing single value into a list.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.entry(name.to_ascii_lowercase()) {
            btree_map::Entry::Occupied(mut slot) => slot.get_mut().push(value),
            btree_map::Entry::Vacant(slot) => {
                slot.insert(HeaderValues::Single(value));
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<HeaderValues> {
        self.entries.remove(&name.to_ascii_lowercase())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValues)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Builds a record from a parsed `http` header map.
    ///
    /// Values that are not valid UTF-8 are decoded lossily.
    #[must_use]
    pub fn from_header_map(map: &HeaderMap) -> Self {
        let mut record = Self::new();
        for (name, value) in map {
            record.append(
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            );
        }
        record
    }

    /// Converts into an `http` header map for the wire.
    ///
    /// # Errors
    /// Returns [`DispatchError::InvalidRequest`] when a name or value is not
    /// a legal HTTP header.
    pub fn to_header_map(&self) -> Result<HeaderMap, DispatchError> {
        let mut map = HeaderMap::with_capacity(self.entries.len());
        for (name, values) in &self.entries {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                DispatchError::InvalidRequest(format!("invalid header name {name:?}: {e}"))
            })?;
            for value in values.as_slice() {
                let header_value = HeaderValue::from_str(value).map_err(|e| {
                    DispatchError::InvalidRequest(format!("invalid value for header {name}: {e}"))
                })?;
                map.append(header_name.clone(), header_value);
            }
        }
        Ok(map)
    }
}

impl From<BTreeMap<String, HeaderValues>> for HeaderRecord {
    fn from(map: BTreeMap<String, HeaderValues>) -> Self {
        let mut record = Self::new();
        for (name, values) in map {
            for value in values.as_slice() {
                record.append(&name, value.clone());
            }
        }
        record
    }
}

impl From<HeaderRecord> for BTreeMap<String, HeaderValues> {
    fn from(record: HeaderRecord) -> Self {
        record.entries
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for HeaderRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Self::new();
        for (k, v) in iter {
            record.append(k.as_ref(), v);
        }
        record
    }
}

/// Headers as handed in by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Headers {
    /// Alternating name/value list.
    Flat(Vec<String>),
    Record(HeaderRecord),
}

impl Default for Headers {
    fn default() -> Self {
        Headers::Record(HeaderRecord::new())
    }
}

impl From<HeaderRecord> for Headers {
    fn from(record: HeaderRecord) -> Self {
        Headers::Record(record)
    }
}

impl From<Vec<String>> for Headers {
    fn from(flat: Vec<String>) -> Self {
        Headers::Flat(flat)
    }
}

/// Normalizes either header shape into a [`HeaderRecord`].
///
/// A trailing name without a value in a flat list is dropped. Applying this to
/// an already normalized record returns an equal record.
#[must_use]
pub fn normalize_headers(headers: &Headers) -> HeaderRecord {
    match headers {
        Headers::Flat(flat) => flat
            .chunks_exact(2)
            .map(|pair| (pair[0].as_str(), pair[1].clone()))
            .collect(),
        Headers::Record(record) => record
            .iter()
            .flat_map(|(k, v)| v.as_slice().iter().map(move |value| (k, value.clone())))
            .collect(),
    }
}

/// Flattens a record into the alternating name/value list.
///
/// Repeated headers produce one pair per value.
#[must_use]
pub fn flatten_headers(record: &HeaderRecord) -> Vec<String> {
    let mut flat = Vec::with_capacity(record.len() * 2);
    for (name, values) in record.iter() {
        for value in values.as_slice() {
            flat.push(name.to_owned());
            flat.push(value.clone());
        }
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(items: &[&str]) -> Headers {
        Headers::Flat(items.iter().map(|s| (*s).to_owned()).collect())
    }

    #[test]
    fn flat_list_is_lowercased_and_grouped() {
        let record = normalize_headers(&flat(&[
            "Content-Type",
            "text/plain",
            "Set-Cookie",
            "a=1",
            "set-cookie",
            "b=2",
        ]));

        assert_eq!(record.first("content-type"), Some("text/plain"));
        assert_eq!(
            record.get("SET-COOKIE"),
            Some(&HeaderValues::Multi(vec!["a=1".into(), "b=2".into()]))
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_headers(&flat(&["ETag", "\"v1\"", "Vary", "accept"]));
        let twice = normalize_headers(&Headers::Record(once.clone()));
        assert_eq!(once, twice);
    }

    #[test]
    fn dangling_flat_name_is_ignored() {
        let record = normalize_headers(&flat(&["a", "1", "b"]));
        assert_eq!(record.len(), 1);
        assert!(!record.contains("b"));
    }

    #[test]
    fn flatten_emits_one_pair_per_value() {
        let mut record = HeaderRecord::new();
        record.append("X-A", "1");
        record.append("x-a", "2");
        record.insert("host", "example.com");

        assert_eq!(
            flatten_headers(&record),
            vec!["host", "example.com", "x-a", "1", "x-a", "2"]
        );
    }

    #[test]
    fn header_map_round_trip_keeps_repeats() {
        let mut map = HeaderMap::new();
        map.append("accept", HeaderValue::from_static("a"));
        map.append("accept", HeaderValue::from_static("b"));

        let record = HeaderRecord::from_header_map(&map);
        assert_eq!(record.joined("accept").as_deref(), Some("a, b"));
        assert_eq!(record.to_header_map().unwrap(), map);
    }

    #[test]
    fn invalid_header_name_is_rejected() {
        let mut record = HeaderRecord::new();
        record.insert("bad name", "x");
        assert!(matches!(
            record.to_header_map(),
            Err(DispatchError::InvalidRequest(_))
        ));
    }

    #[test]
    fn deserialized_record_is_case_insensitive() {
        let record: HeaderRecord =
            serde_json::from_str(r#"{"Cache-Control":"max-age=60","Link":["a","b"]}"#).unwrap();
        assert_eq!(record.first("cache-control"), Some("max-age=60"));
        assert_eq!(record.get("link").map(HeaderValues::as_slice).map(<[String]>::len), Some(2));
    }
}
