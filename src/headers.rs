use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// The filtered, immutable subset of an origin response's headers that the
/// cache stream keeps around (spec.md §3). Header names are stored
/// lower-cased; values are opaque strings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CachedResponseHeaders {
    values: HashMap<String, String>,
}

/// Headers worth persisting across restarts. A superset lives in
/// `ALL_HEADER_NAMES`; this subset is what `save_all_headers = false` keeps
/// (spec.md §6) — just enough to recompute `source_length`,
/// `can_resume_download`, and the resume-validation equality rule.
pub const ESSENTIAL_HEADER_NAMES: &[&str] = &[
    "content-length",
    "accept-ranges",
    "etag",
    "last-modified",
    "content-encoding",
    "transfer-encoding",
];

pub const ALL_HEADER_NAMES: &[&str] = &[
    "content-length",
    "accept-ranges",
    "content-type",
    "last-modified",
    "date",
    "expires",
    "cache-control",
    "etag",
    "content-encoding",
    "transfer-encoding",
];

impl CachedResponseHeaders {
    pub fn from_reqwest(headers: &reqwest::header::HeaderMap) -> Self {
        let mut values = HashMap::new();
        for name in ALL_HEADER_NAMES {
            if let Some(v) = headers.get(*name) {
                if let Ok(s) = v.to_str() {
                    values.insert((*name).to_string(), s.to_string());
                }
            }
        }
        Self { values }
    }

    /// Build from an already-lowercased name/value map, e.g. a loaded
    /// metadata file.
    pub fn from_map(values: HashMap<String, String>) -> Self {
        let values = values
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self { values }
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        self.values.clone()
    }

    /// Project down to the essential subset, for `save_all_headers = false`.
    pub fn essential(&self) -> Self {
        let values = self
            .values
            .iter()
            .filter(|(k, _)| ESSENTIAL_HEADER_NAMES.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.get("content-length").and_then(|v| v.parse().ok())
    }

    /// Returns a copy with `content-length` set, overwriting any previous
    /// value. Used when finalizing a download whose origin never sent a
    /// length (chunked or compressed responses).
    pub fn with_content_length(&self, length: u64) -> Self {
        let mut values = self.values.clone();
        values.insert("content-length".to_string(), length.to_string());
        Self { values }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("content-type")
    }

    pub fn etag(&self) -> Option<&str> {
        self.get("etag")
    }

    fn header_is(&self, name: &str, value: &str) -> bool {
        self.get(name)
            .map(|v| v.eq_ignore_ascii_case(value))
            .unwrap_or(false)
    }

    pub fn is_compressed_or_chunked(&self) -> bool {
        self.header_is("content-encoding", "gzip") || self.header_is("transfer-encoding", "chunked")
    }

    /// `content-length` when the body isn't gzip-compressed or
    /// chunk-transfer-encoded, else unknown (spec.md §3).
    pub fn source_length(&self) -> Option<u64> {
        if self.is_compressed_or_chunked() {
            None
        } else {
            self.content_length()
        }
    }

    pub fn accepts_range_requests(&self) -> bool {
        self.header_is("accept-ranges", "bytes")
    }

    pub fn can_resume_download(&self) -> bool {
        self.accepts_range_requests() && !self.is_compressed_or_chunked()
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.get("last-modified")
            .and_then(|v| httpdate::parse_http_date(v).ok())
            .map(DateTime::<Utc>::from)
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.get("date")
            .and_then(|v| httpdate::parse_http_date(v).ok())
            .map(DateTime::<Utc>::from)
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.get("expires")
            .and_then(|v| httpdate::parse_http_date(v).ok())
            .map(DateTime::<Utc>::from)
    }

    fn max_age(&self) -> Option<chrono::Duration> {
        let cache_control = self.get("cache-control")?;
        cache_control.split(',').find_map(|directive| {
            let directive = directive.trim();
            let secs = directive.strip_prefix("max-age=")?;
            secs.parse::<i64>().ok().map(chrono::Duration::seconds)
        })
    }

    /// `now ≥ expires`, where `expires` is the explicit `Expires` header,
    /// else `date + max-age` from `Cache-Control` (spec.md §3).
    pub fn should_revalidate(&self, now: DateTime<Utc>) -> bool {
        let expires = self.expires().or_else(|| {
            let base = self.date().unwrap_or(now);
            self.max_age().map(|max_age| base + max_age)
        });
        match expires {
            Some(expires) => now >= expires,
            None => false,
        }
    }

    /// Resume-validation equality rule used by the Cache Downloader
    /// (spec.md §4.3): strict match on etag, else last-modified, else
    /// length. Returns `false` (i.e. "changed") the instant any of those
    /// fail to line up.
    pub fn matches_for_resume(&self, saved: &CachedResponseHeaders) -> bool {
        if let (Some(a), Some(b)) = (self.etag(), saved.etag()) {
            return a == b;
        }
        if let (Some(a), Some(b)) = (self.last_modified(), saved.last_modified()) {
            return a == b;
        }
        self.content_length() == saved.content_length()
    }

    /// Equality rule used by `validate_cache` (spec.md §4.5): etag match if
    /// both present; else the new response must not be newer than the
    /// previous one; else length equality.
    pub fn still_valid_against(&self, previous: &CachedResponseHeaders) -> bool {
        if let (Some(next), Some(prev)) = (self.etag(), previous.etag()) {
            return next == prev;
        }
        if let (Some(next), Some(prev)) = (self.last_modified(), previous.last_modified()) {
            return next <= prev;
        }
        self.content_length() == previous.content_length()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> CachedResponseHeaders {
        CachedResponseHeaders::from_map(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn source_length_unknown_when_chunked() {
        let h = headers(&[("content-length", "100"), ("transfer-encoding", "chunked")]);
        assert_eq!(h.source_length(), None);
    }

    #[test]
    fn source_length_known_when_plain() {
        let h = headers(&[("content-length", "100")]);
        assert_eq!(h.source_length(), Some(100));
    }

    #[test]
    fn can_resume_requires_accept_ranges_and_uncompressed() {
        let h = headers(&[("accept-ranges", "bytes")]);
        assert!(h.can_resume_download());
        let h = headers(&[("accept-ranges", "bytes"), ("content-encoding", "gzip")]);
        assert!(!h.can_resume_download());
    }

    #[test]
    fn etag_mismatch_invalidates_resume_regardless_of_length() {
        let saved = headers(&[("etag", "\"v1\""), ("content-length", "1000")]);
        let fresh = headers(&[("etag", "\"v2\""), ("content-length", "1000")]);
        assert!(!fresh.matches_for_resume(&saved));
    }

    #[test]
    fn length_fallback_when_no_etag_or_last_modified() {
        let saved = headers(&[("content-length", "1000")]);
        let fresh = headers(&[("content-length", "1000")]);
        assert!(fresh.matches_for_resume(&saved));
        let fresh_changed = headers(&[("content-length", "1200")]);
        assert!(!fresh_changed.matches_for_resume(&saved));
    }

    #[test]
    fn should_revalidate_uses_explicit_expires() {
        let past = httpdate::fmt_http_date(std::time::SystemTime::UNIX_EPOCH);
        let h = headers(&[("expires", &past)]);
        assert!(h.should_revalidate(Utc::now()));
    }
}
