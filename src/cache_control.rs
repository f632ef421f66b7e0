//! Parsing, merging, and formatting of `Cache-Control` policies.
//!
//! A [`CacheControl`] is the distilled policy of one response. The embedding
//! engine folds the policies of every spliced sub-resource into the outer
//! response with [`CacheControl::merge`], so that the aggregate is never more
//! cacheable than its most restrictive part.

use std::time::Duration;

use http::HeaderMap;

use crate::headers::{get_all_comma, HeaderStr};

/// A parsed `Cache-Control` policy.
///
/// Only the directives that participate in the merge are modelled. `Expires`
/// is folded into `max_age` at parse time so that downstream code deals with
/// a single expiry notion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheControl {
    /// `must-revalidate`
    pub must_revalidate: bool,
    /// `no-cache`
    pub no_cache: bool,
    /// `no-store`
    pub no_store: bool,
    /// `public`
    pub public: bool,
    /// `private`
    pub private: bool,
    /// `immutable`
    pub immutable: bool,
    /// `max-age`, or the `Expires` − `Date` fallback
    pub max_age: Option<Duration>,
}

impl CacheControl {
    /// Parses the policy of a response header map.
    ///
    /// When no `max-age` directive is present, `Expires` − `Date` is used in
    /// its place if both are parseable. An unparseable `Expires` counts as
    /// already expired.
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut cc = Self::default();
        for directive in directives(headers) {
            match directive {
                "must-revalidate" => cc.must_revalidate = true,
                "no-cache" => cc.no_cache = true,
                "no-store" => cc.no_store = true,
                "public" => cc.public = true,
                "private" => cc.private = true,
                "immutable" => cc.immutable = true,
                _ => {
                    if let Some(secs) = numeric_directive(directive, "max-age") {
                        cc.max_age = Some(Duration::from_secs(secs));
                    }
                }
            }
        }
        if cc.max_age.is_none() && !has_directive(headers, "max-age") {
            if let Some(expires) = headers.get_str("expires") {
                match httpdate::parse_http_date(expires) {
                    Ok(expires_at) => {
                        if let Some(date) =
                            headers.get_str("date").and_then(|d| httpdate::parse_http_date(d).ok())
                        {
                            cc.max_age =
                                Some(expires_at.duration_since(date).unwrap_or(Duration::ZERO));
                        }
                    }
                    Err(_) => cc.max_age = Some(Duration::ZERO),
                }
            }
        }
        cc
    }

    /// Folds another policy into this one.
    ///
    /// Restrictive flags survive if either side carries them; permissive
    /// flags survive only if both sides do. The shorter `max_age` wins.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            must_revalidate: self.must_revalidate || other.must_revalidate,
            no_cache: self.no_cache || other.no_cache,
            no_store: self.no_store || other.no_store,
            public: self.public && other.public,
            private: self.private || other.private,
            immutable: self.immutable && other.immutable,
            max_age: match (self.max_age, other.max_age) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
        }
    }

    /// Formats the policy as a header value in canonical directive order.
    ///
    /// An empty policy formats to the empty string; callers omit the header
    /// in that case.
    pub fn format(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if self.must_revalidate {
            parts.push("must-revalidate".into());
        }
        if self.no_cache {
            parts.push("no-cache".into());
        }
        if self.no_store {
            parts.push("no-store".into());
        }
        if self.public {
            parts.push("public".into());
        }
        if self.private {
            parts.push("private".into());
        }
        if self.immutable {
            parts.push("immutable".into());
        }
        if let Some(max_age) = self.max_age {
            parts.push(format!("max-age={}", max_age.as_secs()));
        }
        parts.join(", ")
    }

    /// Whether no directive is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Iterates the trimmed `Cache-Control` directives of a header map.
pub(crate) fn directives(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    get_all_comma(headers.get_all("cache-control"))
}

/// Whether a directive with the given name is present, valued or not.
pub(crate) fn has_directive(headers: &HeaderMap, name: &str) -> bool {
    directives(headers).any(|d| d == name || d.strip_prefix(name).is_some_and(|r| r.starts_with('=')))
}

/// The value of a numeric directive, if present and well formed.
pub(crate) fn directive_value(headers: &HeaderMap, name: &str) -> Option<u64> {
    directives(headers).find_map(|d| numeric_directive(d, name))
}

// Matches `name=<digits>` exactly, nothing looser.
fn numeric_directive(directive: &str, name: &str) -> Option<u64> {
    let value = directive.strip_prefix(name)?.strip_prefix('=')?;
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_with(cache_control: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("cache-control", HeaderValue::from_str(cache_control).unwrap());
        headers
    }

    #[test]
    fn parses_flags_and_max_age() {
        let cc = CacheControl::parse(&headers_with("public,  max-age=60, must-revalidate"));
        assert!(cc.public);
        assert!(cc.must_revalidate);
        assert_eq!(cc.max_age, Some(Duration::from_secs(60)));
        assert!(!cc.no_store);
    }

    #[test]
    fn rejects_malformed_numeric_directives() {
        assert_eq!(CacheControl::parse(&headers_with("max-age=abc")).max_age, None);
        assert_eq!(CacheControl::parse(&headers_with("max-age=")).max_age, None);
        assert_eq!(CacheControl::parse(&headers_with("max-age=1x")).max_age, None);
        assert_eq!(
            CacheControl::parse(&headers_with("max-age=0")).max_age,
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn folds_expires_minus_date_into_max_age() {
        let now = std::time::SystemTime::now();
        let mut headers = HeaderMap::new();
        headers.insert("date", HeaderValue::from_str(&httpdate::fmt_http_date(now)).unwrap());
        headers.insert(
            "expires",
            HeaderValue::from_str(&httpdate::fmt_http_date(now + Duration::from_secs(120)))
                .unwrap(),
        );
        let cc = CacheControl::parse(&headers);
        assert_eq!(cc.max_age, Some(Duration::from_secs(120)));
    }

    #[test]
    fn unparseable_expires_means_already_expired() {
        let mut headers = HeaderMap::new();
        headers.insert("expires", HeaderValue::from_static("0"));
        let cc = CacheControl::parse(&headers);
        assert_eq!(cc.max_age, Some(Duration::ZERO));
    }

    #[test]
    fn explicit_max_age_wins_over_expires() {
        let now = std::time::SystemTime::now();
        let mut headers = headers_with("max-age=10");
        headers.insert("date", HeaderValue::from_str(&httpdate::fmt_http_date(now)).unwrap());
        headers.insert(
            "expires",
            HeaderValue::from_str(&httpdate::fmt_http_date(now + Duration::from_secs(999)))
                .unwrap(),
        );
        assert_eq!(CacheControl::parse(&headers).max_age, Some(Duration::from_secs(10)));
    }

    #[test]
    fn merge_is_commutative_on_flags() {
        let a = CacheControl {
            no_cache: true,
            public: true,
            immutable: true,
            max_age: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let b = CacheControl {
            private: true,
            public: false,
            max_age: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        assert_eq!(a.merge(b), b.merge(a));
        let merged = a.merge(b);
        assert!(merged.no_cache);
        assert!(merged.private);
        assert!(!merged.public);
        assert!(!merged.immutable);
        assert_eq!(merged.max_age, Some(Duration::from_secs(10)));
    }

    #[test]
    fn merge_keeps_the_defined_max_age() {
        let a = CacheControl { max_age: Some(Duration::from_secs(30)), ..Default::default() };
        let b = CacheControl::default();
        assert_eq!(a.merge(b).max_age, Some(Duration::from_secs(30)));
        assert_eq!(b.merge(a).max_age, Some(Duration::from_secs(30)));
        assert_eq!(b.merge(b).max_age, None);
    }

    #[test]
    fn format_uses_canonical_order() {
        let cc = CacheControl {
            max_age: Some(Duration::from_secs(5)),
            no_store: true,
            must_revalidate: true,
            ..Default::default()
        };
        assert_eq!(cc.format(), "must-revalidate, no-store, max-age=5");
        assert_eq!(CacheControl::default().format(), "");
    }

    #[test]
    fn parse_then_format_is_stable() {
        let first = CacheControl::parse(&headers_with("no-cache, public, max-age=60"));
        let again = CacheControl::parse(&headers_with(&first.format()));
        assert_eq!(first, again);
    }

    #[test]
    fn directive_lookup_ignores_whitespace_and_ordering() {
        let headers = headers_with("  s-maxage=9 ,max-age=3");
        assert_eq!(directive_value(&headers, "s-maxage"), Some(9));
        assert_eq!(directive_value(&headers, "max-age"), Some(3));
        assert!(has_directive(&headers, "s-maxage"));
        assert!(!has_directive(&headers, "maxage"));
    }
}
