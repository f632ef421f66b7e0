//! Small header-map utilities shared across the pipeline.
//!
//! HTTP allows a field to carry several values, either as repeated header
//! lines or as one comma-separated line. The helpers here flatten both forms
//! so that callers see a single stream of trimmed values.

use http::{HeaderMap, HeaderValue};
use url::form_urlencoded;

/// The `Warning` header, kept as a string since the `http` constant set does
/// not guarantee it.
pub(crate) const WARNING: &str = "warning";

// rfc7230 6.1
pub(crate) const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Iterates every value of a multi-valued field, splitting comma-separated
/// lines and trimming whitespace.
pub(crate) fn get_all_comma<'a>(
    all: impl IntoIterator<Item = &'a HeaderValue>,
) -> impl Iterator<Item = &'a str> {
    all.into_iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|s| s.split(',').map(str::trim))
        .filter(|s| !s.is_empty())
}

pub(crate) trait HeaderStr {
    fn get_str(&self, k: &str) -> Option<&str>;
}

impl HeaderStr for HeaderMap {
    #[inline]
    fn get_str(&self, k: &str) -> Option<&str> {
        self.get(k).and_then(|v| v.to_str().ok())
    }
}

/// Canonicalises a query string: pairs are decoded, sorted, and re-encoded
/// so that equivalent queries produce equal resource keys.
pub(crate) fn canonical_query(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort_unstable();
    let mut out = form_urlencoded::Serializer::new(String::new());
    for (k, v) in &pairs {
        out.append_pair(k, v);
    }
    out.finish()
}

/// Removes hop-by-hop fields, including any named by `Connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_named: Vec<String> = get_all_comma(headers.get_all("connection"))
        .map(|name| name.to_ascii_lowercase())
        .collect();
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
    for name in connection_named {
        headers.remove(name.as_str());
    }
}

/// Drops `Warning` values with a 1xx code, keeping 2xx ones.
pub(crate) fn remove_1xx_warnings(headers: &mut HeaderMap) {
    let kept: Vec<HeaderValue> = headers
        .get_all(WARNING)
        .iter()
        .filter(|v| {
            let code: Option<u16> = v
                .to_str()
                .ok()
                .and_then(|s| s.chars().take(3).collect::<String>().parse().ok());
            !matches!(code, Some(100..=199))
        })
        .cloned()
        .collect();
    headers.remove(WARNING);
    for value in kept {
        headers.append(WARNING, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_values_are_split_and_trimmed() {
        let mut headers = HeaderMap::new();
        headers.append("vary", HeaderValue::from_static("Accept, Accept-Language"));
        headers.append("vary", HeaderValue::from_static(" Accept-Encoding "));
        let values: Vec<&str> = get_all_comma(headers.get_all("vary")).collect();
        assert_eq!(values, vec!["Accept", "Accept-Language", "Accept-Encoding"]);
    }

    #[test]
    fn canonical_query_sorts_pairs() {
        assert_eq!(canonical_query("b=2&a=1"), "a=1&b=2");
        assert_eq!(canonical_query("a=2&a=1"), "a=1&a=2");
        assert_eq!(canonical_query(""), "");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("close, x-trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("abc"));
        headers.insert("accept", HeaderValue::from_static("*/*"));
        strip_hop_by_hop(&mut headers);
        assert!(headers.get("connection").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-trace").is_none());
        assert!(headers.get("accept").is_some());
    }

    #[test]
    fn only_1xx_warnings_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.append(WARNING, HeaderValue::from_static(r#"110 - "Response is Stale""#));
        headers.append(WARNING, HeaderValue::from_static(r#"214 - "Transformation Applied""#));
        remove_1xx_warnings(&mut headers);
        let values: Vec<&str> =
            headers.get_all(WARNING).iter().filter_map(|v| v.to_str().ok()).collect();
        assert_eq!(values, vec![r#"214 - "Transformation Applied""#]);
    }
}
