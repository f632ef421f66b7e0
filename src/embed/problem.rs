//! RFC 7807 problem documents for failed sub-fetches.
//!
//! A failed sub-fetch never fails the outer request; it is replaced, at its
//! position in `_embedded`, by a problem document pointing back at the link
//! that could not be resolved.

use serde::Serialize;
use serde_json::Value;

/// Why a sub-fetch could not produce an embeddable document.
#[derive(Debug)]
pub(crate) enum SubFetchError {
    /// The `href` could not be resolved into a URL.
    MalformedUrl(String),
    /// An internal request could not be built from the resolved URL.
    MalformedRequest(String),
    /// The upstream answered with a non-success status, or did not answer
    /// at all.
    Response { status: Option<u16>, detail: String },
    /// The response body could not be read.
    BodyRead(String),
    /// The response body was not a JSON document.
    MalformedJson(String),
}

#[derive(Debug, Serialize)]
struct ProblemDocument<'a> {
    #[serde(rename = "type")]
    type_uri: &'static str,
    title: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    detail: &'a str,
    #[serde(rename = "_links")]
    links: Links<'a>,
}

#[derive(Debug, Serialize)]
struct Links<'a> {
    about: Link<'a>,
}

#[derive(Debug, Serialize)]
struct Link<'a> {
    href: &'a str,
}

impl SubFetchError {
    fn type_uri(&self) -> &'static str {
        match self {
            Self::MalformedUrl(_) => "/problems/malformed-url",
            Self::MalformedRequest(_) => "/problems/malformed-subrequest",
            Self::Response { .. } => "/problems/response-error",
            Self::BodyRead(_) => "/problems/response-body",
            Self::MalformedJson(_) => "/problems/malformed-json",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::MalformedUrl(_) => "Malformed URL",
            Self::MalformedRequest(_) => "Malformed Subrequest",
            Self::Response { .. } => "Response Error",
            Self::BodyRead(_) => "Response Body Unreadable",
            Self::MalformedJson(_) => "Malformed JSON",
        }
    }

    /// Renders the document placed at the failed edge.
    pub(crate) fn document(&self, about: &str) -> Value {
        let (status, detail) = match self {
            Self::Response { status, detail } => (*status, detail),
            Self::MalformedUrl(detail)
            | Self::MalformedRequest(detail)
            | Self::BodyRead(detail)
            | Self::MalformedJson(detail) => (None, detail),
        };
        let doc = ProblemDocument {
            type_uri: self.type_uri(),
            title: self.title(),
            status,
            detail,
            links: Links { about: Link { href: about } },
        };
        serde_json::to_value(&doc).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documents_carry_type_title_and_about() {
        let doc = SubFetchError::MalformedUrl("relative base".into()).document("/roles/1");
        assert_eq!(doc["type"], "/problems/malformed-url");
        assert_eq!(doc["title"], "Malformed URL");
        assert_eq!(doc["detail"], "relative base");
        assert_eq!(doc["_links"]["about"]["href"], "/roles/1");
        assert!(doc.get("status").is_none());
    }

    #[test]
    fn response_errors_carry_the_upstream_status() {
        let doc =
            SubFetchError::Response { status: Some(503), detail: "503 Service Unavailable".into() }
                .document("/roles/2");
        assert_eq!(doc["status"], 503);
        assert_eq!(doc["type"], "/problems/response-error");
    }
}
