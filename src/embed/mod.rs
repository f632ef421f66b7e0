//! The embedding engine: expands `_links` into `_embedded` by fanning out
//! internal sub-requests through the rest of the pipeline.
//!
//! Clients name the relations to expand with `?with=` query values or a
//! `With:` header; `with=roles.actor` resolves every `_links.roles` entry,
//! splices the fetched documents under `_embedded.roles`, and within each of
//! them resolves `_links.actor` the same way. Sub-requests re-enter the
//! pipeline below this stage, so they hit the cache like any other request.
//!
//! Sibling edges and array elements fetch in parallel. A parent merges the
//! `Cache-Control` policy of every child into its own, so the outer response
//! is never declared more cacheable than the least cacheable piece it
//! contains. Failed sub-fetches become RFC 7807 problem documents at their
//! position and contribute a `no-store` policy.

mod problem;
mod specifier;

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::request::Parts;
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, Uri};
use md5::{Digest, Md5};
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::{form_urlencoded, Url};

use crate::cache_control::CacheControl;
use crate::handler::{Handler, SharedHandler};
use crate::headers::{HeaderStr, WARNING};
use crate::{Error, Result};

use problem::SubFetchError;
pub use specifier::Specifier;

/// Expands `_links` into `_embedded` on HAL+JSON responses.
///
/// Responses that are not JSON objects, or requests that name nothing to
/// embed, pass through untouched.
pub struct EmbedHandler {
    next: SharedHandler,
}

impl EmbedHandler {
    /// Creates the stage over the next stage down.
    pub fn new(next: SharedHandler) -> Self {
        Self { next }
    }
}

#[async_trait]
impl Handler for EmbedHandler {
    async fn handle(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
        let (mut parts, body) = req.into_parts();
        let spec = extract_specifier(&mut parts)?;
        if spec.is_empty() {
            return self.next.handle(Request::from_parts(parts, body)).await;
        }

        let base = request_url(&parts)?;
        let headers = parts.headers.clone();
        let response = self.next.handle(Request::from_parts(parts, body)).await?;
        if !is_json(response.headers()) {
            return Ok(response);
        }

        let (res_parts, res_body) = response.into_parts();
        let data: Value = match serde_json::from_slice(&res_body) {
            Ok(data @ Value::Object(_)) => data,
            _ => return Ok(Response::from_parts(res_parts, res_body)),
        };

        let policy = CacheControl::parse(&res_parts.headers);
        let node =
            embed_node(self.next.clone(), base, headers, spec, Node { data, policy }).await;
        match serde_json::to_vec(&node.data) {
            Ok(serialised) => rewrite(res_parts, Bytes::from(serialised), node.policy),
            // Leave the outer body untouched if it cannot be re-serialised.
            Err(_) => Ok(Response::from_parts(res_parts, res_body)),
        }
    }
}

// One document plus the aggregate policy of everything embedded in it.
struct Node {
    data: Value,
    policy: CacheControl,
}

// Walks one document level: spawns a sub-fetch per matched link, waits for
// all of them, splices the results into `_embedded`, and folds their
// policies into the parent's.
fn embed_node(
    next: SharedHandler,
    base: Url,
    headers: HeaderMap,
    spec: Specifier,
    node: Node,
) -> BoxFuture<'static, Node> {
    async move {
        let mut policy = node.policy;
        let mut object = match node.data {
            Value::Object(object) => object,
            other => return Node { data: other, policy },
        };

        let mut tasks: JoinSet<(String, Option<usize>, Node)> = JoinSet::new();
        let mut results: Vec<(String, Option<usize>, Node)> = Vec::new();
        let links = object.get("_links").cloned().unwrap_or(Value::Null);
        for (edge, child_spec) in spec.edges {
            match links.get(edge.as_str()) {
                Some(Value::Object(link)) => {
                    if let Some(href) = link.get("href").and_then(Value::as_str) {
                        spawn_fetch(
                            &mut tasks,
                            next.clone(),
                            base.clone(),
                            headers.clone(),
                            child_spec,
                            edge,
                            None,
                            href.to_string(),
                        );
                    }
                }
                Some(Value::Array(items)) => {
                    for (index, item) in items.iter().enumerate() {
                        match item.get("href").and_then(Value::as_str) {
                            Some(href) => spawn_fetch(
                                &mut tasks,
                                next.clone(),
                                base.clone(),
                                headers.clone(),
                                child_spec.clone(),
                                edge.clone(),
                                Some(index),
                                href.to_string(),
                            ),
                            // Keep the slot so array order still mirrors
                            // the `_links` array.
                            None => results.push((
                                edge.clone(),
                                Some(index),
                                problem_node(
                                    SubFetchError::MalformedUrl("link has no href".into()),
                                    base.as_str(),
                                ),
                            )),
                        }
                    }
                }
                _ => {}
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => warn!(error = %err, "embedding sub-fetch task failed"),
            }
        }

        let mut singles: Vec<(String, Value)> = Vec::new();
        let mut arrays: BTreeMap<String, BTreeMap<usize, Value>> = BTreeMap::new();
        for (edge, index, child) in results {
            policy = policy.merge(child.policy);
            match index {
                None => singles.push((edge, child.data)),
                Some(index) => {
                    arrays.entry(edge).or_default().insert(index, child.data);
                }
            }
        }

        if !singles.is_empty() || !arrays.is_empty() {
            let embedded = object
                .entry("_embedded".to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !embedded.is_object() {
                *embedded = Value::Object(Map::new());
            }
            if let Value::Object(embedded) = embedded {
                for (edge, value) in singles {
                    embedded.insert(edge, value);
                }
                for (edge, items) in arrays {
                    embedded.insert(edge, Value::Array(items.into_values().collect()));
                }
            }
        }

        Node { data: Value::Object(object), policy }
    }
    .boxed()
}

#[allow(clippy::too_many_arguments)]
fn spawn_fetch(
    tasks: &mut JoinSet<(String, Option<usize>, Node)>,
    next: SharedHandler,
    base: Url,
    headers: HeaderMap,
    spec: Specifier,
    edge: String,
    index: Option<usize>,
    href: String,
) {
    tasks.spawn(async move {
        let node = fetch_and_embed(next, base, headers, spec, href).await;
        (edge, index, node)
    });
}

// One sub-fetch: resolve the href, issue an internal GET through the next
// stage, then recurse into the fetched document. Every failure mode turns
// into a problem node rather than an error.
async fn fetch_and_embed(
    next: SharedHandler,
    base: Url,
    headers: HeaderMap,
    spec: Specifier,
    href: String,
) -> Node {
    let resolved = match base.join(&href) {
        Ok(url) => url,
        Err(err) => return problem_node(SubFetchError::MalformedUrl(err.to_string()), &href),
    };
    let request = match subrequest(&resolved, &headers) {
        Ok(request) => request,
        Err(err) => {
            return problem_node(
                SubFetchError::MalformedRequest(err.to_string()),
                resolved.as_str(),
            )
        }
    };
    let response = match next.handle(request).await {
        Ok(response) => response,
        Err(Error::BodyRead) => {
            return problem_node(
                SubFetchError::BodyRead("error reading response body".into()),
                resolved.as_str(),
            )
        }
        Err(err) => {
            return problem_node(
                SubFetchError::Response { status: None, detail: err.to_string() },
                resolved.as_str(),
            )
        }
    };

    let status = response.status();
    if !(status.is_success() || status.is_redirection()) {
        return problem_node(
            SubFetchError::Response { status: Some(status.as_u16()), detail: status.to_string() },
            resolved.as_str(),
        );
    }

    let (res_parts, body) = response.into_parts();
    match serde_json::from_slice::<Value>(&body) {
        Ok(data) => {
            let policy = CacheControl::parse(&res_parts.headers);
            embed_node(next, resolved, headers, spec, Node { data, policy }).await
        }
        Err(err) => problem_node(SubFetchError::MalformedJson(err.to_string()), resolved.as_str()),
    }
}

fn problem_node(error: SubFetchError, about: &str) -> Node {
    debug!(about, error = ?error, "sub-fetch failed");
    Node {
        data: error.document(about),
        // Failures must not poison upstream freshness.
        policy: CacheControl { no_store: true, ..CacheControl::default() },
    }
}

// Headers that describe the outer request's body. The internal request has
// no body, so they must not ride along.
const BODY_HEADERS: &[&str] =
    &["content-length", "content-type", "content-encoding", "transfer-encoding"];

// Builds the internal GET for a resolved link target. The parent's headers
// carry over, minus anything describing its body; the Host header follows
// the target.
fn subrequest(url: &Url, parent: &HeaderMap) -> Result<Request<Bytes>> {
    let path_and_query = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };
    let mut request =
        Request::builder().method(Method::GET).uri(path_and_query).body(Bytes::new())?;
    *request.headers_mut() = parent.clone();
    for name in BODY_HEADERS {
        request.headers_mut().remove(*name);
    }
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => return Err(Error::BadHeader),
    };
    request.headers_mut().insert(header::HOST, HeaderValue::from_str(&host)?);
    Ok(request)
}

// Collects embedding paths from every `with` query value and `With` header
// value, and strips the former from the outgoing URL.
fn extract_specifier(parts: &mut Parts) -> Result<Specifier> {
    let mut spec = Specifier::new();
    if let Some(query) = parts.uri.query() {
        let mut remaining = form_urlencoded::Serializer::new(String::new());
        let mut saw_with = false;
        let mut saw_other = false;
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if key == "with" {
                saw_with = true;
                spec.add_path(&value);
            } else {
                saw_other = true;
                remaining.append_pair(&key, &value);
            }
        }
        if saw_with {
            let path_and_query = if saw_other {
                format!("{}?{}", parts.uri.path(), remaining.finish())
            } else {
                parts.uri.path().to_string()
            };
            let mut builder = Uri::builder();
            if let Some(scheme) = parts.uri.scheme() {
                builder = builder.scheme(scheme.clone());
            }
            if let Some(authority) = parts.uri.authority() {
                builder = builder.authority(authority.clone());
            }
            parts.uri = builder.path_and_query(path_and_query).build()?;
        }
    }
    for value in parts.headers.get_all("with") {
        if let Ok(value) = value.to_str() {
            for path in value.split(',') {
                spec.add_path(path);
            }
        }
    }
    Ok(spec)
}

// Reconstructs the absolute URL of the request for resolving link targets.
fn request_url(parts: &Parts) -> Result<Url> {
    if parts.uri.scheme().is_some() {
        return Ok(Url::parse(&parts.uri.to_string())?);
    }
    let host = parts.headers.get_str("host").ok_or(Error::BadHeader)?;
    let scheme = determine_scheme(host, &parts.headers);
    let mut url = Url::parse(&format!("{scheme}://{host}/"))?;
    if let Some(path_and_query) = parts.uri.path_and_query() {
        url.set_path(path_and_query.path());
        url.set_query(path_and_query.query());
    }
    Ok(url)
}

fn determine_scheme(host: &str, headers: &HeaderMap) -> &'static str {
    if let Some(proto) = headers.get_str("x-forwarded-proto") {
        return if proto == "http" { "http" } else { "https" };
    }
    if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
        "http"
    } else {
        "https"
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    let Some(content_type) = headers.get_str(header::CONTENT_TYPE.as_str()) else {
        return false;
    };
    let essence = content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    match essence.strip_prefix("application/") {
        Some("json") => true,
        Some(suffixed) => suffixed.strip_suffix("+json").is_some_and(|prefix| !prefix.is_empty()),
        None => false,
    }
}

// The final header rewrite after the whole tree has been embedded.
fn rewrite(
    mut parts: http::response::Parts,
    body: Bytes,
    policy: CacheControl,
) -> Result<Response<Bytes>> {
    parts.headers.remove(header::EXPIRES);
    let formatted = policy.format();
    if formatted.is_empty() {
        parts.headers.remove(header::CACHE_CONTROL);
    } else {
        parts.headers.insert(header::CACHE_CONTROL, HeaderValue::from_str(&formatted)?);
    }
    let etag = format!("W/\"{}\"", hex::encode(Md5::digest(&body)));
    parts.headers.insert(header::ETAG, HeaderValue::from_str(&etag)?);
    if !parts.headers.contains_key(WARNING) {
        parts
            .headers
            .append(WARNING, HeaderValue::from_static(r#"214 - "Transformation Applied""#));
    }
    parts.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    Ok(Response::from_parts(parts, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_content_types_match() {
        let mut headers = HeaderMap::new();
        for ok in ["application/json", "application/hal+json", "Application/JSON; charset=utf-8"] {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_str(ok).unwrap());
            assert!(is_json(&headers), "{ok} should match");
        }
        for bad in ["text/html", "application/+json", "application/jsonp", "json"] {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_str(bad).unwrap());
            assert!(!is_json(&headers), "{bad} should not match");
        }
        headers.remove(header::CONTENT_TYPE);
        assert!(!is_json(&headers));
    }

    #[test]
    fn specifier_is_collected_and_with_params_are_stripped() {
        let request = Request::get("/movies/1?with=roles.actor&page=2&with=director")
            .header("host", "api.test")
            .header("with", "studio, roles.film")
            .body(())
            .unwrap();
        let (mut parts, _) = request.into_parts();
        let spec = extract_specifier(&mut parts).unwrap();

        assert_eq!(parts.uri.to_string(), "/movies/1?page=2");
        let roles = spec.get("roles").expect("roles edge");
        assert!(roles.get("actor").is_some());
        assert!(roles.get("film").is_some());
        assert!(spec.get("director").is_some());
        assert!(spec.get("studio").is_some());
    }

    #[test]
    fn query_without_with_params_is_left_alone() {
        let request = Request::get("/movies/1?page=2").header("host", "api.test").body(()).unwrap();
        let (mut parts, _) = request.into_parts();
        let spec = extract_specifier(&mut parts).unwrap();
        assert!(spec.is_empty());
        assert_eq!(parts.uri.to_string(), "/movies/1?page=2");
    }

    #[test]
    fn request_url_uses_the_host_header() {
        let request = Request::get("/movies/1?page=2").header("host", "api.test").body(()).unwrap();
        let (parts, _) = request.into_parts();
        let url = request_url(&parts).unwrap();
        assert_eq!(url.host_str(), Some("api.test"));
        assert_eq!(url.path(), "/movies/1");
        assert_eq!(url.query(), Some("page=2"));

        let hostless = Request::get("/x").body(()).unwrap().into_parts().0;
        assert!(request_url(&hostless).is_err());
    }

    #[test]
    fn subrequests_follow_the_resolved_target() {
        let base = Url::parse("http://api.test/movies/1").unwrap();
        let parent: HeaderMap = {
            let mut headers = HeaderMap::new();
            headers.insert("accept", HeaderValue::from_static("application/hal+json"));
            headers.insert(header::HOST, HeaderValue::from_static("api.test"));
            headers
        };
        let resolved = base.join("/roles/1?full=1").unwrap();
        let request = subrequest(&resolved, &parent).unwrap();
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.uri().to_string(), "/roles/1?full=1");
        assert_eq!(request.headers().get("accept").unwrap(), "application/hal+json");
        assert_eq!(request.headers().get(header::HOST).unwrap(), "api.test");
    }

    #[test]
    fn subrequests_drop_the_parent_body_headers() {
        let base = Url::parse("http://api.test/movies/1").unwrap();
        let parent: HeaderMap = {
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            headers.insert("content-encoding", HeaderValue::from_static("gzip"));
            headers.insert("accept-language", HeaderValue::from_static("en"));
            headers
        };
        let request = subrequest(&base.join("/roles/1").unwrap(), &parent).unwrap();
        assert!(request.headers().get(header::CONTENT_LENGTH).is_none());
        assert!(request.headers().get(header::CONTENT_TYPE).is_none());
        assert!(request.headers().get("content-encoding").is_none());
        assert_eq!(request.headers().get("accept-language").unwrap(), "en");
    }
}
