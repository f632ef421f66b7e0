//! The caching engine: the pipeline stage that serves, revalidates, and
//! admits representations according to HTTP caching rules.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{AUTHORIZATION, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use http::request::Parts;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use tracing::debug;

use crate::cache_control::{directive_value, directives, has_directive};
use crate::freshness::{self, Freshness};
use crate::handler::{Handler, SharedHandler};
use crate::headers::{remove_1xx_warnings, WARNING};
use crate::representation::Representation;
use crate::store::Store;
use crate::Result;

/// `x-cache` header: HIT if the response was served from cache, MISS if not
pub const XCACHE: &str = "x-cache";
/// `x-cache-lookup` header: HIT if a response existed in cache, MISS if not
pub const XCACHELOOKUP: &str = "x-cache-lookup";

/// Represents a basic cache status, used in the custom headers `x-cache`
/// and `x-cache-lookup`.
#[derive(Debug, Copy, Clone)]
pub enum HitOrMiss {
    /// Yes, there was a hit
    Hit,
    /// No, there was no hit
    Miss,
}

impl fmt::Display for HitOrMiss {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Hit => write!(f, "HIT"),
            Self::Miss => write!(f, "MISS"),
        }
    }
}

/// Caches responses according to the HTTP spec.
///
/// Per request the engine asks the [freshness oracle](crate::freshness) what
/// the cached representation allows, then serves it, serves it stale with a
/// warning, or revalidates it downstream. Successful non-idempotent requests
/// mark the origin as changed, which pessimistically forces revalidation of
/// everything older without erasing it. `PURGE` requests drop the whole
/// resource.
///
/// Concurrent revalidations of the same key are not serialised; the
/// occasional duplicate upstream fetch is accepted and admission is last
/// writer wins under the store's write lock.
pub struct CacheHandler {
    store: Arc<Store>,
    next: SharedHandler,
}

impl CacheHandler {
    /// Creates the stage over a store and the next stage down.
    pub fn new(store: Arc<Store>, next: SharedHandler) -> Self {
        Self { store, next }
    }

    async fn revalidate(
        &self,
        parts: Parts,
        body: Bytes,
        mut cached: Option<Representation>,
        was_stale: bool,
    ) -> Result<Response<Bytes>> {
        let mut forward = parts.clone();
        if let Some(rep) = &cached {
            if let Some(etag) = rep.headers.get("etag") {
                forward.headers.insert(IF_NONE_MATCH, etag.clone());
            }
            if let Some(last_modified) = rep.headers.get("last-modified") {
                forward.headers.insert(IF_MODIFIED_SINCE, last_modified.clone());
            }
        }

        let request_time = SystemTime::now();
        let result = self.next.handle(Request::from_parts(forward, body)).await;
        let response_time = SystemTime::now();

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                if let (true, Some(rep)) = (was_stale, &cached) {
                    debug!(error = %err, "revalidation failed, serving stale");
                    return Ok(serve_stale(rep));
                }
                return Err(err);
            }
        };

        let status = response.status();
        if !is_idempotent(&parts.method) && is_success(status) {
            self.store.mark_origin_changed(response_time);
        }

        if status == StatusCode::NOT_MODIFIED {
            if let Some(rep) = cached.take() {
                let merged =
                    merge_not_modified(rep, response.headers(), request_time, response_time);
                self.store.set(&parts, merged.clone());
                let mut response = merged.to_response();
                stamp(&mut response, HitOrMiss::Hit, HitOrMiss::Hit);
                return Ok(response);
            }
        }

        if is_success(status) {
            let rep = Representation::seal(response, request_time, response_time);
            if cacheable(&parts, &rep) {
                debug!(status = %status, "admitting response");
                self.store.set(&parts, rep.clone());
            }
            let mut response = rep.to_response();
            stamp(&mut response, HitOrMiss::Miss, lookup_of(&cached));
            return Ok(response);
        }

        if let (true, Some(rep)) = (was_stale, &cached) {
            debug!(status = %status, "upstream error, serving stale");
            return Ok(serve_stale(rep));
        }

        let mut response = response;
        stamp(&mut response, HitOrMiss::Miss, lookup_of(&cached));
        Ok(response)
    }
}

#[async_trait]
impl Handler for CacheHandler {
    async fn handle(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
        let (parts, body) = req.into_parts();

        if parts.method.as_str() == "PURGE" {
            let removed = self.store.purge(&parts).map_or(0, |reps| reps.len());
            debug!(removed, path = parts.uri.path(), "purged resource");
            let mut response = Response::new(Bytes::new());
            *response.status_mut() = StatusCode::NO_CONTENT;
            return Ok(response);
        }

        let cached = self.store.get(&parts);
        let (state, delta) = freshness::state(
            &parts,
            cached.as_ref(),
            self.store.origin_changed_at(),
            SystemTime::now(),
        );
        debug!(state = ?state, delta, path = parts.uri.path(), "freshness");

        match (state, cached) {
            (Freshness::Fresh, Some(rep)) => {
                let mut response = rep.to_response();
                stamp(&mut response, HitOrMiss::Hit, HitOrMiss::Hit);
                Ok(response)
            }
            (Freshness::Stale, Some(rep)) => {
                // A stale copy is written out only when the request accepts
                // it via max-stale; anything else revalidates first.
                let acceptable = match request_max_stale(&parts.headers) {
                    Some(MaxStale::Any) => true,
                    Some(MaxStale::Limit(limit)) => delta <= limit as i64,
                    None => false,
                };
                if acceptable {
                    Ok(serve_stale(&rep))
                } else {
                    self.revalidate(parts, body, Some(rep), true).await
                }
            }
            (_, cached) => self.revalidate(parts, body, cached, false).await,
        }
    }
}

enum MaxStale {
    Any,
    Limit(u64),
}

fn request_max_stale(headers: &HeaderMap) -> Option<MaxStale> {
    if let Some(limit) = directive_value(headers, "max-stale") {
        return Some(MaxStale::Limit(limit));
    }
    if directives(headers).any(|d| d == "max-stale") {
        return Some(MaxStale::Any);
    }
    None
}

fn is_idempotent(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD
}

fn is_success(status: StatusCode) -> bool {
    status.is_success() || status.is_redirection()
}

fn lookup_of(cached: &Option<Representation>) -> HitOrMiss {
    if cached.is_some() {
        HitOrMiss::Hit
    } else {
        HitOrMiss::Miss
    }
}

fn stamp(response: &mut Response<Bytes>, cache: HitOrMiss, lookup: HitOrMiss) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&cache.to_string()) {
        headers.insert(XCACHE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&lookup.to_string()) {
        headers.insert(XCACHELOOKUP, value);
    }
}

fn serve_stale(rep: &Representation) -> Response<Bytes> {
    let mut response = rep.to_response();
    response
        .headers_mut()
        .append(WARNING, HeaderValue::from_static(r#"110 - "Response is Stale""#));
    stamp(&mut response, HitOrMiss::Hit, HitOrMiss::Hit);
    response
}

// rfc7234 4.3.4: keep the cached body, take the validator's headers, drop
// stored 1xx warnings and retain 2xx ones. The revalidation instants replace
// the stored ones so the age restarts.
fn merge_not_modified(
    mut rep: Representation,
    fresh: &HeaderMap,
    request_time: SystemTime,
    response_time: SystemTime,
) -> Representation {
    remove_1xx_warnings(&mut rep.headers);
    for name in fresh.keys() {
        let mut first = true;
        for value in fresh.get_all(name) {
            if first {
                rep.headers.insert(name.clone(), value.clone());
                first = false;
            } else {
                rep.headers.append(name.clone(), value.clone());
            }
        }
    }
    rep.request_time = request_time;
    rep.response_time = response_time;
    rep
}

// rfc7234 3: the admission predicate for a shared cache.
fn cacheable(parts: &Parts, rep: &Representation) -> bool {
    parts.method == Method::GET
        && rep.status == StatusCode::OK
        && !has_directive(&parts.headers, "no-store")
        && !has_directive(&rep.headers, "no-store")
        && !has_directive(&rep.headers, "private")
        && (!parts.headers.contains_key(AUTHORIZATION)
            || has_directive(&rep.headers, "must-revalidate")
            || has_directive(&rep.headers, "public")
            || directive_value(&rep.headers, "s-maxage").is_some())
        && (rep.headers.contains_key("expires")
            || directive_value(&rep.headers, "max-age").is_some()
            || directive_value(&rep.headers, "s-maxage").is_some()
            || has_directive(&rep.headers, "public"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::get("/x").header("host", "api.test");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn rep_with(status: StatusCode, headers: &[(&str, &str)]) -> Representation {
        let mut builder = Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let now = SystemTime::now();
        Representation::seal(builder.body(Bytes::from_static(b"{}")).unwrap(), now, now)
    }

    #[test]
    fn admission_requires_get_and_200() {
        let rep = rep_with(StatusCode::OK, &[("cache-control", "max-age=60")]);
        assert!(cacheable(&get_parts(&[]), &rep));

        let mut post = get_parts(&[]);
        post.method = Method::POST;
        assert!(!cacheable(&post, &rep));

        let created = rep_with(StatusCode::CREATED, &[("cache-control", "max-age=60")]);
        assert!(!cacheable(&get_parts(&[]), &created));
    }

    #[test]
    fn admission_rejects_no_store_and_private() {
        let no_store = rep_with(StatusCode::OK, &[("cache-control", "no-store, max-age=60")]);
        assert!(!cacheable(&get_parts(&[]), &no_store));

        let private = rep_with(StatusCode::OK, &[("cache-control", "private, max-age=60")]);
        assert!(!cacheable(&get_parts(&[]), &private));

        let ok = rep_with(StatusCode::OK, &[("cache-control", "max-age=60")]);
        assert!(!cacheable(&get_parts(&[("cache-control", "no-store")]), &ok));
    }

    #[test]
    fn admission_requires_explicit_freshness() {
        let bare = rep_with(StatusCode::OK, &[]);
        assert!(!cacheable(&get_parts(&[]), &bare));

        let public = rep_with(StatusCode::OK, &[("cache-control", "public")]);
        assert!(cacheable(&get_parts(&[]), &public));

        let expires = rep_with(StatusCode::OK, &[("expires", "0")]);
        assert!(cacheable(&get_parts(&[]), &expires));
    }

    #[test]
    fn authorized_requests_need_an_opt_in() {
        let authed = get_parts(&[("authorization", "Bearer t")]);
        let plain = rep_with(StatusCode::OK, &[("cache-control", "max-age=60")]);
        assert!(!cacheable(&authed, &plain));

        let public = rep_with(StatusCode::OK, &[("cache-control", "public, max-age=60")]);
        assert!(cacheable(&authed, &public));

        let shared = rep_with(StatusCode::OK, &[("cache-control", "s-maxage=60")]);
        assert!(cacheable(&authed, &shared));
    }

    #[test]
    fn not_modified_merge_keeps_body_and_takes_headers() {
        let mut rep = rep_with(
            StatusCode::OK,
            &[("cache-control", "max-age=0"), ("etag", "\"v1\"")],
        );
        rep.headers
            .append(WARNING, HeaderValue::from_static(r#"110 - "Response is Stale""#));
        rep.headers
            .append(WARNING, HeaderValue::from_static(r#"214 - "Transformation Applied""#));
        let body = rep.body.clone();

        let mut fresh = HeaderMap::new();
        fresh.insert("cache-control", HeaderValue::from_static("max-age=60"));
        fresh.insert("etag", HeaderValue::from_static("\"v1\""));

        let now = SystemTime::now();
        let merged = merge_not_modified(rep, &fresh, now, now);
        assert_eq!(merged.body, body);
        assert_eq!(merged.headers.get("cache-control").unwrap(), "max-age=60");
        let warnings: Vec<&str> = merged
            .headers
            .get_all(WARNING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        assert_eq!(warnings, vec![r#"214 - "Transformation Applied""#]);
    }

    #[test]
    fn max_stale_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert("cache-control", HeaderValue::from_static("max-stale=30"));
        assert!(matches!(request_max_stale(&headers), Some(MaxStale::Limit(30))));
        headers.insert("cache-control", HeaderValue::from_static("max-stale"));
        assert!(matches!(request_max_stale(&headers), Some(MaxStale::Any)));
        headers.insert("cache-control", HeaderValue::from_static("no-cache"));
        assert!(request_max_stale(&headers).is_none());
    }
}
