//! Freshness decisions for cached representations.
//!
//! Pure functions over a request and a cached representation. The result
//! tells the caching engine whether the cached copy can be written out as
//! is, written out stale, or must be revalidated against the upstream. The
//! age arithmetic follows RFC 7234 section 4.2.3.

use std::time::{Duration, SystemTime};

use http::request::Parts;

use crate::cache_control::{directive_value, directives, has_directive};
use crate::headers::HeaderStr;
use crate::representation::Representation;

/// What the cache may do with a stored representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Nothing is cached for this request.
    Miss,
    /// The cached representation may be served without contacting upstream.
    Fresh,
    /// The cached representation is past its freshness lifetime but may be
    /// served stale.
    Stale,
    /// The cached representation must be validated upstream before use.
    Revalidate,
}

/// Decides the freshness state of `cached` for the given request.
///
/// The second element is the signed distance in seconds between the current
/// age and the freshness lifetime: negative while fresh, positive once
/// stale.
pub fn state(
    parts: &Parts,
    cached: Option<&Representation>,
    origin_changed_at: SystemTime,
    now: SystemTime,
) -> (Freshness, i64) {
    let Some(rep) = cached else {
        return (Freshness::Miss, 0);
    };

    let pragma_no_store = parts
        .headers
        .get_str("pragma")
        .is_some_and(|p| p.split(',').any(|d| d.trim() == "no-store"));
    if pragma_no_store
        || has_directive(&parts.headers, "no-store")
        || has_directive(&rep.headers, "no-store")
    {
        return (Freshness::Revalidate, 0);
    }

    let lifetime = if let Some(secs) = directive_value(&rep.headers, "s-maxage") {
        Duration::from_secs(secs)
    } else if let Some(secs) = directive_value(&rep.headers, "max-age") {
        Duration::from_secs(secs)
    } else if let Some(expires) = rep.headers.get_str("expires") {
        match httpdate::parse_http_date(expires) {
            Ok(at) => at.duration_since(now).unwrap_or(Duration::ZERO),
            Err(_) => Duration::ZERO,
        }
    } else {
        return (Freshness::Revalidate, 0);
    };

    let age = current_age(rep, now);

    // The representation predates the last destructive upstream change.
    if now.duration_since(origin_changed_at).unwrap_or(Duration::ZERO) <= age {
        return (Freshness::Revalidate, 0);
    }

    let delta = age.as_secs() as i64 - lifetime.as_secs() as i64;
    if lifetime > age {
        return (Freshness::Fresh, delta);
    }

    let must_revalidate = directives(&rep.headers)
        .any(|d| d == "must-revalidate" || d == "proxy-revalidate")
        || directive_value(&rep.headers, "s-maxage").is_some();
    if must_revalidate {
        return (Freshness::Revalidate, 0);
    }

    (Freshness::Stale, delta)
}

// current_age = max(apparent_age, corrected_age_value) + resident_time,
// rfc7234 4.2.3.
fn current_age(rep: &Representation, now: SystemTime) -> Duration {
    let date = rep
        .headers
        .get_str("date")
        .and_then(|d| httpdate::parse_http_date(d).ok())
        .unwrap_or(rep.response_time);
    let apparent_age = rep.response_time.duration_since(date).unwrap_or(Duration::ZERO);
    let age_value = Duration::from_secs(
        rep.headers.get_str("age").and_then(|v| v.trim().parse().ok()).unwrap_or(0),
    );
    let corrected_age_value = age_value
        + rep.response_time.duration_since(rep.request_time).unwrap_or(Duration::ZERO);
    let resident_time = now.duration_since(rep.response_time).unwrap_or(Duration::ZERO);
    apparent_age.max(corrected_age_value) + resident_time
}
