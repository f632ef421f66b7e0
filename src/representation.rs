//! The buffered HTTP representation shared by the store and the engines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::{HeaderMap, Response, StatusCode};
use uuid::Uuid;

use crate::store::{RepresentationKey, ResourceKey};

/// One concrete HTTP response bound to a resource variant.
///
/// A representation seals the buffered output of a downstream handler
/// together with the instants the call was issued and answered. Once admitted
/// to the [`Store`](crate::Store) it is effectively immutable; the store
/// hands out clones and only the last-used stamp changes afterwards.
#[derive(Debug)]
pub struct Representation {
    /// Response status code.
    pub status: StatusCode,
    /// Response headers, multi-valued.
    pub headers: HeaderMap,
    /// Buffered response body.
    pub body: Bytes,
    /// Instant captured immediately before the downstream call was issued.
    pub request_time: SystemTime,
    /// Instant captured immediately after the downstream call completed.
    pub response_time: SystemTime,
    /// Opaque identity, assigned at creation.
    pub id: Uuid,
    // Stamped on every store read, nanoseconds since the epoch. Atomic so
    // reads can update it under the store's shared lock.
    last_used: AtomicU64,
    // Populated at admission; consistent with the store's indexes.
    pub(crate) keys: Option<(ResourceKey, RepresentationKey)>,
}

impl Clone for Representation {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
            request_time: self.request_time,
            response_time: self.response_time,
            id: self.id,
            last_used: AtomicU64::new(self.last_used.load(Ordering::Relaxed)),
            keys: self.keys.clone(),
        }
    }
}

impl Representation {
    /// Seals a buffered response into a representation.
    pub fn seal(
        response: Response<Bytes>,
        request_time: SystemTime,
        response_time: SystemTime,
    ) -> Self {
        debug_assert!(request_time <= response_time);
        let (parts, body) = response.into_parts();
        Self {
            status: parts.status,
            headers: parts.headers,
            body,
            request_time,
            response_time,
            id: Uuid::new_v4(),
            last_used: AtomicU64::new(0),
            keys: None,
        }
    }

    /// Rebuilds a response from the buffered parts. The body is shared, not
    /// copied.
    pub fn to_response(&self) -> Response<Bytes> {
        let mut response = Response::new(self.body.clone());
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers.clone();
        response
    }

    /// The store keys this representation was admitted under, if any.
    pub fn keys(&self) -> Option<&(ResourceKey, RepresentationKey)> {
        self.keys.as_ref()
    }

    /// Body length as counted by the store's byte budget.
    pub fn body_len(&self) -> u64 {
        self.body.len() as u64
    }

    pub(crate) fn touch(&self, now: SystemTime) {
        let nanos = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos()
            .min(u128::from(u64::MAX)) as u64;
        self.last_used.store(nanos, Ordering::Relaxed);
    }

    pub(crate) fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_rebuild_round_trip() {
        let response = Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Bytes::from_static(b"{\"a\":1}"))
            .unwrap();
        let now = SystemTime::now();
        let rep = Representation::seal(response, now, now);
        assert_eq!(rep.body_len(), 7);
        assert!(rep.keys().is_none());

        let rebuilt = rep.to_response();
        assert_eq!(rebuilt.status(), StatusCode::OK);
        assert_eq!(rebuilt.headers().get("content-type").unwrap(), "application/json");
        assert_eq!(rebuilt.body(), &rep.body);
    }

    #[test]
    fn clones_share_nothing_mutable() {
        let rep = Representation::seal(
            Response::new(Bytes::from_static(b"x")),
            SystemTime::now(),
            SystemTime::now(),
        );
        rep.touch(SystemTime::now());
        let cloned = rep.clone();
        assert_eq!(cloned.id, rep.id);
        assert_eq!(cloned.last_used(), rep.last_used());
        rep.touch(SystemTime::now() + Duration::from_secs(10));
        assert!(cloned.last_used() < rep.last_used());
    }
}
