//! The in-memory representation store.
//!
//! Resources are keyed by host, path, and canonicalised query; each resource
//! holds one representation per method and `Vary` variant. The whole store
//! sits behind a single reader-writer lock: lookups take the shared side,
//! admission, purge, and eviction take the exclusive side. Memory is bounded
//! by an explicit byte counter over body lengths, enforced with sampled LRU
//! eviction rather than a global recency list.

use std::collections::HashMap;
use std::time::SystemTime;

use http::request::Parts;
use http::{HeaderMap, Method};
use parking_lot::RwLock;
use tracing::debug;
use url::form_urlencoded;
use uuid::Uuid;

use crate::headers::{canonical_query, get_all_comma, HeaderStr};
use crate::representation::Representation;

/// Identifies a resource: one URL, any number of representations.
///
/// The method is deliberately absent; it lives in [`RepresentationKey`] so
/// that GET and HEAD share a resource identity while remaining distinct
/// representations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    host: String,
    path: String,
    query: String,
}

impl ResourceKey {
    /// Derives the resource key of a request.
    pub fn of(parts: &Parts) -> Self {
        let host = parts
            .uri
            .host()
            .map(str::to_ascii_lowercase)
            .or_else(|| parts.headers.get_str("host").map(str::to_ascii_lowercase))
            .unwrap_or_default();
        Self {
            host,
            path: parts.uri.path().to_string(),
            query: canonical_query(parts.uri.query().unwrap_or("")),
        }
    }
}

/// Identifies one representation within a resource: the request method plus
/// the canonical projection of the headers named by the resource's `Vary`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepresentationKey {
    method: Method,
    variant: String,
}

// Per `Vary` field: collect the request's values, split comma lists, trim,
// sort, then form-encode `field=value` pairs.
fn variant_key(fields: &[String], headers: &HeaderMap) -> String {
    let mut out = form_urlencoded::Serializer::new(String::new());
    for field in fields {
        let mut values: Vec<&str> = get_all_comma(headers.get_all(field.as_str())).collect();
        values.sort_unstable();
        for value in values {
            out.append_pair(field, value);
        }
    }
    out.finish()
}

#[derive(Debug, Default)]
struct Resource {
    unique: bool,
    fields: Vec<String>,
    reps: HashMap<RepresentationKey, Representation>,
}

#[derive(Debug)]
struct Inner {
    resources: HashMap<ResourceKey, Resource>,
    ids: HashMap<Uuid, (ResourceKey, RepresentationKey)>,
    in_use: u64,
    max: u64,
    sample: usize,
    origin_changed_at: SystemTime,
}

/// A concurrent map of resources to representations with bounded memory.
///
/// The store never fails: unknown keys miss, purging an absent resource is a
/// no-op, and eviction silently reclaims space when the byte budget is
/// exceeded. A budget of zero disables eviction entirely.
#[derive(Debug)]
pub struct Store {
    inner: RwLock<Inner>,
}

impl Store {
    /// Creates a store with the given byte budget (`0` = unbounded) and
    /// eviction sample width.
    pub fn new(max: u64, sample: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                resources: HashMap::new(),
                ids: HashMap::new(),
                in_use: 0,
                max,
                sample,
                origin_changed_at: SystemTime::UNIX_EPOCH,
            }),
        }
    }

    /// Looks up the representation matching the request, if any.
    ///
    /// Hits stamp the last-used time and return a clone; the stored entry
    /// stays untouched otherwise.
    pub fn get(&self, parts: &Parts) -> Option<Representation> {
        let inner = self.inner.read();
        let resource = inner.resources.get(&ResourceKey::of(parts))?;
        let key = RepresentationKey {
            method: parts.method.clone(),
            variant: variant_key(&resource.fields, &parts.headers),
        };
        let rep = resource.reps.get(&key)?;
        rep.touch(SystemTime::now());
        Some(rep.clone())
    }

    /// Looks a representation up directly by its identity.
    pub fn get_by_id(&self, id: &Uuid) -> Option<Representation> {
        let inner = self.inner.read();
        let (resource_key, key) = inner.ids.get(id)?;
        inner.resources.get(resource_key)?.reps.get(key).cloned()
    }

    /// Admits a representation under the request's keys, replacing any prior
    /// entry, then enforces the byte budget.
    pub fn set(&self, parts: &Parts, mut rep: Representation) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let resource_key = ResourceKey::of(parts);
        let resource = inner.resources.entry(resource_key.clone()).or_default();
        if resource.reps.is_empty() && resource.fields.is_empty() && !resource.unique {
            let fields: Vec<String> = get_all_comma(rep.headers.get_all("vary"))
                .map(|f| f.to_ascii_lowercase())
                .collect();
            if fields.iter().any(|f| f == "*") {
                // With `Vary: *` only a request identical to the admitting
                // one may match, so the variant covers every header it sent.
                resource.unique = true;
                let mut all: Vec<String> =
                    parts.headers.keys().map(|name| name.as_str().to_string()).collect();
                all.sort_unstable();
                all.dedup();
                resource.fields = all;
            } else {
                resource.fields = fields;
            }
        }

        let key = RepresentationKey {
            method: parts.method.clone(),
            variant: variant_key(&resource.fields, &parts.headers),
        };
        rep.touch(SystemTime::now());
        rep.keys = Some((resource_key.clone(), key.clone()));
        let added = rep.body_len();
        let id = rep.id;
        if let Some(old) = resource.reps.insert(key.clone(), rep) {
            inner.in_use = inner.in_use.saturating_sub(old.body_len());
            inner.ids.remove(&old.id);
        }
        inner.ids.insert(id, (resource_key, key));
        inner.in_use += added;

        while inner.max > 0 && inner.in_use > inner.max {
            if !evict_one(inner) {
                break;
            }
        }
    }

    /// Removes the whole resource for the request's key, returning the
    /// removed representations so callers can enumerate them.
    pub fn purge(&self, parts: &Parts) -> Option<Vec<Representation>> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let resource = inner.resources.remove(&ResourceKey::of(parts))?;
        let mut removed = Vec::with_capacity(resource.reps.len());
        for (_, rep) in resource.reps {
            inner.in_use = inner.in_use.saturating_sub(rep.body_len());
            inner.ids.remove(&rep.id);
            removed.push(rep);
        }
        Some(removed)
    }

    /// The instant of the last observed destructive upstream change.
    pub fn origin_changed_at(&self) -> SystemTime {
        self.inner.read().origin_changed_at
    }

    /// Records a destructive upstream change. Cached representations that
    /// predate it will be revalidated rather than served, without being
    /// erased.
    pub fn mark_origin_changed(&self, at: SystemTime) {
        let mut inner = self.inner.write();
        if at > inner.origin_changed_at {
            inner.origin_changed_at = at;
        }
    }

    /// Bytes currently accounted against the budget.
    pub fn in_use(&self) -> u64 {
        self.inner.read().in_use
    }
}

// One eviction pass: sample up to `sample` entries in map iteration order
// and drop the least recently used of them. Returns false when there is
// nothing left to evict.
fn evict_one(inner: &mut Inner) -> bool {
    let victim = inner
        .ids
        .iter()
        .take(inner.sample.max(1))
        .filter_map(|(id, (resource_key, key))| {
            let rep = inner.resources.get(resource_key)?.reps.get(key)?;
            Some((*id, rep.last_used()))
        })
        .min_by_key(|(_, last_used)| *last_used)
        .map(|(id, _)| id);
    let Some(id) = victim else { return false };
    let Some((resource_key, key)) = inner.ids.remove(&id) else { return false };
    let Some(resource) = inner.resources.get_mut(&resource_key) else { return false };
    if let Some(rep) = resource.reps.remove(&key) {
        inner.in_use = inner.in_use.saturating_sub(rep.body_len());
        debug!(bytes = rep.body_len(), in_use = inner.in_use, "evicted representation");
    }
    if resource.reps.is_empty() {
        inner.resources.remove(&resource_key);
    }
    true
}
