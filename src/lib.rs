#![forbid(unsafe_code, future_incompatible)]
#![warn(missing_docs)]
//! A caching, embedding reverse proxy for HAL+JSON APIs.
//!
//! halcache sits between clients and a hypermedia JSON API and accelerates
//! it with two coupled mechanisms:
//!
//! - a shared in-memory HTTP cache that follows RFC 7234 freshness and
//!   validation rules, with `Vary`-aware variants, explicit `PURGE`, and
//!   sampled-LRU eviction under a byte budget;
//! - an embedding engine that, when asked via `?with=` or a `With:` header,
//!   walks `_links` in a HAL+JSON document, fetches the linked resources in
//!   parallel through the same cache, and splices them into `_embedded`
//!   while merging their `Cache-Control` policies into the outer response.
//!
//! The request path is a chain of [`Handler`] stages:
//!
//! ```text
//! client -> EmbedHandler -> CacheHandler -> ForwardHandler -> upstream
//! ```
//!
//! ## Example
//!
//! Given `/movies/1` linking to two roles which each link to an actor, a
//! single request
//!
//! ```text
//! GET /movies/1?with=roles.actor
//! ```
//!
//! answers with the movie document carrying `_embedded.roles`, each role
//! carrying `_embedded.actor`, a weak `ETag` over the assembled body, and a
//! `Warning: 214` marking the transformation. Sub-resources already in the
//! cache are not fetched again.
//!
//! ## Assembling a pipeline
//!
//! ```no_run
//! use std::sync::Arc;
//! use halcache::{pipeline, Store};
//!
//! # fn main() -> halcache::Result<()> {
//! let store = Arc::new(Store::new(64 * 1024 * 1024, 8));
//! let handler = pipeline(store, &"http://127.0.0.1:3000".parse().unwrap())?;
//! # Ok(())
//! # }
//! ```

mod cache;
pub mod cache_control;
mod embed;
mod error;
mod forward;
pub mod freshness;
mod handler;
mod headers;
mod representation;
mod store;

use std::sync::Arc;

use http::Uri;

pub use cache::{CacheHandler, HitOrMiss, XCACHE, XCACHELOOKUP};
pub use cache_control::CacheControl;
pub use embed::{EmbedHandler, Specifier};
pub use error::{Error, Result};
pub use forward::ForwardHandler;
pub use freshness::Freshness;
pub use handler::{Handler, SharedHandler};
pub use representation::Representation;
pub use store::{RepresentationKey, ResourceKey, Store};

/// Builds the standard three-stage pipeline over a store and an upstream.
pub fn pipeline(store: Arc<Store>, upstream: &Uri) -> Result<SharedHandler> {
    let forward: SharedHandler = Arc::new(ForwardHandler::new(upstream)?);
    let cache: SharedHandler = Arc::new(CacheHandler::new(store, forward));
    Ok(Arc::new(EmbedHandler::new(cache)))
}
