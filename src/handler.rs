//! The request-processing contract shared by every pipeline stage.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};

use crate::Result;

/// One stage of the proxy pipeline.
///
/// Stages hold their `next` stage explicitly and delegate to it; the chain
/// is plain composition, built once at startup:
///
/// ```text
/// client -> EmbedHandler -> CacheHandler -> ForwardHandler -> upstream
/// ```
///
/// Requests and responses are fully buffered, so a stage may inspect and
/// rewrite bodies without streaming concerns. Errors flow back up the chain;
/// the server edge turns any that survive into a 502.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Processes a request, possibly delegating to the next stage.
    async fn handle(&self, req: Request<Bytes>) -> Result<Response<Bytes>>;
}

/// A shared, dynamically dispatched stage, used as the `next` link.
pub type SharedHandler = Arc<dyn Handler>;

#[async_trait]
impl<T: Handler + ?Sized> Handler for Arc<T> {
    async fn handle(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
        (**self).handle(req).await
    }
}
