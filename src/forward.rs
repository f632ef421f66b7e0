//! The forward stage: the bottom of the pipeline, talking to the upstream.
//!
//! Deliberately thin. It rewrites the request onto the configured upstream
//! authority, drops hop-by-hop fields, and buffers the upstream body so the
//! stages above can treat responses as values. Retry and timeout policy is
//! left to the transport.

use async_trait::async_trait;
use bytes::Bytes;
use http::uri::{Authority, Scheme};
use http::{header, HeaderValue, Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::handler::Handler;
use crate::headers::strip_hop_by_hop;
use crate::{Error, Result};

/// Forwards requests to a single upstream origin.
pub struct ForwardHandler {
    client: Client<HttpConnector, Full<Bytes>>,
    scheme: Scheme,
    authority: Authority,
}

impl ForwardHandler {
    /// Creates a forwarder for the given upstream URL, e.g.
    /// `http://127.0.0.1:3000`.
    pub fn new(upstream: &Uri) -> Result<Self> {
        let authority = upstream.authority().cloned().ok_or(Error::BadUpstream)?;
        let scheme = upstream.scheme().cloned().unwrap_or(Scheme::HTTP);
        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            scheme,
            authority,
        })
    }
}

#[async_trait]
impl Handler for ForwardHandler {
    async fn handle(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
        let (mut parts, body) = req.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        let path_and_query =
            parts.uri.path_and_query().map(|paq| paq.as_str()).unwrap_or("/");
        let uri = Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()?;
        debug!(method = %parts.method, %uri, "forwarding");

        let mut forward = Request::builder()
            .method(parts.method)
            .uri(uri)
            .body(Full::new(body))?;
        *forward.headers_mut() = parts.headers;
        forward
            .headers_mut()
            .insert(header::HOST, HeaderValue::from_str(self.authority.as_str())?);

        let response = self.client.request(forward).await?;
        let (res_parts, res_body) = response.into_parts();
        let buffered =
            res_body.collect().await.map_err(|_| Error::BodyRead)?.to_bytes();
        Ok(Response::from_parts(res_parts, buffered))
    }
}
