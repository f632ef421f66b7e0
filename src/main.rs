//! The halcache proxy binary.
//!
//! Configuration comes from the environment:
//!
//! - `HALCACHE_LISTEN`: listen address, default `127.0.0.1:8080`
//! - `HALCACHE_UPSTREAM`: upstream origin, default `http://127.0.0.1:3000`
//! - `HALCACHE_MAX_BYTES`: cache byte budget, `0` for unbounded
//! - `HALCACHE_SAMPLE`: eviction sample width
//! - `HALCACHE_LOG`: tracing filter, default `info`

use std::convert::Infallible;
use std::env;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use halcache::{pipeline, SharedHandler, Store};

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("HALCACHE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen = env_or("HALCACHE_LISTEN", "127.0.0.1:8080");
    let upstream: Uri = env_or("HALCACHE_UPSTREAM", "http://127.0.0.1:3000").parse()?;
    let max_bytes: u64 = env_or("HALCACHE_MAX_BYTES", "67108864").parse()?;
    let sample: usize = env_or("HALCACHE_SAMPLE", "8").parse()?;

    let store = Arc::new(Store::new(max_bytes, sample));
    let handler = pipeline(store, &upstream)?;

    let listener = TcpListener::bind(&listen).await?;
    info!(%listen, %upstream, max_bytes, sample, "halcache listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let handler = handler.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(serve(handler, req).await) }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!(%peer, error = %err, "connection error");
            }
        });
    }
}

// Buffers the inbound body, runs the pipeline, and turns surviving errors
// into a 502.
async fn serve(handler: SharedHandler, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(error = %err, "failed to read request body");
            return status_response(StatusCode::BAD_REQUEST);
        }
    };

    match handler.handle(Request::from_parts(parts, body)).await {
        Ok(response) => response.map(Full::new),
        Err(err) => {
            warn!(error = %err, "pipeline error");
            status_response(StatusCode::BAD_GATEWAY)
        }
    }
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}
