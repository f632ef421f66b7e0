use thiserror::Error;

/// A `Result` typedef to use with the [`Error`] type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the proxy pipeline.
///
/// The cache store itself never fails; everything here comes from parsing
/// inbound messages or from talking to the upstream.
#[derive(Error, Debug)]
pub enum Error {
    /// Error from http
    #[error(transparent)]
    Http(#[from] http::Error),
    /// There was an error building an HTTP header value
    #[error(transparent)]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
    /// There was an error parsing a URL
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
    /// The upstream transport failed before a response could be read
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
    /// A message body could not be buffered
    #[error("error reading message body")]
    BodyRead,
    /// The request lacks the headers needed to reconstruct its URL
    #[error("error parsing header value")]
    BadHeader,
    /// The configured upstream URL has no host to forward to
    #[error("upstream URL must include an authority")]
    BadUpstream,
}
