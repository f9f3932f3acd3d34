use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::codec::CodecError;

/// Boxed error used for underlying I/O, TLS and hyper failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Construction-time failures.
///
/// Every variant is fatal: a transport that fails to build must not be
/// handed to the registry protocol layer, and nothing here is retried.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// The trust store file could not be opened or read
    #[error("SSL configuration issue: trust store '{path}' could not be read: {source}")]
    TrustStoreUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The trust store file was read but holds no usable certificates
    #[error("SSL configuration issue: trust store '{path}' is invalid: {reason}")]
    TrustStoreInvalid { path: PathBuf, reason: String },

    /// A password was given for a trust store that cannot be unlocked with one
    #[error(
        "SSL configuration issue: trust store '{path}' is an unencrypted PEM bundle and cannot be opened with a password"
    )]
    TrustStorePassword { path: PathBuf },

    /// TLS machinery (crypto provider, protocol versions, verifier) failed to initialize
    #[error("SSL configuration issue: {0}")]
    Tls(#[source] BoxError),

    /// A configuration value is out of range or inconsistent
    #[error("invalid transport setting '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// Proxy host/port could not be turned into a proxy URI
    #[error("invalid proxy configuration: {0}")]
    InvalidProxy(String),

    /// Encoder or decoder id is not registered
    #[error("unknown codec '{0}'")]
    UnknownCodec(String),

    /// A fixed header (user agent, identity, extra header) is not a valid header value
    #[error("invalid value for header '{name}': {source}")]
    InvalidHeader {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },

    /// Settings document could not be deserialized
    #[error("invalid transport settings: {0}")]
    Settings(#[source] serde_json::Error),
}

/// Per-request failures.
///
/// These are recoverable by the caller: retry and failover belong to the
/// registry protocol layer, this layer only makes the failure kinds
/// distinguishable.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// TCP connect, DNS resolution or HTTP handshake failed
    #[error("connect failed: {0}")]
    Connect(#[source] BoxError),

    /// Establishing a connection took longer than the connect timeout
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// No response (or body) within the read timeout
    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// Waiting for a free pooled connection took longer than the connect timeout
    #[error("timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(Duration),

    /// The connection pool has been shut down
    #[error("connection pool is shut down")]
    PoolShutdown,

    /// The proxy refused to open a tunnel to the target
    #[error("proxy refused tunnel with status {status}")]
    ProxyTunnel { status: http::StatusCode },

    /// TLS handshake or server name failure
    #[error("TLS error: {0}")]
    Tls(#[source] BoxError),

    /// Connection reset, closed mid-flight or any other wire failure
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    /// Response body exceeded the configured limit
    #[error("response body too large: limit {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// Endpoint or request URL could not be used
    #[error("invalid URL '{url}': {reason}")]
    InvalidUri { url: String, reason: String },

    /// Header name supplied for a request is not valid
    #[error("invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Header value supplied for a request is not valid
    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Request could not be assembled
    #[error("failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Entity encoding or decoding failed
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Query string encoding failed
    #[error("query encoding failed: {0}")]
    QueryEncode(#[from] serde_urlencoded::ser::Error),
}

impl TransportError {
    /// Whether the failure happened on the wire rather than in request assembly.
    ///
    /// The protocol layer uses this to decide whether trying another endpoint
    /// makes sense.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connect(_)
                | Self::ConnectTimeout(_)
                | Self::ReadTimeout(_)
                | Self::PoolTimeout(_)
                | Self::PoolShutdown
                | Self::ProxyTunnel { .. }
                | Self::Tls(_)
                | Self::Transport(_)
        )
    }

    /// Whether the failure is a timeout of any kind.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout(_) | Self::ReadTimeout(_) | Self::PoolTimeout(_)
        )
    }

    /// Stable short label for metrics and logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::ReadTimeout(_) => "read_timeout",
            Self::PoolTimeout(_) => "pool_timeout",
            Self::PoolShutdown => "pool_shutdown",
            Self::ProxyTunnel { .. } => "proxy_tunnel",
            Self::Tls(_) => "tls",
            Self::Transport(_) => "transport",
            Self::BodyTooLarge { .. } => "body_too_large",
            Self::InvalidUri { .. } => "invalid_uri",
            Self::InvalidHeaderName(_) | Self::InvalidHeaderValue(_) | Self::RequestBuild(_) => {
                "request_build"
            }
            Self::Codec(_) => "codec",
            Self::QueryEncode(_) => "query_encode",
        }
    }
}

impl From<hyper::Error> for TransportError {
    fn from(err: hyper::Error) -> Self {
        TransportError::Transport(Box::new(err))
    }
}
