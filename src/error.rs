use crate::secrets::SecretError;
use thiserror::Error;

/// Problems with the loaded configuration. Always fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("url: {url}, error: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("{url}: scheme [{scheme}] not supported (http or https only)")]
    UnsupportedScheme { url: String, scheme: String },

    #[error("{0}: url has no host")]
    MissingHost(String),

    #[error("host {host} is declared as both {first} and {second}")]
    ConflictingScheme {
        host: String,
        first: String,
        second: String,
    },

    #[error("at least one hop is required")]
    NoHops,

    #[error("invalid hop {index}: {reason}")]
    InvalidHop { index: usize, reason: String },
}

/// Failures while building or using the ssh tunnel.
#[derive(Error, Debug, Clone)]
pub enum TunnelError {
    #[error("hop {index} ({address}): dial failed: {reason}")]
    Dial {
        index: usize,
        address: String,
        reason: String,
    },

    #[error("hop {index} ({address}): ssh handshake failed: {reason}")]
    Handshake {
        index: usize,
        address: String,
        reason: String,
    },

    #[error("hop {index} ({address}): authentication failed for user {user}")]
    Auth {
        index: usize,
        address: String,
        user: String,
    },

    #[error("hop {index}: {reason}")]
    Secret { index: usize, reason: String },

    #[error("tunnel is not available: {0}")]
    Unavailable(String),

    #[error("tunnel dial {address} failed: {reason}")]
    Channel { address: String, reason: String },
}

impl TunnelError {
    pub fn secret(index: usize, err: SecretError) -> Self {
        TunnelError::Secret {
            index,
            reason: err.to_string(),
        }
    }
}

/// Per request failures. Reported to the caller as HTTP 500.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("request has no host")]
    MissingHost,

    #[error("unknown remote host: {0}")]
    UnknownHost(String),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("tls handshake with {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid server name {0}")]
    ServerName(String),

    #[error("http handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("roundtrip failed: {0}")]
    RoundTrip(#[source] hyper::Error),

    #[error("reading request body failed: {0}")]
    Body(#[source] hyper::Error),

    #[error("reading response body failed: {0}")]
    ResponseBody(#[source] hyper::Error),

    #[error("invalid request uri: {0}")]
    Uri(#[from] http::Error),

    #[error("upstream did not answer within {0:?}")]
    Timeout(std::time::Duration),
}

/// Failures while rendering a trace dump. Logged, never propagated.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("format error: {0}")]
    Fmt(#[from] std::fmt::Error),
}
