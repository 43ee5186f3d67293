use thiserror::Error;

use crate::models::Side;
use crate::proxy::target::TargetError;

/// Unified error type for the Zeoxy proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    // Target resolution errors
    #[error("Invalid target: {0}")]
    InvalidTarget(#[from] TargetError),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Request head exceeds {limit} bytes")]
    RequestHeadTooLarge { limit: usize },

    // Socket errors
    #[error("Upstream connect to {target} failed: {source}")]
    UpstreamConnect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Upstream I/O error: {0}")]
    UpstreamIo(#[source] std::io::Error),

    #[error("Client I/O error: {0}")]
    ClientIo(#[source] std::io::Error),

    // Listener lifecycle errors
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server is not running")]
    NotRunning,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Zeoxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Wrap a socket error with the side it happened on
    pub fn io(side: Side, err: std::io::Error) -> Self {
        match side {
            Side::Client => ProxyError::ClientIo(err),
            Side::Upstream => ProxyError::UpstreamIo(err),
        }
    }

    /// The connection side a socket-level error originated from
    pub fn side(&self) -> Option<Side> {
        match self {
            ProxyError::UpstreamConnect { .. } | ProxyError::UpstreamIo(_) => Some(Side::Upstream),
            ProxyError::ClientIo(_) => Some(Side::Client),
            _ => None,
        }
    }
}

// Convert from hyper errors
impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}
