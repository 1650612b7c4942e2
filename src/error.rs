use std::net::SocketAddr;
use std::path::PathBuf;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur while serving proxy clients.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The listening socket could not be created or bound.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// `start` was called while the accept loop is already running.
    #[error("Proxy is already running")]
    AlreadyRunning,

    /// The request line could not be parsed.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// The request target (URL or host:port) could not be parsed.
    #[error("Malformed target {target}: {reason}")]
    MalformedTarget { target: String, reason: String },

    /// Only plain `http://` URLs are forwarded.
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// Connecting to the origin or tunnel target failed.
    #[error("Connection to {target} failed: {source}")]
    OriginUnreachable {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Connecting to the origin did not finish within the configured timeout.
    #[error("Connection to {target} timed out")]
    OriginTimeout { target: String },

    /// The origin sent something that is not an HTTP/1.x response head.
    #[error("Invalid origin response: {0}")]
    InvalidResponse(String),

    /// Writing the report file failed.
    #[error("Could not write report to {path:?}: {source}")]
    Report {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn malformed_target(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedTarget {
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}
