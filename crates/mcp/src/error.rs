use std::time::Duration;

use manifold_common::FromMessage;

/// Failure taxonomy for transport and manager operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Peer unreachable: spawn failure, refused connection, dropped pipe.
    #[error("connection error: {0}")]
    Connection(String),
    /// A configured time bound was exceeded.
    #[error("timed out: {0}")]
    Timeout(String),
    /// Malformed reply or incompatible protocol version.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Credential failure (e.g. HTTP 401). Retryable once credentials change.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// No server owns the requested tool.
    #[error("No server found for tool: {0}")]
    Routing(String),
    /// Catch-all for everything the other kinds don't cover.
    #[error("{0}")]
    Unexpected(String),
}

impl Error {
    #[must_use]
    pub(crate) fn timed_out(method: &str, timeout: Duration) -> Self {
        Self::Timeout(format!("'{method}' exceeded {timeout:?}"))
    }

    /// Whether this failure indicates the underlying connection is gone.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Connection(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            Self::Connection(e.to_string())
        } else if e.is_decode() {
            Self::Protocol(e.to_string())
        } else {
            Self::Unexpected(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Unexpected(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

manifold_common::impl_context!();
