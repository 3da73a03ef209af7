//! Error taxonomy for the proxy core.
//!
//! Callers decide what happens to a session by matching on the variant:
//! validation and not-found failures leave it untouched, timeouts keep it
//! alive, and execution failures evict it.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the file store, sessions and the session manager.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Bad input: unsupported language, too many files, oversized upload,
    /// session at capacity.
    #[error("{0}")]
    Validation(String),

    /// The run exceeded its effective timeout.
    #[error("execution timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// A referenced file or session does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The session was closed while the caller still held a reference to it.
    #[error("session '{0}' is closed")]
    Closed(String),

    /// Anything else that went wrong while executing. The session that
    /// produced it must not be reused.
    #[error("execution failed: {0:#}")]
    Execution(anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
