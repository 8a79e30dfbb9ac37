use crate::config::ConfigError;

/// Error type shared by the transport and session layers.
///
/// Malformed stream lines are never represented here: they are skipped by the
/// event parser and only logged.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Stream ended before a terminal event was received")]
    PrematureEnd,
    #[error("Invalid session state: {0}")]
    InvalidState(String),
}

/// Broad failure category, used for log fields and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Authentication,
    RateLimit,
    ServerError,
    Network,
    Truncated,
    Internal,
}

/// Map an upstream HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Authentication,
        429 => ErrorCategory::RateLimit,
        500..=599 => ErrorCategory::ServerError,
        _ => ErrorCategory::Internal,
    }
}

impl StreamError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            StreamError::Config(_) => ErrorCategory::Configuration,
            StreamError::Transport(_) => ErrorCategory::Network,
            StreamError::Upstream { status, .. } => category_from_upstream_status(*status),
            StreamError::PrematureEnd => ErrorCategory::Truncated,
            StreamError::InvalidState(_) => ErrorCategory::Internal,
        }
    }
}
