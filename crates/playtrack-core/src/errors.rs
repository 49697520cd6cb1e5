/// Typed error hierarchy for the event-feed client.
/// Classifies errors as retryable (reconnect with backoff) or fatal.
#[derive(Clone, Debug, thiserror::Error)]
pub enum FeedError {
    // Retryable — the connect loop backs off and tries again
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("feed disconnected: {0}")]
    Disconnected(String),
    #[error("server error {status}: {body}")]
    Http { status: u16, body: String },

    // Fatal — reconnecting cannot help
    #[error("authentication rejected: {0}")]
    AuthenticationFailed(String),
    #[error("protocol error: {0}")]
    Protocol(String),

    // Operational
    #[error("parse error: {0}")]
    Parse(String),
    #[error("cancelled")]
    Cancelled,
}

impl FeedError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed(_) | Self::Disconnected(_) | Self::Http { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthenticationFailed(_) | Self::Protocol(_))
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConnectFailed(_) => "connect_failed",
            Self::Disconnected(_) => "disconnected",
            Self::Http { .. } => "http_error",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::Protocol(_) => "protocol_error",
            Self::Parse(_) => "parse_error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status from the media server's REST surface.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            _ => Self::Http { status, body },
        }
    }
}
