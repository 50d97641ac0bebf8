/// Typed errors for calls to the upstream location service.
///
/// The upstream client never retries; callers decide what a failure costs.
#[derive(Clone, Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("rejected by upstream: {0}")]
    Rejected(String),
    #[error("upstream status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl UpstreamError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(body),
            _ => Self::Status { status, body },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Short classification string for logs and counters.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Rejected(_) => "rejected",
            Self::Status { .. } => "status",
            Self::Network(_) => "network",
            Self::Decode(_) => "decode",
        }
    }
}
