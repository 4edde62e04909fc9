use thiserror::Error;

/// Failure of one call made through [`crate::RequestClient`].
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    /// No response arrived at all.
    #[error("server unreachable at {url}: {guidance}")]
    Unreachable { url: String, guidance: String },
    #[error("request to {url} timed out after {seconds}s")]
    Timeout { url: String, seconds: u64 },
    /// The session could not be recovered; the caller must sign in again.
    #[error("session expired: {0}")]
    Unauthorized(String),
    #[error("{status_code}: {message}")]
    Api { status_code: u16, message: String },
    #[error("malformed response envelope from {url}: {reason}")]
    MalformedEnvelope { url: String, reason: String },
    #[error("session storage failure: {0}")]
    Storage(String),
}

impl RequestError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status_code, .. } => Some(*status_code),
            Self::Unauthorized(_) => Some(401),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("not connected")]
    NotConnected,
    #[error("channel for {0} is closed")]
    Closed(String),
    #[error("failed to encode channel event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid channel url: {0}")]
    InvalidUrl(String),
    #[error("failed to load message history: {0}")]
    History(#[from] RequestError),
}
