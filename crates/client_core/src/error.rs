use shared::{domain::ConversationId, error::ApiError};
use thiserror::Error;

/// Failure of a REST call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RestError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("server rejected request with status {status}: {error}")]
    Server { status: u16, error: ApiError },
    #[error("unexpected http status {0}")]
    Status(u16),
    #[error("request timed out")]
    Timeout,
    #[error("request failed: {0}")]
    Transport(String),
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("upload response did not include a file url")]
    MissingUploadUrl,
}

impl From<reqwest::Error> for RestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RestError::Timeout
        } else if err.is_decode() {
            RestError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            RestError::Status(status.as_u16())
        } else {
            RestError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("attachment upload failed: {0}")]
    Upload(#[source] RestError),
    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid websocket url '{0}'")]
    InvalidUrl(String),
    #[error("websocket connect failed: {0}")]
    Connect(String),
}
