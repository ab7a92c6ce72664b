use crate::models::chat::ConversationId;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Non-2xx answer. `message` is the server's `{error}` field or the status text.
    #[error("{message}")]
    Api {
        status: u16,
        message: String,
    },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid response payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("stream interrupted: {0}")]
    Stream(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("conversation {0} not found")]
    ConversationNotFound(ConversationId),

    #[error("no auth token available")]
    MissingToken,

    #[error("malformed `{kind}` event: {source}")]
    MalformedEvent {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("a response is already streaming")]
    SendInFlight,
}

impl ChatError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        ChatError::Api { status, message: message.into() }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ChatError::Api { status, .. } => Some(*status),
            ChatError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
