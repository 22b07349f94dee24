use shared::domain::ConversationId;
use thiserror::Error;

use crate::{selection::SelectionError, session::SessionError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not authenticated; sign in again")]
    Unauthorized,
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid api base url: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error("session store failed: {0}")]
    Session(#[from] SessionError),
    #[error("load of conversation {0} was superseded by a newer request")]
    Superseded(ConversationId),
    #[error("message must not be empty")]
    EmptyMessage,
}

impl ClientError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}
