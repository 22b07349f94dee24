use serde::{Deserialize, Serialize};

/// Error body returned by the backend. Depending on the route the text sits
/// under `message`, `detail` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(alias = "detail", alias = "error")]
    pub message: String,
}

impl ApiError {
    /// Extracts a readable message from a raw response body.
    pub fn message_from_body(body: &str) -> String {
        match serde_json::from_str::<ApiError>(body) {
            Ok(parsed) => parsed.message,
            Err(_) => body.trim().to_string(),
        }
    }
}
