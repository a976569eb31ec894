use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// 401/403 while a credential was held
    #[error("Permission denied!")]
    PermissionDenied,

    /// 401/403 while logged out
    #[error("Authentication failed. Please login.")]
    AuthenticationRequired,

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Deserialization failed: {0}")]
    Decode(String),

    #[error("{message}")]
    Server { status: u16, message: String },

    #[error("Could not store credentials: {0}")]
    SecretStore(String),

    #[error("No push device token registered")]
    MissingDeviceToken,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Build the error for a non-2xx response that is not an auth failure.
    /// Prefers the server's `detail` message when the body is JSON.
    pub fn from_status(status: u16, body: &[u8]) -> Self {
        let message = match serde_json::from_slice::<Value>(body) {
            Ok(json) => json
                .get("detail")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string(),
            Err(_) => format!(
                "Status {}: {}",
                status,
                Self::truncate_body(&String::from_utf8_lossy(body))
            ),
        };
        ApiError::Server { status, message }
    }
}
