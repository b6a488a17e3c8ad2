use thiserror::Error;

/// Maximum number of error body characters carried into an error message.
const MAX_ERROR_CHARS: usize = 200;

/// Message the API returns when the refresh token itself is no longer valid.
pub const REFRESH_EXPIRED_MESSAGE: &str = "Refresh token has expired";

// Failure of a single gateway call
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Request failed ({status}): {message}")]
    Http { status: u16, message: String },
    #[error("Response error: {0}")]
    Parse(String),
    #[error("Request error: {0}")]
    Serialization(String),
    #[error("Invalid refresh response: {0}")]
    InvalidRefreshResponse(String),
}

impl RequestError {
    /// Upstream HTTP status, if the failure came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    /// True for the 401 the refresh endpoint returns once the refresh token is dead.
    pub fn is_refresh_expired(&self) -> bool {
        match self {
            RequestError::Http { status: 401, message } => {
                message.contains(REFRESH_EXPIRED_MESSAGE)
            }
            _ => false,
        }
    }

    /// Builds an `Http` error from a raw response body.
    ///
    /// The API reports failures as `{"message": "..."}`; anything else is
    /// trimmed and truncated so it can be shown to a user.
    pub fn from_response(status: u16, body: &str) -> Self {
        RequestError::Http {
            status,
            message: error_message(body),
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RequestError::Timeout("Request timed out. Please try again.".to_string())
        } else if err.is_builder() {
            RequestError::Serialization(format!("Failed to build request: {err}"))
        } else {
            RequestError::Network(format!("Unable to reach the server: {err}"))
        }
    }
}

fn error_message(body: &str) -> String {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(serde_json::Value::String(message)) = map.get("message") {
            return sanitize(message);
        }
    }
    sanitize(body)
}

fn sanitize(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "Request failed.".to_string()
    } else {
        trimmed.chars().take(MAX_ERROR_CHARS).collect()
    }
}

/// Rejected limiter configuration.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LimitConfigError {
    #[error("max_attempts must be positive")]
    ZeroAttempts,
    #[error("window must be positive")]
    ZeroWindow,
}

/// Failure of a higher-level auth flow.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AuthFlowError {
    #[error("Too many attempts. Try again in {} seconds.", .retry_after_ms.div_ceil(1000))]
    RateLimited { retry_after_ms: u64 },
    #[error("Not signed in")]
    NotAuthenticated,
    #[error(transparent)]
    Request(#[from] RequestError),
}
