use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database error: {0}")]
    MySql(#[from] sqlx::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No available accounts")]
    NoEligibleAccount,

    #[error("Token refresh failed for account '{account_id}': {reason}")]
    TokenRefresh { account_id: String, reason: String },

    #[error("Upstream rate limit (429): {0}")]
    UpstreamRateLimit(String),

    #[error("Upstream error {status}: {body}")]
    UpstreamClient { status: u16, body: String },

    #[error("Upstream server error: {0}")]
    UpstreamServer(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Device authorization timed out")]
    AuthTimeout,

    #[error("Account error: {0}")]
    Account(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProxyError {
    /// HTTP status the client should see for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::NoEligibleAccount => 503,
            ProxyError::TokenRefresh { .. } => 502,
            ProxyError::UpstreamRateLimit(_) => 429,
            ProxyError::UpstreamClient { status, .. } => *status,
            ProxyError::UpstreamServer(_) | ProxyError::Network(_) => 502,
            ProxyError::InvalidRequest(_) => 400,
            ProxyError::AuthTimeout => 408,
            ProxyError::Account(_) => 404,
            _ => 500,
        }
    }

    /// Claude-style error type string for the JSON error body.
    pub fn claude_error_type(&self) -> &'static str {
        match self {
            ProxyError::NoEligibleAccount => "overloaded_error",
            ProxyError::UpstreamRateLimit(_) => "rate_limit_error",
            ProxyError::InvalidRequest(_) => "invalid_request_error",
            ProxyError::UpstreamClient { status: 401, .. } => "authentication_error",
            ProxyError::UpstreamClient { status: 403, .. } => "permission_error",
            ProxyError::UpstreamClient { status: 404, .. } => "not_found_error",
            ProxyError::Account(_) => "not_found_error",
            _ => "api_error",
        }
    }

    pub fn to_claude_body(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "error",
            "error": {
                "type": self.claude_error_type(),
                "message": self.to_string(),
            }
        })
    }
}

impl Serialize for ProxyError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_kind() {
        assert_eq!(ProxyError::NoEligibleAccount.status_code(), 503);
        assert_eq!(ProxyError::AuthTimeout.status_code(), 408);
        assert_eq!(
            ProxyError::UpstreamRateLimit("quota".into()).status_code(),
            429
        );
        assert_eq!(ProxyError::InvalidRequest("bad".into()).status_code(), 400);
    }

    #[test]
    fn claude_body_carries_error_type() {
        let body = ProxyError::UpstreamRateLimit("slow down".into()).to_claude_body();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "rate_limit_error");
    }
}
