use thiserror::Error;

/// Failures talking to an agent endpoint.
#[derive(Debug, Error)]
pub enum AgentApiError {
    #[error("agent API returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("agent API transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("conversation was created without a chatId")]
    MissingChatId,

    #[error("failed to decode agent reply: {0}")]
    Decode(String),

    #[error("invalid agent endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("event stream failed: {0}")]
    Stream(String),

    #[error("event stream idle for {0:?}")]
    IdleTimeout(std::time::Duration),

    #[error("no API key configured")]
    MissingApiKey,

    #[error("request cancelled by session teardown")]
    Cancelled,
}

impl AgentApiError {
    /// Rate limiting and transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentApiError::Http { status, .. } => *status == 429,
            AgentApiError::Transport(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_limits_are_retryable_among_http_errors() {
        let limited = AgentApiError::Http {
            status: 429,
            body: String::new(),
        };
        let server = AgentApiError::Http {
            status: 500,
            body: "boom".to_string(),
        };
        assert!(limited.is_retryable());
        assert!(!server.is_retryable());
        assert!(!AgentApiError::MissingChatId.is_retryable());
        assert!(!AgentApiError::Cancelled.is_retryable());
    }

    #[test]
    fn http_error_message_includes_status_and_body() {
        let error = AgentApiError::Http {
            status: 401,
            body: "bad key".to_string(),
        };
        assert_eq!(error.to_string(), "agent API returned HTTP 401: bad key");
    }
}
