//! Error types for the login flow.
//!
//! Every variant is terminal for the flow that produced it. Nothing here is
//! retried; the user re-runs `login` instead.

use std::time::Duration;

/// Errors from the authorization flow and the local stores.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Missing or invalid client id, secret, redirect URI or endpoint.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The provider redirected back with an `error` parameter.
    #[error("authorization denied: {detail}")]
    Denied { detail: String },

    /// No redirect arrived within the wait window.
    #[error("timed out after {}s waiting for the authorization redirect", .0.as_secs())]
    Timeout(Duration),

    /// The token endpoint call failed or returned something unusable.
    #[error("token exchange failed: {message}")]
    Exchange {
        /// HTTP status, when a response was received.
        status: Option<u16>,
        /// Raw response body, when one was read.
        body: Option<String>,
        message: String,
    },

    #[error("persistence error: {0}")]
    Persistence(String),

    /// The callback listener could not bind or died before a redirect.
    #[error("callback listener error: {0}")]
    Listener(String),
}

impl AuthError {
    pub(crate) fn exchange(message: impl Into<String>) -> Self {
        Self::Exchange {
            status: None,
            body: None,
            message: message.into(),
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_reports_seconds() {
        let err = AuthError::Timeout(Duration::from_secs(300));
        assert_eq!(
            err.to_string(),
            "timed out after 300s waiting for the authorization redirect"
        );
    }

    #[test]
    fn exchange_helper_has_no_status() {
        match AuthError::exchange("connection refused") {
            AuthError::Exchange { status, body, .. } => {
                assert!(status.is_none());
                assert!(body.is_none());
            }
            other => panic!("expected Exchange, got {other:?}"),
        }
    }
}
