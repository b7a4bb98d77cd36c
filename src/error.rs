//! Error types for the m365-mcp server.
//!
//! Uses `thiserror` for library-style errors with automatic `Display` and `Error` implementations.
//! Every error maps onto an [`ErrorCategory`] so tool callers can render a message without
//! parsing free text.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// OAuth error codes that mean the grant can never succeed without the user.
const TERMINAL_GRANT_ERRORS: &[&str] = &[
    "invalid_grant",
    "consent_required",
    "interaction_required",
    "login_required",
];

/// Stable, serializable error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    AuthRequired,
    AuthDenied,
    AuthTimeout,
    Unauthorized,
    ThrottledPermanently,
    ClientRequestError,
    ServerError,
    WriteDisabled,
    Cancelled,
    StoreUnavailable,
    Network,
    InvalidInput,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthRequired => "auth_required",
            Self::AuthDenied => "auth_denied",
            Self::AuthTimeout => "auth_timeout",
            Self::Unauthorized => "unauthorized",
            Self::ThrottledPermanently => "throttled_permanently",
            Self::ClientRequestError => "client_request_error",
            Self::ServerError => "server_error",
            Self::WriteDisabled => "write_disabled",
            Self::Cancelled => "cancelled",
            Self::StoreUnavailable => "store_unavailable",
            Self::Network => "network",
            Self::InvalidInput => "invalid_input",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level application error type.
#[derive(Error, Debug, Clone)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Token cache error: {0}")]
    Store(#[from] StoreError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures reported by the identity provider's token endpoints.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("identity provider rejected the grant ({code}): {description}")]
    Rejected { code: String, description: String },

    #[error("identity provider unreachable: {0}")]
    Network(String),

    #[error("unexpected identity provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn rejected(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.into(),
            description: description.into(),
        }
    }

    /// The OAuth error code, if the provider sent one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Rejected { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Terminal errors demote the session; everything else is retried.
    pub fn is_terminal(&self) -> bool {
        self.code()
            .map(|code| TERMINAL_GRANT_ERRORS.contains(&code))
            .unwrap_or(false)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        Self::Network(error.to_string())
    }
}

/// Credential broker errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    #[error("Sign-in was denied: {0}")]
    AuthDenied(String),

    #[error("Sign-in timed out before the user completed it")]
    AuthTimeout,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Already signed in; sign out first or use force")]
    AlreadySignedIn,

    #[error("Unknown or finished sign-in flow: {0}")]
    UnknownFlow(String),

    #[error("Identity provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Sign-in flow failed: {0}")]
    FlowFailed(String),
}

impl AuthError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::AuthRequired(_) | Self::UnknownFlow(_) => ErrorCategory::AuthRequired,
            Self::AuthDenied(_) => ErrorCategory::AuthDenied,
            Self::AuthTimeout => ErrorCategory::AuthTimeout,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::AlreadySignedIn => ErrorCategory::InvalidInput,
            Self::ProviderUnavailable(_) => ErrorCategory::Network,
            Self::FlowFailed(_) => ErrorCategory::Internal,
        }
    }
}

/// Token cache errors. These are soft: the broker keeps working from memory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Failed to write token cache: {0}")]
    WriteFailed(String),

    #[error("Failed to delete token cache: {0}")]
    DeleteFailed(String),
}

/// Graph request executor errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error(transparent)]
    Auth(AuthError),

    #[error("Unauthorized (401): Graph rejected a freshly issued token")]
    Unauthorized,

    #[error("Throttled by Microsoft Graph after {attempts} attempts")]
    ThrottledPermanently {
        attempts: u32,
        retry_after: Option<Duration>,
    },

    #[error("Graph request failed with HTTP {status}: {message}")]
    ClientRequestError {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Graph server error HTTP {status} after {attempts} attempts: {message}")]
    ServerError {
        status: u16,
        attempts: u32,
        message: String,
    },

    #[error("Write operations are disabled in read-only mode ({method} {path})")]
    WriteDisabled { method: String, path: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid Graph response: {0}")]
    InvalidResponse(String),
}

impl From<AuthError> for GraphError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::Cancelled => Self::Cancelled,
            other => Self::Auth(other),
        }
    }
}

impl GraphError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Auth(e) => e.category(),
            Self::Unauthorized => ErrorCategory::Unauthorized,
            Self::ThrottledPermanently { .. } => ErrorCategory::ThrottledPermanently,
            Self::ClientRequestError { .. } => ErrorCategory::ClientRequestError,
            Self::ServerError { .. } | Self::InvalidResponse(_) => ErrorCategory::ServerError,
            Self::WriteDisabled { .. } => ErrorCategory::WriteDisabled,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Network(_) => ErrorCategory::Network,
        }
    }
}

impl AppError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Auth(e) => e.category(),
            Self::Store(_) => ErrorCategory::StoreUnavailable,
            Self::Graph(e) => e.category(),
            Self::InvalidInput(_) => ErrorCategory::InvalidInput,
            Self::Config(_) | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// HTTP status of the failed Graph call, when there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Graph(GraphError::ClientRequestError { status, .. })
            | Self::Graph(GraphError::ServerError { status, .. }) => Some(*status),
            Self::Graph(GraphError::Unauthorized) => Some(401),
            Self::Graph(GraphError::ThrottledPermanently { .. }) => Some(429),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Graph(GraphError::ThrottledPermanently { retry_after, .. }) => *retry_after,
            _ => None,
        }
    }

    /// Returns a user-friendly message for display to the caller.
    pub fn user_message(&self) -> &str {
        match self.category() {
            ErrorCategory::AuthRequired => "Not signed in. Use the login tool to authenticate.",
            ErrorCategory::AuthDenied => "Sign-in was declined. Please try again.",
            ErrorCategory::AuthTimeout => "Sign-in timed out. Start a new login.",
            ErrorCategory::Unauthorized => "Microsoft Graph rejected the session. Sign in again.",
            ErrorCategory::ThrottledPermanently => {
                "Microsoft Graph is throttling requests. Please wait a moment."
            }
            ErrorCategory::ClientRequestError => "Microsoft Graph rejected the request.",
            ErrorCategory::ServerError => "Microsoft Graph is having problems. Please try again.",
            ErrorCategory::WriteDisabled => "Write operations are disabled in read-only mode.",
            ErrorCategory::Cancelled => "The operation was cancelled.",
            ErrorCategory::StoreUnavailable => "The local token cache is unavailable.",
            ErrorCategory::Network => "Network error. Check your connection.",
            ErrorCategory::InvalidInput => "Invalid tool arguments.",
            ErrorCategory::Internal => "An error occurred. Please try again.",
        }
    }

    /// Returns true if this error should trigger a sign-out.
    pub fn requires_sign_out(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::AuthRequired | ErrorCategory::Unauthorized
        )
    }

    /// Structured payload handed back to tool callers.
    pub fn payload(&self) -> Value {
        let mut error = json!({
            "category": self.category(),
            "message": self.to_string(),
            "hint": self.user_message(),
        });
        if let Some(status) = self.status() {
            error["status"] = json!(status);
        }
        if let Some(retry_after) = self.retry_after() {
            error["retryAfterSeconds"] = json!(retry_after.as_secs());
        }
        json!({ "error": error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages() {
        let err = AppError::Auth(AuthError::AuthRequired("no session".into()));
        assert_eq!(
            err.user_message(),
            "Not signed in. Use the login tool to authenticate."
        );

        let err = AppError::Graph(GraphError::WriteDisabled {
            method: "DELETE".into(),
            path: "/me/messages/1".into(),
        });
        assert_eq!(
            err.user_message(),
            "Write operations are disabled in read-only mode."
        );
    }

    #[test]
    fn test_requires_sign_out() {
        let err = AppError::Graph(GraphError::Unauthorized);
        assert!(err.requires_sign_out());

        let err = AppError::Graph(GraphError::ClientRequestError {
            status: 403,
            code: None,
            message: "Forbidden".into(),
        });
        assert!(!err.requires_sign_out());
    }

    #[test]
    fn test_terminal_grant_errors() {
        assert!(ProviderError::rejected("invalid_grant", "expired").is_terminal());
        assert!(ProviderError::rejected("consent_required", "AADSTS65001").is_terminal());
        assert!(!ProviderError::rejected("temporarily_unavailable", "busy").is_terminal());
        assert!(!ProviderError::Network("connection reset".into()).is_terminal());
    }

    #[test]
    fn test_cancelled_auth_maps_to_graph_cancelled() {
        assert_eq!(GraphError::from(AuthError::Cancelled), GraphError::Cancelled);
        assert_eq!(
            GraphError::from(AuthError::AuthTimeout).category(),
            ErrorCategory::AuthTimeout
        );
    }

    #[test]
    fn test_payload_carries_status_and_retry_hint() {
        let err = AppError::Graph(GraphError::ThrottledPermanently {
            attempts: 5,
            retry_after: Some(Duration::from_secs(30)),
        });
        let payload = err.payload();
        assert_eq!(payload["error"]["category"], "throttled_permanently");
        assert_eq!(payload["error"]["status"], 429);
        assert_eq!(payload["error"]["retryAfterSeconds"], 30);
    }

    #[test]
    fn test_store_errors_are_store_unavailable() {
        let err = AppError::Store(StoreError::WriteFailed("disk full".into()));
        assert_eq!(err.category(), ErrorCategory::StoreUnavailable);
        assert!(err.status().is_none());
    }
}
