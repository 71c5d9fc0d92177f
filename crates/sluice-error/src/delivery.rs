use crate::category::ErrorCategory;
use serde::{Deserialize, Serialize};

/// Delivery failure kinds, as recorded on execution traces and DLQ entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    TransformationError,
    AuthError,
    NetworkError,
    HttpClientError,
    HttpTransientError,
    CircuitOpen,
    UrlPolicyViolation,
    ConfigError,
    Timeout,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TransformationError => "TRANSFORMATION_ERROR",
            Self::AuthError => "AUTH_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::HttpClientError => "HTTP_CLIENT_ERROR",
            Self::HttpTransientError => "HTTP_TRANSIENT_ERROR",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::UrlPolicyViolation => "URL_POLICY_VIOLATION",
            Self::ConfigError => "CONFIG_ERROR",
            Self::Timeout => "TIMEOUT",
        }
    }

    /// Whether failures of this kind feed the retry / DLQ-requeue path.
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::AuthError | Self::NetworkError | Self::HttpTransientError | Self::Timeout
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while delivering an event to an external endpoint.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("Transformation failed: {reason}")]
    Transformation { reason: String },

    #[error("Auth resolution failed after {attempts} attempt(s): {reason}")]
    Auth { reason: String, attempts: u32 },

    #[error("Network error: {reason}")]
    Network { reason: String },

    #[error("Endpoint returned client error {status}: {body_snippet}")]
    HttpClient { status: u16, body_snippet: String },

    #[error("Endpoint returned transient error {status}")]
    HttpTransient {
        status:         u16,
        /// Parsed Retry-After delay, when the endpoint provided one.
        retry_after_ms: Option<u64>,
    },

    #[error("Circuit open for integration {integration_id}")]
    CircuitOpen { integration_id: String },

    #[error("URL policy violation: {reason}")]
    UrlPolicy { reason: String },

    #[error("Delivery configuration error: {reason}")]
    Config { reason: String },

    #[error("Request exceeded timeout of {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl DeliveryError {
    /// The failure kind recorded on traces and DLQ entries.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transformation { .. } => ErrorKind::TransformationError,
            Self::Auth { .. } => ErrorKind::AuthError,
            Self::Network { .. } => ErrorKind::NetworkError,
            Self::HttpClient { .. } => ErrorKind::HttpClientError,
            Self::HttpTransient { .. } => ErrorKind::HttpTransientError,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::UrlPolicy { .. } => ErrorKind::UrlPolicyViolation,
            Self::Config { .. } => ErrorKind::ConfigError,
            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Returns true if this error is transient (retryable).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    /// Returns true if this error should park the message in the DLQ as
    /// abandoned rather than queue it for retry.
    #[must_use]
    pub const fn should_abandon(&self) -> bool {
        !self.is_transient() && !matches!(self, Self::CircuitOpen { .. })
    }

    /// HTTP status attached to the failure, when there was a response at all.
    #[must_use]
    pub const fn response_status(&self) -> Option<u16> {
        match self {
            Self::HttpClient { status, .. } | Self::HttpTransient { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn category(&self) -> ErrorCategory {
        match self {
            Self::Transformation { .. } | Self::Config { .. } | Self::UrlPolicy { .. } => {
                ErrorCategory::ValidationError
            },
            Self::Auth { .. } => ErrorCategory::Unauthorized,
            Self::HttpTransient { status: 429, .. } => ErrorCategory::RateLimitExceeded,
            Self::Network { .. }
            | Self::HttpTransient { .. }
            | Self::CircuitOpen { .. }
            | Self::Timeout { .. } => ErrorCategory::ServiceUnavailable,
            Self::HttpClient { .. } => ErrorCategory::InternalError,
        }
    }
}
