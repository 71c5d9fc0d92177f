//! Unified error types for Sluice runtime crates.
//!
//! All runtime crates depend on this crate for error handling.

// Error variants and fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

mod category;
mod config;
mod delivery;
mod ingest;
mod schedule;
mod script;

pub use category::ErrorCategory;
pub use config::ConfigError;
pub use delivery::{DeliveryError, ErrorKind};
pub use ingest::IngestError;
pub use schedule::ScheduleError;
pub use script::ScriptError;

/// Unified error type wrapping all domain errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

impl GatewayError {
    /// Wire-visible category for this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) | Self::Serialization(_) => ErrorCategory::ValidationError,
            Self::Ingest(e) => e.category(),
            Self::Delivery(e) => e.category(),
            Self::Schedule(e) => e.category(),
            Self::Script(_) => ErrorCategory::ValidationError,
            Self::Database(_) => ErrorCategory::ServiceUnavailable,
            Self::Internal { .. } => ErrorCategory::InternalError,
        }
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_mapping_for_wrapped_errors() {
        let err = GatewayError::from(ConfigError::Invalid {
            message: "missing token_url".to_string(),
        });
        assert_eq!(err.category(), ErrorCategory::ValidationError);

        let err = GatewayError::Internal {
            reason: "boom".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::InternalError);
    }

    #[test]
    fn test_display_is_transparent_for_domain_errors() {
        let err = GatewayError::from(ScriptError::Reference {
            identifier: "fetch".to_string(),
        });
        assert!(err.to_string().contains("fetch"));
    }
}
