use crate::category::ErrorCategory;

/// Errors raised while polling a source and recording events.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IngestError {
    #[error("Source database error: {reason}")]
    Database { reason: String },

    #[error("Malformed row {row_id} from source '{source_name}': {reason}")]
    MalformedRow {
        source_name: String,
        row_id: i64,
        reason: String,
    },

    #[error("Checkpoint operation failed: {reason}")]
    Checkpoint { reason: String },

    #[error("Audit store operation failed: {reason}")]
    Audit { reason: String },

    #[error("Event channel closed")]
    ChannelClosed,
}

impl IngestError {
    /// Returns true when the poll loop should back off and retry
    /// rather than skip past the failing row.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database { .. } | Self::Checkpoint { .. } | Self::Audit { .. }
        )
    }

    pub(crate) const fn category(&self) -> ErrorCategory {
        match self {
            Self::MalformedRow { .. } => ErrorCategory::ValidationError,
            _ => ErrorCategory::ServiceUnavailable,
        }
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(IngestError::Database {
            reason: "gone".to_string()
        }
        .is_transient());
        assert!(!IngestError::MalformedRow {
            source_name: "queue".to_string(),
            row_id: 7,
            reason: "bad json".to_string()
        }
        .is_transient());
    }
}
