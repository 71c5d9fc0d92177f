use crate::category::ErrorCategory;
use crate::script::ScriptError;

/// Errors raised while evaluating scheduling scripts and dispatching
/// scheduled entries.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid schedule: {reason}")]
    Invalid { reason: String },

    #[error("Scheduled time is more than {max_days} days in the future")]
    TooFarAhead { max_days: i64 },

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("Schedule store error: {reason}")]
    Store { reason: String },

    #[error("Lease lost for entry {entry_id}")]
    LeaseLost { entry_id: String },
}

impl ScheduleError {
    pub(crate) const fn category(&self) -> ErrorCategory {
        match self {
            Self::Invalid { .. } | Self::TooFarAhead { .. } | Self::Script(_) => {
                ErrorCategory::ValidationError
            },
            Self::Store { .. } => ErrorCategory::ServiceUnavailable,
            Self::LeaseLost { .. } => ErrorCategory::Conflict,
        }
    }
}

impl From<sqlx::Error> for ScheduleError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_passthrough() {
        let err = ScheduleError::from(ScriptError::Timeout { elapsed_ms: 5000 });
        assert!(err.to_string().contains("5000ms"));
        assert_eq!(err.category(), ErrorCategory::ValidationError);
    }
}
