#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field '{field}' for {context}")]
    MissingField { field: String, context: String },

    #[error("Value for '{field}' out of bounds: {value} (allowed {min}..={max})")]
    OutOfBounds {
        field: String,
        value: i64,
        min:   i64,
        max:   i64,
    },

    #[error("Failed to read configuration file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

impl ConfigError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Invalid { .. } => "config_invalid",
            Self::MissingField { .. } => "config_missing_field",
            Self::OutOfBounds { .. } => "config_out_of_bounds",
            Self::Io { .. } => "config_io",
            Self::Parse { .. } => "config_parse",
        }
    }

    /// Shorthand for a missing-field error.
    pub fn missing(field: &str, context: &str) -> Self {
        Self::MissingField {
            field:   field.to_string(),
            context: context.to_string(),
        }
    }
}
