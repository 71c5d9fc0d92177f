/// Failures surfaced by the script sandbox. Each variant is a distinct
/// error kind: callers report syntax, reference, type, and limit errors
/// separately on execution traces.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("Syntax error at line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("Reference error: '{identifier}' is not defined")]
    Reference { identifier: String },

    #[error("Type error: {message}")]
    Type { message: String },

    #[error("Script exceeded its deadline after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Script exceeded its operation budget of {budget} operations")]
    BudgetExhausted { budget: u64 },

    #[error("Script returned an invalid value: {message}")]
    InvalidResult { message: String },
}

impl ScriptError {
    /// Stable kind string recorded in trace step metadata.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Syntax { .. } => "SYNTAX_ERROR",
            Self::Reference { .. } => "REFERENCE_ERROR",
            Self::Type { .. } => "TYPE_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::BudgetExhausted { .. } => "BUDGET_EXHAUSTED",
            Self::InvalidResult { .. } => "INVALID_RESULT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_distinct() {
        let kinds = [
            ScriptError::Syntax {
                line:    1,
                message: String::new(),
            }
            .kind(),
            ScriptError::Reference {
                identifier: String::new(),
            }
            .kind(),
            ScriptError::Timeout { elapsed_ms: 0 }.kind(),
            ScriptError::BudgetExhausted { budget: 0 }.kind(),
        ];
        let unique: std::collections::HashSet<_> = kinds.iter().collect();
        assert_eq!(unique.len(), kinds.len());
    }
}
