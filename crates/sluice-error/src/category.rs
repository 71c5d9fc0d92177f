use serde::{Deserialize, Serialize};

/// Wire-visible error category with a stable code and HTTP status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    ValidationError,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    RateLimitExceeded,
    InternalError,
    ServiceUnavailable,
}

impl ErrorCategory {
    /// Stable string code as serialized on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }

    /// HTTP status code this category maps to.
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::ValidationError => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::RateLimitExceeded => 429,
            Self::InternalError => 500,
            Self::ServiceUnavailable => 503,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorCategory::ValidationError.http_status(), 400);
        assert_eq!(ErrorCategory::Unauthorized.http_status(), 401);
        assert_eq!(ErrorCategory::Forbidden.http_status(), 403);
        assert_eq!(ErrorCategory::NotFound.http_status(), 404);
        assert_eq!(ErrorCategory::Conflict.http_status(), 409);
        assert_eq!(ErrorCategory::RateLimitExceeded.http_status(), 429);
        assert_eq!(ErrorCategory::InternalError.http_status(), 500);
        assert_eq!(ErrorCategory::ServiceUnavailable.http_status(), 503);
    }

    #[test]
    fn test_serde_round_trip() {
        let json = serde_json::to_string(&ErrorCategory::RateLimitExceeded).unwrap();
        assert_eq!(json, "\"RATE_LIMIT_EXCEEDED\"");
        let back: ErrorCategory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCategory::RateLimitExceeded);
    }
}
