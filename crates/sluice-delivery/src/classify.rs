//! Response classification: success, transient, or terminal.

use sluice_error::DeliveryError;
use std::time::Duration;

/// What to do with a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// 2xx — the delivery succeeded
    Success,
    /// Retryable failure; carries the parsed `Retry-After` delay when the
    /// endpoint provided one (honored for 429/503)
    Transient {
        /// Parsed Retry-After delay
        retry_after: Option<Duration>,
    },
    /// Non-retryable failure
    Terminal,
}

/// Classify an HTTP status code.
///
/// 2xx is success; 408/425/429 and all 5xx are transient; every other
/// 4xx is terminal. `Retry-After` is honored for 429 and 503.
#[must_use]
pub fn classify_status(status: u16, retry_after_header: Option<&str>) -> Disposition {
    match status {
        200..=299 => Disposition::Success,
        408 | 425 => Disposition::Transient { retry_after: None },
        429 | 503 => Disposition::Transient {
            retry_after: retry_after_header.and_then(parse_retry_after),
        },
        500..=599 => Disposition::Transient { retry_after: None },
        _ => Disposition::Terminal,
    }
}

/// Build the delivery error for a non-success response.
#[must_use]
pub fn error_for_status(status: u16, body_snippet: &str, retry_after_header: Option<&str>) -> DeliveryError {
    match classify_status(status, retry_after_header) {
        Disposition::Transient { retry_after } => DeliveryError::HttpTransient {
            status,
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
        },
        _ => DeliveryError::HttpClient {
            status,
            body_snippet: body_snippet.chars().take(512).collect(),
        },
    }
}

/// Parse a `Retry-After` header: either delta-seconds or an HTTP date.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    let secs = delta.num_seconds();
    if secs > 0 {
        Some(Duration::from_secs(secs as u64))
    } else {
        Some(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_codes() {
        assert_eq!(classify_status(200, None), Disposition::Success);
        assert_eq!(classify_status(204, None), Disposition::Success);
    }

    #[test]
    fn test_transient_codes() {
        for status in [408, 425, 429, 500, 502, 503, 504] {
            assert!(
                matches!(classify_status(status, None), Disposition::Transient { .. }),
                "expected {status} to be transient"
            );
        }
    }

    #[test]
    fn test_terminal_codes() {
        for status in [400, 401, 403, 404, 409, 410, 422] {
            assert_eq!(
                classify_status(status, None),
                Disposition::Terminal,
                "expected {status} to be terminal"
            );
        }
    }

    #[test]
    fn test_retry_after_seconds_honored_for_429() {
        let disposition = classify_status(429, Some("30"));
        assert_eq!(
            disposition,
            Disposition::Transient {
                retry_after: Some(Duration::from_secs(30))
            }
        );
    }

    #[test]
    fn test_retry_after_ignored_for_plain_500() {
        let disposition = classify_status(500, Some("30"));
        assert_eq!(disposition, Disposition::Transient { retry_after: None });
    }

    #[test]
    fn test_error_for_status() {
        let err = error_for_status(400, "{\"error\":\"bad\"}", None);
        assert!(matches!(err, DeliveryError::HttpClient { status: 400, .. }));
        assert!(!err.is_transient());

        let err = error_for_status(503, "", Some("2"));
        match err {
            DeliveryError::HttpTransient {
                status,
                retry_after_ms,
            } => {
                assert_eq!(status, 503);
                assert_eq!(retry_after_ms, Some(2000));
            },
            other => panic!("expected transient, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_retry_after_formats() {
        assert_eq!(parse_retry_after("15"), Some(Duration::from_secs(15)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("not a date"), None);
        // A past HTTP date clamps to zero
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
    }
}
