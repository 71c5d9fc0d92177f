//! Scheduled entries and recurrence configuration.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sluice_core::integration::HttpMethod;
use sluice_error::ScheduleError;
use uuid::Uuid;

/// Furthest a schedule may reach into the future
pub const MAX_AHEAD_DAYS: i64 = 365;
/// Minimum recurrence interval
pub const MIN_INTERVAL_MS: i64 = 60_000;
/// Bounds on `max_occurrences`
pub const MAX_OCCURRENCES: (u32, u32) = (2, 365);
/// Grace period for slightly-past timestamps
pub const PAST_GRACE_SECS: i64 = 60;

/// Scheduled entry lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedStatus {
    /// Waiting for its scheduled time
    Pending,
    /// Leased by a worker, dispatch in flight
    Processing,
    /// Dispatched successfully
    Sent,
    /// Dispatch failed terminally or exhausted retries
    Failed,
    /// Cancelled by a later event
    Cancelled,
    /// Flagged by the janitor as past its window while still pending
    Overdue,
}

impl SchedStatus {
    /// String form as persisted.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Overdue => "OVERDUE",
        }
    }

    /// Statuses the worker may still dispatch.
    #[must_use]
    pub const fn is_dispatchable(self) -> bool {
        matches!(self, Self::Pending | Self::Overdue)
    }
}

/// Recurrence configuration, produced by scheduling scripts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringConfig {
    /// First occurrence
    pub first_occurrence: DateTime<Utc>,
    /// Interval between occurrences (milliseconds)
    pub interval_ms:      i64,
    /// Occurrence cap; mutually optional with `end_date`
    #[serde(default)]
    pub max_occurrences:  Option<u32>,
    /// Hard end date
    #[serde(default)]
    pub end_date:         Option<DateTime<Utc>>,
    /// 1-based index of the occurrence this entry represents
    #[serde(default = "default_occurrence")]
    pub occurrence:       u32,
}

const fn default_occurrence() -> u32 {
    1
}

impl RecurringConfig {
    /// Validate interval, occurrence cap and end date.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.interval_ms < MIN_INTERVAL_MS {
            return Err(ScheduleError::Invalid {
                reason: format!(
                    "interval_ms {} is below the minimum of {MIN_INTERVAL_MS}",
                    self.interval_ms
                ),
            });
        }
        if let Some(max) = self.max_occurrences {
            if !(MAX_OCCURRENCES.0..=MAX_OCCURRENCES.1).contains(&max) {
                return Err(ScheduleError::Invalid {
                    reason: format!(
                        "max_occurrences {max} outside {}..={}",
                        MAX_OCCURRENCES.0, MAX_OCCURRENCES.1
                    ),
                });
            }
        }
        if let Some(end) = self.end_date {
            if end <= self.first_occurrence {
                return Err(ScheduleError::Invalid {
                    reason: "end_date must be after first_occurrence".to_string(),
                });
            }
        }
        Ok(())
    }

    /// The next occurrence after this one, or `None` when the recurrence
    /// is exhausted. Occurrence k happens at
    /// `first_occurrence + interval * (k - 1)`.
    #[must_use]
    pub fn next_occurrence(&self) -> Option<(DateTime<Utc>, u32)> {
        let k = self.occurrence + 1;
        if let Some(max) = self.max_occurrences {
            if k > max {
                return None;
            }
        }
        let at = self.first_occurrence + Duration::milliseconds(self.interval_ms * i64::from(k - 1));
        if let Some(end) = self.end_date {
            if at > end {
                return None;
            }
        }
        Some((at, k))
    }
}

/// What a scheduling script decided
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleDecision {
    /// One dispatch at the given time
    Delayed(DateTime<Utc>),
    /// A recurring series
    Recurring(RecurringConfig),
}

impl ScheduleDecision {
    /// Validate against the wall clock: not too far ahead; the past is
    /// allowed (the janitor relabels old entries `OVERDUE`).
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        let first = match self {
            Self::Delayed(at) => *at,
            Self::Recurring(config) => {
                config.validate()?;
                config.first_occurrence
            },
        };
        if first > now + Duration::days(MAX_AHEAD_DAYS) {
            return Err(ScheduleError::TooFarAhead {
                max_days: MAX_AHEAD_DAYS,
            });
        }
        Ok(())
    }
}

/// Cancellation details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationInfo {
    /// When the cancellation was recorded
    pub cancelled_at: DateTime<Utc>,
    /// Why
    pub reason:       String,
}

/// One scheduled dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledEntry {
    /// Entry id
    pub id:                Uuid,
    /// Integration to dispatch through
    pub integration_id:    Uuid,
    /// Tenant
    pub org_id:            i64,
    /// Event that produced the schedule
    pub original_event_id: Uuid,
    /// Event type, used for cancellation matching
    pub event_type:        String,
    /// Dispatch subject key (e.g. entity id + time), used for
    /// cancellation matching
    #[serde(default)]
    pub subject_key:       Option<String>,
    /// When to dispatch
    pub scheduled_for:     DateTime<Utc>,
    /// Lifecycle status
    pub status:            SchedStatus,
    /// Pre-transformed payload to send
    pub payload:           serde_json::Value,
    /// Target URL
    pub target_url:        String,
    /// HTTP method
    pub http_method:       HttpMethod,
    /// Dispatch attempts so far
    pub attempt_count:     u32,
    /// Recurrence, for RECURRING integrations
    #[serde(default)]
    pub recurring:         Option<RecurringConfig>,
    /// Cancellation details, when cancelled
    #[serde(default)]
    pub cancellation:      Option<CancellationInfo>,
    /// Worker holding the lease
    #[serde(default)]
    pub leased_by:         Option<String>,
    /// Lease expiry
    #[serde(default)]
    pub leased_until:      Option<DateTime<Utc>>,
    /// Creation time
    pub created_at:        DateTime<Utc>,
}
