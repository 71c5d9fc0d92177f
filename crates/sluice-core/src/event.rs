//! Event types and deduplication keys for the ingestion pipeline.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Lifecycle status of an ingested event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// Accepted by the audit store, not yet matched
    Received,
    /// Picked up by the delivery pipeline
    Processing,
    /// At least one matched integration delivered successfully
    Delivered,
    /// No matching integrations, or all actions gated off
    Skipped,
    /// All matched integrations failed terminally
    Failed,
    /// Left in `Processing` longer than the stuck window; flagged by the janitor
    Stuck,
}

impl EventStatus {
    /// String form as persisted.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Processing => "PROCESSING",
            Self::Delivered => "DELIVERED",
            Self::Skipped => "SKIPPED",
            Self::Failed => "FAILED",
            Self::Stuck => "STUCK",
        }
    }

    /// Whether this status is terminal for the event lifecycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Skipped | Self::Failed)
    }
}

/// One entry in an event's processing timeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// When the transition happened
    pub ts:      DateTime<Utc>,
    /// Stage name (status transition or pipeline step)
    pub stage:   String,
    /// Optional free-form details
    pub details: Option<String>,
}

/// Deduplication key for an event.
///
/// The primary key is the upstream row identity; when the source has no
/// stable row id, a fallback of tenant + content hash + minute bucket is
/// used instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    /// `(source, source_id)` — upstream row identity
    SourceRow {
        /// Source name
        source:    String,
        /// Upstream row identifier
        source_id: i64,
    },
    /// `(org_id, event_key, minute bucket)` fallback
    Fallback {
        /// Tenant id
        org_id:    i64,
        /// Content hash of event type + id-like payload field + org
        event_key: String,
        /// Minute-truncated receipt time (unix seconds)
        bucket:    i64,
    },
}

impl DedupKey {
    /// Render the key as a single string, usable as an LRU/cache key.
    #[must_use]
    pub fn cache_key(&self) -> String {
        match self {
            Self::SourceRow { source, source_id } => format!("src:{source}:{source_id}"),
            Self::Fallback {
                org_id,
                event_key,
                bucket,
            } => format!("fb:{org_id}:{event_key}:{bucket}"),
        }
    }
}

/// A normalized business event flowing through the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    /// Unique event identifier, assigned on first ingestion
    pub event_id:     Uuid,
    /// Source name this event was pulled from
    pub source:       String,
    /// Upstream row identifier, when the source has one
    pub source_id:    Option<i64>,
    /// Parent tenant
    pub org_id:       i64,
    /// Leaf tenant, when present
    pub org_unit_id:  Option<i64>,
    /// Business event type (e.g. "ORDER_CREATED")
    pub event_type:   String,
    /// Opaque event payload
    pub payload:      serde_json::Value,
    /// When the gateway received the event
    pub received_at:  DateTime<Utc>,
    /// SHA-256 digest of the serialized payload
    pub payload_hash: String,
    /// Lifecycle status
    pub status:       EventStatus,
}

impl GatewayEvent {
    /// Create a new event with a fresh id and `Received` status.
    #[must_use]
    pub fn new(
        source: String,
        source_id: Option<i64>,
        org_id: i64,
        org_unit_id: Option<i64>,
        event_type: String,
        payload: serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Self {
        let payload_hash = hash_payload(&payload);
        Self {
            event_id: Uuid::new_v4(),
            source,
            source_id,
            org_id,
            org_unit_id,
            event_type,
            payload,
            received_at,
            payload_hash,
            status: EventStatus::Received,
        }
    }

    /// Deduplication key for this event.
    #[must_use]
    pub fn dedup_key(&self) -> DedupKey {
        match self.source_id {
            Some(source_id) => DedupKey::SourceRow {
                source: self.source.clone(),
                source_id,
            },
            None => DedupKey::Fallback {
                org_id:    self.org_id,
                event_key: self.event_key(),
                bucket:    minute_bucket(self.received_at),
            },
        }
    }

    /// Content key used by the fallback dedup path:
    /// `sha256(event_type + id-like payload field + org_id)`.
    #[must_use]
    pub fn event_key(&self) -> String {
        let id_like = id_like_field(&self.payload).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(self.event_type.as_bytes());
        hasher.update(id_like.as_bytes());
        hasher.update(self.org_id.to_string().as_bytes());
        hex_digest(&hasher.finalize())
    }
}

/// SHA-256 digest of a JSON payload's canonical serialization.
#[must_use]
pub fn hash_payload(payload: &serde_json::Value) -> String {
    let serialized = payload.to_string();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hex_digest(&hasher.finalize())
}

/// Minute-truncated receipt time, in unix seconds.
#[must_use]
pub fn minute_bucket(at: DateTime<Utc>) -> i64 {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
        .timestamp()
}

/// Find an id-like field in the payload for the fallback dedup key.
///
/// Looks for `id`, `uuid`, `rid` first, then any top-level key ending in
/// `Id`, `_id` or `Rid`. Returns the value rendered as a string.
#[must_use]
pub fn id_like_field(payload: &serde_json::Value) -> Option<String> {
    let map = payload.as_object()?;

    for key in ["id", "uuid", "rid"] {
        if let Some(v) = map.get(key) {
            return Some(render_scalar(v));
        }
    }

    map.iter()
        .find(|(k, _)| k.ends_with("Id") || k.ends_with("_id") || k.ends_with("Rid"))
        .map(|(_, v)| render_scalar(v))
}

fn render_scalar(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Per-delivery context handed to transformation scripts and templates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryContext {
    /// Parent tenant
    pub org_id:           i64,
    /// Leaf tenant, when present
    pub org_unit_id:      Option<i64>,
    /// Business event type
    pub event_type:       String,
    /// Matched integration id
    pub integration_id:   Uuid,
    /// Matched integration name
    pub integration_name: String,
    /// Injected wall clock; scripts see a stable `now` per execution
    pub now:              DateTime<Utc>,
}

impl DeliveryContext {
    /// JSON shape injected into the sandbox as `context`.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "orgId": self.org_id,
            "orgUnitId": self.org_unit_id,
            "eventType": self.event_type,
            "integrationId": self.integration_id.to_string(),
            "integrationName": self.integration_name,
            "now": self.now.timestamp_millis(),
        })
    }
}
