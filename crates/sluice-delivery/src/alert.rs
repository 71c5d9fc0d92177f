//! Failure alerting: rolling windows, digests, channel adapters.
//!
//! Failed executions are recorded per (org, integration). On each tick,
//! windows older than the aggregation period flush into a digest which is
//! handed to the configured channel adapter (`channel:provider`, e.g.
//! `EMAIL:SMTP`). Every send is recorded as an alert log entry.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sluice_error::DeliveryError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// Default aggregation window (1 hour)
pub const DEFAULT_WINDOW: Duration = Duration::hours(1);
/// Sample snippets kept per digest
pub const MAX_SAMPLES: usize = 5;

/// One failure observation
#[derive(Debug, Clone)]
pub struct FailureRecord {
    /// Tenant
    pub org_id:           i64,
    /// Integration
    pub integration_id:   Uuid,
    /// Integration name, carried into the digest
    pub integration_name: String,
    /// Failure kind string (see error taxonomy)
    pub category:         String,
    /// Redacted sample snippet
    pub sample:           String,
    /// Trace of the failed execution
    pub trace_id:         Uuid,
    /// When the failure happened
    pub at:               DateTime<Utc>,
}

/// Special category recorded when the breaker auto-disables an integration
pub const CATEGORY_AUTO_DISABLED: &str = "AUTO_DISABLED";

/// Aggregated digest for one (org, integration) window
#[derive(Debug, Clone, Serialize)]
pub struct AlertDigest {
    /// Tenant
    pub org_id:           i64,
    /// Integration
    pub integration_id:   Uuid,
    /// Integration name
    pub integration_name: String,
    /// Window start
    pub window_start:     DateTime<Utc>,
    /// Window end
    pub window_end:       DateTime<Utc>,
    /// Total failures in the window
    pub total_failures:   u64,
    /// Failure counts by category
    pub by_category:      HashMap<String, u64>,
    /// Redacted request snippets (capped)
    pub samples:          Vec<String>,
    /// Dashboard deep link for the integration
    pub dashboard_link:   String,
}

/// Adapter configuration passed to `send`/`verify`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Recipients (addresses, channel ids — adapter-specific)
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Free-form adapter settings
    #[serde(default)]
    pub settings:   serde_json::Value,
}

/// Result of an adapter send
#[derive(Debug, Clone)]
pub struct AlertReceipt {
    /// Provider message id
    pub message_id: Option<String>,
    /// Recipients the provider accepted
    pub accepted:   Vec<String>,
    /// Recipients the provider rejected
    pub rejected:   Vec<String>,
}

/// A pluggable alert channel (`channel:provider`)
#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Registry key, e.g. `"EMAIL:SMTP"` or `"SLACK:WEBHOOK"`
    fn key(&self) -> &'static str;

    /// Send a digest.
    async fn send(
        &self,
        digest: &AlertDigest,
        config: &ChannelConfig,
    ) -> Result<AlertReceipt, DeliveryError>;

    /// Verify the channel configuration without sending.
    async fn verify(&self, config: &ChannelConfig) -> Result<(), DeliveryError>;
}

/// Outcome of one alert send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    /// Digest delivered
    Sent,
    /// Adapter failed
    Failed,
    /// No adapter configured / nothing to send
    Skipped,
}

/// Record of one alert dispatch
#[derive(Debug, Clone, Serialize)]
pub struct AlertLog {
    /// Outcome
    pub status:            AlertStatus,
    /// Recipients attempted
    pub recipients:        Vec<String>,
    /// Failures aggregated in the digest
    pub total_failures:    u64,
    /// Window start
    pub window_start:      DateTime<Utc>,
    /// Window end
    pub window_end:        DateTime<Utc>,
    /// Provider response rendering
    pub provider_response: Option<String>,
    /// When the dispatch happened
    pub at:                DateTime<Utc>,
}

#[derive(Debug, Default)]
struct WindowBucket {
    window_start: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    names:        String,
    total:        u64,
    by_category:  HashMap<String, u64>,
    samples:      Vec<String>,
}

/// Aggregates failures and dispatches digests through a channel adapter
pub struct AlertDispatcher {
    channels:       HashMap<&'static str, Arc<dyn AlertChannel>>,
    channel_key:    Option<String>,
    channel_config: ChannelConfig,
    window:         Duration,
    dashboard_base: String,
    buckets:        Mutex<HashMap<(i64, Uuid), WindowBucket>>,
    log:            Mutex<Vec<AlertLog>>,
}

impl AlertDispatcher {
    /// Create a dispatcher with the default 1h window and no channel.
    #[must_use]
    pub fn new(dashboard_base: String) -> Self {
        Self {
            channels: HashMap::new(),
            channel_key: None,
            channel_config: ChannelConfig::default(),
            window: DEFAULT_WINDOW,
            dashboard_base,
            buckets: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Register a channel adapter.
    pub fn register(&mut self, channel: Arc<dyn AlertChannel>) {
        self.channels.insert(channel.key(), channel);
    }

    /// Select the active channel and its configuration.
    pub fn configure_channel(&mut self, key: &str, config: ChannelConfig) {
        self.channel_key = Some(key.to_string());
        self.channel_config = config;
    }

    /// Override the aggregation window.
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Record one failure observation.
    pub fn record_failure(&self, record: FailureRecord) {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry((record.org_id, record.integration_id))
            .or_default();
        if bucket.window_start.is_none() {
            bucket.window_start = Some(record.at);
        }
        bucket.last_failure = Some(record.at);
        bucket.names = record.integration_name;
        bucket.total += 1;
        *bucket.by_category.entry(record.category).or_insert(0) += 1;
        if bucket.samples.len() < MAX_SAMPLES {
            bucket.samples.push(record.sample);
        }
    }

    /// Flush windows older than the aggregation period and dispatch their
    /// digests. Returns the number of digests produced.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<((i64, Uuid), WindowBucket)> = {
            let mut buckets = self.buckets.lock();
            let keys: Vec<(i64, Uuid)> = buckets
                .iter()
                .filter(|(_, bucket)| {
                    bucket
                        .window_start
                        .is_some_and(|start| now - start >= self.window)
                })
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| buckets.remove(&key).map(|bucket| (key, bucket)))
                .collect()
        };

        let mut dispatched = 0;
        for ((org_id, integration_id), bucket) in due {
            let digest = AlertDigest {
                org_id,
                integration_id,
                integration_name: bucket.names.clone(),
                window_start: bucket.window_start.unwrap_or(now),
                window_end: bucket.last_failure.unwrap_or(now),
                total_failures: bucket.total,
                by_category: bucket.by_category,
                samples: bucket.samples,
                dashboard_link: format!(
                    "{}/integrations/{}/executions",
                    self.dashboard_base, integration_id
                ),
            };
            self.dispatch(&digest).await;
            dispatched += 1;
        }
        dispatched
    }

    async fn dispatch(&self, digest: &AlertDigest) {
        let channel = self
            .channel_key
            .as_deref()
            .and_then(|key| self.channels.get(key));

        let entry = match channel {
            None => {
                info!(
                    integration = %digest.integration_id,
                    failures = digest.total_failures,
                    "no alert channel configured, digest skipped"
                );
                AlertLog {
                    status:            AlertStatus::Skipped,
                    recipients:        Vec::new(),
                    total_failures:    digest.total_failures,
                    window_start:      digest.window_start,
                    window_end:        digest.window_end,
                    provider_response: None,
                    at:                Utc::now(),
                }
            },
            Some(channel) => match channel.send(digest, &self.channel_config).await {
                Ok(receipt) => AlertLog {
                    status:            AlertStatus::Sent,
                    recipients:        self.channel_config.recipients.clone(),
                    total_failures:    digest.total_failures,
                    window_start:      digest.window_start,
                    window_end:        digest.window_end,
                    provider_response: receipt.message_id,
                    at:                Utc::now(),
                },
                Err(e) => {
                    warn!(error = %e, "alert send failed");
                    AlertLog {
                        status:            AlertStatus::Failed,
                        recipients:        self.channel_config.recipients.clone(),
                        total_failures:    digest.total_failures,
                        window_start:      digest.window_start,
                        window_end:        digest.window_end,
                        provider_response: Some(e.to_string()),
                        at:                Utc::now(),
                    }
                },
            },
        };
        self.log.lock().push(entry);
    }

    /// Snapshot of the dispatch log.
    #[must_use]
    pub fn log(&self) -> Vec<AlertLog> {
        self.log.lock().clone()
    }

    /// Run the periodic flush until shutdown.
    pub async fn run_with_shutdown(
        self: Arc<Self>,
        tick: std::time::Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("alert dispatcher starting");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {},
                _ = shutdown.recv() => {
                    // Final flush so a shutdown doesn't drop a full window
                    let _ = self.tick(Utc::now() + self.window).await;
                    info!("alert dispatcher stopping");
                    return;
                },
            }
            let _ = self.tick(Utc::now()).await;
        }
    }
}
