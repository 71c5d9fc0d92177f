//! Scheduling front door and dispatch worker.
//!
//! The [`Scheduler`] turns matched DELAYED/RECURRING integrations into
//! scheduled entries. The [`SchedulerWorker`] ticks, leases due entries
//! and dispatches them through the delivery engine; recurring series
//! advance on success only.

use crate::entry::{
    RecurringConfig, SchedStatus, ScheduleDecision, ScheduledEntry, PAST_GRACE_SECS,
};
use crate::evaluator::ScheduleEvaluator;
use crate::store::ScheduleStore;
use chrono::{DateTime, Duration, Utc};
use sluice_core::event::{id_like_field, DeliveryContext, GatewayEvent};
use sluice_core::integration::{DeliveryMode, IntegrationConfig};
use sluice_core::registry::IntegrationRegistry;
use sluice_core::transform::Transformer;
use sluice_delivery::engine::DeliveryEngine;
use sluice_delivery::retry::RetryPolicy;
use sluice_error::ScheduleError;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default worker tick
pub const DEFAULT_TICK: StdDuration = StdDuration::from_secs(30);
/// Default dispatch skew: entries due within this window are picked up
pub const DEFAULT_SKEW: Duration = Duration::seconds(60);
/// Default lease duration
pub const DEFAULT_LEASE: Duration = Duration::seconds(60);
/// Default dispatch retry cap per entry
pub const DEFAULT_MAX_DISPATCH_ATTEMPTS: u32 = 5;

/// Creates scheduled entries from events
pub struct Scheduler {
    evaluator:   ScheduleEvaluator,
    transformer: Transformer,
    store:       Arc<dyn ScheduleStore>,
}

impl Scheduler {
    /// Assemble a scheduler.
    #[must_use]
    pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
        Self {
            evaluator: ScheduleEvaluator::default(),
            transformer: Transformer::default(),
            store,
        }
    }

    /// Evaluate the integration's scheduling script for an event and
    /// persist the resulting entry. Returns `None` for integrations that
    /// deliver immediately.
    pub async fn schedule_event(
        &self,
        event: &GatewayEvent,
        integration: &IntegrationConfig,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledEntry>, ScheduleError> {
        if !matches!(
            integration.delivery_mode,
            DeliveryMode::Delayed | DeliveryMode::Recurring
        ) {
            return Ok(None);
        }
        let script = integration
            .scheduling_script
            .as_deref()
            .ok_or_else(|| ScheduleError::Invalid {
                reason: "integration has no scheduling script".to_string(),
            })?;

        let ctx = DeliveryContext {
            org_id:           event.org_id,
            org_unit_id:      event.org_unit_id,
            event_type:       event.event_type.clone(),
            integration_id:   integration.id,
            integration_name: integration.name.clone(),
            now,
        };

        let decision = self.evaluator.evaluate(script, event, &ctx, now)?;

        // The payload is transformed at schedule time and stored verbatim;
        // dispatch sends exactly what was scheduled.
        let payload = self
            .transformer
            .apply(&integration.transformation, &event.payload, &ctx)
            .map_err(|e| ScheduleError::Invalid {
                reason: format!("transformation failed: {e}"),
            })?;

        let (scheduled_for, recurring) = match decision {
            ScheduleDecision::Delayed(at) => (at, None),
            ScheduleDecision::Recurring(config) => (config.first_occurrence, Some(config)),
        };

        let entry = ScheduledEntry {
            id: Uuid::new_v4(),
            integration_id: integration.id,
            org_id: event.org_id,
            original_event_id: event.event_id,
            event_type: event.event_type.clone(),
            subject_key: subject_key(event, scheduled_for),
            scheduled_for,
            status: SchedStatus::Pending,
            payload,
            target_url: integration.target_url.clone().unwrap_or_default(),
            http_method: integration.http_method,
            attempt_count: 0,
            recurring,
            cancellation: None,
            leased_by: None,
            leased_until: None,
            created_at: now,
        };
        self.store.insert(&entry).await?;
        debug!(entry = %entry.id, at = %entry.scheduled_for, "scheduled entry created");
        Ok(Some(entry))
    }

    /// Cancel pending entries for the same subject, driven by a
    /// cancellation event arriving later.
    pub async fn cancel_for_event(
        &self,
        event: &GatewayEvent,
        scheduled_for: DateTime<Utc>,
        reason: &str,
    ) -> Result<u64, ScheduleError> {
        let Some(key) = subject_key(event, scheduled_for) else {
            return Ok(0);
        };
        self.store
            .cancel_matching(event.org_id, &event.event_type, &key, reason)
            .await
    }
}

/// Cancellation identity: the id-like payload field plus the scheduled
/// minute. A later event for the same subject and time addresses the same
/// entries.
fn subject_key(event: &GatewayEvent, scheduled_for: DateTime<Utc>) -> Option<String> {
    id_like_field(&event.payload).map(|id| format!("{id}:{}", scheduled_for.timestamp() / 60))
}

/// Leases due entries and dispatches them through the delivery engine
pub struct SchedulerWorker {
    store:        Arc<dyn ScheduleStore>,
    engine:       Arc<DeliveryEngine>,
    registry:     Arc<IntegrationRegistry>,
    worker_id:    String,
    tick:         StdDuration,
    skew:         Duration,
    lease:        Duration,
    batch:        u32,
    max_attempts: u32,
}

impl SchedulerWorker {
    /// Assemble a worker with default cadence.
    #[must_use]
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        engine: Arc<DeliveryEngine>,
        registry: Arc<IntegrationRegistry>,
    ) -> Self {
        Self {
            store,
            engine,
            registry,
            worker_id: format!("sched-{}", Uuid::new_v4()),
            tick: DEFAULT_TICK,
            skew: DEFAULT_SKEW,
            lease: DEFAULT_LEASE,
            batch: 50,
            max_attempts: DEFAULT_MAX_DISPATCH_ATTEMPTS,
        }
    }

    /// Override the tick interval.
    #[must_use]
    pub const fn with_tick(mut self, tick: StdDuration) -> Self {
        self.tick = tick;
        self
    }

    /// Worker id, as recorded on leases.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until shutdown.
    pub async fn run_with_shutdown(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(worker = %self.worker_id, "scheduler worker starting");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {},
                _ = shutdown.recv() => {
                    info!(worker = %self.worker_id, "scheduler worker stopping");
                    return;
                },
            }
            if let Err(e) = self.tick_once(Utc::now()).await {
                warn!(error = %e, "scheduler tick failed");
            }
        }
    }

    /// One full tick: janitor passes, then lease and dispatch due entries.
    /// Returns the number of entries dispatched.
    pub async fn tick_once(&self, now: DateTime<Utc>) -> Result<usize, ScheduleError> {
        let released = self.store.release_expired(now).await?;
        if released > 0 {
            debug!(released, "released expired leases");
        }
        let overdue = self
            .store
            .mark_overdue(now, Duration::seconds(PAST_GRACE_SECS))
            .await?;
        if overdue > 0 {
            debug!(overdue, "relabeled overdue entries");
        }

        let due = self
            .store
            .acquire_due(now, self.skew, &self.worker_id, self.lease, self.batch)
            .await?;
        let count = due.len();
        for entry in due {
            self.dispatch(entry, now).await;
        }
        Ok(count)
    }

    async fn dispatch(&self, entry: ScheduledEntry, now: DateTime<Utc>) {
        let Some(integration) = self.registry.get(entry.integration_id) else {
            let _ = self
                .store
                .mark_failed(entry.id, "integration no longer exists")
                .await;
            return;
        };

        let result = self
            .engine
            .deliver_direct(
                &integration,
                &entry.target_url,
                entry.http_method,
                &entry.payload,
                Some(entry.id),
                Some(entry.original_event_id),
            )
            .await;

        match result {
            Ok(_trace_id) => {
                let _ = self.store.mark_sent(entry.id).await;
                if let Some(recurring) = &entry.recurring {
                    self.advance_recurrence(&entry, recurring).await;
                }
            },
            Err(e)
                if (e.is_transient()
                    || matches!(e, sluice_error::DeliveryError::CircuitOpen { .. }))
                    && entry.attempt_count + 1 < self.max_attempts =>
            {
                let attempts = entry.attempt_count + 1;
                let delay = RetryPolicy::default().delay(attempts, None);
                let at = now
                    + Duration::from_std(delay).unwrap_or_else(|_| Duration::seconds(60));
                let _ = self.store.reschedule(entry.id, at, attempts).await;
            },
            Err(e) => {
                warn!(entry = %entry.id, error = %e, "scheduled dispatch failed terminally");
                let _ = self.store.mark_failed(entry.id, &e.to_string()).await;
            },
        }
    }

    /// On success, write the next occurrence of a recurring series.
    async fn advance_recurrence(&self, entry: &ScheduledEntry, recurring: &RecurringConfig) {
        let Some((at, k)) = recurring.next_occurrence() else {
            debug!(entry = %entry.id, "recurring series complete");
            return;
        };
        let next = ScheduledEntry {
            id: Uuid::new_v4(),
            scheduled_for: at,
            status: SchedStatus::Pending,
            attempt_count: 0,
            recurring: Some(RecurringConfig {
                occurrence: k,
                ..recurring.clone()
            }),
            leased_by: None,
            leased_until: None,
            created_at: Utc::now(),
            ..entry.clone()
        };
        if let Err(e) = self.store.insert(&next).await {
            warn!(entry = %entry.id, error = %e, "failed to write next occurrence");
        }
    }
}
