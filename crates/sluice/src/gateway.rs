//! Runtime assembly: wires pools, stores, registries and workers, and
//! owns the graceful-shutdown lifecycle.

use crate::config::{GatewayConfig, StorageBackend};
use chrono::Utc;
use sluice_core::event::GatewayEvent;
use sluice_core::integration::DeliveryMode;
use sluice_core::registry::IntegrationRegistry;
use sluice_core::trace::TraceStatus;
use sluice_core::EventStatus;
use sluice_delivery::alert::AlertDispatcher;
use sluice_delivery::breaker::{BreakerConfig, CircuitBreakerRegistry};
use sluice_delivery::dlq::{DlqWorker, MemoryDlqStore, MySqlDlqStore};
use sluice_delivery::engine::{DeliveryEngine, EnginePolicy};
use sluice_delivery::logger::{
    ExecutionLogger, MemoryAttemptStore, MemoryTraceStore, MySqlAttemptStore, MySqlTraceStore,
};
use sluice_delivery::url_policy::UrlPolicy;
use sluice_delivery::DlqStore;
use sluice_ingest::{
    CheckpointStore, Deduplicator, EventAuditStore, MemoryAuditStore, MemoryCheckpointStore,
    MySqlAuditStore, MySqlCheckpointStore, MySqlSourceBackend, SourcePoller,
};
use sluice_sched::{
    MemoryScheduleStore, MySqlScheduleStore, ScheduleStore, Scheduler, SchedulerWorker,
};
use sluice_error::{GatewayError, Result};
use sqlx::mysql::MySqlPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Channel capacity between the pollers and the delivery workers
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The assembled gateway runtime
pub struct Gateway {
    registry:    Arc<IntegrationRegistry>,
    engine:      Arc<DeliveryEngine>,
    audit:       Arc<dyn EventAuditStore>,
    scheduler:   Arc<Scheduler>,
    shutdown_tx: broadcast::Sender<()>,
    tasks:       Vec<JoinHandle<()>>,
    grace:       Duration,
}

impl Gateway {
    /// Boot the gateway from its configuration. Spawns the source
    /// pollers, delivery workers, DLQ worker, scheduler worker, alert
    /// ticker and janitors.
    pub async fn start(config: GatewayConfig) -> Result<Self> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| GatewayError::Internal {
                reason: format!("HTTP client construction failed: {e}"),
            })?;

        // Shared persistence
        let pool = match config.gateway.storage {
            StorageBackend::Mysql => Some(
                MySqlPoolOptions::new()
                    .max_connections(config.database.max_connections)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect(&config.database_url())
                    .await?,
            ),
            StorageBackend::Memory => None,
        };

        let (audit, checkpoints, dlq_store, schedule_store, trace_store, attempt_store): (
            Arc<dyn EventAuditStore>,
            Arc<dyn CheckpointStore>,
            Arc<dyn DlqStore>,
            Arc<dyn ScheduleStore>,
            Arc<dyn sluice_delivery::TraceStore>,
            Arc<dyn sluice_delivery::AttemptStore>,
        ) = match &pool {
            Some(pool) => (
                Arc::new(MySqlAuditStore::new(pool.clone())),
                Arc::new(MySqlCheckpointStore::new(pool.clone())),
                Arc::new(MySqlDlqStore::new(pool.clone())),
                Arc::new(MySqlScheduleStore::new(pool.clone())),
                Arc::new(MySqlTraceStore::new(pool.clone())),
                Arc::new(MySqlAttemptStore::new(pool.clone())),
            ),
            None => (
                Arc::new(MemoryAuditStore::new()),
                Arc::new(MemoryCheckpointStore::new()),
                Arc::new(MemoryDlqStore::new()),
                Arc::new(MemoryScheduleStore::new()),
                Arc::new(MemoryTraceStore::new()),
                Arc::new(MemoryAttemptStore::new()),
            ),
        };

        let registry = Arc::new(IntegrationRegistry::new());
        let mut dispatcher = AlertDispatcher::new(config.gateway.dashboard_url.clone())
            .with_window(chrono::Duration::minutes(config.alerts.window_minutes as i64));
        if let Some(channel) = &config.alerts.channel {
            dispatcher.configure_channel(
                channel,
                sluice_delivery::ChannelConfig {
                    recipients: config.alerts.recipients.clone(),
                    settings:   serde_json::Value::Null,
                },
            );
        }
        let alerts = Arc::new(dispatcher);

        let breakers = CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold:      config.breaker.failure_threshold,
            cooldown:               chrono::Duration::seconds(config.breaker.cooldown_secs as i64),
            auto_disable_threshold: config.breaker.auto_disable_threshold,
        });

        let url_policy = if config.gateway.allow_insecure_urls {
            UrlPolicy::permissive()
        } else {
            UrlPolicy::strict()
        };

        let engine = Arc::new(
            DeliveryEngine::new(
                http,
                registry.clone(),
                ExecutionLogger::new(trace_store),
                attempt_store,
                dlq_store.clone(),
                breakers,
                EnginePolicy {
                    url_policy,
                    ..EnginePolicy::default()
                },
            )
            .with_alerts(alerts.clone()),
        );

        let scheduler = Arc::new(Scheduler::new(schedule_store.clone()));

        let (shutdown_tx, _) = broadcast::channel(4);
        let (events_tx, events_rx) = mpsc::channel::<GatewayEvent>(EVENT_CHANNEL_CAPACITY);
        let mut tasks = Vec::new();

        // One poller task per configured source
        let dedup = Arc::new(Deduplicator::default());
        for source in &config.sources {
            let Some(pool) = &pool else {
                warn!(
                    source = %source.name,
                    "memory storage has no SQL pool; source poller not started"
                );
                continue;
            };
            let backend = Arc::new(MySqlSourceBackend::new(pool.clone(), source.clone()));
            let poller = SourcePoller::new(
                backend,
                audit.clone(),
                dedup.clone(),
                checkpoints.clone(),
                source.clone(),
                events_tx.clone(),
            );
            let shutdown_rx = shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = poller.run_with_shutdown(shutdown_rx).await {
                    warn!(error = %e, "source poller exited with error");
                }
            }));
        }
        drop(events_tx);

        // Delivery dispatch loop with a bounded worker pool
        let worker_count = config.gateway.worker_count.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(4, |n| n.get() * 2)
        });
        tasks.push(tokio::spawn(dispatch_loop(
            events_rx,
            registry.clone(),
            engine.clone(),
            scheduler.clone(),
            audit.clone(),
            worker_count,
        )));

        // DLQ replay ticker
        let dlq_worker = DlqWorker::new(dlq_store, engine.clone(), registry.clone())
            .with_tick(Duration::from_secs(config.dlq.tick_secs));
        let shutdown_rx = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            dlq_worker.run_with_shutdown(shutdown_rx).await;
        }));

        // Scheduler dispatch ticker
        let sched_worker = SchedulerWorker::new(schedule_store, engine.clone(), registry.clone())
            .with_tick(Duration::from_secs(config.scheduler.tick_secs));
        let shutdown_rx = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            sched_worker.run_with_shutdown(shutdown_rx).await;
        }));

        // Alert flush ticker
        let alert_handle = alerts.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            alert_handle
                .run_with_shutdown(Duration::from_secs(60), shutdown_rx)
                .await;
        }));

        // Stuck-event janitor
        let janitor_audit = audit.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {},
                    _ = shutdown_rx.recv() => return,
                }
                match janitor_audit
                    .sweep_stuck(Utc::now(), chrono::Duration::minutes(10))
                    .await
                {
                    Ok(0) => {},
                    Ok(n) => warn!(count = n, "flagged stuck events"),
                    Err(e) => warn!(error = %e, "stuck sweep failed"),
                }
            }
        }));

        info!(
            sources = config.sources.len(),
            workers = worker_count,
            "gateway started"
        );

        Ok(Self {
            registry,
            engine,
            audit,
            scheduler,
            shutdown_tx,
            tasks,
            grace: Duration::from_secs(config.gateway.shutdown_grace_secs),
        })
    }

    /// The integration registry, for loading configurations at boot and
    /// applying management-plane updates.
    #[must_use]
    pub fn registry(&self) -> Arc<IntegrationRegistry> {
        self.registry.clone()
    }

    /// The delivery engine (operational surfaces: breaker snapshots).
    #[must_use]
    pub fn engine(&self) -> Arc<DeliveryEngine> {
        self.engine.clone()
    }

    /// The scheduler front door (cancellation API).
    #[must_use]
    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    /// The audit store (operational lookups).
    #[must_use]
    pub fn audit(&self) -> Arc<dyn EventAuditStore> {
        self.audit.clone()
    }

    /// Graceful shutdown: stop accepting work, then wait up to the drain
    /// window for in-flight tasks before aborting them.
    pub async fn shutdown(self) {
        info!("gateway shutting down");
        let _ = self.shutdown_tx.send(());

        let drain = async {
            for task in self.tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(self.grace, drain).await.is_err() {
            warn!("drain window elapsed; aborting remaining tasks");
        }
        info!("gateway stopped");
    }
}

/// Pulls events off the channel and processes each under a concurrency
/// cap. Matching, scheduling and delivery happen here.
async fn dispatch_loop(
    mut events_rx: mpsc::Receiver<GatewayEvent>,
    registry: Arc<IntegrationRegistry>,
    engine: Arc<DeliveryEngine>,
    scheduler: Arc<Scheduler>,
    audit: Arc<dyn EventAuditStore>,
    worker_count: usize,
) {
    let semaphore = Arc::new(Semaphore::new(worker_count.max(1)));
    while let Some(event) = events_rx.recv().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            return;
        };
        let registry = registry.clone();
        let engine = engine.clone();
        let scheduler = scheduler.clone();
        let audit = audit.clone();
        tokio::spawn(async move {
            process_event(&event, &registry, &engine, &scheduler, audit.as_ref()).await;
            drop(permit);
        });
    }
}

/// Process one event end to end: match, deliver or schedule, and record
/// the terminal audit status.
async fn process_event(
    event: &GatewayEvent,
    registry: &IntegrationRegistry,
    engine: &DeliveryEngine,
    scheduler: &Scheduler,
    audit: &dyn EventAuditStore,
) {
    let _ = audit
        .transition(event.event_id, EventStatus::Processing, None)
        .await;

    let matcher = registry.build_matcher();
    let matches = matcher.find_matches(event);
    if matches.is_empty() {
        let _ = audit
            .transition(
                event.event_id,
                EventStatus::Skipped,
                Some("no matching integrations".to_string()),
            )
            .await;
        return;
    }

    let mut delivered = 0u32;
    let mut failed = 0u32;
    for integration in matches {
        match integration.delivery_mode {
            DeliveryMode::Immediate => {
                let outcome = engine.deliver_event(event, integration).await;
                match outcome.status {
                    TraceStatus::Success => delivered += 1,
                    TraceStatus::Failed => failed += 1,
                    _ => {},
                }
            },
            DeliveryMode::Delayed | DeliveryMode::Recurring => {
                match scheduler.schedule_event(event, integration, Utc::now()).await {
                    Ok(_) => delivered += 1,
                    Err(e) => {
                        warn!(
                            integration = %integration.id,
                            error = %e,
                            "scheduling failed"
                        );
                        failed += 1;
                    },
                }
            },
        }
    }

    let (status, details) = if failed == 0 && delivered > 0 {
        (EventStatus::Delivered, None)
    } else if delivered == 0 && failed > 0 {
        (EventStatus::Failed, Some(format!("{failed} integration(s) failed")))
    } else if delivered > 0 {
        (
            EventStatus::Delivered,
            Some(format!("{delivered} delivered, {failed} failed")),
        )
    } else {
        (EventStatus::Skipped, Some("all integrations skipped".to_string()))
    };
    let _ = audit.transition(event.event_id, status, details).await;
}
