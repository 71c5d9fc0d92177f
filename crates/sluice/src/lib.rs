#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Sluice - Multi-tenant Integration Gateway.
//!
//! Sluice receives business events from per-tenant sources (a MySQL
//! event-queue table by default), matches tenant-configured integration
//! rules, transforms payloads with declarative mappings or sandboxed
//! scripts, and delivers them to external HTTP endpoints with per-tenant
//! authentication, retry, dead-lettering, circuit breaking, scheduling
//! and failure alerting.
//!
//! This umbrella crate assembles the runtime from the subsystem crates:
//!
//! - [`sluice_core`] — domain model, matcher, templates, sandbox
//! - [`sluice_ingest`] — source polling, audit store, deduplication
//! - [`sluice_delivery`] — delivery engine, retry/DLQ, breaker, alerts
//! - [`sluice_sched`] — delayed and recurring delivery
//!
//! ```no_run
//! use sluice::{Gateway, GatewayConfig};
//!
//! # async fn boot() -> sluice_error::Result<()> {
//! let config = GatewayConfig::load(std::path::Path::new("sluice.toml"))?;
//! let gateway = Gateway::start(config).await?;
//! // ... load integrations into gateway.registry() ...
//! # gateway.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod gateway;

pub use config::{GatewayConfig, StorageBackend};
pub use gateway::Gateway;

pub use sluice_core as core;
pub use sluice_delivery as delivery;
pub use sluice_error as error;
pub use sluice_ingest as ingest;
pub use sluice_sched as sched;
