#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Sluice event ingestion.
//!
//! Pulls rows from per-tenant event sources (MySQL queue tables by
//! default), normalizes them into gateway events, and guarantees
//! exactly-once recording through the audit store's idempotent insert:
//!
//! ```text
//! MySQL event queue
//!     │
//!     ↓ cursor-based polling (SourcePoller)
//! normalize + LRU dedup short-circuit
//!     │
//!     ↓ EventAuditStore::try_insert (unique on dedup key)
//! accepted events → mpsc channel → delivery pipeline
//! ```
//!
//! Checkpoints advance only after the audit store accepted a batch, so a
//! crash between poll and insert replays rows that the unique insert then
//! refuses — at-most-once recording with no lost rows.

pub mod audit;
pub mod checkpoint;
pub mod dedup;
pub mod poller;
pub mod source;

pub use audit::{AuditRecord, EventAuditStore, InsertOutcome, MemoryAuditStore, MySqlAuditStore};
pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, MySqlCheckpointStore};
pub use dedup::{DedupStats, Deduplicator};
pub use poller::{MySqlSourceBackend, PoisonRow, SourceBackend, SourcePoller, SourceRow};
pub use source::{ColumnMapping, SourceConfig};
