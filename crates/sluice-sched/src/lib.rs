#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Sluice scheduling.
//!
//! DELAYED and RECURRING integrations are driven by a deterministic
//! scheduling-script evaluator plus a tick worker:
//!
//! ```text
//! event + DELAYED/RECURRING integration
//!     ↓ sandboxed scheduling script (pinned clock)
//! ScheduledEntry(PENDING, scheduled_for) persisted
//!     ↓ worker tick: lease PENDING rows due within the skew window
//! DeliveryEngine::deliver_direct (stored payload, stored endpoint)
//!     ↓ SENT | reschedule with backoff | FAILED
//! recurring series: next occurrence written on success only
//! ```
//!
//! Leases make dispatch exactly-once across workers and restarts; the
//! janitor releases expired leases and relabels long-pending entries
//! `OVERDUE`.

pub mod entry;
pub mod evaluator;
pub mod store;
pub mod worker;

pub use entry::{
    CancellationInfo, RecurringConfig, SchedStatus, ScheduleDecision, ScheduledEntry,
};
pub use evaluator::ScheduleEvaluator;
pub use store::{MemoryScheduleStore, MySqlScheduleStore, ScheduleStore};
pub use worker::{Scheduler, SchedulerWorker};
