#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Sluice delivery engine.
//!
//! Takes matched (event, integration) pairs and drives them to external
//! endpoints:
//!
//! ```text
//! event + integration
//!     ├─ circuit check (per-integration breaker)
//!     ├─ per action: condition → transform → URL policy → auth → sign
//!     ├─ HTTP attempt loop (timeout, classification, backoff + jitter)
//!     ├─ execution trace + delivery attempts (best-effort logging)
//!     └─ failures → DLQ (+ alert aggregation, auto-disable policy)
//! ```
//!
//! The DLQ ticker replays due entries; manual replay links fresh traces
//! to the original via `parent_trace_id`.

pub mod alert;
pub mod auth;
pub mod breaker;
pub mod classify;
pub mod dlq;
pub mod engine;
pub mod logger;
pub mod retry;
pub mod signing;
pub mod url_policy;

pub use alert::{AlertChannel, AlertDigest, AlertDispatcher, AlertLog, AlertStatus, ChannelConfig};
pub use auth::{AuthResolver, ResolvedAuth};
pub use breaker::{
    BreakerConfig, BreakerDecision, BreakerSnapshot, BreakerState, CircuitBreakerRegistry,
};
pub use classify::{classify_status, Disposition};
pub use dlq::{DlqEntry, DlqStats, DlqStatus, DlqStore, DlqWorker, MemoryDlqStore, MySqlDlqStore};
pub use engine::{ActionOutcome, DeliveryEngine, DeliveryOutcome, EnginePolicy};
pub use logger::{
    AttemptStore, ExecutionLogger, MemoryAttemptStore, MemoryTraceStore, MySqlAttemptStore,
    MySqlTraceStore, TraceStore,
};
pub use retry::RetryPolicy;
pub use url_policy::UrlPolicy;
