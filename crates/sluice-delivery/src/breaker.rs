//! Per-integration circuit breaker.
//!
//! Counts consecutive failures per integration. At the threshold the
//! circuit opens and deliveries short-circuit until the cooldown passes;
//! the first call after cooldown runs as a half-open probe. A success
//! closes the circuit and resets the counter, a failure re-opens it.
//! Past the auto-disable threshold the integration itself is switched
//! off and an alert is emitted.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Breaker state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Normal operation
    Closed,
    /// Short-circuiting until the cooldown passes
    Open,
    /// One probe in flight after cooldown
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker configuration
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold:      u32,
    /// How long the circuit stays open before a probe
    pub cooldown:               Duration,
    /// Consecutive failures before the integration is auto-disabled
    pub auto_disable_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold:      10,
            cooldown:               Duration::minutes(5),
            auto_disable_threshold: 50,
        }
    }
}

/// Decision for an incoming delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Proceed normally
    Allow,
    /// Proceed as the half-open probe
    Probe,
    /// Short-circuit; retry no earlier than `next_probe_at`
    ShortCircuit {
        /// When the next probe becomes possible
        next_probe_at: DateTime<Utc>,
    },
}

/// Outcome of recording a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Consecutive failure count after this failure
    pub consecutive_failures: u32,
    /// The circuit transitioned to open on this failure
    pub opened:               bool,
    /// The auto-disable threshold was crossed on this failure
    pub auto_disable:         bool,
}

#[derive(Debug, Clone, Copy)]
struct Cell {
    state:                BreakerState,
    consecutive_failures: u32,
    opened_at:            Option<DateTime<Utc>>,
    next_probe_at:        Option<DateTime<Utc>>,
}

impl Cell {
    const fn new() -> Self {
        Self {
            state:                BreakerState::Closed,
            consecutive_failures: 0,
            opened_at:            None,
            next_probe_at:        None,
        }
    }
}

/// Snapshot of one breaker for operational listings
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Integration id
    pub integration_id:       Uuid,
    /// Current state
    pub state:                BreakerState,
    /// Consecutive failures
    pub consecutive_failures: u32,
    /// When the circuit opened, when open
    pub opened_at:            Option<DateTime<Utc>>,
    /// When the next probe becomes possible
    pub next_probe_at:        Option<DateTime<Utc>>,
}

/// Registry of circuit breakers keyed by integration id
pub struct CircuitBreakerRegistry {
    cells:  DashMap<Uuid, Cell>,
    config: BreakerConfig,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    /// Create a registry with the given configuration.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            cells: DashMap::new(),
            config,
        }
    }

    /// Consult the breaker before a delivery.
    pub fn check(&self, integration_id: Uuid, now: DateTime<Utc>) -> BreakerDecision {
        let mut cell = self.cells.entry(integration_id).or_insert_with(Cell::new);
        match cell.state {
            BreakerState::Closed => BreakerDecision::Allow,
            BreakerState::HalfOpen => {
                // A probe is already in flight; short-circuit until it
                // resolves.
                BreakerDecision::ShortCircuit {
                    next_probe_at: cell.next_probe_at.unwrap_or(now),
                }
            },
            BreakerState::Open => {
                let due = cell.next_probe_at.is_none_or(|at| now >= at);
                if due {
                    cell.state = BreakerState::HalfOpen;
                    BreakerDecision::Probe
                } else {
                    BreakerDecision::ShortCircuit {
                        next_probe_at: cell.next_probe_at.unwrap_or(now),
                    }
                }
            },
        }
    }

    /// Record a successful delivery: closes the circuit, resets counters.
    pub fn record_success(&self, integration_id: Uuid) {
        if let Some(mut cell) = self.cells.get_mut(&integration_id) {
            *cell = Cell::new();
        }
    }

    /// Record a failed delivery.
    pub fn record_failure(&self, integration_id: Uuid, now: DateTime<Utc>) -> FailureOutcome {
        let mut cell = self.cells.entry(integration_id).or_insert_with(Cell::new);
        cell.consecutive_failures = cell.consecutive_failures.saturating_add(1);

        let was_open = matches!(cell.state, BreakerState::Open);
        let should_open = match cell.state {
            BreakerState::Closed => cell.consecutive_failures >= self.config.failure_threshold,
            // A failed probe re-opens immediately
            BreakerState::HalfOpen => true,
            BreakerState::Open => true,
        };

        if should_open {
            cell.state = BreakerState::Open;
            if cell.opened_at.is_none() {
                cell.opened_at = Some(now);
            }
            cell.next_probe_at = Some(now + self.config.cooldown);
        }

        FailureOutcome {
            consecutive_failures: cell.consecutive_failures,
            opened:               should_open && !was_open,
            auto_disable:         cell.consecutive_failures == self.config.auto_disable_threshold,
        }
    }

    /// Snapshot all breakers for operational listings.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        self.cells
            .iter()
            .map(|entry| BreakerSnapshot {
                integration_id:       *entry.key(),
                state:                entry.state,
                consecutive_failures: entry.consecutive_failures,
                opened_at:            entry.opened_at,
                next_probe_at:        entry.next_probe_at,
            })
            .collect()
    }

    /// Drop breaker state for an integration (e.g. after reconfiguration).
    pub fn reset(&self, integration_id: Uuid) {
        self.cells.remove(&integration_id);
    }
}
