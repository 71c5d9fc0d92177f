//! Event-to-integration matcher.
//!
//! Maps events to applicable integrations using a hashmap index keyed by
//! event type, with a separate wildcard bucket. Wildcard matches are
//! appended after exact matches; within each bucket results are ordered by
//! `updated_at` descending for determinism. Tenant scope and exclusion
//! lists are applied per candidate.

use crate::event::GatewayEvent;
use crate::integration::{Direction, IntegrationConfig, TenantScope};
use std::collections::HashMap;

/// Index for event-to-integration matching
#[derive(Debug, Clone, Default)]
pub struct IntegrationMatcher {
    // event_type -> integrations, plus a separate wildcard bucket
    index:    HashMap<String, Vec<IntegrationConfig>>,
    wildcard: Vec<IntegrationConfig>,
}

impl IntegrationMatcher {
    /// Create an empty matcher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a matcher from a set of integrations.
    ///
    /// Inactive and non-outbound integrations are indexed too; they are
    /// filtered at match time so the matcher can also serve admin lookups.
    #[must_use]
    pub fn build(integrations: Vec<IntegrationConfig>) -> Self {
        let mut matcher = Self::new();
        for integration in integrations {
            matcher.add(integration);
        }
        matcher
    }

    /// Add a single integration to the index.
    pub fn add(&mut self, integration: IntegrationConfig) {
        if integration.is_wildcard() {
            insert_sorted(&mut self.wildcard, integration);
        } else {
            let bucket = self.index.entry(integration.event_type.clone()).or_default();
            insert_sorted(bucket, integration);
        }
    }

    /// Find all integrations applicable to an event.
    ///
    /// Returns outbound, active integrations whose event type matches
    /// (exact matches first, then wildcards) and whose tenant scope admits
    /// the event.
    #[must_use]
    pub fn find_matches(&self, event: &GatewayEvent) -> Vec<&IntegrationConfig> {
        let mut results = Vec::new();

        if let Some(bucket) = self.index.get(&event.event_type) {
            results.extend(bucket.iter().filter(|i| Self::applies(i, event)));
        }
        results.extend(self.wildcard.iter().filter(|i| Self::applies(i, event)));

        results
    }

    fn applies(integration: &IntegrationConfig, event: &GatewayEvent) -> bool {
        if integration.direction != Direction::Outbound || !integration.is_active {
            return false;
        }

        match integration.scope {
            TenantScope::EntityOnly => integration.org_unit_id == event.org_unit_id,
            TenantScope::IncludeChildren => {
                integration.org_id == event.org_id
                    && event
                        .org_unit_id
                        .is_none_or(|unit| !integration.excluded_org_unit_ids.contains(&unit))
            },
        }
    }

    /// Total number of indexed integrations
    #[must_use]
    pub fn integration_count(&self) -> usize {
        self.index.values().map(Vec::len).sum::<usize>() + self.wildcard.len()
    }

    /// Number of distinct exact event types indexed
    #[must_use]
    pub fn event_type_count(&self) -> usize {
        self.index.len()
    }

    /// Clear the index
    pub fn clear(&mut self) {
        self.index.clear();
        self.wildcard.clear();
    }
}

// Keeps each bucket ordered by updated_at DESC so lookups are deterministic.
fn insert_sorted(bucket: &mut Vec<IntegrationConfig>, integration: IntegrationConfig) {
    let pos = bucket
        .iter()
        .position(|existing| existing.updated_at < integration.updated_at)
        .unwrap_or(bucket.len());
    bucket.insert(pos, integration);
}
