//! Process-wide integration registry.
//!
//! Holds the active integration configurations keyed by id. The registry
//! is initialized at boot, refreshed by the management plane, and read by
//! the delivery engine, DLQ worker and scheduler. Auto-disable (circuit
//! breaker policy) flips `is_active` here.

use crate::integration::{Direction, IntegrationConfig};
use crate::matcher::IntegrationMatcher;
use dashmap::DashMap;
use uuid::Uuid;

/// In-memory integration registry
#[derive(Debug, Default)]
pub struct IntegrationRegistry {
    configs: DashMap<Uuid, IntegrationConfig>,
}

impl IntegrationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a set of configurations, replacing entries with the same id.
    pub fn load(&self, integrations: Vec<IntegrationConfig>) {
        for integration in integrations {
            self.configs.insert(integration.id, integration);
        }
    }

    /// Insert or replace one configuration.
    pub fn upsert(&self, integration: IntegrationConfig) {
        self.configs.insert(integration.id, integration);
    }

    /// Fetch a configuration by id.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<IntegrationConfig> {
        self.configs.get(&id).map(|entry| entry.clone())
    }

    /// Remove a configuration.
    pub fn remove(&self, id: Uuid) {
        self.configs.remove(&id);
    }

    /// Flip the active flag; returns false when the id is unknown.
    pub fn set_active(&self, id: Uuid, is_active: bool) -> bool {
        match self.configs.get_mut(&id) {
            Some(mut entry) => {
                entry.is_active = is_active;
                true
            },
            None => false,
        }
    }

    /// Build a matcher over the current outbound configurations.
    #[must_use]
    pub fn build_matcher(&self) -> IntegrationMatcher {
        IntegrationMatcher::build(
            self.configs
                .iter()
                .filter(|entry| entry.direction == Direction::Outbound)
                .map(|entry| entry.clone())
                .collect(),
        )
    }

    /// Number of registered integrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::tests::minimal;

    #[test]
    fn test_load_get_and_remove() {
        let registry = IntegrationRegistry::new();
        let config = minimal("ORDER_CREATED");
        let id = config.id;
        registry.load(vec![config]);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(id).map(|c| c.name), Some("erp-sync".to_string()));

        registry.remove(id);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_set_active() {
        let registry = IntegrationRegistry::new();
        let config = minimal("ORDER_CREATED");
        let id = config.id;
        registry.upsert(config);

        assert!(registry.set_active(id, false));
        assert_eq!(registry.get(id).map(|c| c.is_active), Some(false));
        assert!(!registry.set_active(Uuid::new_v4(), false));
    }

    #[test]
    fn test_build_matcher_filters_outbound() {
        let registry = IntegrationRegistry::new();
        let outbound = minimal("ORDER_CREATED");
        let mut scheduled = minimal("ORDER_CREATED");
        scheduled.direction = Direction::Scheduled;
        registry.load(vec![outbound, scheduled]);

        let matcher = registry.build_matcher();
        assert_eq!(matcher.integration_count(), 1);
    }
}
