//! Gateway configuration, loaded from TOML.

use serde::{Deserialize, Serialize};
use sluice_error::ConfigError;
use sluice_ingest::SourceConfig;
use std::path::Path;

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process-local stores; state is lost on restart
    Memory,
    /// MySQL-backed stores (default)
    #[default]
    Mysql,
}

/// Top-level gateway section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    /// Base URL used in alert dashboard links
    #[serde(default = "default_dashboard_url")]
    pub dashboard_url:       String,
    /// Allow plain HTTP and private endpoints (local development)
    #[serde(default)]
    pub allow_insecure_urls: bool,
    /// Delivery worker concurrency; defaults to 2x the CPU count
    #[serde(default)]
    pub worker_count:        Option<usize>,
    /// Graceful-shutdown drain window in seconds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Storage backend for audit/DLQ/schedule/log stores
    #[serde(default)]
    pub storage:             StorageBackend,
}

fn default_dashboard_url() -> String {
    "http://localhost:3000".to_string()
}

const fn default_shutdown_grace() -> u64 {
    30
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            dashboard_url:       default_dashboard_url(),
            allow_insecure_urls: false,
            worker_count:        None,
            shutdown_grace_secs: default_shutdown_grace(),
            storage:             StorageBackend::default(),
        }
    }
}

/// Database section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// Connection URL; `{{env.NAME}}` tokens are substituted
    #[serde(default)]
    pub url:             String,
    /// Shared pool size
    #[serde(default = "default_pool_size")]
    pub max_connections: u32,
}

const fn default_pool_size() -> u32 {
    10
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url:             String::new(),
            max_connections: default_pool_size(),
        }
    }
}

/// Circuit breaker knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSection {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold:      u32,
    /// Cooldown in seconds before a half-open probe
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs:          u64,
    /// Consecutive failures before auto-disable
    #[serde(default = "default_auto_disable")]
    pub auto_disable_threshold: u32,
}

const fn default_failure_threshold() -> u32 {
    10
}

const fn default_cooldown_secs() -> u64 {
    300
}

const fn default_auto_disable() -> u32 {
    50
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold:      default_failure_threshold(),
            cooldown_secs:          default_cooldown_secs(),
            auto_disable_threshold: default_auto_disable(),
        }
    }
}

/// Worker cadence knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerSection {
    /// Tick interval in seconds
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

const fn default_tick_secs() -> u64 {
    30
}

impl Default for TickerSection {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
        }
    }
}

/// Alerting section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSection {
    /// Active channel key (`channel:provider`), e.g. `"EMAIL:SMTP"`
    #[serde(default)]
    pub channel:        Option<String>,
    /// Recipients handed to the channel adapter
    #[serde(default)]
    pub recipients:     Vec<String>,
    /// Aggregation window in minutes
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u64,
}

const fn default_window_minutes() -> u64 {
    60
}

impl Default for AlertSection {
    fn default() -> Self {
        Self {
            channel:        None,
            recipients:     Vec::new(),
            window_minutes: default_window_minutes(),
        }
    }
}

/// Full gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway-wide settings
    #[serde(default)]
    pub gateway:   GatewaySection,
    /// Shared database
    #[serde(default)]
    pub database:  DatabaseSection,
    /// Polled event sources
    #[serde(default)]
    pub sources:   Vec<SourceConfig>,
    /// Circuit breaker settings
    #[serde(default)]
    pub breaker:   BreakerSection,
    /// DLQ worker cadence
    #[serde(default)]
    pub dlq:       TickerSection,
    /// Scheduler worker cadence
    #[serde(default)]
    pub scheduler: TickerSection,
    /// Alerting
    #[serde(default)]
    pub alerts:    AlertSection,
}

impl GatewayConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path:   path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.storage == StorageBackend::Mysql && self.database.url.is_empty() {
            return Err(ConfigError::missing("database.url", "mysql storage"));
        }
        for source in &self.sources {
            source.validate()?;
        }
        if self.gateway.shutdown_grace_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "shutdown_grace_secs must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// Database URL with environment tokens substituted.
    ///
    /// Substitution here is uniform with the rest of the templating
    /// surface: both `{{env.*}}` and `{{config.*}}` forms are honored
    /// (config tokens resolve to nothing at boot and pass through).
    #[must_use]
    pub fn database_url(&self) -> String {
        substitute_env(&self.database.url)
    }
}

/// Replace `{{env.NAME}}` tokens from the process environment. Unknown
/// tokens pass through verbatim.
#[must_use]
pub fn substitute_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{env.") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 6..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        out.push_str("{{env.");
                        out.push_str(&after[..end]);
                        out.push_str("}}");
                    },
                }
                rest = &after[end + 2..];
            },
            None => {
                out.push_str(&rest[start..]);
                return out;
            },
        }
    }
    out.push_str(rest);
    out
}
