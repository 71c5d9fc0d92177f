//! Per-source polling configuration.

use serde::{Deserialize, Serialize};
use sluice_error::ConfigError;

/// Bounds: poll interval (seconds)
pub const POLL_INTERVAL_SECS: (u64, u64) = (1, 300);
/// Bounds: batch size
pub const BATCH_SIZE: (u32, u32) = (1, 100);
/// Bounds: DB timeout (seconds)
pub const DB_TIMEOUT_SECS: (u64, u64) = (1, 120);
/// Bounds: pool size
pub const POOL_SIZE: (u32, u32) = (1, 20);

/// Maps source-table columns onto the normalized event shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Monotonic row identifier, used for checkpointing
    pub id:          String,
    /// Parent tenant column
    pub org_id:      String,
    /// Leaf tenant column, when the table has one
    #[serde(default)]
    pub org_unit_id: Option<String>,
    /// Event type column
    pub event_type:  String,
    /// Payload column (JSON-serializable string/blob)
    pub payload:     String,
    /// Row timestamp column
    pub timestamp:   String,
}

impl ColumnMapping {
    /// Validate that every mapped column is a safe SQL identifier
    /// (letters, digits, underscore). The mapping is interpolated into
    /// queries, so this doubles as the injection guard.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut columns = vec![
            ("id", self.id.as_str()),
            ("org_id", self.org_id.as_str()),
            ("event_type", self.event_type.as_str()),
            ("payload", self.payload.as_str()),
            ("timestamp", self.timestamp.as_str()),
        ];
        if let Some(unit) = &self.org_unit_id {
            columns.push(("org_unit_id", unit.as_str()));
        }
        for (field, column) in columns {
            if !is_safe_identifier(column) {
                return Err(ConfigError::Invalid {
                    message: format!("column mapping '{field}' = '{column}' is not a plain identifier"),
                });
            }
        }
        Ok(())
    }
}

/// Whether a string is a plain SQL identifier.
#[must_use]
pub fn is_safe_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !s.chars().next().is_some_and(|c| c.is_ascii_digit())
}

/// Configuration of one polled event source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source name; part of every dedup key and checkpoint
    pub name:               String,
    /// Tenant this source belongs to
    pub org_id:             i64,
    /// Source table name
    pub table:              String,
    /// Column mapping
    pub column_mapping:     ColumnMapping,
    /// Poll interval in seconds (1-300)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Rows fetched per poll (1-100)
    #[serde(default = "default_batch_size")]
    pub batch_size:         u32,
    /// Per-query timeout in seconds (1-120)
    #[serde(default = "default_db_timeout")]
    pub db_timeout_secs:    u64,
    /// Connection pool size (1-20)
    #[serde(default = "default_pool_size")]
    pub pool_size:          u32,
    /// Use a dedicated pool instead of the shared one
    #[serde(default)]
    pub dedicated_pool:     bool,
    /// Connection string override; template tokens are substituted
    #[serde(default)]
    pub connection_string:  Option<String>,
}

const fn default_poll_interval() -> u64 {
    5
}

const fn default_batch_size() -> u32 {
    10
}

const fn default_db_timeout() -> u64 {
    30
}

const fn default_pool_size() -> u32 {
    5
}

impl SourceConfig {
    /// Validate all bounds and the column mapping.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::missing("name", "source"));
        }
        if !is_safe_identifier(&self.table) {
            return Err(ConfigError::Invalid {
                message: format!("table '{}' is not a plain identifier", self.table),
            });
        }
        check_bounds("poll_interval_secs", self.poll_interval_secs, POLL_INTERVAL_SECS)?;
        check_bounds("batch_size", u64::from(self.batch_size), (u64::from(BATCH_SIZE.0), u64::from(BATCH_SIZE.1)))?;
        check_bounds("db_timeout_secs", self.db_timeout_secs, DB_TIMEOUT_SECS)?;
        check_bounds("pool_size", u64::from(self.pool_size), (u64::from(POOL_SIZE.0), u64::from(POOL_SIZE.1)))?;
        self.column_mapping.validate()
    }
}

fn check_bounds(field: &str, value: u64, (min, max): (u64, u64)) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfBounds {
            field: field.to_string(),
            value: value as i64,
            min:   min as i64,
            max:   max as i64,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn mapping() -> ColumnMapping {
        ColumnMapping {
            id:          "id".to_string(),
            org_id:      "org_id".to_string(),
            org_unit_id: Some("org_unit_id".to_string()),
            event_type:  "event_type".to_string(),
            payload:     "payload".to_string(),
            timestamp:   "created_at".to_string(),
        }
    }

    pub(crate) fn config() -> SourceConfig {
        SourceConfig {
            name:               "orders-queue".to_string(),
            org_id:             100,
            table:              "event_queue".to_string(),
            column_mapping:     mapping(),
            poll_interval_secs: 5,
            batch_size:         10,
            db_timeout_secs:    30,
            pool_size:          5,
            dedicated_pool:     false,
            connection_string:  None,
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_bounds() {
        let mut c = config();
        c.poll_interval_secs = 0;
        assert!(c.validate().is_err());
        c.poll_interval_secs = 301;
        assert!(c.validate().is_err());
        c.poll_interval_secs = 300;
        assert!(c.validate().is_ok());

        let mut c = config();
        c.batch_size = 0;
        assert!(c.validate().is_err());
        c.batch_size = 101;
        assert!(c.validate().is_err());

        let mut c = config();
        c.pool_size = 21;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_identifier_guard() {
        assert!(is_safe_identifier("event_queue"));
        assert!(is_safe_identifier("tb_queue2"));
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("1table"));
        assert!(!is_safe_identifier("queue; DROP TABLE users"));
        assert!(!is_safe_identifier("a-b"));

        let mut c = config();
        c.column_mapping.payload = "payload`".to_string();
        assert!(c.validate().is_err());
    }
}
