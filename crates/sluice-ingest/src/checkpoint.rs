//! Durable source checkpoints for crash-safe polling.
//!
//! A checkpoint records the last processed row id per (source, org).
//! Saves never move a checkpoint backwards; recovery resumes strictly
//! after the last accepted row.

use async_trait::async_trait;
use dashmap::DashMap;
use sluice_error::IngestError;
use sqlx::mysql::MySqlPool;

/// Abstraction for durable checkpoint storage.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for a (source, org) stream.
    ///
    /// Returns `None` when the stream has never been polled.
    async fn load(&self, source: &str, org_id: i64) -> Result<Option<i64>, IngestError>;

    /// Persist the checkpoint. Implementations must keep the stored value
    /// non-decreasing: a save below the current value is a no-op.
    async fn save(&self, source: &str, org_id: i64, last_processed_id: i64)
        -> Result<(), IngestError>;

    /// Delete the checkpoint (reset the stream to the beginning).
    async fn delete(&self, source: &str, org_id: i64) -> Result<(), IngestError>;
}

/// In-memory checkpoint store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    cursors: DashMap<(String, i64), i64>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, source: &str, org_id: i64) -> Result<Option<i64>, IngestError> {
        Ok(self
            .cursors
            .get(&(source.to_string(), org_id))
            .map(|entry| *entry))
    }

    async fn save(
        &self,
        source: &str,
        org_id: i64,
        last_processed_id: i64,
    ) -> Result<(), IngestError> {
        self.cursors
            .entry((source.to_string(), org_id))
            .and_modify(|current| *current = (*current).max(last_processed_id))
            .or_insert(last_processed_id);
        Ok(())
    }

    async fn delete(&self, source: &str, org_id: i64) -> Result<(), IngestError> {
        self.cursors.remove(&(source.to_string(), org_id));
        Ok(())
    }
}

/// MySQL-backed checkpoint store.
///
/// Uses UPSERT with `GREATEST` so concurrent pollers can never move a
/// checkpoint backwards.
#[derive(Clone)]
pub struct MySqlCheckpointStore {
    pool: MySqlPool,
}

impl MySqlCheckpointStore {
    /// Create a store over the given pool.
    #[must_use]
    pub const fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for MySqlCheckpointStore {
    async fn load(&self, source: &str, org_id: i64) -> Result<Option<i64>, IngestError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT last_processed_id FROM sluice_source_checkpoint \
             WHERE source_name = ? AND org_id = ?",
        )
        .bind(source)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    async fn save(
        &self,
        source: &str,
        org_id: i64,
        last_processed_id: i64,
    ) -> Result<(), IngestError> {
        sqlx::query(
            r"
            INSERT INTO sluice_source_checkpoint
                (source_name, org_id, last_processed_id, last_processed_at)
            VALUES (?, ?, ?, NOW())
            ON DUPLICATE KEY UPDATE
                last_processed_id = GREATEST(last_processed_id, VALUES(last_processed_id)),
                last_processed_at = NOW()
            ",
        )
        .bind(source)
        .bind(org_id)
        .bind(last_processed_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, source: &str, org_id: i64) -> Result<(), IngestError> {
        sqlx::query("DELETE FROM sluice_source_checkpoint WHERE source_name = ? AND org_id = ?")
            .bind(source)
            .bind(org_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryCheckpointStore::new();
        assert_eq!(store.load("queue", 100).await.unwrap(), None);

        store.save("queue", 100, 42).await.unwrap();
        assert_eq!(store.load("queue", 100).await.unwrap(), Some(42));

        store.delete("queue", 100).await.unwrap();
        assert_eq!(store.load("queue", 100).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store_is_monotonic() {
        let store = MemoryCheckpointStore::new();
        store.save("queue", 100, 42).await.unwrap();
        store.save("queue", 100, 17).await.unwrap();
        assert_eq!(store.load("queue", 100).await.unwrap(), Some(42));

        store.save("queue", 100, 50).await.unwrap();
        assert_eq!(store.load("queue", 100).await.unwrap(), Some(50));
    }

    #[tokio::test]
    async fn test_memory_store_streams_are_independent() {
        let store = MemoryCheckpointStore::new();
        store.save("queue", 100, 10).await.unwrap();
        store.save("queue", 200, 20).await.unwrap();
        store.save("other", 100, 30).await.unwrap();

        assert_eq!(store.load("queue", 100).await.unwrap(), Some(10));
        assert_eq!(store.load("queue", 200).await.unwrap(), Some(20));
        assert_eq!(store.load("other", 100).await.unwrap(), Some(30));
    }
}
