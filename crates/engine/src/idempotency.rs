use crate::storage::SharedStore;
use crate::types::ExecutionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle of an idempotency record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    InFlight,
    Completed,
}

/// Stored record for one idempotency key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub status: IdempotencyStatus,
    pub execution_id: ExecutionId,
    pub response: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Result of claiming an idempotency key
#[derive(Debug, Clone)]
pub enum BeginOutcome {
    /// First sight of the key; the caller owns the execution.
    Started,
    /// The key was seen before; the stored record is returned.
    Duplicate(IdempotencyRecord),
}

/// Deduplicates repeated trigger calls sharing an idempotency key.
///
/// `begin` atomically records an in-flight placeholder on first sight; every
/// run that began must end with `complete` (or `abandon` if it never started)
/// so later duplicates observe a terminal result instead of a stuck
/// placeholder.
pub struct IdempotencyManager {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
}

impl IdempotencyManager {
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Keys are digested so arbitrary caller-supplied tokens map into a flat,
    /// fixed-width keyspace.
    fn store_key(key: &str) -> String {
        let digest = Sha256::digest(key.as_bytes());
        format!("idempotency:{}", hex::encode(digest))
    }

    /// Claim a key. Returns `Started` on first sight within the TTL,
    /// `Duplicate` with the stored record otherwise.
    pub async fn begin(
        &self,
        key: &str,
        execution_id: ExecutionId,
    ) -> anyhow::Result<BeginOutcome> {
        let store_key = Self::store_key(key);
        let placeholder = IdempotencyRecord {
            status: IdempotencyStatus::InFlight,
            execution_id,
            response: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&placeholder)?;

        // Two rounds cover the race where the previous record expires between
        // the failed set and the read.
        for _ in 0..2 {
            if self
                .store
                .set_if_absent(&store_key, &json, Some(self.ttl))
                .await?
            {
                return Ok(BeginOutcome::Started);
            }
            if let Some(raw) = self.store.get(&store_key).await? {
                let record: IdempotencyRecord = serde_json::from_str(&raw)?;
                return Ok(BeginOutcome::Duplicate(record));
            }
        }
        Ok(BeginOutcome::Started)
    }

    /// Store the terminal success/failure payload for the key so duplicates
    /// see the finished result.
    pub async fn complete(
        &self,
        key: &str,
        execution_id: ExecutionId,
        response: Value,
    ) -> anyhow::Result<()> {
        let record = IdempotencyRecord {
            status: IdempotencyStatus::Completed,
            execution_id,
            response: Some(response),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&record)?;
        self.store
            .set(&Self::store_key(key), &json, Some(self.ttl))
            .await
    }

    /// Drop the placeholder for a run that never started (e.g. the execution
    /// lock was busy), so a later retry is not stuck behind it.
    pub async fn abandon(&self, key: &str) -> anyhow::Result<()> {
        self.store.delete(&Self::store_key(key)).await?;
        Ok(())
    }
}
