pub mod event_log;
pub mod memory;
pub mod redb_kv;

pub use event_log::{JsonlEventLog, MemoryEventLog};
pub use memory::MemoryStore;
pub use redb_kv::RedbStore;

use std::time::Duration;

/// Shared key-value store consumed by the lock, state, idempotency and
/// dead-letter managers. The compare-and-act primitives must be atomic;
/// both bundled implementations guarantee that (a single mutex for the
/// memory store, single-writer transactions for redb).
///
/// Absence of a shared store degrades the managers to process-local,
/// single-instance behavior.
#[async_trait::async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Set a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()>;

    /// Atomic set-if-absent-with-expiry. Returns true when the key was set.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> anyhow::Result<bool>;

    /// Reset a key's TTL. Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Returns true when the key existed.
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;

    /// Delete the key only if its current value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> anyhow::Result<bool>;

    /// Extend the key's TTL only if its current value equals `expected`.
    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> anyhow::Result<bool>;

    /// All live `(key, value)` pairs whose key starts with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, String)>>;
}
