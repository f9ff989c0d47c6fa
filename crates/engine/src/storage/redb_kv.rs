use super::SharedStore;
use anyhow::{Context, Result};
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Stored entry with an absolute wall-clock expiry so TTLs survive process
/// restarts.
#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    value: String,
    expires_at_ms: Option<i64>,
}

impl Entry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

fn expiry_ms(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|t| Utc::now().timestamp_millis() + t.as_millis() as i64)
}

/// File-backed shared-store implementation on redb. The database allows a
/// single writer at a time, which makes every compare-and-act method here
/// atomic: the read and the mutation happen inside one write transaction.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _table = write_txn
                .open_table(KV_TABLE)
                .context("Failed to open kv table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn read_entry(&self, key: &str) -> Result<Option<Entry>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(KV_TABLE).context("Failed to open table")?;
        let value = table.get(key).context("Failed to get key")?;
        match value {
            Some(guard) => {
                let entry: Entry = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize entry")?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    fn write_entry(&self, key: &str, entry: &Entry) -> Result<()> {
        let bytes = serde_json::to_vec(entry).context("Failed to serialize entry")?;
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn.open_table(KV_TABLE).context("Failed to open table")?;
            table
                .insert(key, bytes.as_slice())
                .context("Failed to insert entry")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn remove_key(&self, key: &str) -> Result<bool> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let existed;
        {
            let mut table = write_txn.open_table(KV_TABLE).context("Failed to open table")?;
            existed = table.remove(key).context("Failed to remove key")?.is_some();
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(existed)
    }
}

#[async_trait::async_trait]
impl SharedStore for RedbStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now_ms = Utc::now().timestamp_millis();
        match self.read_entry(key)? {
            Some(entry) if entry.is_expired(now_ms) => {
                self.remove_key(key)?;
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.write_entry(
            key,
            &Entry {
                value: value.to_string(),
                expires_at_ms: expiry_ms(ttl),
            },
        )
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let inserted;
        {
            let mut table = write_txn.open_table(KV_TABLE).context("Failed to open table")?;
            let existing: Option<Entry> = {
                let guard = table.get(key).context("Failed to get key")?;
                guard
                    .map(|g| serde_json::from_slice(g.value()))
                    .transpose()
                    .context("Failed to deserialize entry")?
            };

            let live = existing.is_some_and(|e| !e.is_expired(now_ms));
            if live {
                inserted = false;
            } else {
                let entry = Entry {
                    value: value.to_string(),
                    expires_at_ms: expiry_ms(ttl),
                };
                let bytes = serde_json::to_vec(&entry).context("Failed to serialize entry")?;
                table
                    .insert(key, bytes.as_slice())
                    .context("Failed to insert entry")?;
                inserted = true;
            }
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(inserted)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let updated;
        {
            let mut table = write_txn.open_table(KV_TABLE).context("Failed to open table")?;
            let existing: Option<Entry> = {
                let guard = table.get(key).context("Failed to get key")?;
                guard
                    .map(|g| serde_json::from_slice(g.value()))
                    .transpose()
                    .context("Failed to deserialize entry")?
            };

            match existing {
                Some(mut entry) if !entry.is_expired(now_ms) => {
                    entry.expires_at_ms = expiry_ms(Some(ttl));
                    let bytes = serde_json::to_vec(&entry).context("Failed to serialize entry")?;
                    table
                        .insert(key, bytes.as_slice())
                        .context("Failed to insert entry")?;
                    updated = true;
                }
                _ => updated = false,
            }
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(updated)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.remove_key(key)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let deleted;
        {
            let mut table = write_txn.open_table(KV_TABLE).context("Failed to open table")?;
            let existing: Option<Entry> = {
                let guard = table.get(key).context("Failed to get key")?;
                guard
                    .map(|g| serde_json::from_slice(g.value()))
                    .transpose()
                    .context("Failed to deserialize entry")?
            };

            match existing {
                Some(entry) if !entry.is_expired(now_ms) && entry.value == expected => {
                    table.remove(key).context("Failed to remove key")?;
                    deleted = true;
                }
                _ => deleted = false,
            }
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(deleted)
    }

    async fn compare_and_extend(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let extended;
        {
            let mut table = write_txn.open_table(KV_TABLE).context("Failed to open table")?;
            let existing: Option<Entry> = {
                let guard = table.get(key).context("Failed to get key")?;
                guard
                    .map(|g| serde_json::from_slice(g.value()))
                    .transpose()
                    .context("Failed to deserialize entry")?
            };

            match existing {
                Some(mut entry) if !entry.is_expired(now_ms) && entry.value == expected => {
                    entry.expires_at_ms = expiry_ms(Some(ttl));
                    let bytes = serde_json::to_vec(&entry).context("Failed to serialize entry")?;
                    table
                        .insert(key, bytes.as_slice())
                        .context("Failed to insert entry")?;
                    extended = true;
                }
                _ => extended = false,
            }
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(extended)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let now_ms = Utc::now().timestamp_millis();
        let mut live = Vec::new();
        let mut expired = Vec::new();

        {
            let read_txn = self.db.begin_read().context("Failed to begin read")?;
            let table = read_txn.open_table(KV_TABLE).context("Failed to open table")?;
            for item in table.range::<&str>(prefix..).context("Failed to scan")? {
                let (key_guard, value_guard) = item.context("Failed to read item")?;
                let key = key_guard.value().to_string();
                if !key.starts_with(prefix) {
                    break;
                }
                let entry: Entry = serde_json::from_slice(value_guard.value())
                    .context("Failed to deserialize entry")?;
                if entry.is_expired(now_ms) {
                    expired.push(key);
                } else {
                    live.push((key, entry.value));
                }
            }
        }

        // Purge entries that expired since their last access.
        for key in expired {
            self.remove_key(&key)?;
        }

        Ok(live)
    }
}
