use super::SharedStore;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process shared-store implementation. Expired entries are evicted
/// lazily on access and wholesale during prefix scans, so the map stays
/// bounded by live TTLs.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<String> {
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }
}

#[async_trait::async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut entries = self.entries.lock().unwrap();
        Ok(Self::live_value(&mut entries, key, Instant::now()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        if Self::live_value(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        if Self::live_value(&mut entries, key, now).is_none() {
            return Ok(false);
        }
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(now + ttl);
        }
        Ok(true)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let existed = Self::live_value(&mut entries, key, now).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        match Self::live_value(&mut entries, key, now) {
            Some(value) if value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        match Self::live_value(&mut entries, key, now) {
            Some(value) if value == expected => {
                if let Some(entry) = entries.get_mut(key) {
                    entry.expires_at = Some(now + ttl);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, String)>> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now));

        let mut matches: Vec<(String, String)> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matches)
    }
}
