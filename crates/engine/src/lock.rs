use crate::error::EngineError;
use crate::storage::SharedStore;
use crate::types::{BlockId, WorkflowId};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lock name guarding one workflow's whole run against concurrent duplicate
/// execution.
pub fn execution_lock_name(workflow_id: &WorkflowId) -> String {
    format!("workflow:execute:{}", workflow_id)
}

/// Lock name for node-level exclusion within one workflow.
pub fn node_lock_name(workflow_id: &WorkflowId, block_id: &BlockId) -> String {
    format!("workflow:{}:node:{}", workflow_id, block_id)
}

fn lock_key(name: &str) -> String {
    format!("lock:{}", name)
}

/// Proof of ownership for one acquisition. Only the holder of the token can
/// release or extend the lock.
#[derive(Debug, Clone)]
pub struct LockHandle {
    name: String,
    token: String,
}

impl LockHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Tuning for lock acquisition and expiry
#[derive(Debug, Clone)]
pub struct LockSettings {
    pub ttl: Duration,
    pub poll_interval: Duration,
    pub blocking_timeout: Duration,
}

/// Named mutual exclusion across processes, built on the store's atomic
/// set-if-absent-with-expiry primitive.
///
/// Locks auto-expire so a crashed holder cannot wedge the system; that trades
/// strict mutual exclusion for liveness, and long critical sections must call
/// `extend` periodically. Without a shared store every acquisition succeeds
/// immediately (single-instance mode).
pub struct LockManager {
    store: Option<Arc<dyn SharedStore>>,
    settings: LockSettings,
}

impl LockManager {
    pub fn new(store: Option<Arc<dyn SharedStore>>, settings: LockSettings) -> Self {
        if store.is_none() {
            tracing::info!("No shared store configured; locks degrade to local no-ops");
        }
        Self { store, settings }
    }

    /// Try to take the lock once, without blocking.
    pub async fn try_acquire(&self, name: &str) -> Result<Option<LockHandle>, EngineError> {
        let Some(store) = &self.store else {
            return Ok(Some(self.local_handle(name)));
        };

        let token = uuid::Uuid::new_v4().to_string();
        let acquired = store
            .set_if_absent(&lock_key(name), &token, Some(self.settings.ttl))
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;

        Ok(acquired.then(|| LockHandle {
            name: name.to_string(),
            token,
        }))
    }

    /// Acquire the lock, polling at a fixed interval until success or the
    /// default blocking timeout. A timeout means "busy, retry later", not a
    /// fatal condition.
    pub async fn acquire(&self, name: &str) -> Result<LockHandle, EngineError> {
        self.acquire_with_timeout(name, self.settings.blocking_timeout)
            .await
    }

    pub async fn acquire_with_timeout(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<LockHandle, EngineError> {
        let started = Instant::now();
        loop {
            if let Some(handle) = self.try_acquire(name).await? {
                tracing::debug!("Acquired lock {}", name);
                return Ok(handle);
            }
            if started.elapsed() >= timeout {
                return Err(EngineError::LockAcquisition {
                    name: name.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Release the lock if we still own it. Returns false when ownership was
    /// already lost (expiry), which callers treat as a warning, not an error.
    pub async fn release(&self, handle: &LockHandle) -> Result<bool, EngineError> {
        let Some(store) = &self.store else {
            return Ok(true);
        };
        let released = store
            .compare_and_delete(&lock_key(&handle.name), &handle.token)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        if !released {
            tracing::warn!(
                "Lock {} was no longer held at release (expired or taken over)",
                handle.name
            );
        }
        Ok(released)
    }

    /// Extend the lock's expiry if we still own it. Long-running sections
    /// call this periodically to keep the lock alive.
    pub async fn extend(
        &self,
        handle: &LockHandle,
        ttl: Duration,
    ) -> Result<bool, EngineError> {
        let Some(store) = &self.store else {
            return Ok(true);
        };
        store
            .compare_and_extend(&lock_key(&handle.name), &handle.token, ttl)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))
    }

    fn local_handle(&self, name: &str) -> LockHandle {
        LockHandle {
            name: name.to_string(),
            token: "local".to_string(),
        }
    }
}
