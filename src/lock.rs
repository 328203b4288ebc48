//! Named lock manager
//!
//! Serializes operations that share a key (for example every attach and
//! detach of one assigner) while letting different keys run concurrently.
//! Entries are reference counted and dropped from the table once the last
//! holder or waiter leaves.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

/// Lock key for operations on one assigner
pub fn assigner_key(assigner_id: &str) -> String {
    format!("assigner-{}", assigner_id)
}

/// Lock key for structural changes to one template
pub fn template_key(template_id: &str) -> String {
    format!("template-{}", template_id)
}

/// Lock key for hardware reconciliation
pub const SYNC_KEY: &str = "fcp-sync";

#[derive(Default)]
struct LockEntry {
    lock: Arc<AsyncMutex<()>>,
    /// Callers currently holding or waiting on `lock`
    holders: usize,
}

type LockTable = Arc<Mutex<HashMap<String, LockEntry>>>;

/// Keyed mutual exclusion with automatic cleanup
#[derive(Clone, Default)]
pub struct NamedLockManager {
    table: LockTable,
}

/// Held named lock; releases and deregisters on drop
pub struct NamedLockGuard {
    // Field order matters: the lock is released before deregistration
    _guard: OwnedMutexGuard<()>,
    _registration: Registration,
}

/// Holder-count registration, decremented on drop
struct Registration {
    table: LockTable,
    key: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        if let Some(entry) = table.get_mut(&self.key) {
            entry.holders -= 1;
            if entry.holders == 0 {
                table.remove(&self.key);
                trace!("Removed lock entry {}", self.key);
            }
        }
    }
}

impl NamedLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock named `key`, waiting behind earlier holders
    ///
    /// Not re-entrant: acquiring the same key twice from one call chain
    /// deadlocks.
    pub async fn acquire(&self, key: &str) -> NamedLockGuard {
        let (lock, registration) = {
            let mut table = self.table.lock();
            let entry = table.entry(key.to_string()).or_default();
            entry.holders += 1;
            (
                entry.lock.clone(),
                Registration {
                    table: self.table.clone(),
                    key: key.to_string(),
                },
            )
        };

        // A cancelled wait still drops the registration
        let guard = lock.lock_owned().await;
        NamedLockGuard {
            _guard: guard,
            _registration: registration,
        }
    }

    /// Run `f` while holding the lock named `key`
    pub async fn with_lock<F, Fut, T>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(key).await;
        f().await
    }

    /// Number of keys currently held or awaited
    pub fn active_keys(&self) -> usize {
        self.table.lock().len()
    }

    /// Holders plus waiters on `key`
    pub fn holders(&self, key: &str) -> usize {
        self.table.lock().get(key).map(|e| e.holders).unwrap_or(0)
    }
}

impl std::fmt::Debug for NamedLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedLockManager")
            .field("active_keys", &self.active_keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = NamedLockManager::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            tasks.push(tokio::spawn(async move {
                locks
                    .with_lock(&assigner_key("USER1"), || async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = NamedLockManager::new();
        let _held = locks.acquire(&assigner_key("USER1")).await;

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            locks.with_lock(&assigner_key("USER2"), || async { 42 }),
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(locks.active_keys(), 1);
    }

    #[tokio::test]
    async fn test_waiters_are_counted_and_cleaned_up() {
        let locks = NamedLockManager::new();
        let key = template_key("t1");
        let held = locks.acquire(&key).await;

        let waiter = {
            let locks = locks.clone();
            let key = key.clone();
            tokio::spawn(async move { locks.with_lock(&key, || async {}).await })
        };
        while locks.holders(&key) < 2 {
            tokio::task::yield_now().await;
        }

        drop(held);
        waiter.await.unwrap();
        assert_eq!(locks.holders(&key), 0);
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_deregisters() {
        let locks = NamedLockManager::new();
        let held = locks.acquire(SYNC_KEY).await;

        let attempt = tokio::time::timeout(Duration::from_millis(10), locks.acquire(SYNC_KEY)).await;
        assert!(attempt.is_err());
        assert_eq!(locks.holders(SYNC_KEY), 1);

        drop(held);
        assert_eq!(locks.active_keys(), 0);
    }
}
