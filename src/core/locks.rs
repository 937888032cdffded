//! Keyed per-drive mutual exclusion.
//!
//! One lock per drive key, created on first use and pruned once the last
//! holder releases it. Acquisition never waits: a held lock is reported
//! immediately so callers can answer "already running".

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

type LockMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

#[derive(Clone, Default)]
pub struct DriveLocks {
    inner: Arc<Mutex<LockMap>>,
}

/// Held for the duration of an operation on one drive.
pub struct DriveGuard {
    key: String,
    table: Arc<Mutex<LockMap>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl DriveGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for DriveGuard {
    fn drop(&mut self) {
        // Release first so the entry's only remaining reference is the table's
        drop(self.guard.take());
        let mut table = match self.table.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entry) = table.get(&self.key) {
            if Arc::strong_count(entry) == 1 {
                table.remove(&self.key);
            }
        }
    }
}

impl DriveLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `key`, or return None if another operation holds it.
    pub fn try_acquire(&self, key: &str) -> Option<DriveGuard> {
        let mut table = match self.inner.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = table
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = entry.try_lock_owned().ok()?;
        Some(DriveGuard {
            key: key.to_string(),
            table: self.inner.clone(),
            guard: Some(guard),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        let table = match self.inner.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        table
            .get(key)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of live lock entries.
    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(t) => t.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let locks = DriveLocks::new();
        let guard = locks.try_acquire("d1").unwrap();
        assert_eq!(guard.key(), "d1");
        assert!(locks.try_acquire("d1").is_none());
        assert!(locks.is_held("d1"));
        drop(guard);
        assert!(!locks.is_held("d1"));
        assert!(locks.try_acquire("d1").is_some());
    }

    #[test]
    fn different_keys_are_independent() {
        let locks = DriveLocks::new();
        let _a = locks.try_acquire("a").unwrap();
        let _b = locks.try_acquire("b").unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn entries_are_pruned_on_release() {
        let locks = DriveLocks::new();
        for i in 0..50 {
            let key = format!("drive-{}", i);
            let guard = locks.try_acquire(&key).unwrap();
            assert!(locks.try_acquire(&key).is_none());
            drop(guard);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn guard_can_move_into_task() {
        let locks = DriveLocks::new();
        let guard = locks.try_acquire("d1").unwrap();
        let handle = tokio::spawn(async move {
            tokio::task::yield_now().await;
            drop(guard);
        });
        handle.await.unwrap();
        assert!(locks.is_empty());
    }
}
