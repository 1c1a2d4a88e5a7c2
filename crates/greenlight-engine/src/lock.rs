//! Per-instance write locks.
//!
//! An instance never runs in two tasks simultaneously: every advance and
//! every log append happens under its lock. `tokio::sync::Mutex` queues
//! waiters FIFO, giving the fair acquisition the contention model needs.
//! Holds are short: one advance cycle or one delivery.

use greenlight_types::InstanceId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<InstanceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the instance's lock, creating it on first use. The guard
    /// is owned so it can cross await points inside an advance.
    pub async fn acquire(&self, instance: InstanceId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(instance).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry for a terminal instance. Safe even if another
    /// task still holds a guard; the Arc keeps the mutex alive until the
    /// guard drops.
    pub fn release_terminal(&self, instance: InstanceId) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(&instance);
    }
}
