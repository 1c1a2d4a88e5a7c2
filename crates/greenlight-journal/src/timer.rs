//! Wall clock and durable scheduled wakeups.
//!
//! The clock is a trait so deadline logic is deterministic under test:
//! production uses [`SystemClock`], tests drive a [`ManualClock`].
//! The timer service keeps at most one pending wake per instance:
//! rescheduling replaces, cancellation is idempotent, and a duplicate
//! fire only re-enqueues an instance whose advance no-ops.

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use greenlight_types::InstanceId;
use std::collections::HashMap;
use std::sync::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Process wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock advanced by hand.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Durable wake scheduling. One pending wake per instance.
#[async_trait]
pub trait TimerService: Send + Sync {
    /// Schedule (or replace) the instance's wake. The instance becomes
    /// runnable no earlier than `at`.
    async fn schedule(&self, instance: InstanceId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Idempotent: cancelling an absent wake is a no-op.
    async fn cancel(&self, instance: InstanceId) -> Result<(), StoreError>;

    /// Drain and return every instance whose wake time has passed.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<InstanceId>, StoreError>;

    /// Earliest pending wake, for idle-loop pacing.
    async fn next_fire_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryTimerService {
    wakes: Mutex<HashMap<InstanceId, DateTime<Utc>>>,
}

impl InMemoryTimerService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<InstanceId, DateTime<Utc>>> {
        self.wakes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TimerService for InMemoryTimerService {
    async fn schedule(&self, instance: InstanceId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.lock().insert(instance, at);
        Ok(())
    }

    async fn cancel(&self, instance: InstanceId) -> Result<(), StoreError> {
        self.lock().remove(&instance);
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<InstanceId>, StoreError> {
        let mut wakes = self.lock();
        let fired: Vec<InstanceId> = wakes
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &fired {
            wakes.remove(id);
        }
        Ok(fired)
    }

    async fn next_fire_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.lock().values().min().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenlight_types::WorkflowKind;

    fn instance(tag: &str) -> InstanceId {
        InstanceId::derive(WorkflowKind::Nda, tag)
    }

    #[tokio::test]
    async fn due_drains_fired_wakes_once() {
        let timers = InMemoryTimerService::new();
        let clock = ManualClock::starting_at(Utc::now());
        let id = instance("due");

        timers
            .schedule(id, clock.now() + Duration::hours(1))
            .await
            .unwrap();
        assert!(timers.due(clock.now()).await.unwrap().is_empty());

        clock.advance(Duration::hours(2));
        assert_eq!(timers.due(clock.now()).await.unwrap(), vec![id]);
        // Drained: a second poll fires nothing.
        assert!(timers.due(clock.now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reschedule_replaces_and_cancel_is_idempotent() {
        let timers = InMemoryTimerService::new();
        let now = Utc::now();
        let id = instance("replace");

        timers.schedule(id, now + Duration::days(7)).await.unwrap();
        timers.schedule(id, now + Duration::hours(1)).await.unwrap();
        assert_eq!(
            timers.next_fire_at().await.unwrap(),
            Some(now + Duration::hours(1))
        );

        timers.cancel(id).await.unwrap();
        timers.cancel(id).await.unwrap();
        assert_eq!(timers.next_fire_at().await.unwrap(), None);
    }
}
