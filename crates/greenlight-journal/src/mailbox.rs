//! Per-instance inbox of external events.
//!
//! Messages are keyed by (instance, event name) and consumed only when an
//! instance enters a matching wait. FIFO per key is guaranteed by a
//! monotonic sequence number assigned at delivery; messages that never
//! match a wait age out during sweeps.

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use greenlight_types::{EventFilter, EventName, InstanceId, Payload};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxMessage {
    pub seq: u64,
    pub name: EventName,
    pub payload: Payload,
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Durably enqueue a message. Returns its sequence number within the
    /// (instance, name) queue.
    async fn deliver(
        &self,
        instance: InstanceId,
        name: EventName,
        payload: Payload,
        received_at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Non-blocking: consume and return the earliest message for
    /// (instance, name) that passes the filter, if any.
    async fn take(
        &self,
        instance: InstanceId,
        name: &EventName,
        filter: Option<&EventFilter>,
    ) -> Result<Option<MailboxMessage>, StoreError>;

    /// Queued message count for (instance, name).
    async fn pending(&self, instance: InstanceId, name: &EventName)
    -> Result<usize, StoreError>;

    /// Drop every queue for a (usually terminal) instance.
    async fn purge(&self, instance: InstanceId) -> Result<(), StoreError>;

    /// Drop messages older than the retention window. Returns how many
    /// were removed.
    async fn sweep(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize, StoreError>;
}

#[derive(Default)]
struct MailboxInner {
    queues: HashMap<(InstanceId, EventName), VecDeque<MailboxMessage>>,
    next_seq: HashMap<(InstanceId, EventName), u64>,
}

#[derive(Default)]
pub struct InMemoryMailbox {
    inner: Mutex<MailboxInner>,
}

impl InMemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MailboxInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Mailbox for InMemoryMailbox {
    async fn deliver(
        &self,
        instance: InstanceId,
        name: EventName,
        payload: Payload,
        received_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let key = (instance, name.clone());
        let seq = {
            let counter = inner.next_seq.entry(key.clone()).or_insert(1);
            let seq = *counter;
            *counter += 1;
            seq
        };
        inner.queues.entry(key).or_default().push_back(MailboxMessage {
            seq,
            name,
            payload,
            received_at,
        });
        Ok(seq)
    }

    async fn take(
        &self,
        instance: InstanceId,
        name: &EventName,
        filter: Option<&EventFilter>,
    ) -> Result<Option<MailboxMessage>, StoreError> {
        let mut inner = self.lock();
        let Some(queue) = inner.queues.get_mut(&(instance, name.clone())) else {
            return Ok(None);
        };
        let position = queue
            .iter()
            .position(|msg| filter.is_none_or(|f| f.matches(&msg.payload)));
        Ok(position.and_then(|i| queue.remove(i)))
    }

    async fn pending(
        &self,
        instance: InstanceId,
        name: &EventName,
    ) -> Result<usize, StoreError> {
        let inner = self.lock();
        Ok(inner
            .queues
            .get(&(instance, name.clone()))
            .map(VecDeque::len)
            .unwrap_or(0))
    }

    async fn purge(&self, instance: InstanceId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.queues.retain(|(id, _), _| *id != instance);
        inner.next_seq.retain(|(id, _), _| *id != instance);
        Ok(())
    }

    async fn sweep(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize, StoreError> {
        let cutoff = now - retention;
        let mut removed = 0;
        let mut inner = self.lock();
        for queue in inner.queues.values_mut() {
            let before = queue.len();
            queue.retain(|msg| msg.received_at >= cutoff);
            removed += before - queue.len();
        }
        inner.queues.retain(|_, q| !q.is_empty());
        Ok(removed)
    }
}
