//! Event-log and snapshot persistence.
//!
//! The trait is the durability seam: the engine only ever talks to
//! [`EventStore`], and the in-memory implementation here is the reference
//! semantics a relational backend must match: append is all-or-nothing
//! and compare-and-swap on the current version, events are immutable,
//! snapshots are strictly derivative, and reads are monotonic.

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use greenlight_types::{
    EventLog, EventRecord, InstanceId, InstanceStatus, Snapshot, WorkflowKind,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// One row of the instance index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMeta {
    pub id: InstanceId,
    pub kind: WorkflowKind,
    pub status: InstanceStatus,
    pub latest_version: u64,
    pub pitch_id: String,
    pub initiator_id: String,
    pub creator_id: String,
    pub created_at: DateTime<Utc>,
    pub last_advanced_at: DateTime<Utc>,
}

/// Filter for listing instances. Empty filter matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub kind: Option<WorkflowKind>,
    pub pitch_id: Option<String>,
    /// Matches either the initiating party or the creator.
    pub party_id: Option<String>,
}

impl InstanceFilter {
    pub fn matches(&self, meta: &InstanceMeta) -> bool {
        if self.kind.is_some_and(|k| k != meta.kind) {
            return false;
        }
        if self
            .pitch_id
            .as_ref()
            .is_some_and(|p| p != &meta.pitch_id)
        {
            return false;
        }
        if self
            .party_id
            .as_ref()
            .is_some_and(|p| p != &meta.initiator_id && p != &meta.creator_id)
        {
            return false;
        }
        true
    }
}

/// Offset pagination for listings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstancePage {
    pub items: Vec<InstanceMeta>,
    pub next_offset: Option<usize>,
}

/// Append-only event log + snapshot + instance-index store.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// All-or-nothing append. Assigns consecutive versions starting at
    /// `expected_version + 1`; fails with `VersionConflict` iff the
    /// persisted version differs from `expected_version`. Durable before
    /// returning. A retry carrying event ids that are already persisted
    /// is recognized and reported as success.
    async fn append(
        &self,
        instance: InstanceId,
        expected_version: u64,
        events: Vec<EventRecord>,
    ) -> Result<u64, StoreError>;

    /// Events with `from_exclusive < version <= to_inclusive` (all
    /// remaining when `to_inclusive` is `None`), ascending by version.
    async fn read_range(
        &self,
        instance: InstanceId,
        from_exclusive: u64,
        to_inclusive: Option<u64>,
    ) -> Result<Vec<EventRecord>, StoreError>;

    async fn read_log(&self, instance: InstanceId) -> Result<EventLog, StoreError>;

    /// The snapshot with the highest version, if any.
    async fn latest_snapshot(&self, instance: InstanceId)
    -> Result<Option<Snapshot>, StoreError>;

    /// Idempotent on (instance, snapshot version).
    async fn write_snapshot(
        &self,
        instance: InstanceId,
        snapshot: Snapshot,
    ) -> Result<(), StoreError>;

    /// Returns false if the instance was already registered (idempotent
    /// start hit).
    async fn register_instance(&self, meta: InstanceMeta) -> Result<bool, StoreError>;

    async fn instance_meta(
        &self,
        instance: InstanceId,
    ) -> Result<Option<InstanceMeta>, StoreError>;

    async fn update_instance(
        &self,
        instance: InstanceId,
        status: InstanceStatus,
        latest_version: u64,
        last_advanced_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn list_instances(
        &self,
        filter: InstanceFilter,
        page: Page,
    ) -> Result<InstancePage, StoreError>;
}

#[derive(Default)]
struct StoreInner {
    logs: HashMap<InstanceId, Vec<EventRecord>>,
    snapshots: HashMap<InstanceId, BTreeMap<u64, Snapshot>>,
    metas: HashMap<InstanceId, InstanceMeta>,
}

/// Reference in-memory store. A single mutex over the whole map is fine
/// here: contention on a per-instance basis is already serialized by the
/// engine's instance locks.
#[derive(Default)]
pub struct InMemoryEventStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        // Mutex poisoning only happens if a holder panicked; the store
        // has no partial-write states, so continuing is safe.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        instance: InstanceId,
        expected_version: u64,
        events: Vec<EventRecord>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let log = inner.logs.entry(instance).or_default();
        let current = log.last().map(|r| r.version).unwrap_or(0);

        if current != expected_version {
            // Deterministic event ids make an ambiguous-retry append
            // detectable: if every incoming record is already persisted
            // at its claimed version, the earlier attempt won.
            let already = !events.is_empty()
                && events.iter().all(|e| {
                    e.version
                        .checked_sub(1)
                        .and_then(|idx| log.get(idx as usize))
                        .is_some_and(|existing| existing.event_id == e.event_id)
                });
            if already {
                return Ok(current);
            }
            return Err(StoreError::VersionConflict {
                instance,
                expected: expected_version,
                actual: current,
            });
        }

        for (i, record) in events.iter().enumerate() {
            let assigned = expected_version + 1 + i as u64;
            if record.version != assigned {
                return Err(StoreError::Io(format!(
                    "append batch out of order: record {} carries version {}, expected {}",
                    i, record.version, assigned
                )));
            }
        }

        log.extend(events);
        Ok(log.last().map(|r| r.version).unwrap_or(current))
    }

    async fn read_range(
        &self,
        instance: InstanceId,
        from_exclusive: u64,
        to_inclusive: Option<u64>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let inner = self.lock();
        let log = inner.logs.get(&instance).map(Vec::as_slice).unwrap_or(&[]);
        Ok(log
            .iter()
            .filter(|r| {
                r.version > from_exclusive && to_inclusive.is_none_or(|to| r.version <= to)
            })
            .cloned()
            .collect())
    }

    async fn read_log(&self, instance: InstanceId) -> Result<EventLog, StoreError> {
        let inner = self.lock();
        Ok(EventLog {
            instance_id: instance,
            records: inner.logs.get(&instance).cloned().unwrap_or_default(),
        })
    }

    async fn latest_snapshot(
        &self,
        instance: InstanceId,
    ) -> Result<Option<Snapshot>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .snapshots
            .get(&instance)
            .and_then(|by_version| by_version.values().next_back().cloned()))
    }

    async fn write_snapshot(
        &self,
        instance: InstanceId,
        snapshot: Snapshot,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner
            .snapshots
            .entry(instance)
            .or_default()
            .entry(snapshot.version())
            .or_insert(snapshot);
        Ok(())
    }

    async fn register_instance(&self, meta: InstanceMeta) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.metas.entry(meta.id) {
            std::collections::hash_map::Entry::Occupied(_) => Ok(false),
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(meta);
                Ok(true)
            }
        }
    }

    async fn instance_meta(
        &self,
        instance: InstanceId,
    ) -> Result<Option<InstanceMeta>, StoreError> {
        Ok(self.lock().metas.get(&instance).cloned())
    }

    async fn update_instance(
        &self,
        instance: InstanceId,
        status: InstanceStatus,
        latest_version: u64,
        last_advanced_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let meta = inner
            .metas
            .get_mut(&instance)
            .ok_or(StoreError::UnknownInstance(instance))?;
        meta.status = status;
        meta.latest_version = latest_version;
        meta.last_advanced_at = last_advanced_at;
        Ok(())
    }

    async fn list_instances(
        &self,
        filter: InstanceFilter,
        page: Page,
    ) -> Result<InstancePage, StoreError> {
        let inner = self.lock();
        let mut matched: Vec<InstanceMeta> = inner
            .metas
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        matched.sort_by_key(|m| (m.created_at, m.id));

        let total = matched.len();
        let items: Vec<InstanceMeta> = matched
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();
        let consumed = page.offset + items.len();
        Ok(InstancePage {
            items,
            next_offset: (consumed < total).then_some(consumed),
        })
    }
}
