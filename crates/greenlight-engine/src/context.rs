//! Per-advance append context.
//!
//! An [`AdvanceCtx`] is created under the instance lock, holds the
//! rebuilt state plus the incremental invariant checker, and is the only
//! path through which the scheduler, executor, and compensation runner
//! append events. Every append is validated against the log invariants
//! before it is offered to the store, and the in-memory state is folded
//! forward only after the store accepts the batch.

use crate::error::EngineError;
use chrono::Utc;
use greenlight_journal::{Clock, EventStore, LogCheck, replay};
use greenlight_types::{EventId, EventRecord, EventType, InstanceId, InstanceState, Snapshot};
use std::sync::Arc;

pub(crate) struct AdvanceCtx {
    pub instance: InstanceId,
    pub state: InstanceState,
    check: LogCheck,
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    snapshot_interval: u64,
    last_snapshot_version: u64,
}

impl std::fmt::Debug for AdvanceCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvanceCtx")
            .field("instance", &self.instance)
            .field("state", &self.state)
            .field("check", &self.check)
            .field("snapshot_interval", &self.snapshot_interval)
            .field("last_snapshot_version", &self.last_snapshot_version)
            .finish_non_exhaustive()
    }
}

impl AdvanceCtx {
    /// Rebuild current state from the latest snapshot plus the log tail.
    pub async fn load(
        instance: InstanceId,
        store: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
        snapshot_interval: u64,
    ) -> Result<Self, EngineError> {
        let snapshot = store.latest_snapshot(instance).await?;
        let from = snapshot.as_ref().map(Snapshot::version).unwrap_or(0);
        let tail = store.read_range(instance, from, None).await?;
        if snapshot.is_none() && tail.is_empty() {
            return Err(EngineError::UnknownInstance(instance));
        }
        let last_snapshot_version = from;
        let state = replay::rebuild(snapshot, &tail)?;
        let check = LogCheck::from_state(&state);
        Ok(Self {
            instance,
            state,
            check,
            store,
            clock,
            snapshot_interval,
            last_snapshot_version,
        })
    }

    pub fn now(&self) -> chrono::DateTime<Utc> {
        self.clock.now()
    }

    /// Validate, durably append, and fold a batch of events.
    ///
    /// All-or-nothing: on a version conflict nothing is folded and the
    /// caller restarts its advance from a fresh rebuild.
    pub async fn append(&mut self, events: Vec<EventType>) -> Result<(), EngineError> {
        if events.is_empty() {
            return Ok(());
        }
        let expected = self.state.version;
        let timestamp = self.clock.now();
        let records: Vec<EventRecord> = events
            .into_iter()
            .enumerate()
            .map(|(i, event)| {
                let version = expected + 1 + i as u64;
                EventRecord {
                    event_id: EventId::derive(&self.instance, version),
                    version,
                    timestamp,
                    event,
                }
            })
            .collect();

        // Reject invariant violations before they reach the store.
        let mut check = self.check.clone();
        for record in &records {
            check
                .check_append(record)
                .map_err(EngineError::LogInvariant)?;
        }

        self.store
            .append(self.instance, expected, records.clone())
            .await?;

        for record in &records {
            replay::apply(&mut self.state, record);
        }
        self.check = check;
        self.maybe_snapshot().await
    }

    async fn maybe_snapshot(&mut self) -> Result<(), EngineError> {
        if self.state.version - self.last_snapshot_version >= self.snapshot_interval {
            self.write_snapshot().await?;
        }
        Ok(())
    }

    /// Unconditional snapshot, used at terminal states so recovery never
    /// replays a finished instance from scratch.
    pub async fn write_snapshot(&mut self) -> Result<(), EngineError> {
        self.store
            .write_snapshot(
                self.instance,
                Snapshot {
                    taken_at: self.clock.now(),
                    state: self.state.clone(),
                },
            )
            .await?;
        self.last_snapshot_version = self.state.version;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenlight_journal::{InMemoryEventStore, SystemClock};
    use greenlight_types::{
        EventName, InvestmentParams, InvestmentType, StartParams, WorkflowKind,
    };

    fn start_event() -> EventType {
        EventType::InstanceStarted {
            kind: WorkflowKind::Investment,
            params: StartParams::Investment(InvestmentParams {
                investor_id: "inv-1".into(),
                creator_id: "cre-1".into(),
                pitch_id: "pitch-1".into(),
                proposed_amount: 50_000,
                investment_type: InvestmentType::Equity,
                nda_accepted: true,
            }),
            client_token: "ctx-test".into(),
        }
    }

    async fn seeded() -> (Arc<InMemoryEventStore>, InstanceId) {
        let store = Arc::new(InMemoryEventStore::new());
        let instance = InstanceId::derive(WorkflowKind::Investment, "ctx-test");
        let record = EventRecord {
            event_id: EventId::derive(&instance, 1),
            version: 1,
            timestamp: Utc::now(),
            event: start_event(),
        };
        store.append(instance, 0, vec![record]).await.unwrap();
        (store, instance)
    }

    #[tokio::test]
    async fn load_fails_for_unknown_instance() {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let err = AdvanceCtx::load(
            InstanceId::derive(WorkflowKind::Nda, "missing"),
            store,
            Arc::new(SystemClock),
            50,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::UnknownInstance(_)));
    }

    #[tokio::test]
    async fn append_assigns_versions_and_folds() {
        let (store, instance) = seeded().await;
        let mut ctx = AdvanceCtx::load(instance, store.clone(), Arc::new(SystemClock), 50)
            .await
            .unwrap();
        assert_eq!(ctx.state.version, 1);

        ctx.append(vec![EventType::WaitStarted {
            name: EventName::new("creator-decision"),
            filter: None,
            deadline: None,
        }])
        .await
        .unwrap();

        assert_eq!(ctx.state.version, 2);
        assert!(ctx.state.wait.is_some());
        assert_eq!(store.read_log(instance).await.unwrap().version(), 2);
    }

    #[tokio::test]
    async fn invalid_append_is_rejected_before_the_store() {
        let (store, instance) = seeded().await;
        let mut ctx = AdvanceCtx::load(instance, store.clone(), Arc::new(SystemClock), 50)
            .await
            .unwrap();

        // SleepFired without an outstanding sleep.
        let err = ctx.append(vec![EventType::SleepFired]).await.unwrap_err();
        assert!(matches!(err, EngineError::LogInvariant(_)));
        // Nothing reached the store and the fold did not move.
        assert_eq!(store.read_log(instance).await.unwrap().version(), 1);
        assert_eq!(ctx.state.version, 1);
    }

    #[tokio::test]
    async fn snapshots_follow_the_interval() {
        let (store, instance) = seeded().await;
        let mut ctx = AdvanceCtx::load(instance, store.clone(), Arc::new(SystemClock), 3)
            .await
            .unwrap();

        for _ in 0..3 {
            ctx.append(vec![EventType::WaitStarted {
                name: EventName::new("creator-decision"),
                filter: None,
                deadline: None,
            }])
            .await
            .unwrap();
            ctx.append(vec![EventType::WaitFulfilled {
                name: EventName::new("creator-decision"),
                outcome: greenlight_types::WaitOutcome::TimedOut,
            }])
            .await
            .unwrap();
        }

        let snapshot = store.latest_snapshot(instance).await.unwrap().unwrap();
        assert!(snapshot.version() >= 3);
        // The snapshot equals the fold of its prefix.
        let log = store.read_log(instance).await.unwrap();
        let prefix = replay::fold(&log.records[..snapshot.version() as usize]).unwrap();
        similar_asserts::assert_eq!(prefix, snapshot.state);
    }
}
