use crate::event::EventType;
use crate::id::{EventId, InstanceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single entry in an instance's append-only event log.
///
/// Versions are 1-based and contiguous. Timestamp is wall-clock for
/// debugging only, never used in replay logic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: EventId,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub event: EventType,
}

/// Derived scheduling status. Not stored independently, always the fold
/// of the event log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Runnable,
    Waiting,
    Sleeping,
    /// Draining the compensation stack after a failure or abort.
    Compensating,
    /// Terminal.
    Completed,
    /// Terminal.
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Runnable => "Runnable",
            Self::Waiting => "Waiting",
            Self::Sleeping => "Sleeping",
            Self::Compensating => "Compensating",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// A full event log for one instance. Persistence-level struct; the
/// current version is `records.last().map(|r| r.version).unwrap_or(0)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLog {
    pub instance_id: InstanceId,
    pub records: Vec<EventRecord>,
}

impl EventLog {
    pub fn version(&self) -> u64 {
        self.records.last().map(|r| r.version).unwrap_or(0)
    }
}
