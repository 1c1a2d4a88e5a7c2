use crate::payload::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Names an external event an instance can wait for or receive.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventName(String);

impl EventName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Declarative predicate over a message payload.
///
/// Kept as data (field path + expected value) so an outstanding wait can
/// be persisted in snapshots and re-evaluated after a restart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub field: String,
    pub equals: serde_json::Value,
}

impl EventFilter {
    pub fn field_equals(field: impl Into<String>, equals: serde_json::Value) -> Self {
        Self {
            field: field.into(),
            equals,
        }
    }

    pub fn matches(&self, payload: &Payload) -> bool {
        payload.raw().get(&self.field) == Some(&self.equals)
    }
}

/// The single pending external dependency of a suspended instance.
///
/// At most one is outstanding per instance at any time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitDescriptor {
    /// Named external-event wait, with an optional hard deadline.
    Event {
        name: EventName,
        filter: Option<EventFilter>,
        deadline: Option<DateTime<Utc>>,
    },
    /// Timed sleep until an absolute wake time.
    Sleep { until: DateTime<Utc> },
}

impl WaitDescriptor {
    /// The absolute time at which this wait must be force-resolved,
    /// if it has one.
    pub fn wake_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Event { deadline, .. } => *deadline,
            Self::Sleep { until } => Some(*until),
        }
    }
}

/// How a wait resolved. Crossing the deadline is indistinguishable from a
/// declined outcome at the engine level; machines decide what a timeout
/// means for their state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitOutcome {
    Event { payload: Payload },
    TimedOut,
}

impl WaitOutcome {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Self::Event { payload } => Some(payload),
            Self::TimedOut => None,
        }
    }
}
