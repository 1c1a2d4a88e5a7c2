//! Persistence seams and log semantics for the deal-orchestration engine:
//! the append-only event store, the external-event mailbox, the clock and
//! timer service, state folding, and log invariant checking.

pub mod error;
pub mod invariants;
pub mod mailbox;
pub mod replay;
pub mod store;
pub mod timer;

pub use error::{LogViolation, ReplayError, StoreError};
pub use invariants::{LogCheck, validate_log};
pub use mailbox::{InMemoryMailbox, Mailbox, MailboxMessage};
pub use replay::{apply, fold, from_start, rebuild};
pub use store::{
    EventStore, InMemoryEventStore, InstanceFilter, InstanceMeta, InstancePage, Page,
};
pub use timer::{Clock, InMemoryTimerService, ManualClock, SystemClock, TimerService};
