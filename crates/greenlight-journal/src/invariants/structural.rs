//! Structural invariants.
//!
//! These checks enforce the physical integrity of the log as an
//! append-only, 1-based event sequence with well-defined lifecycle
//! bookends. They run before any domain-level checks because later
//! groups rely on structural soundness.

use super::LogCheck;
use crate::error::LogViolation;
use greenlight_types::{EventRecord, EventType};

/// Validate structural invariants against the current accumulated state.
///
/// Version contiguity and the opening `InstanceStarted` are verified
/// before terminal-finality rules, since the latter depend on coherent
/// version numbering. Within the terminal group, the duplicate-terminal
/// check takes precedence over terminal-not-last.
pub(crate) fn check(state: &LogCheck, record: &EventRecord) -> Result<(), LogViolation> {
    // Versions are 1-based and contiguous: the next record must carry
    // `len + 1`.
    let expected = state.len + 1;
    if record.version != expected {
        return Err(LogViolation::NonContiguousVersion {
            index: state.len as usize,
            expected,
            actual: record.version,
        });
    }

    // The very first event must be `InstanceStarted`, and it must not
    // appear again.
    let is_start = matches!(record.event, EventType::InstanceStarted { .. });
    if !state.started && !is_start {
        return Err(LogViolation::MissingInstanceStarted {
            first_event: record.event.name().to_string(),
        });
    }
    if state.started && is_start {
        return Err(LogViolation::DuplicateInstanceStarted {
            version: record.version,
        });
    }

    // Terminal finality: once a terminal event has been recorded the log
    // is sealed. Another terminal is a uniqueness violation; a
    // non-terminal is a terminal-not-last violation.
    if let Some(first_at) = state.terminal_at {
        if record.event.is_terminal() {
            return Err(LogViolation::MultipleTerminalEvents {
                first_at,
                second_at: record.version,
            });
        }
        return Err(LogViolation::TerminalNotLast {
            terminal_version: first_at,
            log_len: (state.len + 1) as usize,
        });
    }

    Ok(())
}
