use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Lifecycle of one tracked series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Polling the provider on a timer.
    Active,
    /// Retained and answering control actions, but not polling.
    Paused,
    /// Terminal. A stopped session never polls again and rejects every
    /// action except status reads.
    Stopped,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Control actions that are validated against the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Suspend polling.
    Pause,
    /// Resume polling after a pause.
    Resume,
    /// End the session for good.
    Stop,
    /// Run a poll cycle outside the timer.
    Refresh,
    /// Swap a roster player.
    Substitute,
    /// Re-target the live message.
    Repost,
}

/// Error returned when attempting to apply an invalid action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid action: {action:?} cannot be applied while {from}")]
pub struct InvalidTransition {
    /// The status the session was in when the invalid action was received.
    pub from: SessionStatus,
    /// The action that cannot be applied from this status.
    pub action: SessionAction,
}

/// Compute the status after `action`, validating it against `from`.
pub fn next_status(
    from: SessionStatus,
    action: SessionAction,
) -> Result<SessionStatus, InvalidTransition> {
    let next = match (from, action) {
        (SessionStatus::Active, SessionAction::Pause) => SessionStatus::Paused,
        (SessionStatus::Paused, SessionAction::Resume) => SessionStatus::Active,
        (SessionStatus::Active | SessionStatus::Paused, SessionAction::Stop) => {
            SessionStatus::Stopped
        }
        (
            status @ (SessionStatus::Active | SessionStatus::Paused),
            SessionAction::Refresh | SessionAction::Substitute | SessionAction::Repost,
        ) => status,
        (from, action) => return Err(InvalidTransition { from, action }),
    };

    Ok(next)
}
