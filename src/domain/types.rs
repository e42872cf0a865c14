//! Shared types for door monitoring

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
///
/// All door timestamps (state changes, commanded actions, long-poll cursors)
/// use this clock so they can be compared directly with client-supplied values.
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Logical door state derived each polling tick.
///
/// `Opening` and `Closing` are predictions from the last commanded action and
/// the calibrated travel times; only `Closed` is ever sensor-confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DoorState {
    Unknown,
    Open,
    Closed,
    Opening,
    Closing,
}

impl DoorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoorState::Unknown => "unknown",
            DoorState::Open => "open",
            DoorState::Closed => "closed",
            DoorState::Opening => "opening",
            DoorState::Closing => "closing",
        }
    }

    /// Settled states are pushed to external sync collaborators; the
    /// transitional predictions are not.
    pub fn is_settled(&self) -> bool {
        matches!(self, DoorState::Open | DoorState::Closed)
    }
}

impl std::fmt::Display for DoorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last commanded relay action.
///
/// "No pending action" is modeled as `Option<(DoorAction, u64)>` on the door so
/// an action can never exist without its timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorAction {
    Open,
    Close,
}

impl DoorAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoorAction::Open => "open",
            DoorAction::Close => "close",
        }
    }
}

impl std::fmt::Display for DoorAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the registry snapshot handed to the update broker.
///
/// Serialized on the wire as the array triple `[id, state, state_time]`.
#[derive(Debug, Clone)]
pub struct DoorUpdate {
    pub id: String,
    pub state: DoorState,
    pub state_time: u64,
}
