//! Per-door state inference and the toggle protocol
//!
//! The sensor only reports "closed"; everything else is inferred from the
//! last commanded action and the calibrated travel times. The inference is
//! deliberately biased toward `open`: a failed or misread sensor surfaces as
//! a wrong-but-safe open classification, never a fabricated closed.

use crate::domain::types::{DoorAction, DoorState, DoorUpdate};
use crate::infra::config::{Config, DoorConfig};

/// Runtime state for one monitored door
#[derive(Debug, Clone)]
pub struct Door {
    pub id: String,
    pub name: String,
    pub relay_pin: u8,
    pub state_pin: u8,
    /// Sensor level that means "closed"
    pub closed_value: bool,
    pub time_to_open_ms: u64,
    pub time_to_close_ms: u64,
    pub openhab_item: Option<String>,
    pub ifttt_open_event: Option<String>,
    pub ifttt_close_event: Option<String>,
    /// Last commanded action with its timestamp; `None` when idle or after a
    /// toggle cancelled an in-flight prediction
    pub last_action: Option<(DoorAction, u64)>,
    /// State published on the last tick; changes only through the controller
    pub last_state: DoorState,
    pub last_state_time: u64,
    /// When the current open episode began
    pub open_time: u64,
    /// Whether the "opened" alert already fired for this episode
    pub msg_sent: bool,
}

impl Door {
    pub fn from_config(cfg: &DoorConfig, now: u64) -> Self {
        Self {
            id: cfg.id.clone(),
            name: cfg.name.clone(),
            relay_pin: cfg.relay_pin,
            state_pin: cfg.state_pin,
            closed_value: cfg.closed_value,
            time_to_open_ms: cfg.time_to_open_ms,
            time_to_close_ms: cfg.time_to_close_ms,
            openhab_item: cfg.openhab_item.clone(),
            ifttt_open_event: cfg.ifttt_open_event.clone(),
            ifttt_close_event: cfg.ifttt_close_event.clone(),
            last_action: None,
            last_state: DoorState::Unknown,
            last_state_time: now,
            open_time: now,
            msg_sent: false,
        }
    }

    /// Compute the logical state from the sensor reading, the last commanded
    /// action, and elapsed time. Pure; mutates nothing.
    ///
    /// The sensor is ground truth for closed and overrides any pending
    /// action. A commanded close whose travel time elapsed without the sensor
    /// confirming reports `open` — the overdue close is externally
    /// indistinguishable from a normal open door.
    pub fn derive_state(&self, sensor_closed: bool, now: u64) -> DoorState {
        if sensor_closed {
            return DoorState::Closed;
        }
        match self.last_action {
            Some((DoorAction::Open, at)) => {
                if now.saturating_sub(at) >= self.time_to_open_ms {
                    DoorState::Open
                } else {
                    DoorState::Opening
                }
            }
            Some((DoorAction::Close, at)) => {
                if now.saturating_sub(at) >= self.time_to_close_ms {
                    DoorState::Open
                } else {
                    DoorState::Closing
                }
            }
            None => DoorState::Open,
        }
    }

    /// Record the action implied by a toggle and return the state it was
    /// derived from. The caller pulses the relay regardless of the branch.
    ///
    /// Toggling a door in transit clears the pending action: the prediction
    /// is no longer trustworthy, so `derive_state` falls back to `open`
    /// until the sensor or a new action says otherwise.
    pub fn toggle(&mut self, sensor_closed: bool, now: u64) -> DoorState {
        let state = self.derive_state(sensor_closed, now);
        match state {
            DoorState::Open => self.last_action = Some((DoorAction::Close, now)),
            DoorState::Closed => self.last_action = Some((DoorAction::Open, now)),
            _ => self.last_action = None,
        }
        state
    }
}

/// Ordered door table, id-sorted at config load. Doors live for the process
/// lifetime; there is no removal operation.
#[derive(Debug)]
pub struct Registry {
    doors: Vec<Door>,
}

impl Registry {
    pub fn from_config(config: &Config, now: u64) -> Self {
        let doors = config.doors().iter().map(|d| Door::from_config(d, now)).collect();
        Self { doors }
    }

    pub fn doors(&self) -> &[Door] {
        &self.doors
    }

    pub fn doors_mut(&mut self) -> &mut [Door] {
        &mut self.doors
    }

    pub fn door(&self, id: &str) -> Option<&Door> {
        self.doors.iter().find(|d| d.id == id)
    }

    pub fn door_mut(&mut self, id: &str) -> Option<&mut Door> {
        self.doors.iter_mut().find(|d| d.id == id)
    }

    /// Consistent snapshot of published states for the update broker
    pub fn snapshot(&self) -> Vec<DoorUpdate> {
        self.doors
            .iter()
            .map(|d| DoorUpdate {
                id: d.id.clone(),
                state: d.last_state,
                state_time: d.last_state_time,
            })
            .collect()
    }
}
