//! Domain models - core door types shared across the system
//!
//! This module contains the canonical data types used throughout the system:
//! - `DoorState` - logical door state derived each polling tick
//! - `DoorAction` - last commanded relay action
//! - `DoorUpdate` - one row of the broker's transition snapshot

pub mod types;

pub use types::{epoch_ms, DoorAction, DoorState, DoorUpdate};
