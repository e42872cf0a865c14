//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `gpio` - Sensor/relay port trait and the in-memory backend
//! - `http` - HTTP surface (status, toggle, config, long-poll updates, keyed API)
//! - `statesync` - Settled-state push to openHAB / IFTTT

pub mod gpio;
pub mod http;
pub mod statesync;

// Re-export commonly used types
pub use gpio::{pulse_relay, DoorPort, MemoryPort, RELAY_SETTLE};
pub use http::{start_http_server, HttpState};
pub use statesync::StateSync;
