//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `door` - Per-door state inference and the toggle protocol
//! - `controller` - Fixed-period tick walking the door registry
//! - `alerts` - Alert fan-out across configured notification channels
//! - `broker` - Long-poll update broker (parked client requests)

pub mod alerts;
pub mod broker;
pub mod controller;
pub mod door;

// Re-export commonly used types
pub use alerts::{Alert, AlertDispatcher, AlertStatus};
pub use broker::UpdateBroker;
pub use controller::{ControlCmd, Controller, DoorTarget};
pub use door::{Door, Registry};
