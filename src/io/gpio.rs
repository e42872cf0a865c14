//! Sensor and relay port boundary
//!
//! Doors are wired to two GPIO lines: a binary position sensor (reads the
//! configured level when the door is fully closed) and a relay that toggles
//! the opener when pulsed. Hardware bindings live behind `DoorPort` so the
//! controller and tests run against the in-memory backend.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Hold time between asserting and releasing the relay. Shared by all doors.
pub const RELAY_SETTLE: Duration = Duration::from_millis(200);

/// Raw pin access for one board of doors.
///
/// Implementations must be cheap to call from the controller tick; a failed
/// or floating sensor read should return the "not closed" level, never the
/// closed one.
pub trait DoorPort: Send + Sync {
    /// Current level of a sensor pin
    fn read_sensor(&self, pin: u8) -> bool;
    /// Drive a relay pin
    fn set_relay(&self, pin: u8, level: bool);
}

/// Pulse a relay: assert low, hold for the settle delay, release high.
///
/// The relays are active-low with a high idle level. The pulse is
/// fire-and-forget; nothing verifies the door actually moved.
pub async fn pulse_relay(port: &Arc<dyn DoorPort>, pin: u8) {
    port.set_relay(pin, false);
    tokio::time::sleep(RELAY_SETTLE).await;
    port.set_relay(pin, true);
    trace!(pin = %pin, "relay_pulsed");
}

/// In-memory pin table used for development and tests.
///
/// Sensor pins default to high, which reads as "not closed" for the usual
/// pull-up wiring (closed_value = false means low-when-closed).
#[derive(Default)]
pub struct MemoryPort {
    levels: Mutex<HashMap<u8, bool>>,
}

impl MemoryPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive a sensor pin from a test or simulation
    pub fn set_sensor(&self, pin: u8, level: bool) {
        self.levels.lock().insert(pin, level);
    }

    /// Last level written to a relay pin (high when never written)
    pub fn relay_level(&self, pin: u8) -> bool {
        *self.levels.lock().get(&pin).unwrap_or(&true)
    }
}

impl DoorPort for MemoryPort {
    fn read_sensor(&self, pin: u8) -> bool {
        *self.levels.lock().get(&pin).unwrap_or(&true)
    }

    fn set_relay(&self, pin: u8, level: bool) {
        self.levels.lock().insert(pin, level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_port_defaults_high() {
        let port = MemoryPort::new();
        assert!(port.read_sensor(17));
        assert!(port.relay_level(23));
    }

    #[test]
    fn test_memory_port_sensor_levels() {
        let port = MemoryPort::new();
        port.set_sensor(17, false);
        assert!(!port.read_sensor(17));
        port.set_sensor(17, true);
        assert!(port.read_sensor(17));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulse_asserts_then_releases() {
        let port = Arc::new(MemoryPort::new());
        let dyn_port: Arc<dyn DoorPort> = port.clone();

        pulse_relay(&dyn_port, 23).await;
        // After the pulse the relay must be back at the idle (high) level
        assert!(port.relay_level(23));
    }
}
