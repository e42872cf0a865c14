//! Fixed-period tick walking the door registry
//!
//! The controller is the single writer of door state: the polling tick and
//! every actuation command run sequentially on this one task, so a door can
//! never have two in-flight toggles and alert bookkeeping never races.
//! Network side effects (alerts, external sync) happen after the registry
//! lock is released.

use crate::domain::types::{epoch_ms, DoorState};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::gpio::{pulse_relay, DoorPort};
use crate::io::statesync::{StateSync, SyncUpdate};
use crate::services::alerts::{Alert, AlertDispatcher};
use crate::services::broker::UpdateBroker;
use crate::services::door::Registry;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Which doors a command addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoorTarget {
    All,
    Door(String),
}

/// Actuation commands accepted from the HTTP surface.
///
/// `Open` and `Close` are conditional toggles: the relay only fires when the
/// door's derived state matches, so repeating a command is harmless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCmd {
    Toggle(DoorTarget),
    Open(DoorTarget),
    Close(DoorTarget),
}

pub struct Controller {
    config: Config,
    registry: Arc<RwLock<Registry>>,
    broker: Arc<UpdateBroker>,
    dispatcher: AlertDispatcher,
    sync: Arc<StateSync>,
    port: Arc<dyn DoorPort>,
    metrics: Arc<Metrics>,
    cmd_rx: mpsc::Receiver<ControlCmd>,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        registry: Arc<RwLock<Registry>>,
        broker: Arc<UpdateBroker>,
        dispatcher: AlertDispatcher,
        sync: Arc<StateSync>,
        port: Arc<dyn DoorPort>,
        metrics: Arc<Metrics>,
        cmd_rx: mpsc::Receiver<ControlCmd>,
    ) -> Self {
        Self { config, registry, broker, dispatcher, sync, port, metrics, cmd_rx }
    }

    /// Main loop: poll on the configured interval, drain commands between
    /// ticks, stop on shutdown signal.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms()));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            doors = %self.registry.read().doors().len(),
            poll_interval_ms = %self.config.poll_interval_ms(),
            "controller_started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.poll_doors_at(epoch_ms()).await;
                }
                Some(cmd) = self.cmd_rx.recv() => {
                    self.handle_command_at(cmd, epoch_ms()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("controller_stopped");
                        break;
                    }
                }
            }
        }
    }

    /// One polling pass over every door.
    ///
    /// Registry mutation happens under the write lock; the broker notify,
    /// alert dispatch and sync pushes all run after it is released, against
    /// the data collected during the walk.
    pub async fn poll_doors_at(&mut self, now: u64) {
        self.metrics.record_tick();

        let mut alerts: Vec<Alert> = Vec::new();
        let mut syncs: Vec<SyncUpdate> = Vec::new();
        let mut changed = false;
        let snapshot;
        {
            let mut registry = self.registry.write();
            for door in registry.doors_mut() {
                let sensor_closed = self.port.read_sensor(door.state_pin) == door.closed_value;
                let state = door.derive_state(sensor_closed, now);

                if state != door.last_state {
                    if door.last_state == DoorState::Closing && state == DoorState::Open {
                        // The commanded close timed out without the sensor
                        // ever confirming; the published state is unchanged.
                        warn!(door = %door.id, "door_close_unconfirmed");
                        self.metrics.record_close_unconfirmed();
                    }
                    info!(
                        door = %door.id,
                        from = %door.last_state,
                        to = %state,
                        "door_state_changed"
                    );
                    self.metrics.record_transition();
                    door.last_state = state;
                    door.last_state_time = now;
                    changed = true;

                    if state.is_settled() && self.sync.is_active() {
                        let ifttt_event = match state {
                            DoorState::Open => door.ifttt_open_event.clone(),
                            DoorState::Closed => door.ifttt_close_event.clone(),
                            _ => None,
                        };
                        syncs.push(SyncUpdate {
                            door_id: door.id.clone(),
                            state,
                            openhab_item: door.openhab_item.clone(),
                            ifttt_event,
                        });
                    }
                }

                if self.config.alerts_enabled() {
                    match state {
                        DoorState::Open
                            if !door.msg_sent
                                && now.saturating_sub(door.open_time)
                                    >= self.config.time_to_wait_ms() =>
                        {
                            alerts.push(Alert::opened(door, now, self.config.time_to_wait_ms()));
                            door.msg_sent = true;
                        }
                        DoorState::Closed => {
                            if door.msg_sent {
                                alerts.push(Alert::closed(door, now));
                            }
                            // While closed the episode clock tracks the
                            // present, so the next open measures from here.
                            door.open_time = now;
                            door.msg_sent = false;
                        }
                        _ => {}
                    }
                }
            }
            snapshot = registry.snapshot();
        }

        if changed {
            self.broker.notify(&snapshot, now);
        }
        for alert in &alerts {
            self.dispatcher.dispatch(alert).await;
        }
        for update in syncs {
            self.sync.publish(update);
        }
    }

    /// Apply one actuation command. Conditional commands check the derived
    /// state at execution time, not enqueue time.
    pub async fn handle_command_at(&mut self, cmd: ControlCmd, now: u64) {
        let (target, required) = match cmd {
            ControlCmd::Toggle(target) => (target, None),
            ControlCmd::Open(target) => (target, Some(DoorState::Closed)),
            ControlCmd::Close(target) => (target, Some(DoorState::Open)),
        };

        let ids: Vec<String> = match target {
            DoorTarget::All => {
                self.registry.read().doors().iter().map(|d| d.id.clone()).collect()
            }
            DoorTarget::Door(id) => vec![id],
        };

        for id in ids {
            let relay_pin = {
                let mut registry = self.registry.write();
                let Some(door) = registry.door_mut(&id) else {
                    warn!(door = %id, "command_for_unknown_door");
                    continue;
                };
                let sensor_closed = self.port.read_sensor(door.state_pin) == door.closed_value;
                let state = door.derive_state(sensor_closed, now);
                if let Some(required) = required {
                    if state != required {
                        debug!(door = %id, state = %state, "command_skipped");
                        continue;
                    }
                }
                door.toggle(sensor_closed, now);
                door.relay_pin
            };

            pulse_relay(&self.port, relay_pin).await;
            self.metrics.record_toggle();
            info!(door = %id, "door_toggled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::DoorAction;
    use crate::io::gpio::MemoryPort;
    use crate::services::alerts::AlertChannel;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    // Default wiring: closed_value = false, so a low sensor level is closed
    // and the MemoryPort's default-high level reads as "not closed".
    const LEFT_SENSOR: u8 = 17;
    const LEFT_RELAY: u8 = 23;
    const RIGHT_SENSOR: u8 = 27;

    struct RecordingChannel {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl AlertChannel for RecordingChannel {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send(
            &self,
            alert: &Alert,
            _note: &mut Option<String>,
        ) -> anyhow::Result<()> {
            self.log.lock().push(format!("{}:{}", alert.door_id, alert.status.as_str()));
            Ok(())
        }
    }

    struct Harness {
        controller: Controller,
        port: Arc<MemoryPort>,
        registry: Arc<RwLock<Registry>>,
        broker: Arc<UpdateBroker>,
        metrics: Arc<Metrics>,
        alert_log: Arc<Mutex<Vec<String>>>,
    }

    fn harness(config: Config) -> Harness {
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(RwLock::new(Registry::from_config(&config, 1_000)));
        let broker = Arc::new(UpdateBroker::new(metrics.clone()));
        let alert_log = Arc::new(Mutex::new(Vec::new()));
        let channels: Vec<Box<dyn AlertChannel>> =
            vec![Box::new(RecordingChannel { log: alert_log.clone() })];
        let dispatcher = AlertDispatcher::with_channels(channels, metrics.clone());
        let sync = Arc::new(StateSync::from_config(&config).unwrap());
        let port = Arc::new(MemoryPort::new());
        let dyn_port: Arc<dyn DoorPort> = port.clone();
        let (_tx, cmd_rx) = mpsc::channel(8);

        let controller = Controller::new(
            config,
            registry.clone(),
            broker.clone(),
            dispatcher,
            sync,
            dyn_port,
            metrics.clone(),
            cmd_rx,
        );
        Harness { controller, port, registry, broker, metrics, alert_log }
    }

    #[tokio::test]
    async fn test_first_tick_classifies_doors() {
        let mut h = harness(Config::default());
        h.port.set_sensor(LEFT_SENSOR, false); // closed
        // right stays at the default high level: open

        h.controller.poll_doors_at(2_000).await;

        let registry = h.registry.read();
        assert_eq!(registry.door("left").unwrap().last_state, DoorState::Closed);
        assert_eq!(registry.door("right").unwrap().last_state, DoorState::Open);
        assert_eq!(registry.door("left").unwrap().last_state_time, 2_000);
        assert_eq!(h.metrics.report().transitions_total, 2);
    }

    #[tokio::test]
    async fn test_unchanged_state_is_not_republished() {
        let mut h = harness(Config::default());
        h.controller.poll_doors_at(2_000).await;
        h.controller.poll_doors_at(3_000).await;

        let registry = h.registry.read();
        // Timestamp still from the tick that observed the transition
        assert_eq!(registry.door("left").unwrap().last_state_time, 2_000);
        assert_eq!(h.metrics.report().transitions_total, 2);
    }

    #[tokio::test]
    async fn test_transition_resolves_parked_waiter() {
        let mut h = harness(Config::default());
        let parked = h.broker.park(0, None);

        h.controller.poll_doors_at(2_000).await;

        let body = parked.wait().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["update"].as_array().unwrap().len(), 2);
        assert_eq!(h.broker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_pulses_relay_and_records_action() {
        let mut h = harness(Config::default());
        h.port.set_sensor(LEFT_SENSOR, false); // closed
        h.controller.poll_doors_at(2_000).await;

        h.controller
            .handle_command_at(ControlCmd::Toggle(DoorTarget::Door("left".into())), 3_000)
            .await;

        // Relay back at idle after the pulse; action recorded as open
        assert!(h.port.relay_level(LEFT_RELAY));
        let registry = h.registry.read();
        assert_eq!(
            registry.door("left").unwrap().last_action,
            Some((DoorAction::Open, 3_000))
        );
        assert_eq!(h.metrics.report().toggles_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_command_skipped_when_already_open() {
        let mut h = harness(Config::default());
        h.controller.poll_doors_at(2_000).await; // both doors open

        h.controller
            .handle_command_at(ControlCmd::Open(DoorTarget::Door("left".into())), 3_000)
            .await;

        assert_eq!(h.metrics.report().toggles_total, 0);
        assert_eq!(h.registry.read().door("left").unwrap().last_action, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_all_only_touches_open_doors() {
        let mut h = harness(Config::default());
        h.port.set_sensor(LEFT_SENSOR, false); // left closed, right open
        h.controller.poll_doors_at(2_000).await;

        h.controller.handle_command_at(ControlCmd::Close(DoorTarget::All), 3_000).await;

        assert_eq!(h.metrics.report().toggles_total, 1);
        let registry = h.registry.read();
        assert_eq!(registry.door("left").unwrap().last_action, None);
        assert_eq!(
            registry.door("right").unwrap().last_action,
            Some((DoorAction::Close, 3_000))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_door_command_is_ignored() {
        let mut h = harness(Config::default());
        h.controller
            .handle_command_at(ControlCmd::Toggle(DoorTarget::Door("attic".into())), 2_000)
            .await;
        assert_eq!(h.metrics.report().toggles_total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_close_reported_once() {
        let mut h = harness(Config::default());
        h.controller.poll_doors_at(2_000).await; // left open

        h.controller
            .handle_command_at(ControlCmd::Close(DoorTarget::Door("left".into())), 3_000)
            .await;
        h.controller.poll_doors_at(4_000).await;
        assert_eq!(h.registry.read().door("left").unwrap().last_state, DoorState::Closing);

        // Travel time (10s) elapses without the sensor confirming
        h.controller.poll_doors_at(14_000).await;
        assert_eq!(h.registry.read().door("left").unwrap().last_state, DoorState::Open);
        assert_eq!(h.metrics.report().close_unconfirmed_total, 1);

        h.controller.poll_doors_at(15_000).await;
        assert_eq!(h.metrics.report().close_unconfirmed_total, 1);
    }

    #[tokio::test]
    async fn test_alert_lifecycle_with_zero_threshold() {
        let config = Config::default().with_alerts_enabled(true).with_time_to_wait_ms(0);
        let mut h = harness(config);
        h.port.set_sensor(RIGHT_SENSOR, false); // keep right closed and quiet

        // First observed-open tick alerts immediately at threshold zero
        h.controller.poll_doors_at(2_000).await;
        assert_eq!(*h.alert_log.lock(), vec!["left:open"]);
        assert!(h.registry.read().door("left").unwrap().msg_sent);

        // Still open: no repeat
        h.controller.poll_doors_at(3_000).await;
        assert_eq!(h.alert_log.lock().len(), 1);

        // Closing resolves the episode with a single closed alert
        h.port.set_sensor(LEFT_SENSOR, false);
        h.controller.poll_doors_at(4_000).await;
        assert_eq!(*h.alert_log.lock(), vec!["left:open", "left:closed"]);
        let registry = h.registry.read();
        assert!(!registry.door("left").unwrap().msg_sent);
        assert_eq!(registry.door("left").unwrap().open_time, 4_000);
    }

    #[tokio::test]
    async fn test_alert_waits_for_threshold() {
        let config = Config::default().with_alerts_enabled(true).with_time_to_wait_ms(30_000);
        let mut h = harness(config);
        h.port.set_sensor(RIGHT_SENSOR, false);

        // Door open since open_time = 1_000 (registry creation)
        h.controller.poll_doors_at(2_000).await;
        assert!(h.alert_log.lock().is_empty());

        h.controller.poll_doors_at(31_000).await;
        assert_eq!(*h.alert_log.lock(), vec!["left:open"]);
    }

    #[tokio::test]
    async fn test_alerts_disabled_skips_evaluation() {
        let mut h = harness(Config::default());
        h.controller.poll_doors_at(2_000).await;
        h.controller.poll_doors_at(3_000).await;
        assert!(h.alert_log.lock().is_empty());
        assert_eq!(h.metrics.report().alerts_total, 0);
    }
}
