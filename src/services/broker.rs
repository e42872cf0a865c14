//! Long-poll update broker
//!
//! Clients ask for door transitions newer than a cursor timestamp. When no
//! satisfying data exists the request parks as a waiter; a later controller
//! tick resolves it through `notify`. A waiter leaves the registry exactly one
//! of two ways: resolved (envelope delivered) or cancelled (the request future
//! was dropped because the client disconnected). There is no server timeout —
//! an unsatisfiable cursor parks indefinitely.

use crate::domain::types::DoorUpdate;
use crate::infra::metrics::Metrics;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

struct Waiter {
    id: u64,
    cursor: u64,
    callback: Option<String>,
    tx: oneshot::Sender<String>,
}

pub struct UpdateBroker {
    waiters: Mutex<Vec<Waiter>>,
    next_id: AtomicU64,
    metrics: Arc<Metrics>,
}

impl UpdateBroker {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { waiters: Mutex::new(Vec::new()), next_id: AtomicU64::new(1), metrics }
    }

    /// Doors whose published transition satisfies the cursor.
    ///
    /// Doors still in their startup `unknown` state are not reportable: a
    /// cursor of 0 issued before any transition must park rather than be
    /// answered with states nobody has derived yet.
    pub fn updates_since(snapshot: &[DoorUpdate], cursor: u64) -> Vec<DoorUpdate> {
        snapshot
            .iter()
            .filter(|u| !matches!(u.state, crate::domain::types::DoorState::Unknown))
            .filter(|u| u.state_time >= cursor)
            .cloned()
            .collect()
    }

    /// Wire envelope: `{"timestamp": now, "update": [[id, state, state_time], ...]}`,
    /// wrapped as `callback(<json>)` when a JSONP callback name was supplied.
    pub fn envelope(updates: &[DoorUpdate], callback: Option<&str>, now: u64) -> String {
        let rows: Vec<_> =
            updates.iter().map(|u| json!([u.id, u.state, u.state_time])).collect();
        let body = json!({ "timestamp": now, "update": rows }).to_string();
        match callback {
            Some(name) => format!("{}({})", name, body),
            None => body,
        }
    }

    /// Park a request that could not be satisfied immediately.
    ///
    /// The returned handle removes the waiter on drop, so a disconnected
    /// client cleans itself out of the pending set without delivery.
    pub fn park(self: &Arc<Self>, cursor: u64, callback: Option<String>) -> ParkedRequest {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push(Waiter { id, cursor, callback, tx });
        self.metrics.record_waiter_parked();
        debug!(waiter = %id, cursor = %cursor, "update_request_parked");
        ParkedRequest { guard: WaiterGuard { broker: self.clone(), id }, rx }
    }

    /// Resolve every parked waiter the snapshot satisfies.
    ///
    /// Called by the controller after a full tick walk, so the snapshot is
    /// consistent and covers all doors that changed this tick — a waiter may
    /// be resolved by any transition, not only the one that triggered the
    /// notify.
    pub fn notify(&self, snapshot: &[DoorUpdate], now: u64) {
        let mut waiters = self.waiters.lock();
        let mut kept = Vec::with_capacity(waiters.len());
        for waiter in waiters.drain(..) {
            let updates = Self::updates_since(snapshot, waiter.cursor);
            if updates.is_empty() {
                kept.push(waiter);
                continue;
            }
            let body = Self::envelope(&updates, waiter.callback.as_deref(), now);
            if waiter.tx.send(body).is_err() {
                // Receiver already dropped; the guard will account for it
                debug!(waiter = %waiter.id, "update_receiver_gone");
            }
            self.metrics.record_resolved_update();
            self.metrics.record_waiter_removed();
        }
        *waiters = kept;
    }

    /// Number of currently parked waiters
    pub fn pending_count(&self) -> usize {
        self.waiters.lock().len()
    }

    fn remove(&self, id: u64) -> bool {
        let mut waiters = self.waiters.lock();
        let before = waiters.len();
        waiters.retain(|w| w.id != id);
        before != waiters.len()
    }
}

/// A parked long-poll request
pub struct ParkedRequest {
    guard: WaiterGuard,
    rx: oneshot::Receiver<String>,
}

impl ParkedRequest {
    /// Wait for resolution. Returns `None` only if the broker dropped the
    /// waiter without sending, which does not happen in normal operation.
    pub async fn wait(self) -> Option<String> {
        let body = self.rx.await.ok();
        drop(self.guard); // resolved waiters are already out of the set; this is a no-op
        body
    }
}

struct WaiterGuard {
    broker: Arc<UpdateBroker>,
    id: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if self.broker.remove(self.id) {
            self.broker.metrics.record_cancelled_update();
            self.broker.metrics.record_waiter_removed();
            debug!(waiter = %self.id, "update_request_cancelled");
        }
    }
}
