//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//!
//! NOTE: All atomics use Relaxed ordering intentionally—these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Counters for the polling/actuation/notification pipeline
#[derive(Debug, Default)]
pub struct Metrics {
    /// Controller ticks completed
    ticks_total: AtomicU64,
    /// Door state transitions observed
    transitions_total: AtomicU64,
    /// Relay toggle pulses issued
    toggles_total: AtomicU64,
    /// Alerts dispatched (one per dispatch call, not per channel)
    alerts_total: AtomicU64,
    /// Per-channel send failures
    alert_failures_total: AtomicU64,
    /// Long-poll requests answered immediately
    updates_immediate_total: AtomicU64,
    /// Long-poll waiters resolved by a later transition
    updates_resolved_total: AtomicU64,
    /// Long-poll waiters removed on client disconnect
    updates_cancelled_total: AtomicU64,
    /// Currently parked long-poll waiters
    waiters_parked: AtomicU64,
    /// Commanded closes that timed out without sensor confirmation
    close_unconfirmed_total: AtomicU64,
}

/// Point-in-time snapshot of the counters
#[derive(Debug, Clone, Copy)]
pub struct MetricsSummary {
    pub ticks_total: u64,
    pub transitions_total: u64,
    pub toggles_total: u64,
    pub alerts_total: u64,
    pub alert_failures_total: u64,
    pub updates_immediate_total: u64,
    pub updates_resolved_total: u64,
    pub updates_cancelled_total: u64,
    pub waiters_parked: u64,
    pub close_unconfirmed_total: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            ticks = %self.ticks_total,
            transitions = %self.transitions_total,
            toggles = %self.toggles_total,
            alerts = %self.alerts_total,
            alert_failures = %self.alert_failures_total,
            upd_immediate = %self.updates_immediate_total,
            upd_resolved = %self.updates_resolved_total,
            upd_cancelled = %self.updates_cancelled_total,
            waiters = %self.waiters_parked,
            close_unconfirmed = %self.close_unconfirmed_total,
            "metrics_summary"
        );
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transition(&self) {
        self.transitions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_toggle(&self) {
        self.toggles_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert(&self) {
        self.alerts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert_failure(&self) {
        self.alert_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_immediate_update(&self) {
        self.updates_immediate_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolved_update(&self) {
        self.updates_resolved_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled_update(&self) {
        self.updates_cancelled_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_waiter_parked(&self) {
        self.waiters_parked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_waiter_removed(&self) {
        // Saturating: a guard may fire after the waiter was already resolved
        let _ = self.waiters_parked.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    pub fn record_close_unconfirmed(&self) {
        self.close_unconfirmed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn waiters_parked(&self) -> u64 {
        self.waiters_parked.load(Ordering::Relaxed)
    }

    /// Snapshot all counters for logging or the Prometheus endpoint
    pub fn report(&self) -> MetricsSummary {
        MetricsSummary {
            ticks_total: self.ticks_total.load(Ordering::Relaxed),
            transitions_total: self.transitions_total.load(Ordering::Relaxed),
            toggles_total: self.toggles_total.load(Ordering::Relaxed),
            alerts_total: self.alerts_total.load(Ordering::Relaxed),
            alert_failures_total: self.alert_failures_total.load(Ordering::Relaxed),
            updates_immediate_total: self.updates_immediate_total.load(Ordering::Relaxed),
            updates_resolved_total: self.updates_resolved_total.load(Ordering::Relaxed),
            updates_cancelled_total: self.updates_cancelled_total.load(Ordering::Relaxed),
            waiters_parked: self.waiters_parked.load(Ordering::Relaxed),
            close_unconfirmed_total: self.close_unconfirmed_total.load(Ordering::Relaxed),
        }
    }
}
