//! Counters for the Watchdog ("erinyes") and Shutdown Controller
//! ("thanatos") namespaces named in the end-to-end scenarios this crate
//! is tested against. Scoped to this crate's own concerns rather than
//! a process-wide registry: the binary that wires a [`Watchdog`] and
//! [`ShutdownController`] together owns one `Metrics` instance and
//! hands both components an `Arc` to it.
//!
//! [`Watchdog`]: crate::watchdog::Watchdog
//! [`ShutdownController`]: crate::shutdown::ShutdownController

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

#[derive(Default)]
pub struct Metrics {
    kill_total: Mutex<HashMap<String, u64>>,
    arm_total: AtomicU64,
    disarm_total: AtomicU64,
    sleep_total: AtomicU64,
    wake_total: AtomicU64,
    wake_failed_total: AtomicU64,
    completed_total: AtomicU64,
    killed_total: AtomicU64,
    grace_timeout_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_arm(&self) {
        self.arm_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disarm(&self) {
        self.disarm_total.fetch_add(1, Ordering::Relaxed);
    }

    /// `erinyes_kill_total{reason}`.
    pub fn record_kill(&self, reason: &str) {
        let mut table = self.kill_total.lock().expect("metrics poisoned");
        *table.entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn kill_total(&self, reason: &str) -> u64 {
        self.kill_total.lock().expect("metrics poisoned").get(reason).copied().unwrap_or(0)
    }

    pub fn record_sleep(&self) {
        self.sleep_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wake(&self, ok: bool) {
        if ok {
            self.wake_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.wake_failed_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_completed(&self) {
        self.completed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// `thanatos_grace_timeout_total`, incremented alongside `killed_total`
    /// whenever the grace deadline is the reason a run was force-killed.
    pub fn record_grace_timeout(&self) {
        self.grace_timeout_total.fetch_add(1, Ordering::Relaxed);
        self.killed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            kill_total: self.kill_total.lock().expect("metrics poisoned").clone(),
            arm_total: self.arm_total.load(Ordering::Relaxed),
            disarm_total: self.disarm_total.load(Ordering::Relaxed),
            sleep_total: self.sleep_total.load(Ordering::Relaxed),
            wake_total: self.wake_total.load(Ordering::Relaxed),
            wake_failed_total: self.wake_failed_total.load(Ordering::Relaxed),
            completed_total: self.completed_total.load(Ordering::Relaxed),
            killed_total: self.killed_total.load(Ordering::Relaxed),
            grace_timeout_total: self.grace_timeout_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub kill_total: HashMap<String, u64>,
    pub arm_total: u64,
    pub disarm_total: u64,
    pub sleep_total: u64,
    pub wake_total: u64,
    pub wake_failed_total: u64,
    pub completed_total: u64,
    pub killed_total: u64,
    pub grace_timeout_total: u64,
}
