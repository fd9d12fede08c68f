use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Global metrics registry (singleton), shared by every binary in the
/// process regardless of which role (agent, control plane, CLI) it plays.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get or initialize the process-wide metrics instance.
pub fn global() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Process-wide counters. Every increment is a non-blocking atomic add;
/// metrics never observe I/O or take a lock.
pub struct Metrics {
    // ── Control-plane requests ──────────────────────────────────────
    pub requests_total: AtomicU64,
    pub requests_heartbeat: AtomicU64,
    pub requests_submit: AtomicU64,
    pub requests_status: AtomicU64,
    pub requests_cancel: AtomicU64,
    pub requests_failed: AtomicU64,

    // ── Admission ────────────────────────────────────────────────────
    pub admission_accepted: AtomicU64,
    pub admission_rejected: AtomicU64,

    // ── Scheduler ────────────────────────────────────────────────────
    pub schedule_attempts: AtomicU64,
    pub schedule_failures: AtomicU64,

    // ── Run lifecycle ────────────────────────────────────────────────
    pub runs_scheduled: AtomicU64,
    pub runs_started: AtomicU64,
    pub runs_succeeded: AtomicU64,
    pub runs_failed: AtomicU64,
    pub runs_canceled: AtomicU64,
    pub runs_slept: AtomicU64,
    pub runs_woken: AtomicU64,

    // ── Connections ──────────────────────────────────────────────────
    pub connections_accepted: AtomicU64,
    pub connections_rejected: AtomicU64,
}

impl Metrics {
    fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            requests_heartbeat: AtomicU64::new(0),
            requests_submit: AtomicU64::new(0),
            requests_status: AtomicU64::new(0),
            requests_cancel: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            admission_accepted: AtomicU64::new(0),
            admission_rejected: AtomicU64::new(0),
            schedule_attempts: AtomicU64::new(0),
            schedule_failures: AtomicU64::new(0),
            runs_scheduled: AtomicU64::new(0),
            runs_started: AtomicU64::new(0),
            runs_succeeded: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            runs_canceled: AtomicU64::new(0),
            runs_slept: AtomicU64::new(0),
            runs_woken: AtomicU64::new(0),
            connections_accepted: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
        }
    }

    /// Collect a point-in-time snapshot for serialization.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_heartbeat: self.requests_heartbeat.load(Ordering::Relaxed),
            requests_submit: self.requests_submit.load(Ordering::Relaxed),
            requests_status: self.requests_status.load(Ordering::Relaxed),
            requests_cancel: self.requests_cancel.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            admission_accepted: self.admission_accepted.load(Ordering::Relaxed),
            admission_rejected: self.admission_rejected.load(Ordering::Relaxed),
            schedule_attempts: self.schedule_attempts.load(Ordering::Relaxed),
            schedule_failures: self.schedule_failures.load(Ordering::Relaxed),
            runs_scheduled: self.runs_scheduled.load(Ordering::Relaxed),
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_succeeded: self.runs_succeeded.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            runs_canceled: self.runs_canceled.load(Ordering::Relaxed),
            runs_slept: self.runs_slept.load(Ordering::Relaxed),
            runs_woken: self.runs_woken.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
        }
    }

    /// Render in Prometheus exposition format, namespaced `sandkeep_`.
    pub fn prometheus_exposition(&self) -> String {
        let s = self.snapshot();
        let mut out = String::with_capacity(2048);

        write_metric(&mut out, "sandkeep_requests_total", s.requests_total, "Total control-plane requests received");
        write_metric(&mut out, "sandkeep_requests_heartbeat_total", s.requests_heartbeat, "Heartbeat requests");
        write_metric(&mut out, "sandkeep_requests_submit_total", s.requests_submit, "Submit requests");
        write_metric(&mut out, "sandkeep_requests_status_total", s.requests_status, "Status requests");
        write_metric(&mut out, "sandkeep_requests_cancel_total", s.requests_cancel, "Cancel requests");
        write_metric(&mut out, "sandkeep_requests_failed_total", s.requests_failed, "Requests that ended in error");
        write_metric(&mut out, "sandkeep_admission_accepted_total", s.admission_accepted, "Requests accepted by the admission chain");
        write_metric(&mut out, "sandkeep_admission_rejected_total", s.admission_rejected, "Requests rejected by the admission chain");
        write_metric(&mut out, "sandkeep_schedule_attempts_total", s.schedule_attempts, "Scheduling attempts made");
        write_metric(&mut out, "sandkeep_schedule_failures_total", s.schedule_failures, "Scheduling attempts exhausted with no node fitting");
        write_metric(&mut out, "sandkeep_runs_scheduled_total", s.runs_scheduled, "Runs scheduled onto a node");
        write_metric(&mut out, "sandkeep_runs_started_total", s.runs_started, "Runs that reached Running");
        write_metric(&mut out, "sandkeep_runs_succeeded_total", s.runs_succeeded, "Runs that reached Succeeded");
        write_metric(&mut out, "sandkeep_runs_failed_total", s.runs_failed, "Runs that reached Failed");
        write_metric(&mut out, "sandkeep_runs_canceled_total", s.runs_canceled, "Runs that reached Canceled");
        write_metric(&mut out, "sandkeep_runs_slept_total", s.runs_slept, "Runs put to sleep by the sleep manager");
        write_metric(&mut out, "sandkeep_runs_woken_total", s.runs_woken, "Runs woken from sleep");
        write_metric(&mut out, "sandkeep_connections_accepted_total", s.connections_accepted, "Control-plane connections accepted");
        write_metric(&mut out, "sandkeep_connections_rejected_total", s.connections_rejected, "Control-plane connections rejected");

        out
    }
}

fn write_metric(out: &mut String, name: &str, value: u64, help: &str) {
    use std::fmt::Write;
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

/// Serializable snapshot of all counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_heartbeat: u64,
    pub requests_submit: u64,
    pub requests_status: u64,
    pub requests_cancel: u64,
    pub requests_failed: u64,
    pub admission_accepted: u64,
    pub admission_rejected: u64,
    pub schedule_attempts: u64,
    pub schedule_failures: u64,
    pub runs_scheduled: u64,
    pub runs_started: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_canceled: u64,
    pub runs_slept: u64,
    pub runs_woken: u64,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
}
