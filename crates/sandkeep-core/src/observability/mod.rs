//! Ambient stack shared by every binary: structured logging init and a
//! process-wide Prometheus-style counter registry.

pub mod logging;
pub mod metrics;

pub use logging::{init as init_logging, LogFormat};
pub use metrics::{global as metrics, Metrics, MetricsSnapshot};
