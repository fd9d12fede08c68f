use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

/// Every crate in the workspace that is worth a default log level on
/// its own, independent of whatever `RUST_LOG` the operator supplies.
/// Kept as a list rather than one `sandkeep=info` directive because
/// `EnvFilter` matches on the target's full module path and every
/// crate here is `sandkeep_<name>`, not `sandkeep::<name>` — a single
/// `sandkeep` directive matches none of them.
const WORKSPACE_CRATES: &[&str] = &[
    "sandkeep_core",
    "sandkeep_store",
    "sandkeep_build",
    "sandkeep_runtime",
    "sandkeep_plan",
    "sandkeep_policy",
    "sandkeep_admission",
    "sandkeep_control",
    "sandkeep_agent",
    "sandkeep_supervisor",
    "sandkeep_cli",
];

fn default_filter() -> String {
    let mut directives: Vec<String> = WORKSPACE_CRATES.iter().map(|c| format!("{c}=info")).collect();
    directives.push("warn".into());
    directives.join(",")
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable colored output, for interactive CLI use.
    Human,
    /// Structured JSON output, for daemon/agent mode.
    Json,
}

/// Initialize the global tracing subscriber. Call once at program startup.
///
/// `component` tags every line with which binary emitted it (`sandkeep-cli`,
/// `sandkeep-hostd`, ...) — useful once log output from several of this
/// workspace's processes ends up interleaved in the same place. `RUST_LOG`
/// overrides the per-crate defaults in [`default_filter`] entirely.
///
/// Every `#[instrument]`-wrapped method in this workspace (`run_lifecycle`,
/// `prepare`, `request_termination`, ...) gets its entry/exit logged with
/// timing in human mode, so a hung sandbox shows up as a span that opened
/// but never closed rather than silence.
pub fn init(component: &str, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter()));

    match format {
        LogFormat::Human => {
            let subscriber = fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_span_events(FmtSpan::CLOSE)
                .compact();
            tracing_subscriber::registry().with(env_filter).with(subscriber).init();
        }
        LogFormat::Json => {
            let subscriber = fmt::layer().json().with_target(true).with_span_events(FmtSpan::CLOSE);
            tracing_subscriber::registry().with(env_filter).with(subscriber).init();
        }
    }

    tracing::info!(component, format = ?format, "logging initialized");
}
