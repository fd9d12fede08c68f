//! Watchdog (L), Sleep Manager (M) and Shutdown Controller (N): the
//! three long-running pieces of a sandbox's life past `launch`. The
//! node agent arms a [`Watchdog`] and hands off to the
//! [`ShutdownController`] on every exit path; the [`SleepManager`] is
//! invoked either directly (an operator asking to hibernate a sandbox)
//! or by the controller itself when a grace policy asks to checkpoint
//! before tearing down.

pub mod metrics;
pub mod shutdown;
pub mod sleep;
pub mod watchdog;

pub use metrics::{Metrics, MetricsSnapshot};
pub use shutdown::{DeferredStatus, ShutdownController, ShutdownError, TerminationOutcome, TerminationPhase, TerminationRequest};
pub use sleep::{SleepError, SleepManager, SleepOptions};
pub use watchdog::Watchdog;
