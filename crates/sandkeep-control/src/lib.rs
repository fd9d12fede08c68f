//! Control plane: least-loaded Scheduler, per-node Dispatch Queue, node
//! Registry and the QUIC server/client pair node agents talk to for
//! heartbeat delivery and out-of-band commands.

pub mod client;
pub mod config;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod tls;

pub use client::ControlClient;
pub use config::{ControlConfig, ControlGlobal, EtcdEntry};
pub use protocol::{ControlCommand, ControlRequest, ControlResponse};
pub use queue::{DispatchQueue, InMemoryQueue, LeaseId};
pub use registry::{EtcdRegistry, InMemoryRegistry, Registry};
pub use scheduler::Scheduler;
pub use server::{CommandOutbox, ControlServer};
