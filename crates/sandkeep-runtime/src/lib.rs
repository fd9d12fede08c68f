//! Overlay Pool (C), Network Gateway (D), Snapshot Manager (E) and
//! Runtime Adapter (F): everything a node needs to take an admitted
//! sandbox request from "nothing exists yet" to a running microVM and
//! back down again.

pub mod config;
pub mod firecracker;
pub mod hostd;
pub mod network;
pub mod overlay;
pub mod runtime;
pub mod snapshot;

pub use config::RuntimeConfig;
pub use network::{NetworkError, NetworkGateway};
pub use overlay::{OverlayError, OverlayPool};
pub use runtime::{MockRuntime, Runtime as RuntimeTrait, RuntimeError, VmConfig};
pub use snapshot::{SnapshotError, SnapshotManager};
