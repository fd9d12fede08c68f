//! Policy Store: holds `SandboxPolicy`/`NetworkContract`/
//! `GracePolicy` bundles consulted by the Admission Chain and Shutdown
//! Controller, with optional Ed25519 signature verification on insert.

mod error;
mod store;

pub use error::PolicyError;
pub use store::PolicyStore;
