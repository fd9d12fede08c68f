//! Image Builder: assembles a rootfs directory from a
//! content-addressed layer manifest, deduplicating against the blob
//! store, and packages a rootfs directory into a filesystem image via
//! an external tool.

mod build;
mod errors;
mod manifest;

pub use build::{assemble, build_rootfs, RegistryClient, ScanHook};
pub use errors::BuildError;
pub use manifest::{LayerDescriptor, Manifest};
