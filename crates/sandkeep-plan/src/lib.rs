//! Submission-time contract: bundles a `SandboxRequest` with its
//! `TemplateSpec` and, when crossing a trust boundary, an Ed25519
//! signature covering both.

mod plan;
mod signing;

pub use plan::Plan;
pub use signing::{
    generate_keypair, sign_payload, verify_and_extract, verify_signed_payload, SignedPayload,
    SigningError,
};
