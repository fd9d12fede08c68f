//! Admission Chain and tamper-evident audit hash chain: an ordered
//! sequence of judges evaluated strictly in order against every
//! incoming request, plus a post-hoc classification merge for
//! terminated runs.

mod audit_chain;
mod audit_judge;
mod chain;
mod judge;
mod network_judge;
mod rate_judge;
mod resource_judge;
mod sink;

pub use audit_chain::{compute_hash, seal, verify_chain};
pub use audit_judge::AuditJudge;
pub use chain::AdmissionChain;
pub use judge::{merge_classifications, Classification, Judge, Verdict};
pub use network_judge::NetworkJudge;
pub use rate_judge::RateJudge;
pub use resource_judge::ResourceJudge;
pub use sink::{AuditSink, InMemorySink, JsonlFileSink};
