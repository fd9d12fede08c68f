use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::AuditId;

/// What kind of resource an [`AuditEvent`] is about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResource {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

/// The outcome of the audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Accepted,
    Rejected,
    Completed,
    Killed,
    Failed,
}

/// A single tamper-evident audit log entry.
///
/// `previous_hash`/`hash` form a hash chain computed by
/// `sandkeep_admission::audit_chain`; this type only carries the data —
/// it has no opinion on how the hash is derived, so `sandkeep-core` stays
/// free of the HMAC dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: AuditId,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub action: String,
    pub result: AuditResult,
    pub resource: AuditResource,
    pub identity: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub previous_hash: String,
    #[serde(default)]
    pub hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_expected_result_tag() {
        let event = AuditEvent {
            id: AuditId::new(),
            timestamp: chrono::Utc::now(),
            action: "admitted".into(),
            result: AuditResult::Accepted,
            resource: AuditResource {
                kind: "sandbox".into(),
                id: "sbx-1".into(),
            },
            identity: "tenant:acme".into(),
            metadata: BTreeMap::new(),
            previous_hash: String::new(),
            hash: String::new(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"accepted\""));
    }
}
