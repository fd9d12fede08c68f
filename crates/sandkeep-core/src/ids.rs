//! Opaque string identifiers for the core entities in the data model.
//!
//! All IDs are newtypes over `String` rather than raw strings so that a
//! `SandboxId` can never be accidentally passed where a `TemplateId` is
//! expected. Construction from a random UUID is the common case; `parse`
//! accepts any non-empty opaque string (IDs that arrive from external
//! collaborators — the queue, the registry backend — are not necessarily
//! UUIDs).

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! opaque_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a new random identifier.
            pub fn new() -> Self {
                Self(format!("{}-{}", $prefix, Uuid::new_v4()))
            }

            /// Wrap an existing opaque string as an identifier of this kind.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

opaque_id!(SandboxId, "sbx");
opaque_id!(TemplateId, "tpl");
opaque_id!(NodeId, "node");
opaque_id!(SnapshotId, "snap");
opaque_id!(OverlayId, "ovl");
opaque_id!(AuditId, "aud");
opaque_id!(TerminationId, "term");
opaque_id!(TenantId, "tnt");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_prefixes() {
        assert!(SandboxId::new().as_str().starts_with("sbx-"));
        assert!(TemplateId::new().as_str().starts_with("tpl-"));
        assert!(NodeId::new().as_str().starts_with("node-"));
    }

    #[test]
    fn round_trips_through_serde() {
        let id = SandboxId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: SandboxId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn wraps_opaque_strings_from_collaborators() {
        let id = NodeId::from("some-external-id");
        assert_eq!(id.as_str(), "some-external-id");
    }
}
