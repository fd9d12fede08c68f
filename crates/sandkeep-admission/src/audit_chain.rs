use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sandkeep_core::AuditEvent;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Canonicalize an [`AuditEvent`] into a deterministic JSON string: field
/// order is fixed by re-serializing through a `BTreeMap<String, Value>`
/// rather than relying on struct declaration order, so the hash chain is
/// stable regardless of whether the `serde_json` `preserve_order` feature
/// is enabled elsewhere in the workspace. `hash` itself is excluded since
/// it is the output of this computation, not an input to it.
fn canonicalize(event: &AuditEvent) -> String {
    let mut value = serde_json::to_value(event).expect("AuditEvent always serializes");
    if let Some(obj) = value.as_object_mut() {
        obj.remove("hash");
    }
    let sorted: BTreeMap<String, serde_json::Value> = value
        .as_object()
        .expect("AuditEvent serializes to an object")
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    serde_json::to_string(&sorted).expect("BTreeMap<String, Value> always serializes")
}

/// Compute the chained hash for `event`, given the hash of the event that
/// preceded it (or the empty string for the first event in the chain).
/// The genesis link is implicit: an event whose `previous_hash` is empty
/// is, by definition, the first entry.
pub fn compute_hash(event: &AuditEvent, secret: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(event.previous_hash.as_bytes());
    mac.update(canonicalize(event).as_bytes());
    let digest = mac.finalize().into_bytes();
    encode_hex(&digest)
}

/// Seal `event` by computing and attaching its chained hash in place.
pub fn seal(event: &mut AuditEvent, secret: &[u8]) {
    event.hash = compute_hash(event, secret);
}

/// Verify that every event in `chain` links correctly to its predecessor
/// and that no event's hash has been tampered with. `chain` must already
/// be in append order.
pub fn verify_chain(chain: &[AuditEvent], secret: &[u8]) -> Result<(), String> {
    let mut expected_previous = String::new();
    for (idx, event) in chain.iter().enumerate() {
        if event.previous_hash != expected_previous {
            return Err(format!(
                "event {idx} ({}) has previous_hash '{}', expected '{}'",
                event.id, event.previous_hash, expected_previous
            ));
        }
        let recomputed = compute_hash(event, secret);
        if recomputed != event.hash {
            return Err(format!(
                "event {idx} ({}) hash mismatch: stored '{}', recomputed '{}'",
                event.id, event.hash, recomputed
            ));
        }
        expected_previous = event.hash.clone();
    }
    Ok(())
}

fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{:02x}", b).expect("writing to a String never fails");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandkeep_core::{AuditId, AuditResource, AuditResult};
    use std::collections::BTreeMap as Map;

    fn base_event(previous_hash: &str) -> AuditEvent {
        AuditEvent {
            id: AuditId::new(),
            timestamp: chrono::Utc::now(),
            action: "admitted".into(),
            result: AuditResult::Accepted,
            resource: AuditResource {
                kind: "sandbox".into(),
                id: "sbx-1".into(),
            },
            identity: "tenant:acme".into(),
            metadata: Map::new(),
            previous_hash: previous_hash.into(),
            hash: String::new(),
        }
    }

    #[test]
    fn sealing_is_deterministic_for_the_same_event() {
        let event = base_event("");
        let a = compute_hash(&event, b"secret");
        let b = compute_hash(&event, b"secret");
        assert_eq!(a, b);
    }

    #[test]
    fn different_secrets_produce_different_hashes() {
        let event = base_event("");
        assert_ne!(
            compute_hash(&event, b"secret-a"),
            compute_hash(&event, b"secret-b")
        );
    }

    #[test]
    fn chain_of_two_events_verifies() {
        let mut first = base_event("");
        seal(&mut first, b"secret");

        let mut second = base_event(&first.hash);
        second.action = "completed".into();
        seal(&mut second, b"secret");

        assert!(verify_chain(&[first, second], b"secret").is_ok());
    }

    #[test]
    fn tampering_with_an_event_breaks_verification() {
        let mut first = base_event("");
        seal(&mut first, b"secret");
        let mut second = base_event(&first.hash);
        seal(&mut second, b"secret");

        let mut tampered = second.clone();
        tampered.action = "killed".into();

        assert!(verify_chain(&[first, tampered], b"secret").is_err());
    }

    #[test]
    fn broken_previous_hash_link_is_detected() {
        let mut first = base_event("");
        seal(&mut first, b"secret");
        let mut second = base_event("not-the-real-previous-hash");
        seal(&mut second, b"secret");

        assert!(verify_chain(&[first, second], b"secret").is_err());
    }
}
