use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid signature length: {0} (expected 64)")]
    InvalidSignatureLength(usize),

    #[error("signature verification failed: no trusted key matched (signer: {0})")]
    NoTrustedKeyMatched(String),

    #[error("failed to deserialize signed payload: {0}")]
    Deserialize(String),
}

/// A signed payload: the raw bytes of the canonical JSON, the Ed25519
/// signature over those bytes, and an identifier for which key
/// produced the signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPayload {
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
    pub signer_id: String,
}

/// Sign a payload with an Ed25519 signing key.
pub fn sign_payload(payload: &[u8], key: &SigningKey, signer_id: &str) -> SignedPayload {
    let signature = key.sign(payload);
    SignedPayload {
        payload: payload.to_vec(),
        signature: signature.to_bytes().to_vec(),
        signer_id: signer_id.to_string(),
    }
}

/// Verify a signed payload against a set of trusted public keys.
/// Succeeds if any one of `trusted_keys` validates the signature.
pub fn verify_signed_payload(
    signed: &SignedPayload,
    trusted_keys: &[VerifyingKey],
) -> Result<(), SigningError> {
    if signed.signature.len() != 64 {
        return Err(SigningError::InvalidSignatureLength(signed.signature.len()));
    }

    let sig_bytes: [u8; 64] = signed
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| SigningError::InvalidSignatureLength(signed.signature.len()))?;
    let signature = Signature::from_bytes(&sig_bytes);

    for key in trusted_keys {
        if key.verify(&signed.payload, &signature).is_ok() {
            return Ok(());
        }
    }

    Err(SigningError::NoTrustedKeyMatched(signed.signer_id.clone()))
}

/// Verify a signed payload against provided trusted keys, then
/// deserialize its JSON payload as `T`. Callers with no trusted keys
/// configured (locally-authored, unsigned use) should skip this and
/// deserialize the payload directly — verification is opt-in, matching
/// the Policy Store's own optional Ed25519 check.
pub fn verify_and_extract<T: serde::de::DeserializeOwned>(
    signed: &SignedPayload,
    trusted_keys: &[VerifyingKey],
) -> Result<T, SigningError> {
    verify_signed_payload(signed, trusted_keys)?;
    serde_json::from_slice(&signed.payload).map_err(|e| SigningError::Deserialize(e.to_string()))
}

/// Generate a new Ed25519 signing keypair, returning the signing key
/// and the base64-encoded verifying key for distribution.
pub fn generate_keypair() -> (SigningKey, String) {
    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    let verifying_key = signing_key.verifying_key();
    let pub_b64 = base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        verifying_key.as_bytes(),
    );
    (signing_key, pub_b64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let (signing_key, _) = generate_keypair();
        let verifying_key = signing_key.verifying_key();
        let signed = sign_payload(b"desired state JSON", &signing_key, "test-coordinator");
        assert!(verify_signed_payload(&signed, &[verifying_key]).is_ok());
    }

    #[test]
    fn verify_wrong_key_fails() {
        let (key_a, _) = generate_keypair();
        let (key_b, _) = generate_keypair();
        let signed = sign_payload(b"desired state JSON", &key_a, "coordinator-a");
        let err = verify_signed_payload(&signed, &[key_b.verifying_key()]).unwrap_err();
        assert!(matches!(err, SigningError::NoTrustedKeyMatched(_)));
    }

    #[test]
    fn verify_tampered_payload_fails() {
        let (signing_key, _) = generate_keypair();
        let verifying_key = signing_key.verifying_key();
        let mut signed = sign_payload(b"original payload", &signing_key, "test");
        signed.payload = b"tampered payload".to_vec();
        assert!(verify_signed_payload(&signed, &[verifying_key]).is_err());
    }

    #[test]
    fn verify_with_multiple_trusted_keys() {
        let (key_a, _) = generate_keypair();
        let (key_b, _) = generate_keypair();
        let signed = sign_payload(b"payload", &key_b, "coordinator-b");
        let trusted = vec![key_a.verifying_key(), key_b.verifying_key()];
        assert!(verify_signed_payload(&signed, &trusted).is_ok());
    }

    #[test]
    fn empty_trusted_keys_always_fails() {
        let (key, _) = generate_keypair();
        let signed = sign_payload(b"data", &key, "test");
        assert!(verify_signed_payload(&signed, &[]).is_err());
    }

    #[test]
    fn verify_and_extract_roundtrips_json() {
        let (key, _) = generate_keypair();
        let payload = serde_json::to_vec(&serde_json::json!({"hello": "world"})).unwrap();
        let signed = sign_payload(&payload, &key, "test");
        let extracted: serde_json::Value =
            verify_and_extract(&signed, &[key.verifying_key()]).unwrap();
        assert_eq!(extracted["hello"], "world");
    }

    #[test]
    fn generate_keypair_produces_usable_key() {
        let (signing_key, pub_b64) = generate_keypair();
        let decoded =
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &pub_b64).unwrap();
        assert_eq!(decoded.len(), 32);
        let signed = sign_payload(b"test", &signing_key, "gen-test");
        assert!(verify_signed_payload(&signed, &[signing_key.verifying_key()]).is_ok());
    }
}
