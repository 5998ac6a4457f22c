//! 🔏 Evidence hashing and record signing
//!
//! Evidence hashes are plain SHA-256 over a canonical JSON rendering of a record's
//! economically meaningful fields. Signatures are HMAC-SHA256 keyed by the signer's
//! secret. Both are hex encoded so they can be stored and byte-compared as text.

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("signing key is empty")]
    EmptyKey,
    #[error("failed to canonicalise record: {0}")]
    Canonicalise(#[from] serde_json::Error),
}

/// SHA-256 (hex) over the canonical JSON form of `value`.
///
/// serde_json writes struct fields in declaration order, which is what makes the
/// rendering canonical for the fixed record types hashed here.
pub fn evidence_hash<T: Serialize>(value: &T) -> Result<String, SigningError> {
    let bytes = serde_json::to_vec(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// HMAC signer bound to one signer identity
#[derive(Clone)]
pub struct RecordSigner {
    signer_id: String,
    key: Vec<u8>,
}

impl std::fmt::Debug for RecordSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSigner")
            .field("signer_id", &self.signer_id)
            .finish_non_exhaustive()
    }
}

impl RecordSigner {
    pub fn new(signer_id: impl Into<String>, key: impl AsRef<[u8]>) -> Result<Self, SigningError> {
        let key = key.as_ref().to_vec();
        if key.is_empty() {
            return Err(SigningError::EmptyKey);
        }
        Ok(Self {
            signer_id: signer_id.into(),
            key,
        })
    }

    pub fn signer_id(&self) -> &str {
        &self.signer_id
    }

    /// Sign an ordered list of fields joined with `|`.
    pub fn sign_fields(&self, fields: &[&str]) -> String {
        let payload = fields.join("|");
        self.sign_bytes(payload.as_bytes())
    }

    /// Sign the canonical JSON form of a record.
    pub fn sign_record<T: Serialize>(&self, record: &T) -> Result<String, SigningError> {
        let bytes = serde_json::to_vec(record)?;
        Ok(self.sign_bytes(&bytes))
    }

    /// Recompute and byte-compare.
    pub fn verify_fields(&self, fields: &[&str], signature: &str) -> bool {
        self.sign_fields(fields).as_bytes() == signature.as_bytes()
    }

    pub fn verify_record<T: Serialize>(&self, record: &T, signature: &str) -> bool {
        match self.sign_record(record) {
            Ok(expected) => expected.as_bytes() == signature.as_bytes(),
            Err(_) => false,
        }
    }

    fn sign_bytes(&self, bytes: &[u8]) -> String {
        // new_from_slice only fails for invalid key lengths, which HMAC does not have
        let mut mac = match HmacSha256::new_from_slice(&self.key) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(bytes);
        hex::encode(mac.finalize().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Sample {
        asset: String,
        price: f64,
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(RecordSigner::new("desk", ""), Err(SigningError::EmptyKey)));
    }

    #[test]
    fn test_evidence_hash_is_deterministic() {
        let a = Sample { asset: "SPY".into(), price: 101.25 };
        let b = Sample { asset: "SPY".into(), price: 101.25 };
        let c = Sample { asset: "SPY".into(), price: 101.26 };

        assert_eq!(evidence_hash(&a).unwrap(), evidence_hash(&b).unwrap());
        assert_ne!(evidence_hash(&a).unwrap(), evidence_hash(&c).unwrap());
        assert_eq!(evidence_hash(&a).unwrap().len(), 64);
    }

    #[test]
    fn test_sign_and_verify_fields() {
        let signer = RecordSigner::new("desk", b"secret").unwrap();
        let sig = signer.sign_fields(&["id-1", "abc", "desk"]);

        assert!(signer.verify_fields(&["id-1", "abc", "desk"], &sig));
        assert!(!signer.verify_fields(&["id-1", "abd", "desk"], &sig));

        let other = RecordSigner::new("desk", b"other-secret").unwrap();
        assert!(!other.verify_fields(&["id-1", "abc", "desk"], &sig));
    }
}
