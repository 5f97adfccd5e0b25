//! Expiring resource signatures
//!
//! The push service authenticates WebSocket clients with a signature over the
//! user's id, issued by the platform with a bounded lifetime and verified
//! against the tenant's signing key. The MAC is a keyed blake3 hash;
//! verification compares [`blake3::Hash`] values, which is constant-time.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const KEY_CONTEXT: &str = "oae-activity expiring-signature v1";

/// A signature over a resource id that is only valid until `expires_millis`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiringSignature {
    /// Epoch milliseconds after which the signature is rejected
    pub expires_millis: i64,

    /// Hex-encoded keyed MAC over the resource id and expiry
    pub signature: String,
}

fn mac(key: &str, resource_id: &str, expires_millis: i64) -> blake3::Hash {
    let derived = blake3::derive_key(KEY_CONTEXT, key.as_bytes());
    let mut hasher = blake3::Hasher::new_keyed(&derived);
    hasher.update(resource_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(&expires_millis.to_be_bytes());
    hasher.finalize()
}

/// Sign a resource id with the given key, valid for `ttl_millis` from `now`
#[must_use]
pub fn create_expiring_signature(
    key: &str,
    resource_id: &str,
    now_millis: i64,
    ttl_millis: i64,
) -> ExpiringSignature {
    let expires_millis = now_millis + ttl_millis;
    ExpiringSignature {
        expires_millis,
        signature: mac(key, resource_id, expires_millis).to_hex().to_string(),
    }
}

/// Verify a signature against the key it should have been issued with
pub fn verify_expiring_signature(
    key: &str,
    resource_id: &str,
    signature: &ExpiringSignature,
    now_millis: i64,
) -> Result<()> {
    if signature.expires_millis <= now_millis {
        return Err(Error::Unauthorized("signature expired".into()));
    }

    let presented = blake3::Hash::from_hex(signature.signature.as_bytes())
        .map_err(|_| Error::Unauthorized("malformed signature".into()))?;
    let expected = mac(key, resource_id, signature.expires_millis);

    if presented == expected {
        Ok(())
    } else {
        Err(Error::Unauthorized("signature mismatch".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let sig = create_expiring_signature("key", "u:cam:alice", 1_000, 60_000);
        assert!(verify_expiring_signature("key", "u:cam:alice", &sig, 2_000).is_ok());
    }

    #[test]
    fn test_expired_signature_rejected() {
        let sig = create_expiring_signature("key", "u:cam:alice", 1_000, 60_000);
        assert!(verify_expiring_signature("key", "u:cam:alice", &sig, 61_000).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sig = create_expiring_signature("key", "u:cam:alice", 1_000, 60_000);
        assert!(verify_expiring_signature("other", "u:cam:alice", &sig, 2_000).is_err());
    }

    #[test]
    fn test_wrong_resource_rejected() {
        let sig = create_expiring_signature("key", "u:cam:alice", 1_000, 60_000);
        assert!(verify_expiring_signature("key", "u:cam:bob", &sig, 2_000).is_err());
    }

    #[test]
    fn test_tampered_expiry_rejected() {
        let mut sig = create_expiring_signature("key", "u:cam:alice", 1_000, 60_000);
        sig.expires_millis += 3_600_000;
        assert!(verify_expiring_signature("key", "u:cam:alice", &sig, 2_000).is_err());
    }

    #[test]
    fn test_malformed_signature_rejected() {
        let sig = ExpiringSignature {
            expires_millis: 100_000,
            signature: "not-hex".to_string(),
        };
        assert!(verify_expiring_signature("key", "u:cam:alice", &sig, 2_000).is_err());
    }
}
