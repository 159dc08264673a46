//! Self-describing peer identities
//!
//! A `PeerId` is the base58btc encoding of `0xed 0x01 || ed25519-pubkey`,
//! so the public key needed to verify a peer's signatures is recoverable
//! from the id itself. No external key infrastructure is required.

use crate::error::{Error, Result};
use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Multicodec prefix for an ed25519 public key (varint 0xed = `0xed 0x01`).
const ED25519_PREFIX: [u8; 2] = [0xed, 0x01];

/// A peer identity embedding its ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    key: [u8; 32],
}

impl PeerId {
    /// Build a peer id from a raw 32-byte ed25519 public key.
    pub fn from_public_key(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Build a peer id from a signing key's public half.
    pub fn from_signing_key(signing_key: &SigningKey) -> Self {
        Self {
            key: signing_key.verifying_key().to_bytes(),
        }
    }

    /// Raw public key bytes.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Parse the embedded public key into a verifying key.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.key).map_err(|e| Error::invalid_peer_id(e.to_string()))
    }

    /// Verify an ed25519 signature made by this peer.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        if signature.len() != 64 {
            return Err(Error::signature(format!(
                "ed25519 signature must be 64 bytes, got {}",
                signature.len()
            )));
        }
        let sig =
            Signature::from_slice(signature).map_err(|e| Error::signature(e.to_string()))?;
        self.verifying_key()?
            .verify(message, &sig)
            .map_err(|e| Error::signature(e.to_string()))
    }

    /// The self-describing wire bytes: `0xed 0x01 || pubkey`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(34);
        bytes.extend_from_slice(&ED25519_PREFIX);
        bytes.extend_from_slice(&self.key);
        bytes
    }

    /// Parse the self-describing wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 34 || bytes[..2] != ED25519_PREFIX {
            return Err(Error::invalid_peer_id(format!(
                "expected 34 bytes with ed25519 prefix, got {} bytes",
                bytes.len()
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes[2..]);
        Ok(Self { key })
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.to_bytes()).into_string())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| Error::invalid_peer_id(format!("base58 decode failed: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    #[test]
    fn test_peer_id_string_round_trip() {
        let id = PeerId::from_signing_key(&test_key(1));
        let s = id.to_string();
        let parsed = PeerId::from_str(&s).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_peer_id_bytes_round_trip() {
        let id = PeerId::from_signing_key(&test_key(2));
        let parsed = PeerId::from_bytes(&id.to_bytes()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_peer_id_rejects_bad_prefix() {
        let mut bytes = PeerId::from_signing_key(&test_key(3)).to_bytes();
        bytes[0] = 0x00;
        assert!(PeerId::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_peer_id_rejects_bad_base58() {
        assert!(PeerId::from_str("not base58 0OIl").is_err());
    }

    #[test]
    fn test_verify_signature_from_id() {
        use ed25519_dalek::Signer;

        let key = test_key(4);
        let id = PeerId::from_signing_key(&key);
        let message = b"advertisement payload";
        let sig = key.sign(message).to_bytes();

        assert!(id.verify(message, &sig).is_ok());
        assert!(id.verify(b"tampered", &sig).is_err());

        let mut bad_sig = sig;
        bad_sig[0] ^= 0xff;
        assert!(id.verify(message, &bad_sig).is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let id = PeerId::from_signing_key(&test_key(5));
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
