//! Content identifiers and multihash helpers
//!
//! Sextant identifies advertisements and entry blocks by CIDv1 over the
//! dag-cbor codec with sha2-256, using the multiformats crates. The
//! canonical string form is base32-lower (`bafy...`), which is what appears
//! in JSON, logs, and datastore keys.

use crate::error::{Error, Result};
use sha2::Digest;

pub use cid::Cid;

/// Fixed-size multihash used throughout sextant (64-byte digest capacity).
pub type Multihash = multihash::Multihash<64>;

/// Multicodec for dag-cbor encoded blocks (advertisements, entry nodes).
pub const CODEC_DAG_CBOR: u64 = 0x71;

/// Multicodec for raw byte blocks.
pub const CODEC_RAW: u64 = 0x55;

/// SHA2-256 multihash code (standard).
const SHA2_256: u64 = 0x12;

/// Compute the sha2-256 multihash of the given bytes.
pub fn sha256_multihash(bytes: &[u8]) -> Multihash {
    let digest = sha2::Sha256::digest(bytes);
    Multihash::wrap(SHA2_256, &digest).expect("sha2-256 digest fits the multihash capacity")
}

/// Compute the CIDv1 of a block under the given codec.
pub fn cid_for_data(codec: u64, bytes: &[u8]) -> Cid {
    Cid::new_v1(codec, sha256_multihash(bytes))
}

/// Parse a CID from its canonical string form.
pub fn parse_cid(s: &str) -> Result<Cid> {
    s.parse::<Cid>().map_err(|e| Error::invalid_cid(e.to_string()))
}

/// Parse a multihash from its raw bytes.
pub fn parse_multihash(bytes: &[u8]) -> Result<Multihash> {
    Multihash::from_bytes(bytes).map_err(|e| Error::invalid_cid(e.to_string()))
}

/// Pad a store key up to `min_len` bytes.
///
/// Engines with a minimum key length cannot index shorter multihashes
/// directly; padding is deterministic so lookups and inserts agree.
/// Keys at or above the minimum are returned unchanged.
pub fn pad_key(key: &[u8], min_len: usize) -> Vec<u8> {
    let mut padded = key.to_vec();
    if padded.len() < min_len {
        padded.resize(min_len, 0);
    }
    padded
}

/// Serde adapter for `Option<Cid>` rendered as the canonical string form.
pub mod cid_serde_opt {
    use super::Cid;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Cid>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(cid) => serializer.serialize_some(&cid.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Cid>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            Some(s) => s
                .parse::<Cid>()
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
