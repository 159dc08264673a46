//! Index values
//!
//! A value is what the index maps a multihash to: the provider that serves
//! the content, the provider-scoped context id the mapping belongs to, and
//! opaque provider-defined metadata carried verbatim to clients.

use crate::error::Result;
use crate::peer::PeerId;
use minicbor::{Decoder, Encoder};

/// One (provider, context, metadata) tuple stored against a multihash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Value {
    /// Provider serving the content.
    pub provider_id: PeerId,
    /// Opaque provider-scoped grouping of entries.
    pub context_id: Vec<u8>,
    /// Opaque provider-defined metadata, returned verbatim in find responses.
    pub metadata: Vec<u8>,
}

impl Value {
    pub fn new(provider_id: PeerId, context_id: Vec<u8>, metadata: Vec<u8>) -> Self {
        Self {
            provider_id,
            context_id,
            metadata,
        }
    }

    /// Whether two values address the same (provider, context) slot.
    ///
    /// Puts for the same slot replace the stored metadata; removes match on
    /// the slot regardless of metadata.
    pub fn same_slot(&self, other: &Value) -> bool {
        self.provider_id == other.provider_id && self.context_id == other.context_id
    }
}

/// Encode a list of values as a CBOR array (the stored form in engines).
pub fn encode_values(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut e = Encoder::new(&mut buf);
    e.array(values.len() as u64).expect("vec write");
    for v in values {
        e.array(3).expect("vec write");
        e.bytes(&v.provider_id.to_bytes()).expect("vec write");
        e.bytes(&v.context_id).expect("vec write");
        e.bytes(&v.metadata).expect("vec write");
    }
    buf
}

/// Decode a list of values from its stored CBOR form.
pub fn decode_values(bytes: &[u8]) -> Result<Vec<Value>> {
    let mut d = Decoder::new(bytes);
    let len = d.array()?.unwrap_or(0);
    let mut values = Vec::with_capacity(len as usize);
    for _ in 0..len {
        d.array()?;
        let provider_id = PeerId::from_bytes(d.bytes()?)?;
        let context_id = d.bytes()?.to_vec();
        let metadata = d.bytes()?.to_vec();
        values.push(Value {
            provider_id,
            context_id,
            metadata,
        });
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_signing_key(&SigningKey::from_bytes(&[seed; 32]))
    }

    #[test]
    fn test_value_codec_round_trip() {
        let values = vec![
            Value::new(peer(1), b"ctx-A".to_vec(), b"meta".to_vec()),
            Value::new(peer(2), vec![], vec![0xde, 0xad]),
        ];
        let bytes = encode_values(&values);
        assert_eq!(decode_values(&bytes).unwrap(), values);
    }

    #[test]
    fn test_empty_value_list() {
        let bytes = encode_values(&[]);
        assert!(decode_values(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_same_slot_ignores_metadata() {
        let a = Value::new(peer(1), b"ctx".to_vec(), b"m1".to_vec());
        let b = Value::new(peer(1), b"ctx".to_vec(), b"m2".to_vec());
        let c = Value::new(peer(1), b"other".to_vec(), b"m1".to_vec());
        assert!(a.same_slot(&b));
        assert!(!a.same_slot(&c));
        // Full equality still requires metadata to match.
        assert_ne!(a, b);
    }
}
