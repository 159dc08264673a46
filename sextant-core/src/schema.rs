//! Advertisement chain schema and wire codec
//!
//! Publishers describe the content they host as a signed chain of
//! advertisements. Each advertisement links to the previous one, carries the
//! provider identity and addresses, and points at a chain of entry blocks
//! (or a HAMT root) enumerating the advertised multihashes.
//!
//! All records are CBOR maps with string keys so that staged blocks can be
//! recognized structurally: an advertisement is any map with a `Signature`
//! field, a HAMT root is any map with a `hamt` field.

use crate::error::{Error, Result};
use crate::link::{cid_for_data, Cid, Multihash, CODEC_DAG_CBOR, CODEC_RAW};
use crate::peer::PeerId;
use ed25519_dalek::{Signer, SigningKey};
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};

/// Sentinel CID marking an advertisement that intentionally has no entries
/// (used as a chain placeholder, e.g. after a removal).
pub fn no_entries_cid() -> Cid {
    cid_for_data(CODEC_RAW, b"sextant/no-entries")
}

/// The entries link of an advertisement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Entries {
    /// No entry blocks; the advertisement only extends the chain.
    NoEntries,
    /// Link to the first entry block (chunk chain or HAMT root).
    Link(Cid),
}

impl Entries {
    fn to_cid(&self) -> Cid {
        match self {
            Entries::NoEntries => no_entries_cid(),
            Entries::Link(cid) => *cid,
        }
    }

    fn from_cid(cid: Cid) -> Self {
        if cid == no_entries_cid() {
            Entries::NoEntries
        } else {
            Entries::Link(cid)
        }
    }
}

/// An alternate provider record carried by an advertisement.
///
/// Extended providers are returned alongside the main provider in find
/// responses; they are never independently indexed.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExtendedProviderEntry {
    pub peer_id: PeerId,
    pub addrs: Vec<String>,
    pub metadata: Vec<u8>,
}

/// A signed advertisement in a publisher's chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertisement {
    /// Link to the prior advertisement, or None for the chain start.
    pub previous: Option<Cid>,
    /// Provider the entries belong to.
    pub provider: PeerId,
    /// Provider addresses at publish time.
    pub addresses: Vec<String>,
    /// Context the entries are scoped to.
    pub context_id: Vec<u8>,
    /// Opaque metadata stored with each indexed multihash.
    pub metadata: Vec<u8>,
    /// Link to the entry blocks, or the no-entries sentinel.
    pub entries: Entries,
    /// True if this advertisement removes the (provider, context) entries.
    pub is_rm: bool,
    /// Alternate providers for this advertisement's context.
    pub extended_providers: Vec<ExtendedProviderEntry>,
    /// Ed25519 signature by the publisher over the encoding minus this field.
    pub signature: Vec<u8>,
}

impl Advertisement {
    /// CBOR-encode the advertisement.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.map(9).expect("vec write");
        e.str("Previous").expect("vec write");
        match &self.previous {
            Some(cid) => e.bytes(&cid.to_bytes()).expect("vec write"),
            None => e.null().expect("vec write"),
        };
        e.str("Provider").expect("vec write");
        e.bytes(&self.provider.to_bytes()).expect("vec write");
        e.str("Addresses").expect("vec write");
        e.array(self.addresses.len() as u64).expect("vec write");
        for addr in &self.addresses {
            e.str(addr).expect("vec write");
        }
        e.str("ContextID").expect("vec write");
        e.bytes(&self.context_id).expect("vec write");
        e.str("Metadata").expect("vec write");
        e.bytes(&self.metadata).expect("vec write");
        e.str("Entries").expect("vec write");
        e.bytes(&self.entries.to_cid().to_bytes()).expect("vec write");
        e.str("IsRm").expect("vec write");
        e.bool(self.is_rm).expect("vec write");
        e.str("ExtendedProviders").expect("vec write");
        if self.extended_providers.is_empty() {
            e.null().expect("vec write");
        } else {
            e.array(self.extended_providers.len() as u64).expect("vec write");
            for ep in &self.extended_providers {
                e.map(3).expect("vec write");
                e.str("ID").expect("vec write");
                e.bytes(&ep.peer_id.to_bytes()).expect("vec write");
                e.str("Addresses").expect("vec write");
                e.array(ep.addrs.len() as u64).expect("vec write");
                for addr in &ep.addrs {
                    e.str(addr).expect("vec write");
                }
                e.str("Metadata").expect("vec write");
                e.bytes(&ep.metadata).expect("vec write");
            }
        }
        e.str("Signature").expect("vec write");
        e.bytes(&self.signature).expect("vec write");
        buf
    }

    /// Decode an advertisement from its CBOR encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(bytes);
        let len = d
            .map()?
            .ok_or_else(|| Error::decode("indefinite-length advertisement map"))?;

        let mut previous = None;
        let mut provider = None;
        let mut addresses = Vec::new();
        let mut context_id = Vec::new();
        let mut metadata = Vec::new();
        let mut entries = None;
        let mut is_rm = false;
        let mut extended_providers = Vec::new();
        let mut signature = Vec::new();

        for _ in 0..len {
            match d.str()? {
                "Previous" => previous = decode_opt_cid(&mut d)?,
                "Provider" => provider = Some(PeerId::from_bytes(d.bytes()?)?),
                "Addresses" => addresses = decode_str_array(&mut d)?,
                "ContextID" => context_id = d.bytes()?.to_vec(),
                "Metadata" => metadata = d.bytes()?.to_vec(),
                "Entries" => entries = Some(Entries::from_cid(decode_cid(&mut d)?)),
                "IsRm" => is_rm = d.bool()?,
                "ExtendedProviders" => {
                    if d.datatype()? == Type::Null {
                        d.null()?;
                    } else {
                        let n = d
                            .array()?
                            .ok_or_else(|| Error::decode("indefinite extended providers"))?;
                        for _ in 0..n {
                            extended_providers.push(decode_extended_provider(&mut d)?);
                        }
                    }
                }
                "Signature" => signature = d.bytes()?.to_vec(),
                _ => {
                    d.skip()?;
                }
            }
        }

        Ok(Advertisement {
            previous,
            provider: provider.ok_or_else(|| Error::decode("advertisement missing Provider"))?,
            addresses,
            context_id,
            metadata,
            entries: entries.ok_or_else(|| Error::decode("advertisement missing Entries"))?,
            is_rm,
            extended_providers,
            signature,
        })
    }

    /// The bytes the signature covers: the encoding with an empty signature.
    pub fn signed_payload(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = Vec::new();
        unsigned.encode()
    }

    /// Sign the advertisement with the publisher's key.
    pub fn sign(&mut self, key: &SigningKey) {
        let payload = self.signed_payload();
        self.signature = key.sign(&payload).to_bytes().to_vec();
    }

    /// Verify the signature against the publisher's peer id.
    pub fn verify(&self, publisher: &PeerId) -> Result<()> {
        publisher.verify(&self.signed_payload(), &self.signature)
    }

    /// The advertisement's own content id.
    pub fn cid(&self) -> Cid {
        cid_for_data(CODEC_DAG_CBOR, &self.encode())
    }
}

/// Structural check: is this block an advertisement?
///
/// Staged blocks are recognized by the presence of a `Signature` field,
/// mirroring how the archive drain distinguishes advertisements from entry
/// blocks without decoding them fully.
pub fn is_advertisement(bytes: &[u8]) -> bool {
    let mut d = Decoder::new(bytes);
    let Ok(Some(len)) = d.map() else {
        return false;
    };
    for _ in 0..len {
        match d.str() {
            Ok("Signature") => return true,
            Ok(_) => {
                if d.skip().is_err() {
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Entry blocks
// ---------------------------------------------------------------------------

/// One block of an entry chunk chain.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct EntryChunk {
    pub multihashes: Vec<Multihash>,
    pub next: Option<Cid>,
}

/// A HAMT root whose leaves enumerate multihashes.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct HamtRoot {
    pub multihashes: Vec<Multihash>,
}

/// A decoded entry block: either a chunk in a linked list or a HAMT root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryNode {
    Chunk(EntryChunk),
    Hamt(HamtRoot),
}

impl EntryChunk {
    pub fn new(multihashes: Vec<Multihash>, next: Option<Cid>) -> Self {
        Self { multihashes, next }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.map(2).expect("vec write");
        e.str("Entries").expect("vec write");
        e.array(self.multihashes.len() as u64).expect("vec write");
        for mh in &self.multihashes {
            e.bytes(&mh.to_bytes()).expect("vec write");
        }
        e.str("Next").expect("vec write");
        match &self.next {
            Some(cid) => e.bytes(&cid.to_bytes()).expect("vec write"),
            None => e.null().expect("vec write"),
        };
        buf
    }

    /// Content id of this chunk's encoding.
    pub fn cid(&self) -> Cid {
        cid_for_data(CODEC_DAG_CBOR, &self.encode())
    }
}

impl HamtRoot {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.map(2).expect("vec write");
        e.str("hamt").expect("vec write");
        e.bool(true).expect("vec write");
        e.str("Entries").expect("vec write");
        e.array(self.multihashes.len() as u64).expect("vec write");
        for mh in &self.multihashes {
            e.bytes(&mh.to_bytes()).expect("vec write");
        }
        buf
    }

    pub fn cid(&self) -> Cid {
        cid_for_data(CODEC_DAG_CBOR, &self.encode())
    }
}

impl EntryNode {
    /// Decode an entry block, distinguishing HAMT roots by their `hamt` field.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(bytes);
        let len = d
            .map()?
            .ok_or_else(|| Error::decode("indefinite-length entry map"))?;

        let mut is_hamt = false;
        let mut multihashes = Vec::new();
        let mut next = None;

        for _ in 0..len {
            match d.str()? {
                "hamt" => {
                    is_hamt = true;
                    d.skip()?;
                }
                "Entries" => {
                    let n = d
                        .array()?
                        .ok_or_else(|| Error::decode("indefinite entries array"))?;
                    for _ in 0..n {
                        multihashes.push(
                            Multihash::from_bytes(d.bytes()?)
                                .map_err(|e| Error::decode(e.to_string()))?,
                        );
                    }
                }
                "Next" => next = decode_opt_cid(&mut d)?,
                _ => {
                    d.skip()?;
                }
            }
        }

        if is_hamt {
            Ok(EntryNode::Hamt(HamtRoot { multihashes }))
        } else {
            Ok(EntryNode::Chunk(EntryChunk { multihashes, next }))
        }
    }
}

// ---------------------------------------------------------------------------
// Announce messages
// ---------------------------------------------------------------------------

/// A "new head" notification published on the announce topic or delivered
/// over the ingest HTTP API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Announce {
    /// Head of the publisher's advertisement chain.
    pub cid: Cid,
    /// Publisher addresses, optionally suffixed with `/p2p/<peer-id>`.
    pub addrs: Vec<String>,
}

impl Announce {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.map(2).expect("vec write");
        e.str("cid").expect("vec write");
        e.bytes(&self.cid.to_bytes()).expect("vec write");
        e.str("addrs").expect("vec write");
        e.array(self.addrs.len() as u64).expect("vec write");
        for addr in &self.addrs {
            e.str(addr).expect("vec write");
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(bytes);
        let len = d
            .map()?
            .ok_or_else(|| Error::decode("indefinite-length announce map"))?;
        let mut cid = None;
        let mut addrs = Vec::new();
        for _ in 0..len {
            match d.str()? {
                "cid" => cid = Some(decode_cid(&mut d)?),
                "addrs" => addrs = decode_str_array(&mut d)?,
                _ => {
                    d.skip()?;
                }
            }
        }
        Ok(Announce {
            cid: cid.ok_or_else(|| Error::decode("announce missing cid"))?,
            addrs,
        })
    }

    /// Extract the publisher id from any `/p2p/<peer-id>` address suffix.
    pub fn publisher(&self) -> Option<PeerId> {
        peer_from_addrs(&self.addrs)
    }

    /// The addresses with any `/p2p/...` suffix stripped, usable as
    /// transport base addresses.
    pub fn transport_addrs(&self) -> Vec<String> {
        self.addrs
            .iter()
            .map(|a| match a.find("/p2p/") {
                Some(idx) => a[..idx].to_string(),
                None => a.clone(),
            })
            .filter(|a| !a.is_empty())
            .collect()
    }
}

/// Find a `/p2p/<peer-id>` suffix in an address list.
pub fn peer_from_addrs(addrs: &[String]) -> Option<PeerId> {
    for addr in addrs {
        if let Some(idx) = addr.rfind("/p2p/") {
            if let Ok(id) = addr[idx + 5..].parse::<PeerId>() {
                return Some(id);
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Decode helpers
// ---------------------------------------------------------------------------

fn decode_cid(d: &mut Decoder<'_>) -> Result<Cid> {
    Cid::try_from(d.bytes()?).map_err(|e| Error::invalid_cid(e.to_string()))
}

fn decode_opt_cid(d: &mut Decoder<'_>) -> Result<Option<Cid>> {
    if d.datatype()? == Type::Null {
        d.null()?;
        Ok(None)
    } else {
        decode_cid(d).map(Some)
    }
}

fn decode_str_array(d: &mut Decoder<'_>) -> Result<Vec<String>> {
    let n = d
        .array()?
        .ok_or_else(|| Error::decode("indefinite string array"))?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        out.push(d.str()?.to_string());
    }
    Ok(out)
}

fn decode_extended_provider(d: &mut Decoder<'_>) -> Result<ExtendedProviderEntry> {
    let len = d
        .map()?
        .ok_or_else(|| Error::decode("indefinite extended provider map"))?;
    let mut peer_id = None;
    let mut addrs = Vec::new();
    let mut metadata = Vec::new();
    for _ in 0..len {
        match d.str()? {
            "ID" => peer_id = Some(PeerId::from_bytes(d.bytes()?)?),
            "Addresses" => addrs = decode_str_array(&mut *d)?,
            "Metadata" => metadata = d.bytes()?.to_vec(),
            _ => {
                d.skip()?;
            }
        }
    }
    Ok(ExtendedProviderEntry {
        peer_id: peer_id.ok_or_else(|| Error::decode("extended provider missing ID"))?,
        addrs,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::sha256_multihash;

    fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn sample_ad(key: &SigningKey) -> Advertisement {
        let chunk = EntryChunk::new(vec![sha256_multihash(b"mh-0")], None);
        let mut ad = Advertisement {
            previous: None,
            provider: PeerId::from_signing_key(key),
            addresses: vec!["http://127.0.0.1:3200".to_string()],
            context_id: b"ctx-A".to_vec(),
            metadata: b"meta".to_vec(),
            entries: Entries::Link(chunk.cid()),
            is_rm: false,
            extended_providers: Vec::new(),
            signature: Vec::new(),
        };
        ad.sign(key);
        ad
    }

    #[test]
    fn test_advertisement_codec_round_trip() {
        let key = signing_key(7);
        let ad = sample_ad(&key);
        let decoded = Advertisement::decode(&ad.encode()).unwrap();
        assert_eq!(ad, decoded);
    }

    #[test]
    fn test_advertisement_sign_verify() {
        let key = signing_key(8);
        let publisher = PeerId::from_signing_key(&key);
        let ad = sample_ad(&key);
        assert!(ad.verify(&publisher).is_ok());

        let other = PeerId::from_signing_key(&signing_key(9));
        assert!(ad.verify(&other).is_err());

        let mut tampered = ad.clone();
        tampered.is_rm = true;
        assert!(tampered.verify(&publisher).is_err());
    }

    #[test]
    fn test_advertisement_cid_stable_over_round_trip() {
        let key = signing_key(10);
        let ad = sample_ad(&key);
        let decoded = Advertisement::decode(&ad.encode()).unwrap();
        assert_eq!(ad.cid(), decoded.cid());
    }

    #[test]
    fn test_is_advertisement_detection() {
        let key = signing_key(11);
        let ad = sample_ad(&key);
        assert!(is_advertisement(&ad.encode()));

        let chunk = EntryChunk::new(vec![sha256_multihash(b"x")], None);
        assert!(!is_advertisement(&chunk.encode()));

        let hamt = HamtRoot {
            multihashes: vec![sha256_multihash(b"y")],
        };
        assert!(!is_advertisement(&hamt.encode()));

        assert!(!is_advertisement(b"not cbor at all"));
    }

    #[test]
    fn test_entry_node_chunk_round_trip() {
        let next = cid_for_data(CODEC_DAG_CBOR, b"next chunk");
        let chunk = EntryChunk::new(
            vec![sha256_multihash(b"a"), sha256_multihash(b"b")],
            Some(next),
        );
        match EntryNode::decode(&chunk.encode()).unwrap() {
            EntryNode::Chunk(c) => assert_eq!(c, chunk),
            EntryNode::Hamt(_) => panic!("chunk decoded as hamt"),
        }
    }

    #[test]
    fn test_entry_node_hamt_detection() {
        let hamt = HamtRoot {
            multihashes: vec![sha256_multihash(b"leaf")],
        };
        match EntryNode::decode(&hamt.encode()).unwrap() {
            EntryNode::Hamt(h) => assert_eq!(h, hamt),
            EntryNode::Chunk(_) => panic!("hamt decoded as chunk"),
        }
    }

    #[test]
    fn test_no_entries_sentinel() {
        let key = signing_key(12);
        let mut ad = sample_ad(&key);
        ad.entries = Entries::NoEntries;
        ad.sign(&key);
        let decoded = Advertisement::decode(&ad.encode()).unwrap();
        assert_eq!(decoded.entries, Entries::NoEntries);
    }

    #[test]
    fn test_extended_providers_round_trip() {
        let key = signing_key(13);
        let mut ad = sample_ad(&key);
        ad.extended_providers = vec![ExtendedProviderEntry {
            peer_id: PeerId::from_signing_key(&signing_key(14)),
            addrs: vec!["http://alt.example:3200".to_string()],
            metadata: b"alt-meta".to_vec(),
        }];
        ad.sign(&key);
        let decoded = Advertisement::decode(&ad.encode()).unwrap();
        assert_eq!(decoded.extended_providers, ad.extended_providers);
    }

    #[test]
    fn test_announce_round_trip_and_publisher() {
        let key = signing_key(15);
        let publisher = PeerId::from_signing_key(&key);
        let announce = Announce {
            cid: cid_for_data(CODEC_DAG_CBOR, b"head"),
            addrs: vec![format!("http://127.0.0.1:9999/p2p/{}", publisher)],
        };
        let decoded = Announce::decode(&announce.encode()).unwrap();
        assert_eq!(decoded, announce);
        assert_eq!(decoded.publisher(), Some(publisher));
        assert_eq!(
            decoded.transport_addrs(),
            vec!["http://127.0.0.1:9999".to_string()]
        );
    }

    #[test]
    fn test_announce_without_peer_suffix() {
        let announce = Announce {
            cid: cid_for_data(CODEC_DAG_CBOR, b"head"),
            addrs: vec!["http://127.0.0.1:9999".to_string()],
        };
        assert_eq!(announce.publisher(), None);
        assert_eq!(announce.transport_addrs(), announce.addrs);
    }
}
