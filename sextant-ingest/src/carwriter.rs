//! CAR archiver
//!
//! Writes advertisements and entries staged in the datastore to CAR files,
//! one archive per advertisement. The original chunk or HAMT blocks are
//! preserved, rather than just the multihashes, so that links from the
//! advertisement and the advertisement signature can be re-verified when an
//! archive is fetched from an untrusted location.
//!
//! Successfully archived blocks are deleted from the datastore in reverse
//! order (entry tail → head → advertisement) so a crash mid-delete never
//! orphans a partially indexed advertisement.

use crate::error::{IngestError, Result};
use minicbor::{Decoder, Encoder};
use sextant_core::link::parse_cid;
use sextant_core::schema::{is_advertisement, Advertisement, Entries, EntryNode};
use sextant_core::{Cid, Datastore, Error, FileInfo, FileStore};
use std::sync::Arc;
use tokio::sync::oneshot;

/// CAR format version written by this archiver.
const CAR_VERSION: u64 = 1;

/// Archives staged advertisement chains into the file store.
#[derive(Debug, Clone)]
pub struct CarWriter {
    ds: Arc<dyn Datastore>,
    files: Arc<dyn FileStore>,
}

impl CarWriter {
    /// Create a writer reading staged blocks from `ds` and storing archives
    /// in `files`.
    pub fn new(ds: Arc<dyn Datastore>, files: Arc<dyn FileStore>) -> Self {
        Self { ds, files }
    }

    /// Archive one advertisement and its entries.
    ///
    /// With `skip_entries`, only the advertisement block is archived; this
    /// keeps the chain link intact when a later advertisement is known to
    /// delete this advertisement's entries.
    ///
    /// Returns the stored file info. If an archive with this name already
    /// exists, the staged blocks are deleted and the existing file is
    /// returned (idempotent).
    pub async fn write(&self, ad_cid: Cid, skip_entries: bool) -> Result<FileInfo> {
        let (ad, ad_bytes) = self.load_ad(&ad_cid).await?;

        let file_name = format!("{}.car", ad_cid);
        let mut roots = vec![ad_cid];

        let mut entries_cid = None;
        if !skip_entries {
            if let Entries::Link(cid) = ad.entries {
                entries_cid = Some(cid);
                roots.push(cid);
            }
        }

        // If the destination file already exists, do not rewrite it.
        if let Some(existing) = self
            .files
            .head(&file_name)
            .await
            .map_err(IngestError::ArchiveWrite)?
        {
            self.remove_ad_data(&roots).await;
            return Ok(existing);
        }

        let mut blocks = vec![(ad_cid, ad_bytes)];
        let mut del_cids = roots.clone();

        if let Some(first_entry) = entries_cid {
            match self.load_entry_blocks(first_entry, &mut del_cids).await {
                Ok(entry_blocks) => blocks.extend(entry_blocks),
                Err(e) => {
                    // Cannot load the entries; give up on this ad but keep
                    // whatever was staged out of the index's way.
                    self.delete_cids(&del_cids).await;
                    return Err(e);
                }
            }
        }

        let car_bytes = encode_car(&roots, &blocks);
        let info = self
            .files
            .put(&file_name, &car_bytes)
            .await
            .map_err(IngestError::ArchiveWrite)?;

        self.delete_cids(&del_cids).await;
        Ok(info)
    }

    /// Scan the datastore for staged advertisements and archive them in the
    /// background. Returns a receiver that yields the number archived once
    /// the pass completes.
    ///
    /// An archive write error stops the pass; load or decode errors skip
    /// one advertisement and continue.
    pub fn write_existing(&self) -> oneshot::Receiver<usize> {
        let (tx, rx) = oneshot::channel();
        let writer = self.clone();
        tokio::spawn(async move {
            let ad_cids = match writer.find_ads().await {
                Ok(cids) => cids,
                Err(e) => {
                    tracing::error!(error = %e, "Error scanning datastore for advertisements");
                    let _ = tx.send(0);
                    return;
                }
            };
            if ad_cids.is_empty() {
                let _ = tx.send(0);
                return;
            }

            tracing::info!(count = ad_cids.len(), "Archiving staged advertisements");
            let mut written = 0;
            for ad_cid in ad_cids {
                match writer.write(ad_cid, false).await {
                    Ok(_) => written += 1,
                    Err(e @ IngestError::ArchiveWrite(_)) => {
                        tracing::error!(ad = %ad_cid, error = %e, "Archive write failed, stopping");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(ad = %ad_cid, error = %e, "Cannot archive advertisement");
                        continue;
                    }
                }
            }
            tracing::info!(written, "Finished archiving staged advertisements");
            let _ = tx.send(written);
        });
        rx
    }

    async fn load_ad(&self, cid: &Cid) -> Result<(Advertisement, Vec<u8>)> {
        let bytes = self
            .ds
            .get(&cid.to_string())
            .await
            .map_err(IngestError::ArchiveLoad)?
            .ok_or_else(|| {
                IngestError::ArchiveLoad(Error::not_found(format!("advertisement {}", cid)))
            })?;
        let ad = Advertisement::decode(&bytes)
            .map_err(|e| IngestError::ArchiveLoad(Error::decode(e.to_string())))?;
        Ok((ad, bytes))
    }

    /// Load the entry blocks reachable from `first`, recording every loaded
    /// CID into `del_cids`. A HAMT root is archived alone; a chunk chain is
    /// followed block by block.
    async fn load_entry_blocks(
        &self,
        first: Cid,
        del_cids: &mut Vec<Cid>,
    ) -> Result<Vec<(Cid, Vec<u8>)>> {
        let mut blocks = Vec::new();
        let mut cursor = Some(first);

        while let Some(cid) = cursor {
            let Some(bytes) = self
                .ds
                .get(&cid.to_string())
                .await
                .map_err(IngestError::ArchiveLoad)?
            else {
                // Entries already applied and cleaned up; archive what we have.
                break;
            };
            let node = EntryNode::decode(&bytes)
                .map_err(|e| IngestError::ArchiveLoad(Error::decode(e.to_string())))?;
            if !del_cids.contains(&cid) {
                del_cids.push(cid);
            }
            blocks.push((cid, bytes));
            cursor = match node {
                EntryNode::Hamt(_) => None,
                EntryNode::Chunk(chunk) => chunk.next,
            };
        }
        Ok(blocks)
    }

    /// Delete staged blocks for an already-archived advertisement, following
    /// the chunk chain to find every staged entry block.
    async fn remove_ad_data(&self, roots: &[Cid]) {
        let mut del_cids = roots.to_vec();
        if roots.len() > 1 {
            if let Err(e) = self.load_entry_blocks(roots[1], &mut del_cids).await {
                tracing::error!(error = %e, "Cannot walk staged entries for cleanup");
            }
        }
        self.delete_cids(&del_cids).await;
    }

    /// Delete in reverse order: entry tail first, advertisement last.
    async fn delete_cids(&self, del_cids: &[Cid]) {
        for cid in del_cids.iter().rev() {
            if let Err(e) = self.ds.delete(&cid.to_string()).await {
                tracing::error!(cid = %cid, error = %e, "Error deleting staged block");
            }
        }
    }

    /// Find staged advertisements: datastore entries whose key parses as a
    /// CID and whose value is a map with a `Signature` field.
    async fn find_ads(&self) -> Result<Vec<Cid>> {
        let mut ad_cids = Vec::new();
        for key in self.ds.list("").await.map_err(IngestError::ArchiveLoad)? {
            if key.contains('/') {
                continue;
            }
            let Ok(cid) = parse_cid(&key) else {
                continue;
            };
            let Some(bytes) = self.ds.get(&key).await.map_err(IngestError::ArchiveLoad)? else {
                continue;
            };
            if !bytes.is_empty() && is_advertisement(&bytes) {
                ad_cids.push(cid);
            }
        }
        Ok(ad_cids)
    }
}

// ============================================================================
// CAR encoding
// ============================================================================

/// Encode a CARv1 archive: a varint-framed CBOR header carrying the roots
/// and version, followed by varint-framed (cid || data) blocks.
pub fn encode_car(roots: &[Cid], blocks: &[(Cid, Vec<u8>)]) -> Vec<u8> {
    let mut header = Vec::new();
    let mut e = Encoder::new(&mut header);
    e.map(2).expect("vec write");
    e.str("roots").expect("vec write");
    e.array(roots.len() as u64).expect("vec write");
    for root in roots {
        e.bytes(&root.to_bytes()).expect("vec write");
    }
    e.str("version").expect("vec write");
    e.u64(CAR_VERSION).expect("vec write");

    let mut out = Vec::new();
    write_frame(&mut out, &header);
    for (cid, data) in blocks {
        let mut frame = cid.to_bytes();
        frame.extend_from_slice(data);
        write_frame(&mut out, &frame);
    }
    out
}

/// Decode a CAR archive back into its roots and blocks.
pub fn decode_car(bytes: &[u8]) -> Result<(Vec<Cid>, Vec<(Cid, Vec<u8>)>)> {
    let mut offset = 0;

    let header = read_frame(bytes, &mut offset)?;
    let mut d = Decoder::new(header);
    let len = d
        .map()
        .map_err(|e| IngestError::Core(Error::decode(e.to_string())))?
        .ok_or_else(|| IngestError::Core(Error::decode("indefinite car header")))?;
    let mut roots = Vec::new();
    let mut version = 0;
    for _ in 0..len {
        match d
            .str()
            .map_err(|e| IngestError::Core(Error::decode(e.to_string())))?
        {
            "roots" => {
                let n = d
                    .array()
                    .map_err(|e| IngestError::Core(Error::decode(e.to_string())))?
                    .ok_or_else(|| IngestError::Core(Error::decode("indefinite roots")))?;
                for _ in 0..n {
                    let raw = d
                        .bytes()
                        .map_err(|e| IngestError::Core(Error::decode(e.to_string())))?;
                    roots.push(
                        Cid::try_from(raw)
                            .map_err(|e| IngestError::Core(Error::invalid_cid(e.to_string())))?,
                    );
                }
            }
            "version" => {
                version = d
                    .u64()
                    .map_err(|e| IngestError::Core(Error::decode(e.to_string())))?;
            }
            _ => {
                d.skip()
                    .map_err(|e| IngestError::Core(Error::decode(e.to_string())))?;
            }
        }
    }
    if version != CAR_VERSION {
        return Err(IngestError::Core(Error::decode(format!(
            "unsupported car version {}",
            version
        ))));
    }

    let mut blocks = Vec::new();
    while offset < bytes.len() {
        let frame = read_frame(bytes, &mut offset)?;
        let mut cursor = std::io::Cursor::new(frame);
        let cid = Cid::read_bytes(&mut cursor)
            .map_err(|e| IngestError::Core(Error::invalid_cid(e.to_string())))?;
        let data = frame[cursor.position() as usize..].to_vec();
        blocks.push((cid, data));
    }
    Ok((roots, blocks))
}

fn write_frame(out: &mut Vec<u8>, frame: &[u8]) {
    write_varint(out, frame.len() as u64);
    out.extend_from_slice(frame);
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_frame<'a>(bytes: &'a [u8], offset: &mut usize) -> Result<&'a [u8]> {
    let len = read_varint(bytes, offset)? as usize;
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| IngestError::Core(Error::decode("truncated car frame")))?;
    let frame = &bytes[*offset..end];
    *offset = end;
    Ok(frame)
}

fn read_varint(bytes: &[u8], offset: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0;
    loop {
        let byte = *bytes
            .get(*offset)
            .ok_or_else(|| IngestError::Core(Error::decode("truncated varint")))?;
        *offset += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(IngestError::Core(Error::decode("varint overflow")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use sextant_core::link::sha256_multihash;
    use sextant_core::schema::{EntryChunk, HamtRoot};
    use sextant_core::{MemFileStore, MemoryDatastore, PeerId};

    fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    /// Stage a two-chunk advertisement in the datastore; returns the ad cid
    /// and every staged cid in (tail..head, ad) order.
    async fn stage_chain(ds: &dyn Datastore, key: &SigningKey) -> (Cid, Vec<Cid>) {
        let tail = EntryChunk::new(vec![sha256_multihash(b"mh-2")], None);
        let head = EntryChunk::new(vec![sha256_multihash(b"mh-1")], Some(tail.cid()));
        let mut ad = Advertisement {
            previous: None,
            provider: PeerId::from_signing_key(key),
            addresses: vec!["http://127.0.0.1:3200".to_string()],
            context_id: b"ctx".to_vec(),
            metadata: b"meta".to_vec(),
            entries: Entries::Link(head.cid()),
            is_rm: false,
            extended_providers: Vec::new(),
            signature: Vec::new(),
        };
        ad.sign(key);
        let ad_cid = ad.cid();

        ds.put(&tail.cid().to_string(), &tail.encode()).await.unwrap();
        ds.put(&head.cid().to_string(), &head.encode()).await.unwrap();
        ds.put(&ad_cid.to_string(), &ad.encode()).await.unwrap();

        (ad_cid, vec![tail.cid(), head.cid(), ad_cid])
    }

    #[test]
    fn test_car_codec_round_trip() {
        let roots = vec![sextant_core::link::cid_for_data(0x71, b"root")];
        let blocks = vec![
            (sextant_core::link::cid_for_data(0x71, b"a"), b"a".to_vec()),
            (sextant_core::link::cid_for_data(0x55, b"b"), b"b".to_vec()),
        ];
        let car = encode_car(&roots, &blocks);
        let (got_roots, got_blocks) = decode_car(&car).unwrap();
        assert_eq!(got_roots, roots);
        assert_eq!(got_blocks, blocks);
    }

    #[tokio::test]
    async fn test_write_reproduces_exact_block_bytes() {
        let ds: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let files: Arc<dyn FileStore> = Arc::new(MemFileStore::new());
        let key = signing_key(1);
        let (ad_cid, staged) = stage_chain(ds.as_ref(), &key).await;

        // Keep originals to compare after the writer deletes them.
        let mut originals = Vec::new();
        for cid in &staged {
            originals.push((*cid, ds.get(&cid.to_string()).await.unwrap().unwrap()));
        }

        let writer = CarWriter::new(ds.clone(), files.clone());
        let info = writer.write(ad_cid, false).await.unwrap();
        assert_eq!(info.name, format!("{}.car", ad_cid));

        let car = files.get(&info.name).await.unwrap();
        let (roots, blocks) = decode_car(&car).unwrap();
        assert_eq!(roots[0], ad_cid);
        assert_eq!(roots.len(), 2);

        for (cid, bytes) in originals {
            let archived = blocks.iter().find(|(c, _)| *c == cid).unwrap();
            assert_eq!(archived.1, bytes, "block bytes must match for {}", cid);
        }

        // Staged blocks were deleted after archiving.
        for cid in staged {
            assert!(ds.get(&cid.to_string()).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_write_is_idempotent() {
        let ds: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let files: Arc<dyn FileStore> = Arc::new(MemFileStore::new());
        let key = signing_key(2);
        let (ad_cid, _) = stage_chain(ds.as_ref(), &key).await;

        let writer = CarWriter::new(ds.clone(), files.clone());
        let first = writer.write(ad_cid, false).await.unwrap();

        // Re-stage and write again: existing archive wins.
        let (ad_cid2, staged) = stage_chain(ds.as_ref(), &key).await;
        assert_eq!(ad_cid, ad_cid2);
        let second = writer.write(ad_cid, false).await.unwrap();
        assert_eq!(first, second);
        for cid in staged {
            assert!(ds.get(&cid.to_string()).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_skip_entries_archives_ad_only() {
        let ds: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let files: Arc<dyn FileStore> = Arc::new(MemFileStore::new());
        let key = signing_key(3);
        let (ad_cid, _) = stage_chain(ds.as_ref(), &key).await;

        let writer = CarWriter::new(ds.clone(), files.clone());
        let info = writer.write(ad_cid, true).await.unwrap();

        let (roots, blocks) = decode_car(&files.get(&info.name).await.unwrap()).unwrap();
        assert_eq!(roots, vec![ad_cid]);
        assert_eq!(blocks.len(), 1);
    }

    #[tokio::test]
    async fn test_hamt_root_archived_alone() {
        let ds: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let files: Arc<dyn FileStore> = Arc::new(MemFileStore::new());
        let key = signing_key(4);

        let hamt = HamtRoot {
            multihashes: vec![sha256_multihash(b"leaf")],
        };
        let mut ad = Advertisement {
            previous: None,
            provider: PeerId::from_signing_key(&key),
            addresses: vec![],
            context_id: b"ctx".to_vec(),
            metadata: vec![],
            entries: Entries::Link(hamt.cid()),
            is_rm: false,
            extended_providers: Vec::new(),
            signature: Vec::new(),
        };
        ad.sign(&key);
        ds.put(&hamt.cid().to_string(), &hamt.encode()).await.unwrap();
        ds.put(&ad.cid().to_string(), &ad.encode()).await.unwrap();

        let writer = CarWriter::new(ds, files.clone());
        let info = writer.write(ad.cid(), false).await.unwrap();
        let (_, blocks) = decode_car(&files.get(&info.name).await.unwrap()).unwrap();
        // Only the ad and the HAMT root; no chain walk past the root.
        assert_eq!(blocks.len(), 2);
    }

    #[tokio::test]
    async fn test_write_existing_archives_and_skips_non_ads() {
        let ds: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let files: Arc<dyn FileStore> = Arc::new(MemFileStore::new());
        let key = signing_key(5);
        let (ad_cid, _) = stage_chain(ds.as_ref(), &key).await;

        // A non-advertisement staged block must be ignored by the scan.
        let stray = EntryChunk::new(vec![sha256_multihash(b"stray")], None);
        ds.put(&stray.cid().to_string(), &stray.encode()).await.unwrap();
        // Keys with slashes are registry records, not blocks.
        ds.put("registry/some-peer", b"{}").await.unwrap();

        let writer = CarWriter::new(ds.clone(), files.clone());
        let written = writer.write_existing().await.unwrap();
        assert_eq!(written, 1);
        assert!(files.head(&format!("{}.car", ad_cid)).await.unwrap().is_some());
        // The stray chunk was not treated as an advertisement root.
        assert!(ds.get(&stray.cid().to_string()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_ad_is_load_error() {
        let ds: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let files: Arc<dyn FileStore> = Arc::new(MemFileStore::new());
        let writer = CarWriter::new(ds, files);

        let absent = sextant_core::link::cid_for_data(0x71, b"absent");
        let err = writer.write(absent, false).await.unwrap_err();
        assert!(matches!(err, IngestError::ArchiveLoad(_)));
    }
}
