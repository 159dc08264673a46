//! Advertisement chain transport
//!
//! Fetches advertisement and entry blocks from a publisher by CID, and
//! resolves the publisher's current chain head. The HTTP implementation
//! speaks the publisher block API (`/sextant/v1/block/{cid}` and
//! `/sextant/v1/head`); tests use the in-memory implementation.

use crate::error::{IngestError, Result};
use async_trait::async_trait;
use sextant_core::link::parse_cid;
use sextant_core::Cid;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Block fetch operations against a publisher.
#[async_trait]
pub trait AdTransport: Debug + Send + Sync {
    /// Fetch one block by CID, trying each address in order.
    async fn fetch_block(&self, addrs: &[String], cid: &Cid) -> Result<Vec<u8>>;

    /// Resolve the publisher's current advertisement head.
    async fn fetch_head(&self, addrs: &[String]) -> Result<Cid>;
}

// ============================================================================
// HttpTransport
// ============================================================================

/// HTTP block transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { client }
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| IngestError::transport(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(IngestError::transport(format!(
                "{}: status {}",
                url,
                response.status()
            )));
        }
        Ok(response
            .bytes()
            .await
            .map_err(|e| IngestError::transport(format!("{}: {}", url, e)))?
            .to_vec())
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl AdTransport for HttpTransport {
    async fn fetch_block(&self, addrs: &[String], cid: &Cid) -> Result<Vec<u8>> {
        let mut last_err = IngestError::transport("no addresses to fetch from");
        for addr in addrs {
            let url = format!("{}/sextant/v1/block/{}", addr.trim_end_matches('/'), cid);
            match self.get_bytes(&url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    async fn fetch_head(&self, addrs: &[String]) -> Result<Cid> {
        let mut last_err = IngestError::transport("no addresses to fetch from");
        for addr in addrs {
            let url = format!("{}/sextant/v1/head", addr.trim_end_matches('/'));
            match self.get_bytes(&url).await {
                Ok(bytes) => {
                    let s = String::from_utf8(bytes)
                        .map_err(|e| IngestError::transport(e.to_string()))?;
                    return parse_cid(s.trim()).map_err(IngestError::Core);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

// ============================================================================
// MemTransport
// ============================================================================

/// In-memory transport doubling as the "publisher side" in tests: test
/// publishers put their blocks and head here, and the ingester fetches them.
#[derive(Debug, Clone, Default)]
pub struct MemTransport {
    blocks: Arc<RwLock<HashMap<Cid, Vec<u8>>>>,
    head: Arc<RwLock<Option<Cid>>>,
    offline: Arc<AtomicBool>,
    fetches: Arc<AtomicU32>,
}

impl MemTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a block, returning its CID unchanged for chaining.
    pub fn put_block(&self, cid: Cid, data: Vec<u8>) -> Cid {
        self.blocks.write().expect("RwLock poisoned").insert(cid, data);
        cid
    }

    pub fn set_head(&self, cid: Cid) {
        *self.head.write().expect("RwLock poisoned") = Some(cid);
    }

    /// Simulate the publisher being unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of blocks fetched so far (for coalescing/rate tests).
    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(IngestError::transport("publisher offline"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AdTransport for MemTransport {
    async fn fetch_block(&self, _addrs: &[String], cid: &Cid) -> Result<Vec<u8>> {
        self.check_online()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.blocks
            .read()
            .expect("RwLock poisoned")
            .get(cid)
            .cloned()
            .ok_or_else(|| IngestError::transport(format!("block {} not found", cid)))
    }

    async fn fetch_head(&self, _addrs: &[String]) -> Result<Cid> {
        self.check_online()?;
        self.head
            .read()
            .expect("RwLock poisoned")
            .ok_or_else(|| IngestError::transport("publisher has no head"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sextant_core::link::cid_for_data;

    #[tokio::test]
    async fn test_mem_transport_blocks_and_head() {
        let transport = MemTransport::new();
        let cid = cid_for_data(0x71, b"block");
        transport.put_block(cid, b"block".to_vec());
        transport.set_head(cid);

        assert_eq!(
            transport.fetch_block(&[], &cid).await.unwrap(),
            b"block".to_vec()
        );
        assert_eq!(transport.fetch_head(&[]).await.unwrap(), cid);
        assert_eq!(transport.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_mem_transport_offline_is_transient() {
        let transport = MemTransport::new();
        let cid = cid_for_data(0x71, b"block");
        transport.put_block(cid, b"block".to_vec());
        transport.set_offline(true);

        let err = transport.fetch_block(&[], &cid).await.unwrap_err();
        assert!(err.is_transient());

        transport.set_offline(false);
        assert!(transport.fetch_block(&[], &cid).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_block_is_transport_error() {
        let transport = MemTransport::new();
        let cid = cid_for_data(0x71, b"absent");
        let err = transport.fetch_block(&[], &cid).await.unwrap_err();
        assert!(err.is_transient());
    }
}
