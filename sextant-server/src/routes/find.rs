//! Find endpoints: multihash lookup and provider records
//!
//! The find response merges stored values with the registry's current view
//! of each provider: addresses come from the provider record, extended
//! providers are resolved per context, and values whose provider is
//! unknown are dropped.

use crate::error::{Result, ServerError};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::Json;
use sextant_core::link::parse_multihash;
use sextant_core::schema::ExtendedProviderEntry;
use sextant_core::{Multihash, PeerId};
use sextant_registry::{parse_peer_id, ProviderInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Provider identity and addresses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderAddrInfo {
    pub id: PeerId,
    pub addrs: Vec<String>,
}

/// An alternate provider in a find response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtendedProviderResult {
    pub id: PeerId,
    pub addrs: Vec<String>,
    /// Base64 metadata override, if any.
    pub metadata: String,
}

/// One stored value resolved against the registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderResult {
    /// Base64 context id.
    pub context_id: String,
    pub provider: ProviderAddrInfo,
    /// Base64 metadata, carried verbatim from the advertisement.
    pub metadata: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extended_providers: Vec<ExtendedProviderResult>,
}

/// All results for one queried multihash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultihashResult {
    /// Base58 multihash.
    pub multihash: String,
    pub provider_results: Vec<ProviderResult>,
}

/// Find response shape.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FindResponse {
    pub multihash_results: Vec<MultihashResult>,
    /// Deduplicated providers referenced by the results.
    pub providers: Vec<ProviderAddrInfo>,
}

/// GET /multihash/{base58}
pub async fn get_multihash(
    State(state): State<Arc<AppState>>,
    Path(mh): Path<String>,
) -> Result<Json<FindResponse>> {
    let mh = decode_multihash(&mh)?;
    let response = make_find_response(&state, &[mh]).await?;
    if response.multihash_results.is_empty() {
        return Err(ServerError::not_found("no results for multihash"));
    }
    Ok(Json(response))
}

/// POST /multihash — batch lookup, body = JSON list of base58 multihashes.
/// An empty batch returns an empty response, not an error.
pub async fn post_multihash_batch(
    State(state): State<Arc<AppState>>,
    Json(mhs): Json<Vec<String>>,
) -> Result<Json<FindResponse>> {
    let mut decoded = Vec::with_capacity(mhs.len());
    for mh in &mhs {
        decoded.push(decode_multihash(mh)?);
    }
    Ok(Json(make_find_response(&state, &decoded).await?))
}

/// GET /providers
pub async fn list_providers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ProviderInfo>>> {
    Ok(Json(state.registry.all_providers().await))
}

/// GET /providers/{peer_id}
pub async fn get_provider(
    State(state): State<Arc<AppState>>,
    Path(peer): Path<String>,
) -> Result<Json<ProviderInfo>> {
    let peer = parse_peer_id(&peer).map_err(|e| ServerError::bad_request(e.to_string()))?;
    state
        .registry
        .provider_info(&peer)
        .await
        .map(Json)
        .ok_or_else(|| ServerError::not_found(format!("provider {}", peer)))
}

fn decode_multihash(s: &str) -> Result<Multihash> {
    let bytes = bs58::decode(s)
        .into_vec()
        .map_err(|e| ServerError::bad_request(format!("bad multihash encoding: {}", e)))?;
    parse_multihash(&bytes).map_err(|e| ServerError::bad_request(e.to_string()))
}

fn extended_result(entry: &ExtendedProviderEntry) -> ExtendedProviderResult {
    ExtendedProviderResult {
        id: entry.peer_id,
        addrs: entry.addrs.clone(),
        metadata: BASE64.encode(&entry.metadata),
    }
}

/// Read the engine and registry to build a find response for a multihash
/// batch.
pub async fn make_find_response(state: &AppState, mhs: &[Multihash]) -> Result<FindResponse> {
    let mut results = Vec::new();
    let mut providers = Vec::new();
    let mut providers_seen: HashSet<PeerId> = HashSet::new();

    for mh in mhs {
        let Some(values) = state.engine.get(mh).await? else {
            continue;
        };
        if values.is_empty() {
            continue;
        }

        let mut provider_results = Vec::new();
        for value in values {
            // Values whose provider is gone are orphans pending cleanup.
            let Some(info) = state.registry.provider_info(&value.provider_id).await else {
                continue;
            };

            if providers_seen.insert(info.peer_id) {
                providers.push(ProviderAddrInfo {
                    id: info.peer_id,
                    addrs: info.addresses.clone(),
                });
            }

            let extended = info
                .extended_providers_for(&value.context_id)
                .iter()
                .map(extended_result)
                .collect();
            provider_results.push(ProviderResult {
                context_id: BASE64.encode(&value.context_id),
                provider: ProviderAddrInfo {
                    id: info.peer_id,
                    addrs: info.addresses,
                },
                metadata: BASE64.encode(&value.metadata),
                extended_providers: extended,
            });
        }

        if !provider_results.is_empty() {
            results.push(MultihashResult {
                multihash: bs58::encode(mh.to_bytes()).into_string(),
                provider_results,
            });
        }
    }

    Ok(FindResponse {
        multihash_results: results,
        providers,
    })
}
