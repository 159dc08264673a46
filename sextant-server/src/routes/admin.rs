//! Admin endpoints: policy toggles, reload, freeze, import, sync

use crate::error::{Result, ServerError};
use crate::state::{AppState, ReloadRequest};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use sextant_core::link::{parse_cid, parse_multihash};
use sextant_core::{Multihash, Value};
use sextant_registry::parse_peer_id;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Deserialize)]
pub struct PeerQuery {
    pub peer: String,
}

#[derive(Serialize)]
pub struct PolicyChangeResponse {
    pub peer: String,
    pub changed: bool,
}

/// POST /admin/allow?peer={id}
pub async fn allow(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PeerQuery>,
) -> Result<Json<PolicyChangeResponse>> {
    let peer = parse_peer_id(&query.peer).map_err(|e| ServerError::bad_request(e.to_string()))?;
    let changed = state.registry.allow_peer(peer);
    tracing::info!(peer = %peer, changed, "Admin allowed peer");
    Ok(Json(PolicyChangeResponse {
        peer: peer.to_string(),
        changed,
    }))
}

/// POST /admin/block?peer={id}
pub async fn block(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PeerQuery>,
) -> Result<Json<PolicyChangeResponse>> {
    let peer = parse_peer_id(&query.peer).map_err(|e| ServerError::bad_request(e.to_string()))?;
    let changed = state.registry.block_peer(peer);
    tracing::info!(peer = %peer, changed, "Admin blocked peer");
    Ok(Json(PolicyChangeResponse {
        peer: peer.to_string(),
        changed,
    }))
}

/// GET /admin/list-allowed
///
/// The peers explicitly allowed under a default-block policy.
pub async fn list_allowed(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(
        state
            .registry
            .allowed_peers()
            .iter()
            .map(|p| p.to_string())
            .collect(),
    )
}

/// POST /admin/reload
///
/// Asks the daemon's reload loop to re-read the config file and waits for
/// the outcome.
pub async fn reload(State(state): State<Arc<AppState>>) -> Result<StatusCode> {
    let Some(reload_tx) = &state.reload_tx else {
        return Err(ServerError::bad_request("reload is not configured"));
    };
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    reload_tx
        .send(ReloadRequest {
            done: Some(done_tx),
        })
        .await
        .map_err(|_| sextant_core::Error::other("reload loop is gone"))?;
    match done_rx.await {
        Ok(Ok(())) => Ok(StatusCode::OK),
        Ok(Err(reason)) => Err(ServerError::bad_request(reason)),
        Err(_) => Err(ServerError::Core(sextant_core::Error::other(
            "reload loop dropped the request",
        ))),
    }
}

/// POST /admin/freeze
pub async fn freeze(State(state): State<Arc<AppState>>) -> Result<StatusCode> {
    state.registry.freeze().await?;
    Ok(StatusCode::OK)
}

/// POST /admin/sync/{peer_id}
///
/// Trigger a resync of a provider from its publisher's current head.
pub async fn sync(
    State(state): State<Arc<AppState>>,
    Path(peer): Path<String>,
) -> Result<StatusCode> {
    let peer = parse_peer_id(&peer).map_err(|e| ServerError::bad_request(e.to_string()))?;
    state.ingester.sync_provider(&peer).await?;
    Ok(StatusCode::ACCEPTED)
}

/// DELETE /admin/providers/{peer_id}
pub async fn remove_provider(
    State(state): State<Arc<AppState>>,
    Path(peer): Path<String>,
) -> Result<StatusCode> {
    let peer = parse_peer_id(&peer).map_err(|e| ServerError::bad_request(e.to_string()))?;
    if state.registry.provider_info(&peer).await.is_none() {
        return Err(ServerError::not_found(format!("provider {}", peer)));
    }
    state.registry.remove_provider(&peer).await?;
    state.counts.remove_provider(&peer).await?;
    tracing::info!(peer = %peer, "Admin removed provider");
    Ok(StatusCode::OK)
}

#[derive(Debug, Default, Deserialize)]
pub struct ImportQuery {
    /// Base64 context id for the imported values.
    #[serde(default)]
    pub context: Option<String>,
    /// Base64 metadata for the imported values.
    #[serde(default)]
    pub metadata: Option<String>,
}

#[derive(Serialize)]
pub struct ImportResponse {
    pub imported: u64,
}

/// POST /admin/import/cidlist/{provider}
///
/// Body: newline-separated base58 multihashes, indexed directly for the
/// provider without an advertisement chain.
pub async fn import_cidlist(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(query): Query<ImportQuery>,
    body: Bytes,
) -> Result<Json<ImportResponse>> {
    let mut mhs = Vec::new();
    for line in body.split(|b| *b == b'\n') {
        let line = std::str::from_utf8(line)
            .map_err(|e| ServerError::bad_request(e.to_string()))?
            .trim();
        if line.is_empty() {
            continue;
        }
        let bytes = bs58::decode(line)
            .into_vec()
            .map_err(|e| ServerError::bad_request(format!("bad multihash {}: {}", line, e)))?;
        mhs.push(parse_multihash(&bytes).map_err(|e| ServerError::bad_request(e.to_string()))?);
    }
    import_batch(&state, &provider, &query, mhs).await
}

/// Manifest line shape: one JSON object per line with a cid field.
#[derive(Deserialize)]
struct ManifestLine {
    cid: String,
}

/// POST /admin/import/manifest/{provider}
///
/// Body: newline-delimited JSON objects `{"cid": "..."}`; the multihash of
/// each CID is indexed for the provider.
pub async fn import_manifest(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(query): Query<ImportQuery>,
    body: Bytes,
) -> Result<Json<ImportResponse>> {
    let mut mhs = Vec::new();
    for line in body.split(|b| *b == b'\n') {
        let line = std::str::from_utf8(line)
            .map_err(|e| ServerError::bad_request(e.to_string()))?
            .trim();
        if line.is_empty() {
            continue;
        }
        let entry: ManifestLine =
            serde_json::from_str(line).map_err(|e| ServerError::bad_request(e.to_string()))?;
        let cid = parse_cid(&entry.cid).map_err(|e| ServerError::bad_request(e.to_string()))?;
        mhs.push(*cid.hash());
    }
    import_batch(&state, &provider, &query, mhs).await
}

async fn import_batch(
    state: &AppState,
    provider: &str,
    query: &ImportQuery,
    mhs: Vec<Multihash>,
) -> Result<Json<ImportResponse>> {
    let provider = parse_peer_id(provider).map_err(|e| ServerError::bad_request(e.to_string()))?;
    let context_id = decode_b64(query.context.as_deref(), b"import")?;
    let metadata = decode_b64(query.metadata.as_deref(), b"")?;

    let value = Value::new(provider, context_id, metadata);
    state.engine.put(&value, &mhs).await?;
    state.counts.add_count(&provider, mhs.len() as u64).await?;

    let mut update = sextant_registry::ProviderUpdate::new(provider);
    update.added_count = mhs.len() as u64;
    state.registry.update(update).await?;

    tracing::info!(provider = %provider, imported = mhs.len(), "Imported multihashes");
    Ok(Json(ImportResponse {
        imported: mhs.len() as u64,
    }))
}

fn decode_b64(value: Option<&str>, default: &[u8]) -> Result<Vec<u8>> {
    match value {
        Some(s) => BASE64
            .decode(s)
            .map_err(|e| ServerError::bad_request(format!("bad base64: {}", e))),
        None => Ok(default.to_vec()),
    }
}
