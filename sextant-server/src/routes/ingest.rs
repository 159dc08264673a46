//! Ingest endpoints: direct announce and stats

use crate::error::{Result, ServerError};
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use sextant_core::schema::Announce;
use sextant_ingest::AnnounceEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// PUT /ingest/announce
///
/// Body is the CBOR announce message `{cid, addrs}`; the publisher id is
/// taken from the `/p2p/<peer-id>` suffix on an address. Returns 204 on
/// accept, 400 on a bad payload, 429 when the publisher is over the direct
/// announce rate limit.
pub async fn announce(State(state): State<Arc<AppState>>, body: Bytes) -> Result<StatusCode> {
    let announce =
        Announce::decode(&body).map_err(|e| ServerError::bad_request(e.to_string()))?;
    let publisher = announce
        .publisher()
        .ok_or_else(|| ServerError::bad_request("announce addresses carry no /p2p/ peer id"))?;

    if state.announce_limiter.try_consume(&publisher).is_err() {
        return Err(ServerError::RateLimited);
    }

    state
        .ingester
        .announce(AnnounceEvent {
            publisher,
            announce,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stats response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    /// Count estimate including the operator addend.
    pub entries_estimate: u64,
    /// Observed count of indexed multihashes.
    pub entries_count: u64,
}

/// GET /stats
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>> {
    Ok(Json(StatsResponse {
        entries_estimate: state.counts.total_with_addend().await,
        entries_count: state.counts.total().await,
    }))
}
