//! Announce endpoint for the assigner
//!
//! Exposes the same `PUT /ingest/announce` surface as an indexer's ingest
//! server, so publishers and operators can announce to the assigner without
//! knowing which indexers are behind it.

use crate::Assigner;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::Router;
use sextant_core::schema::Announce;
use sextant_ingest::AnnounceEvent;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the assigner's announce router.
pub fn build_router(assigner: Arc<Assigner>) -> Router {
    Router::new()
        .route("/ingest/announce", put(announce))
        .route("/health", get(health))
        .with_state(assigner)
        .layer(TraceLayer::new_for_http())
}

/// Run the announce server on the given address.
pub async fn run(assigner: Arc<Assigner>, listen: std::net::SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(addr = %listen, "Assigner announce server listening");
    axum::serve(listener, build_router(assigner)).await
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn announce(State(assigner): State<Arc<Assigner>>, body: Bytes) -> StatusCode {
    let Ok(announce) = Announce::decode(&body) else {
        return StatusCode::BAD_REQUEST;
    };
    let Some(publisher) = announce.publisher() else {
        return StatusCode::BAD_REQUEST;
    };

    match assigner
        .handle_announce(AnnounceEvent {
            publisher,
            announce,
        })
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            tracing::warn!(publisher = %publisher, error = %e, "Announce handling failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::MockApi;
    use crate::{AssignerConfig, IndexerConfig};
    use axum::body::Body;
    use axum::http::Request;
    use ed25519_dalek::SigningKey;
    use sextant_core::link::cid_for_data;
    use sextant_core::{MemoryDatastore, PeerId};
    use sextant_registry::PolicyConfig;
    use tower::ServiceExt;

    async fn assigner_with_mock() -> (Arc<Assigner>, PeerId) {
        let key = SigningKey::from_bytes(&[1; 32]);
        let publisher = PeerId::from_signing_key(&key);
        let config = AssignerConfig {
            indexer_pool: vec![IndexerConfig {
                admin_url: "http://indexer-0.test:3602".to_string(),
                ingest_url: "http://indexer-0.test:3601".to_string(),
            }],
            policy: PolicyConfig {
                allow: false,
                except: vec![publisher.to_string()],
                publish: false,
                publish_except: vec![],
            },
            topic: sextant_ingest::DEFAULT_TOPIC.to_string(),
            replication: 1,
        };
        let assigner = Assigner::new(
            config,
            Arc::new(MemoryDatastore::new()),
            Arc::new(MockApi::default()),
        )
        .await
        .unwrap();
        (assigner, publisher)
    }

    #[tokio::test]
    async fn test_announce_endpoint_assigns() {
        let (assigner, publisher) = assigner_with_mock().await;
        let mut assignments = assigner.on_assignment(publisher);
        let router = build_router(assigner);

        let announce = Announce {
            cid: cid_for_data(0x71, b"head"),
            addrs: vec![format!("http://pub.test:9999/p2p/{}", publisher)],
        };
        let response = router
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/ingest/announce")
                    .body(Body::from(announce.encode()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            assignments.recv().await.unwrap(),
            "http://indexer-0.test:3602"
        );
    }

    #[tokio::test]
    async fn test_announce_endpoint_rejects_bad_payload() {
        let (assigner, _) = assigner_with_mock().await;
        let router = build_router(assigner);

        let response = router
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/ingest/announce")
                    .body(Body::from(&b"not cbor"[..]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
