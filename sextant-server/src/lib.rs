//! Sextant HTTP servers
//!
//! Thin request routers over the indexer core: the find server resolves
//! multihash lookups, the ingest server accepts direct announces and serves
//! stats, and the admin server drives policy, reload, freeze, sync, and
//! imports. Each server runs on its own port; all three share one
//! [`AppState`].

pub mod error;
pub mod routes;
pub mod state;

pub use error::{Result, ServerError};
pub use routes::{build_admin_router, build_find_router, build_ingest_router};
pub use state::{AppState, ReloadRequest};

use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Which router a [`Server`] serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerKind {
    Find,
    Ingest,
    Admin,
}

/// One HTTP server bound to one address.
pub struct Server {
    kind: ServerKind,
    listen: SocketAddr,
    router: Router,
}

impl Server {
    pub fn new(kind: ServerKind, listen: SocketAddr, state: Arc<AppState>) -> Self {
        let router = match kind {
            ServerKind::Find => build_find_router(state),
            ServerKind::Ingest => build_ingest_router(state),
            ServerKind::Admin => build_admin_router(state),
        };
        Self {
            kind,
            listen,
            router,
        }
    }

    /// The router, for in-process tests.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Bind and serve until the process shuts down.
    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.listen).await?;
        tracing::info!(kind = ?self.kind, addr = %self.listen, "Server listening");
        axum::serve(listener, self.router).await
    }
}
