mod handler;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};
use url::Url;

use crate::error::CacheError;
use crate::manager::CacheManager;

/// Loopback HTTP server (C6, spec.md §4.6). Binds `127.0.0.1` on an
/// ephemeral port and rewrites every incoming request's scheme/host/port
/// onto `origin` to recover the source URL, matching `arsfeld-reel`'s
/// `CacheProxy`: a thin axum `Router` in front of the cache layer, bound
/// with `with_state` rather than any global.
pub struct LoopbackServer {
    origin: Url,
    manager: Arc<CacheManager>,
}

pub(crate) struct ServerState {
    pub(crate) origin: Url,
    pub(crate) manager: Arc<CacheManager>,
}

impl LoopbackServer {
    pub fn new(origin: Url, manager: Arc<CacheManager>) -> Self {
        Self { origin, manager }
    }

    fn router(self) -> Router {
        let state = Arc::new(ServerState {
            origin: self.origin,
            manager: self.manager,
        });
        // `get()` already answers non-GET methods with `405 Method Not
        // Allowed` on its own (spec.md §4.6); no separate fallback needed.
        Router::new()
            .route("/", get(handler::serve))
            .route("/*path", get(handler::serve))
            .with_state(state)
    }

    /// Binds to `127.0.0.1:0` and serves forever on a spawned task.
    /// Returns the bound address (with its actual ephemeral port) so
    /// callers can build client-facing URLs.
    pub async fn start(self) -> Result<std::net::SocketAddr, CacheError> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(CacheError::from)?;
        let addr = listener.local_addr().map_err(CacheError::from)?;
        info!(%addr, "loopback cache server listening");

        let app = self.router();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "loopback server exited");
            }
        });
        Ok(addr)
    }
}
