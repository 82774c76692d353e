//! HTTP endpoints.

use crate::error::ServerResult;
use crate::server::SyncServer;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use fieldsync_protocol::{PULL_PATH, PUSH_PATH};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Builds the sync router: `POST /sync/pull`, `POST /sync/push` and
/// `GET /health`.
pub fn router(server: Arc<SyncServer>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(PULL_PATH, post(sync_post))
        .route(PUSH_PATH, post(sync_post))
        .with_state(server)
}

/// Serves the router on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    server: Arc<SyncServer>,
    listener: TcpListener,
    shutdown: F,
) -> ServerResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = %listener.local_addr()?, "sync server listening");
    axum::serve(listener, router(server))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("sync server stopped");
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn sync_post(
    State(server): State<Arc<SyncServer>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (status, body) = server.respond(uri.path(), bearer(&headers), &body).await;
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

/// Extracts the token from an `Authorization: Bearer ...` header.
fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}
