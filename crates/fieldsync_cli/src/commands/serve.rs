//! Serve command implementation.

use fieldsync_server::{serve, ServerConfig, SyncServer};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Serves the sync endpoints until Ctrl-C.
pub async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    let server = Arc::new(SyncServer::connect(config).await?);

    serve(server, listener, async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
    })
    .await?;
    Ok(())
}
