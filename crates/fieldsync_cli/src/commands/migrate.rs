//! Migrate command implementation.

use fieldsync_server::{migrate, open_pool, Clock, ServerConfig, SystemClock};
use tracing::info;

/// Applies pending schema migrations.
pub async fn run(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(database = %config.database_url, "migrating");
    let pool = open_pool(config).await?;
    let applied = migrate(&pool, SystemClock.now_millis()).await?;
    pool.close().await;

    if applied == 0 {
        println!("Schema is up to date.");
    } else {
        println!("Applied {applied} migration(s).");
    }
    Ok(())
}
