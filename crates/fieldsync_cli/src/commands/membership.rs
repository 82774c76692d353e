//! Membership commands.

use fieldsync_server::{
    grant_membership, migrate, open_pool, revoke_membership, Clock, ServerConfig, SystemClock,
};
use tracing::info;

/// Grants `user_id` access to `location_id` with `role`.
pub async fn grant(
    config: &ServerConfig,
    user_id: &str,
    location_id: &str,
    role: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let now = SystemClock.now_millis();
    let pool = open_pool(config).await?;
    migrate(&pool, now).await?;
    grant_membership(&pool, user_id, location_id, role, now).await?;
    pool.close().await;

    info!(user_id, location_id, role, "membership granted");
    println!("Granted {user_id} access to {location_id} as {role}.");
    Ok(())
}

/// Revokes `user_id`'s access to `location_id`. Tokens already issued stop
/// working on their next request.
pub async fn revoke(
    config: &ServerConfig,
    user_id: &str,
    location_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let now = SystemClock.now_millis();
    let pool = open_pool(config).await?;
    migrate(&pool, now).await?;
    revoke_membership(&pool, user_id, location_id, now).await?;
    pool.close().await;

    info!(user_id, location_id, "membership revoked");
    println!("Revoked {user_id}'s access to {location_id}.");
    Ok(())
}
