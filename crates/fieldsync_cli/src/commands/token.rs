//! Issue-token command implementation.

use fieldsync_server::{ServerConfig, SyncServer};

/// Prints a signed session token for `user_id` active in `location_id`.
///
/// Membership is not checked here; a token for a non-member is refused
/// when it is used.
pub async fn run(
    config: ServerConfig,
    user_id: &str,
    location_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.auth_secret.is_none() {
        return Err("a signing secret is required (--secret or FIELDSYNC_SECRET)".into());
    }
    let server = SyncServer::connect(config).await?;
    println!("{}", server.issue_token(user_id, location_id)?);
    Ok(())
}
