//! Caller authentication and tenant membership.
//!
//! Session tokens are signed with HMAC-SHA256 and name the user and the
//! tenant the session is active in.
//!
//! ## Token Format
//!
//! `base64url(user_id "\n" location_id "\n" issued_at) "." base64url(signature)`
//!
//! `issued_at` is Unix milliseconds. Padding is omitted from both parts.

use crate::error::{ServerError, ServerResult};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use fieldsync_protocol::Clock;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// An authenticated caller and the tenant their session is active in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// User ID.
    pub user_id: String,
    /// Active tenant.
    pub location_id: String,
}

/// Issues and checks session tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
    clock: Arc<dyn Clock>,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Creates a token for a user active in a tenant.
    pub fn create_token(&self, user_id: &str, location_id: &str) -> ServerResult<String> {
        if user_id.is_empty() || location_id.is_empty() {
            return Err(ServerError::InvalidRequest(
                "user and location are required".into(),
            ));
        }
        if user_id.contains('\n') || location_id.contains('\n') {
            return Err(ServerError::InvalidRequest(
                "user and location may not contain newlines".into(),
            ));
        }

        let payload = format!("{user_id}\n{location_id}\n{}", self.clock.now_millis());
        let signature = self.mac(payload.as_bytes())?.finalize().into_bytes();
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload.as_bytes()),
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    /// Validates a token and resolves the caller.
    pub fn validate(&self, token: &str) -> ServerResult<Caller> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| ServerError::AuthenticationFailed("malformed token".into()))?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| ServerError::AuthenticationFailed("malformed token".into()))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| ServerError::AuthenticationFailed("malformed token".into()))?;

        self.mac(&payload)?
            .verify_slice(&signature)
            .map_err(|_| ServerError::AuthenticationFailed("invalid signature".into()))?;

        let payload = String::from_utf8(payload)
            .map_err(|_| ServerError::AuthenticationFailed("malformed token".into()))?;
        let mut parts = payload.splitn(3, '\n');
        let (Some(user_id), Some(location_id), Some(issued_at)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(ServerError::AuthenticationFailed("malformed token".into()));
        };
        let issued_at: i64 = issued_at
            .parse()
            .map_err(|_| ServerError::AuthenticationFailed("malformed token".into()))?;

        let expiry = i64::try_from(self.config.token_expiry.as_millis()).unwrap_or(i64::MAX);
        if self.clock.now_millis() > issued_at.saturating_add(expiry) {
            return Err(ServerError::AuthenticationFailed("token expired".into()));
        }

        Ok(Caller {
            user_id: user_id.to_string(),
            location_id: location_id.to_string(),
        })
    }

    fn mac(&self, data: &[u8]) -> ServerResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Configuration(format!("auth secret: {e}")))?;
        mac.update(data);
        Ok(mac)
    }
}

/// Answers whether a user may act in a tenant.
#[async_trait]
pub trait MembershipDirectory: Send + Sync {
    /// Returns true if the user holds an active membership in the tenant.
    async fn is_member(&self, user_id: &str, location_id: &str) -> ServerResult<bool>;
}

/// Membership backed by the `memberships` table.
#[derive(Clone)]
pub struct SqlMembershipDirectory {
    pool: SqlitePool,
}

impl SqlMembershipDirectory {
    /// Creates a directory over the system of record.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MembershipDirectory for SqlMembershipDirectory {
    async fn is_member(&self, user_id: &str, location_id: &str) -> ServerResult<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM memberships
             WHERE user_id = ? AND location_id = ? AND revoked_at IS NULL",
        )
        .bind(user_id)
        .bind(location_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }
}

/// In-memory membership list.
#[derive(Default)]
pub struct StaticMembershipDirectory {
    members: RwLock<HashSet<(String, String)>>,
}

impl StaticMembershipDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants a user access to a tenant.
    pub fn grant(&self, user_id: &str, location_id: &str) {
        self.members
            .write()
            .insert((user_id.to_string(), location_id.to_string()));
    }

    /// Revokes a user's access to a tenant.
    pub fn revoke(&self, user_id: &str, location_id: &str) {
        self.members
            .write()
            .remove(&(user_id.to_string(), location_id.to_string()));
    }
}

#[async_trait]
impl MembershipDirectory for StaticMembershipDirectory {
    async fn is_member(&self, user_id: &str, location_id: &str) -> ServerResult<bool> {
        Ok(self
            .members
            .read()
            .contains(&(user_id.to_string(), location_id.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::grant_membership;
    use crate::store::test_support::memory_pool;
    use fieldsync_protocol::ManualClock;

    fn validator(clock: Arc<ManualClock>) -> TokenValidator {
        let config = AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec())
            .with_expiry(Duration::from_secs(60));
        TokenValidator::new(config, clock)
    }

    #[test]
    fn create_and_validate_token() {
        let validator = validator(Arc::new(ManualClock::new(1_000)));
        let token = validator.create_token("user-1", "loc-1").unwrap();
        let caller = validator.validate(&token).unwrap();
        assert_eq!(caller.user_id, "user-1");
        assert_eq!(caller.location_id, "loc-1");
    }

    #[test]
    fn reject_tampered_token() {
        let validator = validator(Arc::new(ManualClock::new(1_000)));
        let token = validator.create_token("user-1", "loc-1").unwrap();

        let (_, signature) = token.split_once('.').unwrap();
        let forged_payload = URL_SAFE_NO_PAD.encode("user-1\nloc-2\n1000");
        let forged = format!("{forged_payload}.{signature}");
        assert!(matches!(
            validator.validate(&forged),
            Err(ServerError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn reject_foreign_secret() {
        let clock = Arc::new(ManualClock::new(1_000));
        let other = TokenValidator::new(AuthConfig::new(b"another-secret".to_vec()), clock.clone());
        let token = other.create_token("user-1", "loc-1").unwrap();
        assert!(validator(clock).validate(&token).is_err());
    }

    #[test]
    fn reject_expired_token() {
        let clock = Arc::new(ManualClock::new(1_000));
        let validator = validator(clock.clone());
        let token = validator.create_token("user-1", "loc-1").unwrap();

        clock.advance(60_000);
        assert!(validator.validate(&token).is_ok());
        clock.advance(1);
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn reject_garbage() {
        let validator = validator(Arc::new(ManualClock::new(1_000)));
        for token in ["", "abc", "a.b", "!!!.???"] {
            assert!(validator.validate(token).is_err(), "accepted {token:?}");
        }
        assert!(validator.create_token("user\n1", "loc-1").is_err());
    }

    #[tokio::test]
    async fn static_directory() {
        let directory = StaticMembershipDirectory::new();
        directory.grant("user-1", "loc-1");
        assert!(directory.is_member("user-1", "loc-1").await.unwrap());
        assert!(!directory.is_member("user-1", "loc-2").await.unwrap());
        directory.revoke("user-1", "loc-1");
        assert!(!directory.is_member("user-1", "loc-1").await.unwrap());
    }

    #[tokio::test]
    async fn sql_directory() {
        let pool = memory_pool().await;
        grant_membership(&pool, "user-1", "loc-1", "technician", 0)
            .await
            .unwrap();

        let directory = SqlMembershipDirectory::new(pool);
        assert!(directory.is_member("user-1", "loc-1").await.unwrap());
        assert!(!directory.is_member("user-2", "loc-1").await.unwrap());
    }
}
