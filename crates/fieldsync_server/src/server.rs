//! Main sync server.

use crate::auth::{AuthConfig, MembershipDirectory, SqlMembershipDirectory, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::pull::PullService;
use crate::push::PushService;
use crate::sequence::SequenceAllocator;
use crate::store;
use fieldsync_protocol::{
    Clock, ErrorBody, PullRequest, PushRequest, SystemClock, WireMessage, PULL_PATH, PUSH_PATH,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, error, info};

/// The sync server.
///
/// Owns the system of record and answers pull and push requests for
/// authenticated callers. The HTTP layer in [`crate::router`] and loopback
/// clients in tests both go through [`SyncServer::handle_post`].
///
/// # Example
///
/// ```no_run
/// use fieldsync_server::{ServerConfig, SyncServer};
///
/// # async fn run() -> fieldsync_server::ServerResult<()> {
/// let config = ServerConfig::default().with_auth(b"dev-secret".to_vec());
/// let server = SyncServer::connect(config).await?;
/// let token = server.issue_token("user-1", "loc-1")?;
/// # Ok(())
/// # }
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
    sequences: SequenceAllocator,
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SyncServer {
    /// Opens the configured database, applies migrations and serves from
    /// it, with memberships read from the `memberships` table.
    pub async fn connect(config: ServerConfig) -> ServerResult<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let pool = store::open_pool(&config).await?;
        let applied = store::migrate(&pool, clock.now_millis()).await?;
        if applied > 0 {
            info!(applied, "database schema migrated");
        }
        let members = Arc::new(SqlMembershipDirectory::new(pool.clone()));
        Self::with_pool(config, pool, clock, members)
    }

    /// Serves from an already migrated pool.
    pub fn with_pool(
        config: ServerConfig,
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        members: Arc<dyn MembershipDirectory>,
    ) -> ServerResult<Self> {
        let secret = config
            .auth_secret
            .clone()
            .filter(|secret| !secret.is_empty())
            .ok_or_else(|| ServerError::Configuration("an auth secret is required".into()))?;
        let tokens = TokenValidator::new(
            AuthConfig::new(secret).with_expiry(config.token_expiry),
            Arc::clone(&clock),
        );

        let config = Arc::new(config);
        let context = Arc::new(HandlerContext {
            config: Arc::clone(&config),
            tokens,
            members,
            pull: PullService::new(pool.clone(), Arc::clone(&clock), Arc::clone(&config)),
            push: PushService::new(pool.clone(), Arc::clone(&clock), Arc::clone(&config)),
        });
        let handler = RequestHandler::new(Arc::clone(&context));
        let sequences =
            SequenceAllocator::new(pool.clone(), Arc::clone(&clock), config.sequence_attempts);

        Ok(Self {
            handler,
            context,
            sequences,
            pool,
            clock,
        })
    }

    /// Handles a JSON `POST` to one of the sync endpoints and returns the
    /// encoded response body.
    pub async fn handle_post(
        &self,
        path: &str,
        token: Option<&str>,
        body: &[u8],
    ) -> ServerResult<Vec<u8>> {
        if path != PULL_PATH && path != PUSH_PATH {
            return Err(ServerError::NotFound(path.to_string()));
        }
        let caller = self.handler.authenticate(token)?;

        if path == PULL_PATH {
            let request = PullRequest::decode(body)?;
            let response = self.handler.handle_pull(&caller, &request).await?;
            Ok(response.encode()?)
        } else {
            let request = PushRequest::decode(body)?;
            let response = self.handler.handle_push(&caller, &request).await?;
            Ok(response.encode()?)
        }
    }

    /// Like [`SyncServer::handle_post`], but maps errors to an HTTP status
    /// and an [`ErrorBody`].
    pub async fn respond(&self, path: &str, token: Option<&str>, body: &[u8]) -> (u16, Vec<u8>) {
        match self.handle_post(path, token, body).await {
            Ok(body) => (200, body),
            Err(err) => {
                if err.is_server_error() {
                    error!(path, error = %err, "sync request failed");
                } else {
                    debug!(path, error = %err, "sync request rejected");
                }
                let body = ErrorBody {
                    error: err.to_string(),
                    code: err.code().to_string(),
                };
                (err.status_code(), body.encode().unwrap_or_default())
            }
        }
    }

    /// Issues a session token. Intended for development and tests.
    pub fn issue_token(&self, user_id: &str, location_id: &str) -> ServerResult<String> {
        self.context.tokens.create_token(user_id, location_id)
    }

    /// Ticket creation with per-tenant numbering.
    pub fn sequences(&self) -> &SequenceAllocator {
        &self.sequences
    }

    /// The system of record.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// The server's time source.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
