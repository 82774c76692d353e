//! Request handlers for sync endpoints.

use crate::auth::{Caller, MembershipDirectory, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::pull::PullService;
use crate::push::PushService;
use fieldsync_protocol::{PullRequest, PullResponse, PushRequest, PushResponse};
use std::sync::Arc;
use tracing::warn;

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Session token validator.
    pub tokens: TokenValidator,
    /// Tenant membership lookups.
    pub members: Arc<dyn MembershipDirectory>,
    /// Pull service.
    pub pull: PullService,
    /// Push service.
    pub push: PushService,
}

/// Handler for sync requests.
///
/// Every request is checked in the same order: the caller is
/// authenticated, the body's tenant must be the caller's active tenant,
/// and the caller must still be a member of it. Only then is data read.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Resolves the caller from a bearer token.
    pub fn authenticate(&self, token: Option<&str>) -> ServerResult<Caller> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ServerError::AuthenticationFailed("missing bearer token".into()))?;
        self.context.tokens.validate(token)
    }

    /// Checks that the caller may act in `location_id`.
    pub async fn authorize(&self, caller: &Caller, location_id: &str) -> ServerResult<()> {
        if caller.location_id != location_id {
            warn!(
                user_id = %caller.user_id,
                active = %caller.location_id,
                requested = %location_id,
                "rejected cross-tenant request"
            );
            return Err(ServerError::TenantMismatch {
                requested: location_id.to_string(),
                active: caller.location_id.clone(),
            });
        }
        if !self
            .context
            .members
            .is_member(&caller.user_id, location_id)
            .await?
        {
            return Err(ServerError::NotAuthorized(format!(
                "{} is not a member of {location_id}",
                caller.user_id
            )));
        }
        Ok(())
    }

    /// Handles a pull request.
    pub async fn handle_pull(
        &self,
        caller: &Caller,
        request: &PullRequest,
    ) -> ServerResult<PullResponse> {
        self.authorize(caller, &request.location_id).await?;
        self.context.pull.pull(request).await
    }

    /// Handles a push request.
    pub async fn handle_push(
        &self,
        caller: &Caller,
        request: &PushRequest,
    ) -> ServerResult<PushResponse> {
        self.authorize(caller, &request.location_id).await?;
        self.context.push.push(request).await
    }
}
