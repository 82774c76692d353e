//! # FieldSync Server
//!
//! Pull/push delta-sync server for offline-first field-service clients.
//!
//! This crate provides:
//! - The tenant-scoped system of record (SQLite via `sqlx`)
//! - The pull service: paginated deltas under a fixed snapshot bound
//! - The push service: one transaction per push with stale-write rejection
//! - Per-tenant ticket numbering with bounded retries
//! - Session tokens (HMAC-SHA256) and tenant membership checks
//! - HTTP endpoints (`axum`)
//!
//! # Protocol
//!
//! A client cycle is push-then-pull:
//! 1. The client pushes its folded outbox with its current checkpoint
//! 2. Records changed on the server after that checkpoint are not overwritten
//! 3. The client pulls pages until `hasMore` is false, reusing the cursor
//! 4. The last page's `timestamp` becomes the client's new checkpoint
//!
//! # Authentication
//!
//! Every request carries a bearer token naming the user and the tenant the
//! session is active in. A body naming any other tenant is rejected before
//! any data is read.
//!
//! ```rust,ignore
//! use fieldsync_server::{ServerConfig, SyncServer};
//!
//! let config = ServerConfig::default().with_auth(b"my-secure-secret".to_vec());
//! let server = SyncServer::connect(config).await?;
//! let token = server.issue_token("user-1", "loc-1")?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod http;
mod pull;
mod push;
mod sequence;
mod server;
mod store;
mod tables;

pub use auth::{
    AuthConfig, Caller, MembershipDirectory, SqlMembershipDirectory, StaticMembershipDirectory,
    TokenValidator,
};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use fieldsync_protocol::{Clock, ManualClock, SystemClock};
pub use handler::{HandlerContext, RequestHandler};
pub use http::{router, serve};
pub use pull::{classify, Classification, PullService};
pub use push::{PushService, PushSummary};
pub use sequence::{run_with_retries, NewTicket, SequenceAllocator};
pub use server::SyncServer;
pub use store::{
    grant_membership, migrate, open_pool, revoke_membership, tenant_summaries, TenantSummary,
};
