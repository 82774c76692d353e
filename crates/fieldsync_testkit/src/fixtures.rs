//! Server and device fixtures.
//!
//! A [`TestServer`] runs the real sync server over an in-memory SQLite
//! database with a [`ManualClock`]. [`TestDevice`]s talk to it through the
//! engine's HTTP transport routed in-process, so the full wire path is
//! exercised without sockets.

use async_trait::async_trait;
use fieldsync_engine::{
    HttpReply, HttpTransport, LocalStore, LoopbackClient, LoopbackServer, SyncConfig, SyncEngine,
    SyncOutcome, SyncSession,
};
use fieldsync_protocol::{
    ChangeSet, Clock, ErrorBody, PullRequest, PullResponse, PushRequest, PushResponse,
    WireMessage, PULL_PATH, PUSH_PATH,
};
use fieldsync_server::{
    migrate, open_pool, ManualClock, ServerConfig, ServerResult, StaticMembershipDirectory,
    SyncServer,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Secret the test server signs tokens with.
pub const TEST_SECRET: &[u8] = b"fieldsync-test-secret";

/// Time the test clock starts at.
pub const TEST_EPOCH: i64 = 1_000;

/// A sync server over an in-memory database.
pub struct TestServer {
    /// The server.
    pub server: Arc<SyncServer>,
    /// The server clock; advance it between writes.
    pub clock: Arc<ManualClock>,
    /// Tenant memberships.
    pub members: Arc<StaticMembershipDirectory>,
    unavailable: Arc<AtomicBool>,
}

impl TestServer {
    /// Starts a server with default limits.
    pub async fn new() -> Self {
        Self::with_config(ServerConfig::default()).await
    }

    /// Starts a server with custom limits. The auth secret is replaced.
    pub async fn with_config(config: ServerConfig) -> Self {
        let config = config.with_auth(TEST_SECRET.to_vec());
        let pool = open_pool(&config)
            .await
            .expect("Failed to open test database");
        migrate(&pool, TEST_EPOCH)
            .await
            .expect("Failed to migrate test database");

        let clock = Arc::new(ManualClock::new(TEST_EPOCH));
        let members = Arc::new(StaticMembershipDirectory::new());
        let server = SyncServer::with_pool(config, pool, clock.clone(), members.clone())
            .expect("Failed to start test server");

        Self {
            server: Arc::new(server),
            clock,
            members,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current server time.
    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Grants `user_id` access to `location_id` and returns a session token.
    pub fn token(&self, user_id: &str, location_id: &str) -> String {
        self.members.grant(user_id, location_id);
        self.server
            .issue_token(user_id, location_id)
            .expect("Failed to issue token")
    }

    /// Pulls one page through the request path.
    pub async fn try_pull(&self, token: &str, request: &PullRequest) -> ServerResult<PullResponse> {
        let body = request.encode()?;
        let reply = self.server.handle_post(PULL_PATH, Some(token), &body).await?;
        Ok(PullResponse::decode(&reply)?)
    }

    /// Pulls one page, panicking on error.
    pub async fn pull(&self, token: &str, request: &PullRequest) -> PullResponse {
        self.try_pull(token, request).await.expect("pull failed")
    }

    /// Pushes through the request path.
    pub async fn try_push(&self, token: &str, request: &PushRequest) -> ServerResult<PushResponse> {
        let body = request.encode()?;
        let reply = self.server.handle_post(PUSH_PATH, Some(token), &body).await?;
        Ok(PushResponse::decode(&reply)?)
    }

    /// Pushes, panicking on error.
    pub async fn push(&self, token: &str, request: &PushRequest) -> PushResponse {
        self.try_push(token, request).await.expect("push failed")
    }

    /// Pushes `changes` to `location_id` from a fixed test client id.
    pub async fn push_changes(
        &self,
        token: &str,
        location_id: &str,
        last_pulled_at: Option<i64>,
        changes: ChangeSet,
    ) -> PushResponse {
        let request = PushRequest::new(location_id, last_pulled_at, changes, "test-device");
        self.push(token, &request).await
    }

    /// Follows the cursor until the last page and returns every page.
    pub async fn pull_pages(
        &self,
        token: &str,
        location_id: &str,
        last_pulled_at: Option<i64>,
        limit: u32,
    ) -> Vec<PullResponse> {
        let mut pages = Vec::new();
        let mut cursor = None;
        loop {
            let request = PullRequest::new(location_id, last_pulled_at)
                .with_limit(limit)
                .with_cursor(cursor);
            let page = self.pull(token, &request).await;
            let more = page.has_more;
            cursor = page.next_cursor;
            pages.push(page);
            if !more {
                return pages;
            }
            assert!(pages.len() < 10_000, "pagination did not terminate");
        }
    }

    /// A loopback endpoint routing engine requests into this server.
    pub fn loopback(&self) -> ServerLoopback {
        ServerLoopback {
            server: Arc::clone(&self.server),
            unavailable: Arc::clone(&self.unavailable),
        }
    }

    /// Makes every loopback request fail with `503` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// A device signed in as `user_id` in `location_id`. Local writes are
    /// stamped from the server clock.
    pub fn device(&self, client_id: &str, user_id: &str, location_id: &str) -> TestDevice {
        let token = self.token(user_id, location_id);
        let transport = HttpTransport::new(
            "http://fieldsync.test",
            LoopbackClient::new(self.loopback()),
        );
        let store = LocalStore::in_memory_with_clock(self.clock.clone());
        let engine = SyncEngine::new(
            SyncConfig::new(client_id, "http://fieldsync.test"),
            Arc::new(transport),
            Arc::new(store),
        );
        engine.set_session(SyncSession::new(token, location_id));
        TestDevice {
            engine: Arc::new(engine),
            location_id: location_id.to_string(),
        }
    }
}

/// [`LoopbackServer`] over a [`SyncServer`].
#[derive(Clone)]
pub struct ServerLoopback {
    server: Arc<SyncServer>,
    unavailable: Arc<AtomicBool>,
}

#[async_trait]
impl LoopbackServer for ServerLoopback {
    async fn handle_post(&self, path: &str, bearer: Option<&str>, body: &[u8]) -> HttpReply {
        if self.unavailable.load(Ordering::SeqCst) {
            let body = ErrorBody {
                error: "server unavailable".into(),
                code: "unavailable".into(),
            };
            return HttpReply {
                status: 503,
                body: body.encode().unwrap_or_default(),
            };
        }
        let (status, body) = self.server.respond(path, bearer, body).await;
        HttpReply { status, body }
    }
}

/// Engine type used by [`TestDevice`].
pub type LoopbackEngine = SyncEngine<HttpTransport<LoopbackClient<ServerLoopback>>, LocalStore>;

/// A client device wired to a [`TestServer`].
pub struct TestDevice {
    /// The device's sync engine.
    pub engine: Arc<LoopbackEngine>,
    /// Tenant the device is signed into.
    pub location_id: String,
}

impl TestDevice {
    /// The device's local store.
    pub fn store(&self) -> &LocalStore {
        self.engine.store()
    }

    /// Runs one sync cycle.
    pub async fn sync(&self) -> SyncOutcome {
        self.engine.sync_now().await
    }

    /// Runs one sync cycle and panics unless it completed.
    pub async fn sync_ok(&self) {
        let outcome = self.sync().await;
        assert!(
            outcome.is_completed(),
            "sync did not complete: {outcome:?}"
        );
    }

    /// Simulates losing or regaining the network.
    pub fn set_online(&self, online: bool) {
        self.engine.transport().set_connected(online);
    }
}
