//! Server configuration.

use fieldsync_protocol::DEFAULT_PULL_LIMIT;
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// SQLx connection URL of the system of record.
    pub database_url: String,
    /// Maximum pooled database connections.
    pub max_connections: u32,
    /// How long a writer waits on a locked database before giving up.
    pub busy_timeout: Duration,
    /// Records per kind when a pull does not specify a limit.
    pub default_pull_limit: u32,
    /// Hard cap on records per kind per pull page.
    pub max_pull_limit: u32,
    /// Hard cap on entries across all kinds in one push.
    pub max_push_records: usize,
    /// Attempts for transactions that can lose a sequence-number race.
    pub sequence_attempts: u32,
    /// Secret key for session tokens.
    pub auth_secret: Option<Vec<u8>>,
    /// Session token lifetime.
    pub token_expiry: Duration,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr, database_url: impl Into<String>) -> Self {
        Self {
            bind_addr,
            database_url: database_url.into(),
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
            default_pull_limit: DEFAULT_PULL_LIMIT,
            max_pull_limit: 500,
            max_push_records: 1000,
            sequence_attempts: 5,
            auth_secret: None,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the maximum pooled connections.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the maximum pull page size.
    pub fn with_max_pull_limit(mut self, limit: u32) -> Self {
        self.max_pull_limit = limit;
        self
    }

    /// Sets the maximum push size.
    pub fn with_max_push_records(mut self, max: usize) -> Self {
        self.max_push_records = max;
        self
    }

    /// Sets the attempts for sequence-allocating transactions.
    pub fn with_sequence_attempts(mut self, attempts: u32) -> Self {
        self.sequence_attempts = attempts;
        self
    }

    /// Sets the session token secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.auth_secret = Some(secret);
        self
    }

    /// Sets the session token lifetime.
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }

    /// Resolves the page size for a pull request.
    pub fn pull_limit(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_pull_limit)
            .clamp(1, self.max_pull_limit.max(1))
    }

    /// Returns true if the database lives only in memory.
    pub fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8080)), "sqlite::memory:")
    }
}
