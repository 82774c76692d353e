//! Sync engine state machine.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::local::LocalReplica;
use crate::outbox::fold_entries;
use crate::transport::SyncTransport;
use fieldsync_protocol::{Cursor, PullRequest, PushRequest};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// Engine is pushing the outbox to the server.
    Pushing,
    /// Engine is pulling changes from the server.
    Pulling,
    /// Engine has completed a sync cycle.
    Synced,
    /// The last cycle failed.
    Error,
}

impl SyncState {
    /// Returns true if the engine is in an active sync state.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Pushing | SyncState::Pulling)
    }
}

/// Authenticated user and the tenant they are working in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSession {
    /// Bearer token for the sync endpoints.
    pub token: String,
    /// Active tenant.
    pub location_id: String,
}

impl SyncSession {
    /// Creates a session.
    pub fn new(token: impl Into<String>, location_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            location_id: location_id.into(),
        }
    }
}

/// Result of a completed sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCycleResult {
    /// Outbox entries drained by the push.
    pub pushed: usize,
    /// Upserts and deletes applied to the mirror.
    pub pulled: usize,
    /// Pull pages fetched.
    pub pages: u32,
    /// Checkpoint persisted at the end of the cycle.
    pub checkpoint: i64,
    /// Duration of the sync cycle.
    pub duration: Duration,
}

/// What a call to [`SyncEngine::sync_now`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A full cycle ran.
    Completed(SyncCycleResult),
    /// Another cycle was in flight; nothing was done.
    AlreadyRunning,
    /// No session or no active tenant; nothing was done.
    NoSession,
    /// The network is down; the server was not contacted.
    Offline,
    /// The cycle aborted. The outbox and checkpoint are as they were.
    Failed {
        /// What went wrong.
        message: String,
        /// Whether a later cycle may succeed without outside action.
        retryable: bool,
    },
}

impl SyncOutcome {
    /// Returns true if a cycle completed.
    pub fn is_completed(&self) -> bool {
        matches!(self, SyncOutcome::Completed(_))
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of sync cycles completed.
    pub cycles_completed: u64,
    /// Total number of outbox entries pushed.
    pub records_pushed: u64,
    /// Total number of changes applied from pulls.
    pub records_pulled: u64,
    /// Total number of failed or offline attempts.
    pub failures: u64,
    /// Failures since the last completed cycle.
    pub consecutive_failures: u32,
    /// Last sync time.
    pub last_sync_time: Option<Instant>,
    /// Last error message, cleared by a completed cycle.
    pub last_error: Option<String>,
}

/// Resets the single-flight flag when a cycle ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The sync engine pushes the local outbox and pulls server changes into
/// the local mirror.
pub struct SyncEngine<T: SyncTransport, S: LocalReplica> {
    config: SyncConfig,
    transport: Arc<T>,
    store: Arc<S>,
    session: RwLock<Option<SyncSession>>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    syncing: AtomicBool,
}

impl<T: SyncTransport, S: LocalReplica> SyncEngine<T, S> {
    /// Creates a new sync engine.
    pub fn new(config: SyncConfig, transport: Arc<T>, store: Arc<S>) -> Self {
        Self {
            config,
            transport,
            store,
            session: RwLock::new(None),
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            syncing: AtomicBool::new(false),
        }
    }

    /// Starts syncing as an authenticated user in a tenant.
    pub fn set_session(&self, session: SyncSession) {
        *self.session.write() = Some(session);
    }

    /// Signs out; later calls to [`SyncEngine::sync_now`] do nothing.
    pub fn clear_session(&self) {
        *self.session.write() = None;
    }

    /// The current session.
    pub fn session(&self) -> Option<SyncSession> {
        self.session.read().clone()
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// The message to show the user for the last failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.stats.read().last_error.clone()
    }

    /// Returns true while a cycle is in flight.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// The engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// The local store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Runs one push-then-pull cycle.
    ///
    /// At most one cycle runs at a time; a call made while one is in
    /// flight returns [`SyncOutcome::AlreadyRunning`]. Failures never
    /// escape as errors: they are recorded in [`SyncStats::last_error`] and
    /// the next call starts again from the persisted checkpoint.
    pub async fn sync_now(&self) -> SyncOutcome {
        let Some(session) = self.session().filter(|s| !s.location_id.is_empty()) else {
            debug!("no active session, skipping sync");
            return SyncOutcome::NoSession;
        };

        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("sync already in flight");
            return SyncOutcome::AlreadyRunning;
        }
        let _in_flight = InFlight(&self.syncing);

        if !self.transport.is_connected() {
            self.handle_error(&SyncError::NotConnected);
            return SyncOutcome::Offline;
        }

        let start = Instant::now();
        match self.run_cycle(&session).await {
            Ok(mut result) => {
                result.duration = start.elapsed();
                self.set_state(SyncState::Synced);
                {
                    let mut stats = self.stats.write();
                    stats.cycles_completed += 1;
                    stats.records_pushed += result.pushed as u64;
                    stats.records_pulled += result.pulled as u64;
                    stats.consecutive_failures = 0;
                    stats.last_sync_time = Some(Instant::now());
                    stats.last_error = None;
                }
                info!(
                    location_id = %session.location_id,
                    pushed = result.pushed,
                    pulled = result.pulled,
                    pages = result.pages,
                    checkpoint = result.checkpoint,
                    "sync cycle completed"
                );
                SyncOutcome::Completed(result)
            }
            Err(err) => {
                self.handle_error(&err);
                SyncOutcome::Failed {
                    message: err.to_string(),
                    retryable: err.is_retryable(),
                }
            }
        }
    }

    async fn run_cycle(&self, session: &SyncSession) -> SyncResult<SyncCycleResult> {
        let location_id = session.location_id.as_str();
        let checkpoint = self.store.checkpoint(location_id)?;

        self.set_state(SyncState::Pushing);
        let pushed = self.push_outbox(session, checkpoint).await?;

        self.set_state(SyncState::Pulling);
        let (pulled, pages, timestamp) = self.pull_all(session, checkpoint).await?;

        let next = checkpoint.map_or(timestamp, |current| current.max(timestamp));
        self.store.set_checkpoint(location_id, next)?;

        Ok(SyncCycleResult {
            pushed,
            pulled,
            pages,
            checkpoint: next,
            duration: Duration::ZERO,
        })
    }

    /// Folds and pushes every pending entry, then acknowledges exactly the
    /// entries that were read. Entries written meanwhile stay queued.
    async fn push_outbox(
        &self,
        session: &SyncSession,
        checkpoint: Option<i64>,
    ) -> SyncResult<usize> {
        let location_id = session.location_id.as_str();
        let entries = self.store.pending(location_id)?;
        if entries.is_empty() {
            return Ok(0);
        }

        let changes = fold_entries(&entries)?;
        if !changes.is_empty() {
            let request = PushRequest::new(
                location_id,
                checkpoint,
                changes,
                self.config.client_id.as_str(),
            );
            let response = self.transport.push(&session.token, &request).await?;
            if !response.ok {
                return Err(SyncError::Protocol("push was not acknowledged".into()));
            }
            debug!(
                entries = entries.len(),
                records = request.changes.len(),
                new_timestamp = response.new_timestamp,
                "pushed outbox"
            );
        }

        let seqs: Vec<u64> = entries.iter().map(|entry| entry.seq).collect();
        self.store.acknowledge(&seqs)?;
        Ok(entries.len())
    }

    /// Pulls pages until the server reports no more. Every page of one
    /// cycle must carry the same snapshot timestamp.
    async fn pull_all(
        &self,
        session: &SyncSession,
        checkpoint: Option<i64>,
    ) -> SyncResult<(usize, u32, i64)> {
        let location_id = session.location_id.as_str();
        let mut cursor: Option<Cursor> = None;
        let mut snapshot: Option<i64> = None;
        let mut pulled = 0;
        let mut pages = 0;

        loop {
            if pages >= self.config.max_pull_pages {
                return Err(SyncError::Protocol(format!(
                    "pull did not finish within {pages} pages"
                )));
            }

            let request = PullRequest::new(location_id, checkpoint)
                .with_limit(self.config.pull_limit)
                .with_cursor(cursor.take());
            let response = self.transport.pull(&session.token, &request).await?;
            response.validate(location_id)?;
            if let Some(expected) = snapshot {
                if response.timestamp != expected {
                    return Err(SyncError::Protocol(format!(
                        "page timestamp {} differs from cycle snapshot {expected}",
                        response.timestamp
                    )));
                }
            }
            snapshot = Some(response.timestamp);
            pages += 1;

            let applied =
                self.store
                    .apply_changes(location_id, &response.changes, response.timestamp)?;
            pulled += applied;
            debug!(page = pages, applied, has_more = response.has_more, "applied pull page");

            if !response.has_more {
                return Ok((pulled, pages, response.timestamp));
            }
            cursor = response.next_cursor;
        }
    }

    /// Handles an error by updating state and stats.
    fn handle_error(&self, error: &SyncError) {
        self.set_state(SyncState::Error);
        {
            let mut stats = self.stats.write();
            stats.failures += 1;
            stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
            stats.last_error = Some(error.to_string());
        }
        warn!(error = %error, "sync cycle failed");
    }
}
