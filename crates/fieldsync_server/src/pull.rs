//! Pull service: the delta since a client's checkpoint, page by page.
//!
//! The first page fixes `snapshot_at`; every later page of the cycle reuses
//! it from the cursor, so writes committed between pages fall outside the
//! window and are picked up by the next cycle instead.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::tables::{self, SyncTable};
use fieldsync_protocol::{
    ChangeSet, Clock, Cursor, PaymentRecord, PullRequest, PullResponse, SyncRecord, Ticket,
    TicketAttachment, TicketComment,
};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::debug;

/// How a pulled record is reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// First seen inside the window; sent in full.
    Created,
    /// Existed before the window; sent in full.
    Updated,
    /// Soft-deleted inside the window; only the id is sent.
    Deleted,
}

/// Classifies a record against the client's checkpoint.
///
/// A missing checkpoint is older than every timestamp.
pub fn classify<T: SyncRecord>(record: &T, last_pulled_at: Option<i64>) -> Classification {
    let since = last_pulled_at.unwrap_or(i64::MIN);
    match record.deleted_at() {
        Some(deleted_at) if deleted_at > since => Classification::Deleted,
        _ if record.created_at() > since => Classification::Created,
        _ => Classification::Updated,
    }
}

/// Serves pull requests.
pub struct PullService {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    config: Arc<ServerConfig>,
}

impl PullService {
    /// Creates a pull service.
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, config: Arc<ServerConfig>) -> Self {
        Self {
            pool,
            clock,
            config,
        }
    }

    /// Returns one page of the tenant's changes.
    ///
    /// The caller has already checked that the request's tenant is the
    /// caller's.
    pub async fn pull(&self, request: &PullRequest) -> ServerResult<PullResponse> {
        if request.location_id.is_empty() {
            return Err(ServerError::InvalidRequest("locationId is required".into()));
        }
        let since = request.last_pulled_at;
        let limit = self.config.pull_limit(request.limit);

        let cursor = match request.cursor {
            Some(cursor) => {
                if since.is_some_and(|since| cursor.snapshot_at < since) {
                    return Err(ServerError::InvalidRequest(format!(
                        "cursor snapshot {} is older than lastPulledAt",
                        cursor.snapshot_at
                    )));
                }
                cursor
            }
            None => Cursor::at(self.clock.now_millis()),
        };
        let snapshot_at = cursor.snapshot_at;
        let location_id = request.location_id.as_str();

        let mut page = Page {
            location_id,
            since,
            limit,
            cursor,
            changes: ChangeSet::default(),
            has_more: false,
        };
        let mut tx = self.pool.begin().await?;
        page.load::<Ticket>(&mut *tx).await?;
        page.load::<TicketComment>(&mut *tx).await?;
        page.load::<TicketAttachment>(&mut *tx).await?;
        page.load::<PaymentRecord>(&mut *tx).await?;
        tx.commit().await?;

        debug!(
            location_id,
            since = ?since,
            snapshot_at,
            records = page.changes.len(),
            has_more = page.has_more,
            "served pull page"
        );

        Ok(PullResponse {
            changes: page.changes,
            timestamp: snapshot_at,
            has_more: page.has_more,
            next_cursor: page.has_more.then_some(page.cursor),
        })
    }
}

/// One page being assembled, as seen by every kind.
struct Page<'a> {
    location_id: &'a str,
    since: Option<i64>,
    limit: u32,
    cursor: Cursor,
    changes: ChangeSet,
    has_more: bool,
}

impl Page<'_> {
    /// Loads one kind's rows into the page and advances its cursor offset.
    async fn load<T: SyncTable>(&mut self, conn: &mut SqliteConnection) -> ServerResult<()> {
        let mut rows = tables::load_window::<T>(
            conn,
            self.location_id,
            self.since,
            self.cursor.snapshot_at,
            self.cursor.offset(T::KIND),
            self.limit.saturating_add(1),
        )
        .await?;

        if rows.len() > self.limit as usize {
            self.has_more = true;
            rows.truncate(self.limit as usize);
        }
        self.cursor.advance(T::KIND, rows.len() as u32);

        let slot = T::changes_mut(&mut self.changes);
        for record in rows {
            match classify(&record, self.since) {
                Classification::Deleted => slot.deleted.push(record.id().to_string()),
                Classification::Created => slot.created.push(record),
                Classification::Updated => slot.updated.push(record),
            }
        }
        Ok(())
    }
}
