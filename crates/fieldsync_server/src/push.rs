//! Push service: applies a client's folded outbox in one transaction.
//!
//! A write is dropped, not rejected, when the stored record belongs to
//! another tenant or changed after the client's checkpoint. The next pull
//! brings the client's copy back in line.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::sequence::run_with_retries;
use crate::tables::{self, SyncTable};
use fieldsync_protocol::{
    ChangeSet, Clock, PaymentRecord, PushRequest, PushResponse, SyncRecord, Ticket,
    TicketAttachment, TicketComment,
};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one applied push did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushSummary {
    /// Transaction timestamp stamped on every accepted record.
    pub timestamp: i64,
    /// Records inserted or updated.
    pub written: usize,
    /// Records soft-deleted.
    pub deleted: usize,
    /// Entries dropped as stale, foreign or unsupported.
    pub skipped: usize,
}

/// Serves push requests.
pub struct PushService {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    config: Arc<ServerConfig>,
}

impl PushService {
    /// Creates a push service.
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, config: Arc<ServerConfig>) -> Self {
        Self {
            pool,
            clock,
            config,
        }
    }

    /// Applies a push and returns the wire response.
    pub async fn push(&self, request: &PushRequest) -> ServerResult<PushResponse> {
        let summary = self.apply(request).await?;
        Ok(PushResponse::success(summary.timestamp))
    }

    /// Applies a push atomically.
    ///
    /// The whole transaction is re-run if a ticket insert loses a
    /// sequence-number race.
    pub async fn apply(&self, request: &PushRequest) -> ServerResult<PushSummary> {
        self.validate(request)?;

        let summary = run_with_retries(self.config.sequence_attempts, move |_| async move {
            self.apply_once(request).await
        })
        .await?;

        info!(
            location_id = %request.location_id,
            client_id = %request.client_id,
            timestamp = summary.timestamp,
            written = summary.written,
            deleted = summary.deleted,
            skipped = summary.skipped,
            "applied push"
        );
        Ok(summary)
    }

    fn validate(&self, request: &PushRequest) -> ServerResult<()> {
        if request.location_id.is_empty() {
            return Err(ServerError::InvalidRequest("locationId is required".into()));
        }
        if request.client_id.is_empty() {
            return Err(ServerError::InvalidRequest("clientId is required".into()));
        }
        let count = request.changes.len();
        if count > self.config.max_push_records {
            return Err(ServerError::InvalidRequest(format!(
                "push carries {count} entries, limit is {}",
                self.config.max_push_records
            )));
        }
        check_ids::<Ticket>(&request.changes)?;
        check_ids::<TicketComment>(&request.changes)?;
        check_ids::<TicketAttachment>(&request.changes)?;
        check_ids::<PaymentRecord>(&request.changes)?;
        Ok(())
    }

    async fn apply_once(&self, request: &PushRequest) -> ServerResult<PushSummary> {
        let mut tx = self.pool.begin().await?;
        let now = self.clock.now_millis();
        let mut summary = PushSummary {
            timestamp: now,
            ..PushSummary::default()
        };

        let batch = Batch {
            location_id: &request.location_id,
            since: request.last_pulled_at.unwrap_or(i64::MIN),
            now,
            changes: &request.changes,
        };
        batch.apply::<Ticket>(&mut *tx, &mut summary).await?;
        batch.apply::<TicketComment>(&mut *tx, &mut summary).await?;
        batch.apply::<TicketAttachment>(&mut *tx, &mut summary).await?;
        batch.apply::<PaymentRecord>(&mut *tx, &mut summary).await?;

        tx.commit().await?;
        Ok(summary)
    }
}

fn check_ids<T: SyncRecord>(changes: &ChangeSet) -> ServerResult<()> {
    let slot = T::changes(changes);
    let blank = slot
        .created
        .iter()
        .chain(slot.updated.iter())
        .any(|record| record.id().is_empty())
        || slot.deleted.iter().any(String::is_empty);
    if blank {
        return Err(ServerError::InvalidRequest(format!(
            "{} entry with an empty id",
            T::KIND
        )));
    }
    Ok(())
}

/// One push, as seen by every kind.
struct Batch<'a> {
    location_id: &'a str,
    since: i64,
    now: i64,
    changes: &'a ChangeSet,
}

impl Batch<'_> {
    /// A stored record may be overwritten only if it is in the pushing
    /// tenant and unchanged since the client's checkpoint.
    fn is_stale<T: SyncRecord>(&self, existing: &T) -> bool {
        existing.location_id() != self.location_id || existing.updated_at() > self.since
    }

    async fn apply<T: SyncTable>(
        &self,
        conn: &mut SqliteConnection,
        summary: &mut PushSummary,
    ) -> ServerResult<()> {
        let slot = T::changes(self.changes);
        if slot.is_empty() {
            return Ok(());
        }

        let ids: Vec<&str> = slot
            .created
            .iter()
            .chain(slot.updated.iter())
            .map(|record| record.id())
            .chain(slot.deleted.iter().map(String::as_str))
            .collect();
        let mut existing = tables::load_by_ids::<T>(conn, &ids).await?;

        // Ids this push has already written; later entries for them update
        // in place without a staleness check.
        let mut written: HashSet<String> = HashSet::new();

        for incoming in slot.created.iter().chain(slot.updated.iter()) {
            let id = incoming.id().to_string();
            let mut record = incoming.clone();
            record.set_location_id(self.location_id);
            record.stamp(self.now);

            match existing.get(&id) {
                Some(current) if !written.contains(&id) && self.is_stale(current) => {
                    warn!(
                        kind = %T::KIND,
                        id = %id,
                        stored_updated_at = current.updated_at(),
                        "skipping stale write"
                    );
                    summary.skipped += 1;
                    continue;
                }
                Some(current) => {
                    record.retain_server_fields(current);
                    tables::update(conn, &record).await?;
                }
                None => {
                    tables::insert(conn, &mut record).await?;
                }
            }
            summary.written += 1;
            written.insert(id.clone());
            existing.insert(id, record);
        }

        if slot.deleted.is_empty() {
            return Ok(());
        }
        if !T::KIND.soft_delete() {
            warn!(
                kind = %T::KIND,
                count = slot.deleted.len(),
                "ignoring deletes for a kind without soft delete"
            );
            summary.skipped += slot.deleted.len();
            return Ok(());
        }

        for id in &slot.deleted {
            match existing.get(id.as_str()) {
                None => {
                    debug!(kind = %T::KIND, id = %id, "delete for unknown record");
                }
                Some(current) if current.deleted_at().is_some() => {
                    debug!(kind = %T::KIND, id = %id, "record already deleted");
                }
                Some(current) if !written.contains(id) && self.is_stale(current) => {
                    warn!(
                        kind = %T::KIND,
                        id = %id,
                        stored_updated_at = current.updated_at(),
                        "skipping stale delete"
                    );
                    summary.skipped += 1;
                }
                Some(_) => {
                    tables::soft_delete::<T>(conn, id, self.now).await?;
                    summary.deleted += 1;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::memory_pool;
    use fieldsync_protocol::ManualClock;
    use fieldsync_protocol::TicketStatus;

    fn ticket(id: &str, title: &str) -> Ticket {
        Ticket {
            id: id.into(),
            location_id: "loc-1".into(),
            sequence_number: None,
            title: title.into(),
            description: None,
            status: TicketStatus::Open,
            customer_name: None,
            assigned_to: None,
            scheduled_for: None,
            created_at: 900,
            updated_at: 900,
            deleted_at: None,
        }
    }

    async fn service(now: i64) -> (PushService, Arc<ManualClock>, SqlitePool) {
        let pool = memory_pool().await;
        let clock = Arc::new(ManualClock::new(now));
        let service = PushService::new(
            pool.clone(),
            clock.clone(),
            Arc::new(ServerConfig::default().with_max_push_records(3)),
        );
        (service, clock, pool)
    }

    fn request(since: Option<i64>, changes: ChangeSet) -> PushRequest {
        PushRequest::new("loc-1", since, changes, "device-a")
    }

    fn comment(id: &str, ticket_id: &str) -> TicketComment {
        TicketComment {
            id: id.into(),
            location_id: "loc-1".into(),
            ticket_id: ticket_id.into(),
            author_id: "tech-1".into(),
            body: "checked the valve".into(),
            created_at: 900,
            updated_at: 900,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn failing_kind_rolls_back_earlier_kinds() {
        let (service, _, pool) = service(1000).await;
        sqlx::query(
            "CREATE TRIGGER reject_comments BEFORE INSERT ON ticket_comments \
             BEGIN SELECT RAISE(ABORT, 'comment rejected'); END",
        )
        .execute(&pool)
        .await
        .unwrap();

        let mut changes = ChangeSet::default();
        changes.tickets.created.push(ticket("t1", "valid"));
        changes.ticket_comments.created.push(comment("c1", "t1"));
        let err = service.apply(&request(None, changes)).await.unwrap_err();
        assert!(matches!(err, ServerError::Database(_)), "{err:?}");
        assert!(err.to_string().contains("comment rejected"));

        let (tickets,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tickets")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(tickets, 0);
    }

    #[tokio::test]
    async fn insert_then_same_push_update_is_not_stale() {
        let (service, _, pool) = service(1000).await;

        let mut changes = ChangeSet::default();
        changes.tickets.created.push(ticket("t1", "first"));
        changes.tickets.updated.push(ticket("t1", "second"));
        let summary = service.apply(&request(Some(500), changes)).await.unwrap();
        assert_eq!(summary.written, 2);
        assert_eq!(summary.skipped, 0);

        let mut conn = pool.acquire().await.unwrap();
        let stored = tables::load_by_ids::<Ticket>(&mut conn, &["t1"]).await.unwrap();
        assert_eq!(stored["t1"].title, "second");
        assert_eq!(stored["t1"].sequence_number, Some(1));
        assert_eq!(stored["t1"].updated_at, 1000);
    }

    #[tokio::test]
    async fn records_are_forced_onto_the_request_tenant() {
        let (service, _, pool) = service(1000).await;

        let mut foreign = ticket("t1", "mislabelled");
        foreign.location_id = "loc-9".into();
        let mut changes = ChangeSet::default();
        changes.tickets.created.push(foreign);
        service.apply(&request(None, changes)).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let stored = tables::load_by_ids::<Ticket>(&mut conn, &["t1"]).await.unwrap();
        assert_eq!(stored["t1"].location_id, "loc-1");
    }

    #[tokio::test]
    async fn payment_deletes_are_ignored() {
        let (service, _, _) = service(1000).await;

        let mut changes = ChangeSet::default();
        changes.payment_records.deleted.push("p1".into());
        let summary = service.apply(&request(Some(0), changes)).await.unwrap();
        assert_eq!(summary.deleted, 0);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn oversized_and_malformed_pushes_are_rejected() {
        let (service, _, _) = service(1000).await;

        let mut changes = ChangeSet::default();
        for id in ["a", "b", "c", "d"] {
            changes.tickets.deleted.push(id.into());
        }
        let err = service.apply(&request(None, changes)).await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidRequest(_)));

        let mut changes = ChangeSet::default();
        changes.tickets.created.push(ticket("", "no id"));
        let err = service.apply(&request(None, changes)).await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn update_keeps_server_owned_fields() {
        let (service, clock, pool) = service(1000).await;

        let mut changes = ChangeSet::default();
        changes.tickets.created.push(ticket("t1", "first"));
        service.apply(&request(None, changes)).await.unwrap();

        clock.set(2000);
        let mut edited = ticket("t1", "edited");
        edited.sequence_number = Some(42);
        edited.created_at = 1;
        let mut changes = ChangeSet::default();
        changes.tickets.updated.push(edited);
        let summary = service.apply(&request(Some(1500), changes)).await.unwrap();
        assert_eq!(summary.written, 1);

        let mut conn = pool.acquire().await.unwrap();
        let stored = tables::load_by_ids::<Ticket>(&mut conn, &["t1"]).await.unwrap();
        assert_eq!(stored["t1"].title, "edited");
        assert_eq!(stored["t1"].sequence_number, Some(1));
        assert_eq!(stored["t1"].created_at, 900);
        assert_eq!(stored["t1"].updated_at, 2000);
    }
}
