//! Per-tenant ticket numbering.
//!
//! Numbers are `max + 1` inside the inserting transaction, guarded by the
//! `UNIQUE (location_id, sequence_number)` constraint. A transaction that
//! loses the race is re-run as a whole by [`run_with_retries`].

use crate::error::{ServerError, ServerResult};
use crate::tables;
use fieldsync_protocol::{Clock, Ticket, TicketStatus};
use sqlx::{SqliteConnection, SqlitePool};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runs `op` until it succeeds, fails with a non-retryable error, or has
/// been attempted `attempts` times. `op` receives the 1-based attempt.
///
/// Only [`ServerError::is_retryable_conflict`] errors are retried; each
/// attempt must start a fresh transaction.
pub async fn run_with_retries<T, F, Fut>(attempts: u32, mut op: F) -> ServerResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ServerResult<T>>,
{
    let attempts = attempts.max(1);
    let mut last = String::new();
    for attempt in 1..=attempts {
        match op(attempt).await {
            Err(err) if err.is_retryable_conflict() => {
                debug!(attempt, error = %err, "write conflict, retrying");
                last = err.to_string();
                tokio::task::yield_now().await;
            }
            other => return other,
        }
    }
    warn!(attempts, last = %last, "giving up on conflicting write");
    Err(ServerError::RetriesExhausted { attempts, last })
}

/// Next free sequence number for a tenant in `table`, or 1 for the first.
pub(crate) async fn next_sequence(
    conn: &mut SqliteConnection,
    table: &str,
    location_id: &str,
) -> Result<i64, sqlx::Error> {
    let sql = format!(
        "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM {table} WHERE location_id = ?"
    );
    sqlx::query_scalar::<_, i64>(&sql)
        .bind(location_id)
        .fetch_one(&mut *conn)
        .await
}

/// Fields for a ticket created directly on the server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewTicket {
    /// Ticket ID; a random UUID when `None`.
    pub id: Option<String>,
    /// Short summary.
    pub title: String,
    /// Longer description.
    pub description: Option<String>,
    /// Initial state.
    pub status: TicketStatus,
    /// Customer the work is for.
    pub customer_name: Option<String>,
    /// Assigned technician.
    pub assigned_to: Option<String>,
    /// Scheduled visit time.
    pub scheduled_for: Option<i64>,
}

impl NewTicket {
    /// A new open ticket with a title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    fn to_ticket(&self, id: &str, location_id: &str, now: i64) -> Ticket {
        Ticket {
            id: id.to_string(),
            location_id: location_id.to_string(),
            sequence_number: None,
            title: self.title.clone(),
            description: self.description.clone(),
            status: self.status,
            customer_name: self.customer_name.clone(),
            assigned_to: self.assigned_to.clone(),
            scheduled_for: self.scheduled_for,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// Creates tickets with the next per-tenant sequence number.
pub struct SequenceAllocator {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    attempts: u32,
}

impl SequenceAllocator {
    /// Creates an allocator over the system of record.
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, attempts: u32) -> Self {
        Self {
            pool,
            clock,
            attempts,
        }
    }

    /// Inserts a ticket together with its sequence number.
    pub async fn create_ticket(&self, location_id: &str, new: NewTicket) -> ServerResult<Ticket> {
        if location_id.is_empty() {
            return Err(ServerError::InvalidRequest("locationId is required".into()));
        }
        let id = new
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let new = &new;
        let id = id.as_str();

        let ticket = run_with_retries(self.attempts, move |_| async move {
            self.insert_once(location_id, id, new).await
        })
        .await?;

        info!(
            location_id,
            ticket_id = %ticket.id,
            sequence = ?ticket.sequence_number,
            "created ticket"
        );
        Ok(ticket)
    }

    async fn insert_once(
        &self,
        location_id: &str,
        id: &str,
        new: &NewTicket,
    ) -> ServerResult<Ticket> {
        let mut tx = self.pool.begin().await?;
        let mut ticket = new.to_ticket(id, location_id, self.clock.now_millis());
        tables::insert(&mut *tx, &mut ticket).await?;
        tx.commit().await?;
        Ok(ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::store::test_support::memory_pool;
    use crate::store::{migrate, open_pool};
    use fieldsync_protocol::ManualClock;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_conflicts_until_success() {
        let calls = AtomicU32::new(0);
        let result = run_with_retries(5, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(ServerError::WriteConflict("UNIQUE constraint failed".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let result: ServerResult<()> = run_with_retries(4, |_| async {
            Err(ServerError::WriteConflict("database is locked".into()))
        })
        .await;
        match result {
            Err(ServerError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert!(last.contains("locked"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: ServerResult<()> = run_with_retries(5, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ServerError::Internal("boom".into())) }
        })
        .await;
        assert!(matches!(result, Err(ServerError::Internal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn numbers_are_per_tenant() {
        let pool = memory_pool().await;
        let allocator = SequenceAllocator::new(pool, Arc::new(ManualClock::new(1000)), 5);

        let a1 = allocator.create_ticket("loc-a", NewTicket::new("a1")).await.unwrap();
        let a2 = allocator.create_ticket("loc-a", NewTicket::new("a2")).await.unwrap();
        let b1 = allocator.create_ticket("loc-b", NewTicket::new("b1")).await.unwrap();

        assert_eq!(a1.sequence_number, Some(1));
        assert_eq!(a2.sequence_number, Some(2));
        assert_eq!(b1.sequence_number, Some(1));
        assert_eq!(a1.created_at, 1000);
        assert_ne!(a1.id, a2.id);
    }

    #[tokio::test]
    async fn concurrent_creation_yields_distinct_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("seq.db").display());
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), url).with_max_connections(4);
        let pool = open_pool(&config).await.unwrap();
        migrate(&pool, 0).await.unwrap();

        let allocator = Arc::new(SequenceAllocator::new(
            pool,
            Arc::new(ManualClock::new(1000)),
            32,
        ));

        let mut handles = Vec::new();
        for i in 0..8 {
            let allocator = Arc::clone(&allocator);
            handles.push(tokio::spawn(async move {
                allocator
                    .create_ticket("loc-1", NewTicket::new(format!("job {i}")))
                    .await
            }));
        }

        let mut numbers = HashSet::new();
        for handle in handles {
            let ticket = handle.await.unwrap().unwrap();
            numbers.insert(ticket.sequence_number.unwrap());
        }
        assert_eq!(numbers, (1..=8).collect::<HashSet<i64>>());
    }
}
