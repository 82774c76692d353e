//! The relational system of record.
//!
//! Opens the SQLite pool and applies the embedded schema migrations. Every
//! synchronizable table carries `location_id`, `created_at`, `updated_at`
//! and, for soft-deletable kinds, `deleted_at`.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

/// Embedded migrations, applied in order.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_sync_tables.sql",
        include_str!("../migrations/0001_sync_tables.sql"),
    ),
    (
        "0002_memberships.sql",
        include_str!("../migrations/0002_memberships.sql"),
    ),
];

/// Opens a connection pool for the configured database.
///
/// In-memory databases are pinned to one long-lived connection, since each
/// SQLite connection would otherwise see its own empty database.
pub async fn open_pool(config: &ServerConfig) -> ServerResult<SqlitePool> {
    let mut options = SqliteConnectOptions::from_str(&config.database_url)?
        .create_if_missing(true)
        .busy_timeout(config.busy_timeout);

    let mut pool = SqlitePoolOptions::new();
    if config.is_in_memory() {
        pool = pool
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    } else {
        options = options.journal_mode(SqliteJournalMode::Wal);
        pool = pool.max_connections(config.max_connections.max(1));
    }

    let pool = pool.connect_with(options).await?;
    debug!(url = %config.database_url, "opened database pool");
    Ok(pool)
}

/// Applies pending migrations. Returns how many were applied.
pub async fn migrate(pool: &SqlitePool, now: i64) -> ServerResult<usize> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY NOT NULL,
            applied_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    let applied: Vec<String> = sqlx::query_scalar("SELECT name FROM _migrations")
        .fetch_all(pool)
        .await?;

    let mut count = 0;
    let mut tx = pool.begin().await?;
    for (name, sql) in MIGRATIONS {
        if applied.iter().any(|done| done == name) {
            continue;
        }
        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| ServerError::Migration {
                name: (*name).to_string(),
                message: e.to_string(),
            })?;
        sqlx::query("INSERT INTO _migrations (name, applied_at) VALUES (?, ?)")
            .bind(*name)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        info!(migration = name, "applied migration");
        count += 1;
    }
    tx.commit().await?;
    Ok(count)
}

/// Grants a user access to a tenant, reactivating a revoked membership.
pub async fn grant_membership(
    pool: &SqlitePool,
    user_id: &str,
    location_id: &str,
    role: &str,
    now: i64,
) -> ServerResult<()> {
    sqlx::query(
        "INSERT INTO memberships (user_id, location_id, role, created_at, revoked_at)
         VALUES (?, ?, ?, ?, NULL)
         ON CONFLICT (user_id, location_id) DO UPDATE SET role = excluded.role, revoked_at = NULL",
    )
    .bind(user_id)
    .bind(location_id)
    .bind(role)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Revokes a user's access to a tenant.
pub async fn revoke_membership(
    pool: &SqlitePool,
    user_id: &str,
    location_id: &str,
    now: i64,
) -> ServerResult<()> {
    sqlx::query("UPDATE memberships SET revoked_at = ? WHERE user_id = ? AND location_id = ?")
        .bind(now)
        .bind(user_id)
        .bind(location_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Row counts for one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantSummary {
    /// Tenant ID.
    pub location_id: String,
    /// Live tickets.
    pub tickets: i64,
    /// Soft-deleted tickets.
    pub deleted_tickets: i64,
    /// Live comments.
    pub comments: i64,
    /// Live attachments.
    pub attachments: i64,
    /// Payments.
    pub payments: i64,
    /// Highest ticket sequence number.
    pub last_sequence: i64,
}

/// Summarizes every tenant with at least one ticket or membership.
pub async fn tenant_summaries(pool: &SqlitePool) -> ServerResult<Vec<TenantSummary>> {
    let rows = sqlx::query(
        "SELECT l.location_id,
            (SELECT COUNT(*) FROM tickets t WHERE t.location_id = l.location_id AND t.deleted_at IS NULL),
            (SELECT COUNT(*) FROM tickets t WHERE t.location_id = l.location_id AND t.deleted_at IS NOT NULL),
            (SELECT COUNT(*) FROM ticket_comments c WHERE c.location_id = l.location_id AND c.deleted_at IS NULL),
            (SELECT COUNT(*) FROM ticket_attachments a WHERE a.location_id = l.location_id AND a.deleted_at IS NULL),
            (SELECT COUNT(*) FROM payment_records p WHERE p.location_id = l.location_id),
            (SELECT COALESCE(MAX(sequence_number), 0) FROM tickets t WHERE t.location_id = l.location_id)
         FROM (SELECT location_id FROM tickets UNION SELECT location_id FROM memberships) l
         ORDER BY l.location_id",
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(TenantSummary {
                location_id: row.try_get(0)?,
                tickets: row.try_get(1)?,
                deleted_tickets: row.try_get(2)?,
                comments: row.try_get(3)?,
                attachments: row.try_get(4)?,
                payments: row.try_get(5)?,
                last_sequence: row.try_get(6)?,
            })
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A migrated in-memory pool.
    pub async fn memory_pool() -> SqlitePool {
        let pool = open_pool(&ServerConfig::default()).await.unwrap();
        migrate(&pool, 0).await.unwrap();
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::memory_pool;
    use super::*;

    #[tokio::test]
    async fn migrations_are_applied_once() {
        let pool = open_pool(&ServerConfig::default()).await.unwrap();
        assert_eq!(migrate(&pool, 1).await.unwrap(), MIGRATIONS.len());
        assert_eq!(migrate(&pool, 2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("sync.db").display());
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), url);

        let pool = open_pool(&config).await.unwrap();
        migrate(&pool, 1).await.unwrap();
        grant_membership(&pool, "u1", "loc-1", "owner", 1).await.unwrap();
        pool.close().await;

        let pool = open_pool(&config).await.unwrap();
        assert_eq!(migrate(&pool, 2).await.unwrap(), 0);
        let summaries = tenant_summaries(&pool).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].location_id, "loc-1");
    }

    #[tokio::test]
    async fn membership_grant_and_revoke() {
        let pool = memory_pool().await;
        grant_membership(&pool, "u1", "loc-1", "technician", 10).await.unwrap();
        revoke_membership(&pool, "u1", "loc-1", 20).await.unwrap();

        let revoked: Option<i64> = sqlx::query_scalar(
            "SELECT revoked_at FROM memberships WHERE user_id = 'u1' AND location_id = 'loc-1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(revoked, Some(20));

        grant_membership(&pool, "u1", "loc-1", "owner", 30).await.unwrap();
        let revoked: Option<i64> = sqlx::query_scalar(
            "SELECT revoked_at FROM memberships WHERE user_id = 'u1' AND location_id = 'loc-1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(revoked, None);
    }
}
