//! Row mapping for synchronizable tables.
//!
//! Every statement the pull and push services issue is built here from a
//! kind's column list, so the four tables share one set of queries.

use crate::sequence::next_sequence;
use fieldsync_protocol::{
    PaymentRecord, SyncRecord, Ticket, TicketAttachment, TicketComment, TicketStatus,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::collections::HashMap;

/// Upper bound on ids bound into one `IN (...)` list.
const ID_CHUNK: usize = 500;

/// A column value ready to bind.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlValue {
    Text(Option<String>),
    Integer(Option<i64>),
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(Some(value.to_string()))
    }
}

impl From<&Option<String>> for SqlValue {
    fn from(value: &Option<String>) -> Self {
        SqlValue::Text(value.clone())
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(Some(value))
    }
}

impl From<Option<i64>> for SqlValue {
    fn from(value: Option<i64>) -> Self {
        SqlValue::Integer(value)
    }
}

/// Storage mapping for a synchronizable record.
///
/// `COLUMNS` starts with `id`, and `values()` yields one value per column
/// in the same order.
pub(crate) trait SyncTable: SyncRecord {
    /// Table name.
    const TABLE: &'static str;

    /// Column names, `id` first.
    const COLUMNS: &'static [&'static str];

    /// Whether inserts allocate a per-tenant sequence number.
    const SEQUENCED: bool = false;

    /// Column values in `COLUMNS` order.
    fn values(&self) -> Vec<SqlValue>;

    /// Decodes a row selected with `COLUMNS`.
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error>;

    /// Stores an allocated sequence number.
    fn set_sequence(&mut self, _sequence: i64) {}

    /// Copies fields the client may not change from the stored row.
    fn retain_server_fields(&mut self, existing: &Self);
}

impl SyncTable for Ticket {
    const TABLE: &'static str = "tickets";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "location_id",
        "sequence_number",
        "title",
        "description",
        "status",
        "customer_name",
        "assigned_to",
        "scheduled_for",
        "created_at",
        "updated_at",
        "deleted_at",
    ];
    const SEQUENCED: bool = true;

    fn values(&self) -> Vec<SqlValue> {
        vec![
            self.id.as_str().into(),
            self.location_id.as_str().into(),
            self.sequence_number.into(),
            self.title.as_str().into(),
            (&self.description).into(),
            self.status.as_str().into(),
            (&self.customer_name).into(),
            (&self.assigned_to).into(),
            self.scheduled_for.into(),
            self.created_at.into(),
            self.updated_at.into(),
            self.deleted_at.into(),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = TicketStatus::parse(&status)
            .ok_or_else(|| sqlx::Error::Decode(format!("unknown ticket status {status}").into()))?;
        Ok(Ticket {
            id: row.try_get("id")?,
            location_id: row.try_get("location_id")?,
            sequence_number: row.try_get("sequence_number")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            status,
            customer_name: row.try_get("customer_name")?,
            assigned_to: row.try_get("assigned_to")?,
            scheduled_for: row.try_get("scheduled_for")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    fn set_sequence(&mut self, sequence: i64) {
        self.sequence_number = Some(sequence);
    }

    fn retain_server_fields(&mut self, existing: &Self) {
        self.created_at = existing.created_at;
        self.sequence_number = existing.sequence_number;
    }
}

impl SyncTable for TicketComment {
    const TABLE: &'static str = "ticket_comments";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "location_id",
        "ticket_id",
        "author_id",
        "body",
        "created_at",
        "updated_at",
        "deleted_at",
    ];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            self.id.as_str().into(),
            self.location_id.as_str().into(),
            self.ticket_id.as_str().into(),
            self.author_id.as_str().into(),
            self.body.as_str().into(),
            self.created_at.into(),
            self.updated_at.into(),
            self.deleted_at.into(),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(TicketComment {
            id: row.try_get("id")?,
            location_id: row.try_get("location_id")?,
            ticket_id: row.try_get("ticket_id")?,
            author_id: row.try_get("author_id")?,
            body: row.try_get("body")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    fn retain_server_fields(&mut self, existing: &Self) {
        self.created_at = existing.created_at;
    }
}

impl SyncTable for TicketAttachment {
    const TABLE: &'static str = "ticket_attachments";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "location_id",
        "ticket_id",
        "file_name",
        "content_type",
        "size_bytes",
        "storage_key",
        "created_at",
        "updated_at",
        "deleted_at",
    ];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            self.id.as_str().into(),
            self.location_id.as_str().into(),
            self.ticket_id.as_str().into(),
            self.file_name.as_str().into(),
            self.content_type.as_str().into(),
            self.size_bytes.into(),
            (&self.storage_key).into(),
            self.created_at.into(),
            self.updated_at.into(),
            self.deleted_at.into(),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(TicketAttachment {
            id: row.try_get("id")?,
            location_id: row.try_get("location_id")?,
            ticket_id: row.try_get("ticket_id")?,
            file_name: row.try_get("file_name")?,
            content_type: row.try_get("content_type")?,
            size_bytes: row.try_get("size_bytes")?,
            storage_key: row.try_get("storage_key")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    fn retain_server_fields(&mut self, existing: &Self) {
        self.created_at = existing.created_at;
    }
}

impl SyncTable for PaymentRecord {
    const TABLE: &'static str = "payment_records";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "location_id",
        "ticket_id",
        "amount_cents",
        "currency",
        "method",
        "recorded_by",
        "note",
        "created_at",
        "updated_at",
    ];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            self.id.as_str().into(),
            self.location_id.as_str().into(),
            self.ticket_id.as_str().into(),
            self.amount_cents.into(),
            self.currency.as_str().into(),
            self.method.as_str().into(),
            (&self.recorded_by).into(),
            (&self.note).into(),
            self.created_at.into(),
            self.updated_at.into(),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(PaymentRecord {
            id: row.try_get("id")?,
            location_id: row.try_get("location_id")?,
            ticket_id: row.try_get("ticket_id")?,
            amount_cents: row.try_get("amount_cents")?,
            currency: row.try_get("currency")?,
            method: row.try_get("method")?,
            recorded_by: row.try_get("recorded_by")?,
            note: row.try_get("note")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn retain_server_fields(&mut self, existing: &Self) {
        self.created_at = existing.created_at;
    }
}

fn select_from<T: SyncTable>() -> QueryBuilder<'static, Sqlite> {
    let mut qb = QueryBuilder::new("SELECT ");
    qb.push(T::COLUMNS.join(", "))
        .push(" FROM ")
        .push(T::TABLE);
    qb
}

/// Loads records by id, across all tenants. Missing ids are absent from
/// the map.
pub(crate) async fn load_by_ids<T: SyncTable>(
    conn: &mut SqliteConnection,
    ids: &[&str],
) -> Result<HashMap<String, T>, sqlx::Error> {
    let mut found = HashMap::with_capacity(ids.len());
    for chunk in ids.chunks(ID_CHUNK) {
        let mut qb = select_from::<T>();
        qb.push(" WHERE id IN (");
        let mut list = qb.separated(", ");
        for id in chunk {
            list.push_bind(id.to_string());
        }
        list.push_unseparated(")");

        let rows = qb.build().fetch_all(&mut *conn).await?;
        for row in &rows {
            let record = T::from_row(row)?;
            found.insert(record.id().to_string(), record);
        }
    }
    Ok(found)
}

/// Loads one page of a tenant's changes inside `(since, until]`.
///
/// A record is in the window if it was written or soft-deleted inside it.
/// Without `since` the whole table up to `until` is the window, minus
/// soft-deleted rows. Rows are ordered by `(updated_at, id)`.
pub(crate) async fn load_window<T: SyncTable>(
    conn: &mut SqliteConnection,
    location_id: &str,
    since: Option<i64>,
    until: i64,
    offset: u32,
    fetch: u32,
) -> Result<Vec<T>, sqlx::Error> {
    let soft_delete = T::KIND.soft_delete();

    let mut qb = select_from::<T>();
    qb.push(" WHERE location_id = ")
        .push_bind(location_id.to_string());
    match since {
        Some(since) => {
            qb.push(" AND ((updated_at > ")
                .push_bind(since)
                .push(" AND updated_at <= ")
                .push_bind(until)
                .push(")");
            if soft_delete {
                qb.push(" OR (deleted_at > ")
                    .push_bind(since)
                    .push(" AND deleted_at <= ")
                    .push_bind(until)
                    .push(")");
            }
            qb.push(")");
        }
        None => {
            qb.push(" AND updated_at <= ").push_bind(until);
            if soft_delete {
                qb.push(" AND deleted_at IS NULL");
            }
        }
    }
    qb.push(" ORDER BY updated_at ASC, id ASC LIMIT ")
        .push_bind(i64::from(fetch))
        .push(" OFFSET ")
        .push_bind(i64::from(offset));

    let rows = qb.build().fetch_all(&mut *conn).await?;
    rows.iter().map(T::from_row).collect()
}

fn bind_values(qb: &mut QueryBuilder<'static, Sqlite>, values: Vec<SqlValue>) {
    let mut list = qb.separated(", ");
    for value in values {
        match value {
            SqlValue::Text(text) => list.push_bind(text),
            SqlValue::Integer(int) => list.push_bind(int),
        };
    }
}

/// Inserts a record, allocating its sequence number first for sequenced
/// kinds.
pub(crate) async fn insert<T: SyncTable>(
    conn: &mut SqliteConnection,
    record: &mut T,
) -> Result<(), sqlx::Error> {
    if T::SEQUENCED {
        let sequence = next_sequence(conn, T::TABLE, record.location_id()).await?;
        record.set_sequence(sequence);
    }

    let mut qb = QueryBuilder::new("INSERT INTO ");
    qb.push(T::TABLE)
        .push(" (")
        .push(T::COLUMNS.join(", "))
        .push(") VALUES (");
    bind_values(&mut qb, record.values());
    qb.push(")");
    qb.build().execute(&mut *conn).await?;
    Ok(())
}

/// Overwrites every column of an existing row.
pub(crate) async fn update<T: SyncTable>(
    conn: &mut SqliteConnection,
    record: &T,
) -> Result<(), sqlx::Error> {
    let mut qb = QueryBuilder::new("UPDATE ");
    qb.push(T::TABLE).push(" SET ");
    {
        let mut assignments = qb.separated(", ");
        for (column, value) in T::COLUMNS.iter().zip(record.values()).skip(1) {
            assignments.push(*column).push_unseparated(" = ");
            match value {
                SqlValue::Text(text) => assignments.push_bind_unseparated(text),
                SqlValue::Integer(int) => assignments.push_bind_unseparated(int),
            };
        }
    }
    qb.push(" WHERE id = ").push_bind(record.id().to_string());
    qb.build().execute(&mut *conn).await?;
    Ok(())
}

/// Marks a row deleted at `now`.
pub(crate) async fn soft_delete<T: SyncTable>(
    conn: &mut SqliteConnection,
    id: &str,
    now: i64,
) -> Result<(), sqlx::Error> {
    let mut qb = QueryBuilder::new("UPDATE ");
    qb.push(T::TABLE)
        .push(" SET deleted_at = ")
        .push_bind(now)
        .push(", updated_at = ")
        .push_bind(now)
        .push(" WHERE id = ")
        .push_bind(id.to_string());
    qb.build().execute(&mut *conn).await?;
    Ok(())
}
