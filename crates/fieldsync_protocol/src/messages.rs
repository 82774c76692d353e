//! Protocol messages for sync.

use crate::entity::{
    EntityKind, PaymentRecord, SyncRecord, Ticket, TicketAttachment, TicketComment,
};
use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Records per entity kind returned by a pull page when the client does not ask.
pub const DEFAULT_PULL_LIMIT: u32 = 100;

/// Endpoint path for pull requests.
pub const PULL_PATH: &str = "/sync/pull";

/// Endpoint path for push requests.
pub const PUSH_PATH: &str = "/sync/push";

/// JSON encoding shared by every protocol message.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Encodes to JSON bytes.
    fn encode(&self) -> ProtocolResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decodes from JSON bytes.
    fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Changes for one entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityChanges<T> {
    /// Records the receiver has not seen before.
    #[serde(default = "Vec::new")]
    pub created: Vec<T>,
    /// Records the receiver may already hold.
    #[serde(default = "Vec::new")]
    pub updated: Vec<T>,
    /// IDs of deleted records.
    #[serde(default)]
    pub deleted: Vec<String>,
}

impl<T> EntityChanges<T> {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Total number of created, updated and deleted entries.
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

impl<T> Default for EntityChanges<T> {
    fn default() -> Self {
        Self {
            created: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

/// Changes for every entity kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    /// Ticket changes.
    #[serde(default)]
    pub tickets: EntityChanges<Ticket>,
    /// Comment changes.
    #[serde(default)]
    pub ticket_comments: EntityChanges<TicketComment>,
    /// Attachment changes.
    #[serde(default)]
    pub ticket_attachments: EntityChanges<TicketAttachment>,
    /// Payment changes.
    #[serde(default)]
    pub payment_records: EntityChanges<PaymentRecord>,
}

impl ChangeSet {
    /// Returns true if no kind has changes.
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
            && self.ticket_comments.is_empty()
            && self.ticket_attachments.is_empty()
            && self.payment_records.is_empty()
    }

    /// Number of entries across all kinds.
    pub fn len(&self) -> usize {
        self.tickets.len()
            + self.ticket_comments.len()
            + self.ticket_attachments.len()
            + self.payment_records.len()
    }

    /// Number of entries for one kind.
    pub fn len_of(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Ticket => self.tickets.len(),
            EntityKind::TicketComment => self.ticket_comments.len(),
            EntityKind::TicketAttachment => self.ticket_attachments.len(),
            EntityKind::PaymentRecord => self.payment_records.len(),
        }
    }
}

/// Pagination state for one pull cycle.
///
/// `snapshot_at` is fixed by the first page and reused for every later
/// page so records written mid-cycle are neither skipped nor repeated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    /// Upper bound of the pull window.
    pub snapshot_at: i64,
    /// Rows of tickets already returned.
    #[serde(default)]
    pub tickets_offset: u32,
    /// Rows of comments already returned.
    #[serde(default)]
    pub ticket_comments_offset: u32,
    /// Rows of attachments already returned.
    #[serde(default)]
    pub ticket_attachments_offset: u32,
    /// Rows of payments already returned.
    #[serde(default)]
    pub payment_records_offset: u32,
}

impl Cursor {
    /// A cursor at the start of a snapshot.
    pub fn at(snapshot_at: i64) -> Self {
        Self {
            snapshot_at,
            ..Self::default()
        }
    }

    /// Offset for one kind.
    pub fn offset(&self, kind: EntityKind) -> u32 {
        match kind {
            EntityKind::Ticket => self.tickets_offset,
            EntityKind::TicketComment => self.ticket_comments_offset,
            EntityKind::TicketAttachment => self.ticket_attachments_offset,
            EntityKind::PaymentRecord => self.payment_records_offset,
        }
    }

    /// Moves one kind's offset forward by `rows`.
    pub fn advance(&mut self, kind: EntityKind, rows: u32) {
        let slot = match kind {
            EntityKind::Ticket => &mut self.tickets_offset,
            EntityKind::TicketComment => &mut self.ticket_comments_offset,
            EntityKind::TicketAttachment => &mut self.ticket_attachments_offset,
            EntityKind::PaymentRecord => &mut self.payment_records_offset,
        };
        *slot = slot.saturating_add(rows);
    }
}

/// Pull request from client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Tenant being pulled.
    pub location_id: String,
    /// Client checkpoint, `None` if never synced.
    pub last_pulled_at: Option<i64>,
    /// Records per kind; the server applies a default and a cap.
    #[serde(default)]
    pub limit: Option<u32>,
    /// Continuation cursor, `None` on the first page.
    #[serde(default)]
    pub cursor: Option<Cursor>,
}

impl PullRequest {
    /// Creates a first-page pull request.
    pub fn new(location_id: impl Into<String>, last_pulled_at: Option<i64>) -> Self {
        Self {
            location_id: location_id.into(),
            last_pulled_at,
            limit: None,
            cursor: None,
        }
    }

    /// Sets the page size.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Continues from a cursor.
    pub fn with_cursor(mut self, cursor: Option<Cursor>) -> Self {
        self.cursor = cursor;
        self
    }
}

/// Pull response from server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// Changes in this page.
    pub changes: ChangeSet,
    /// Snapshot bound of the cycle; the next checkpoint.
    pub timestamp: i64,
    /// Whether more pages remain.
    pub has_more: bool,
    /// Cursor for the next page, `None` exactly when `has_more` is false.
    pub next_cursor: Option<Cursor>,
}

impl PullResponse {
    /// Checks structural invariants before the page is applied locally.
    pub fn validate(&self, location_id: &str) -> ProtocolResult<()> {
        match (&self.next_cursor, self.has_more) {
            (Some(cursor), true) => {
                if cursor.snapshot_at != self.timestamp {
                    return Err(ProtocolError::invalid(format!(
                        "cursor snapshot {} does not match timestamp {}",
                        cursor.snapshot_at, self.timestamp
                    )));
                }
            }
            (None, false) => {}
            (Some(_), false) => {
                return Err(ProtocolError::invalid("nextCursor present without hasMore"));
            }
            (None, true) => {
                return Err(ProtocolError::invalid("hasMore set without nextCursor"));
            }
        }

        check_tenant::<Ticket>(&self.changes, location_id)?;
        check_tenant::<TicketComment>(&self.changes, location_id)?;
        check_tenant::<TicketAttachment>(&self.changes, location_id)?;
        check_tenant::<PaymentRecord>(&self.changes, location_id)?;
        Ok(())
    }
}

fn check_tenant<T: SyncRecord>(changes: &ChangeSet, location_id: &str) -> ProtocolResult<()> {
    let slot = T::changes(changes);
    match slot
        .created
        .iter()
        .chain(slot.updated.iter())
        .find(|record| record.location_id() != location_id)
    {
        Some(record) => Err(ProtocolError::invalid(format!(
            "{} {} belongs to tenant {}",
            T::KIND,
            record.id(),
            record.location_id()
        ))),
        None => Ok(()),
    }
}

/// Push request from client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    /// Tenant being written.
    pub location_id: String,
    /// Client checkpoint at the time the outbox was drained.
    pub last_pulled_at: Option<i64>,
    /// Folded outbox contents.
    pub changes: ChangeSet,
    /// Originating client.
    pub client_id: String,
}

impl PushRequest {
    /// Creates a new push request.
    pub fn new(
        location_id: impl Into<String>,
        last_pulled_at: Option<i64>,
        changes: ChangeSet,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            location_id: location_id.into(),
            last_pulled_at,
            changes,
            client_id: client_id.into(),
        }
    }
}

/// Push response from server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    /// Always true on success.
    pub ok: bool,
    /// Transaction timestamp stamped on every accepted record.
    pub new_timestamp: i64,
}

impl PushResponse {
    /// Creates a successful push response.
    pub fn success(new_timestamp: i64) -> Self {
        Self {
            ok: true,
            new_timestamp,
        }
    }
}

/// Body returned with a failed HTTP call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
    /// Machine-readable code.
    pub code: String,
}

impl WireMessage for PullRequest {}
impl WireMessage for PullResponse {}
impl WireMessage for PushRequest {}
impl WireMessage for PushResponse {}
impl WireMessage for ErrorBody {}
