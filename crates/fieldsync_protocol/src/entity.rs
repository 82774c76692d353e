//! Synchronizable entities.

use crate::messages::{ChangeSet, EntityChanges};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kinds of entity that take part in delta sync.
///
/// Push applies kinds in the order of [`EntityKind::ALL`]; pull paginates
/// each kind independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    /// Service tickets.
    Ticket,
    /// Comments attached to a ticket.
    TicketComment,
    /// Attachment metadata for a ticket.
    TicketAttachment,
    /// Recorded payments. Never soft-deleted.
    PaymentRecord,
}

impl EntityKind {
    /// Every kind, in push order.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Ticket,
        EntityKind::TicketComment,
        EntityKind::TicketAttachment,
        EntityKind::PaymentRecord,
    ];

    /// Collection name used on the wire and in the local mirror.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Ticket => "tickets",
            EntityKind::TicketComment => "ticketComments",
            EntityKind::TicketAttachment => "ticketAttachments",
            EntityKind::PaymentRecord => "paymentRecords",
        }
    }

    /// Resolves a collection name back to its kind.
    pub fn from_collection(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.collection() == name)
    }

    /// Returns true if this kind carries a `deletedAt` column.
    pub fn soft_delete(&self) -> bool {
        !matches!(self, EntityKind::PaymentRecord)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

/// Descriptor implemented by every synchronizable record.
///
/// Pull classification, push conflict checks, outbox folding and mirror
/// application are written once against this trait so the rules cannot
/// drift between kinds.
pub trait SyncRecord: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The kind this record belongs to.
    const KIND: EntityKind;

    /// Stable, globally unique identifier.
    fn id(&self) -> &str;

    /// Owning tenant.
    fn location_id(&self) -> &str;

    /// Moves the record onto a tenant.
    fn set_location_id(&mut self, location_id: &str);

    /// Creation time.
    fn created_at(&self) -> i64;

    /// Sets the creation time.
    fn set_created_at(&mut self, created_at: i64);

    /// Last modification time.
    fn updated_at(&self) -> i64;

    /// Soft-delete time, always `None` for kinds without soft delete.
    fn deleted_at(&self) -> Option<i64>;

    /// Marks the record as written at `now` and clears any soft delete.
    fn stamp(&mut self, now: i64);

    /// Selects this kind's slot in a change set.
    fn changes(set: &ChangeSet) -> &EntityChanges<Self>;

    /// Selects this kind's slot in a change set, mutably.
    fn changes_mut(set: &mut ChangeSet) -> &mut EntityChanges<Self>;
}

macro_rules! sync_record {
    ($ty:ty, $kind:expr, $slot:ident, soft_delete) => {
        impl SyncRecord for $ty {
            const KIND: EntityKind = $kind;

            fn id(&self) -> &str {
                &self.id
            }
            fn location_id(&self) -> &str {
                &self.location_id
            }
            fn set_location_id(&mut self, location_id: &str) {
                self.location_id = location_id.to_string();
            }
            fn created_at(&self) -> i64 {
                self.created_at
            }
            fn set_created_at(&mut self, created_at: i64) {
                self.created_at = created_at;
            }
            fn updated_at(&self) -> i64 {
                self.updated_at
            }
            fn deleted_at(&self) -> Option<i64> {
                self.deleted_at
            }
            fn stamp(&mut self, now: i64) {
                self.updated_at = now;
                self.deleted_at = None;
            }
            fn changes(set: &ChangeSet) -> &EntityChanges<Self> {
                &set.$slot
            }
            fn changes_mut(set: &mut ChangeSet) -> &mut EntityChanges<Self> {
                &mut set.$slot
            }
        }
    };
    ($ty:ty, $kind:expr, $slot:ident) => {
        impl SyncRecord for $ty {
            const KIND: EntityKind = $kind;

            fn id(&self) -> &str {
                &self.id
            }
            fn location_id(&self) -> &str {
                &self.location_id
            }
            fn set_location_id(&mut self, location_id: &str) {
                self.location_id = location_id.to_string();
            }
            fn created_at(&self) -> i64 {
                self.created_at
            }
            fn set_created_at(&mut self, created_at: i64) {
                self.created_at = created_at;
            }
            fn updated_at(&self) -> i64 {
                self.updated_at
            }
            fn deleted_at(&self) -> Option<i64> {
                None
            }
            fn stamp(&mut self, now: i64) {
                self.updated_at = now;
            }
            fn changes(set: &ChangeSet) -> &EntityChanges<Self> {
                &set.$slot
            }
            fn changes_mut(set: &mut ChangeSet) -> &mut EntityChanges<Self> {
                &mut set.$slot
            }
        }
    };
}

/// Lifecycle state of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Newly opened.
    #[default]
    Open,
    /// A visit has been booked.
    Scheduled,
    /// Work has started.
    InProgress,
    /// Work is done.
    Completed,
    /// Closed without completion.
    Cancelled,
}

impl TicketStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::Scheduled => "scheduled",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Completed => "completed",
            TicketStatus::Cancelled => "cancelled",
        }
    }

    /// Parses the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(TicketStatus::Open),
            "scheduled" => Some(TicketStatus::Scheduled),
            "in_progress" => Some(TicketStatus::InProgress),
            "completed" => Some(TicketStatus::Completed),
            "cancelled" => Some(TicketStatus::Cancelled),
            _ => None,
        }
    }
}

/// A field-service ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    /// Ticket ID.
    pub id: String,
    /// Owning tenant.
    pub location_id: String,
    /// Per-tenant human-readable number, assigned by the server.
    #[serde(default)]
    pub sequence_number: Option<i64>,
    /// Short summary.
    pub title: String,
    /// Longer description.
    #[serde(default)]
    pub description: Option<String>,
    /// Lifecycle state.
    #[serde(default)]
    pub status: TicketStatus,
    /// Customer the work is for.
    #[serde(default)]
    pub customer_name: Option<String>,
    /// Assigned technician.
    #[serde(default)]
    pub assigned_to: Option<String>,
    /// Scheduled visit time.
    #[serde(default)]
    pub scheduled_for: Option<i64>,
    /// Creation time.
    pub created_at: i64,
    /// Last modification time.
    pub updated_at: i64,
    /// Soft-delete time.
    #[serde(default)]
    pub deleted_at: Option<i64>,
}

/// A comment on a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketComment {
    /// Comment ID.
    pub id: String,
    /// Owning tenant.
    pub location_id: String,
    /// Ticket the comment belongs to.
    pub ticket_id: String,
    /// Author user ID.
    pub author_id: String,
    /// Comment text.
    pub body: String,
    /// Creation time.
    pub created_at: i64,
    /// Last modification time.
    pub updated_at: i64,
    /// Soft-delete time.
    #[serde(default)]
    pub deleted_at: Option<i64>,
}

/// Metadata for a file attached to a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketAttachment {
    /// Attachment ID.
    pub id: String,
    /// Owning tenant.
    pub location_id: String,
    /// Ticket the file belongs to.
    pub ticket_id: String,
    /// Original file name.
    pub file_name: String,
    /// MIME type.
    pub content_type: String,
    /// Size in bytes.
    pub size_bytes: i64,
    /// Key in the file store, once uploaded.
    #[serde(default)]
    pub storage_key: Option<String>,
    /// Creation time.
    pub created_at: i64,
    /// Last modification time.
    pub updated_at: i64,
    /// Soft-delete time.
    #[serde(default)]
    pub deleted_at: Option<i64>,
}

/// A payment taken against a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    /// Payment ID.
    pub id: String,
    /// Owning tenant.
    pub location_id: String,
    /// Ticket being paid for.
    pub ticket_id: String,
    /// Amount in minor currency units.
    pub amount_cents: i64,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Payment method (cash, card, ...).
    pub method: String,
    /// User who recorded the payment.
    #[serde(default)]
    pub recorded_by: Option<String>,
    /// Free-form note.
    #[serde(default)]
    pub note: Option<String>,
    /// Creation time.
    pub created_at: i64,
    /// Last modification time.
    pub updated_at: i64,
}

sync_record!(Ticket, EntityKind::Ticket, tickets, soft_delete);
sync_record!(TicketComment, EntityKind::TicketComment, ticket_comments, soft_delete);
sync_record!(TicketAttachment, EntityKind::TicketAttachment, ticket_attachments, soft_delete);
sync_record!(PaymentRecord, EntityKind::PaymentRecord, payment_records);
