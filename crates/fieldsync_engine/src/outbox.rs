//! Pending local changes and how they fold into one push.
//!
//! Every local write appends an [`OutboxEntry`]. Before a push the pending
//! entries are folded per record into the net change the server needs to
//! see:
//!
//! | first entry | last entry    | pushed as  |
//! |-------------|---------------|------------|
//! | create      | create/update | `created`  |
//! | create      | delete        | nothing    |
//! | update      | create/update | `updated`  |
//! | update      | delete        | `deleted`  |
//!
//! The payload pushed is always the last write.

use crate::error::{SyncError, SyncResult};
use fieldsync_protocol::{
    ChangeSet, EntityKind, PaymentRecord, SyncRecord, Ticket, TicketAttachment, TicketComment,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// A local write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    /// A new record.
    Create,
    /// A change to an existing record.
    Update,
    /// A delete.
    Delete,
}

/// One pending local write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    /// Insertion order, unique per store.
    pub seq: u64,
    /// Tenant the write belongs to.
    pub location_id: String,
    /// Entity kind.
    pub kind: EntityKind,
    /// What was done.
    pub operation: Operation,
    /// Record ID.
    pub entity_id: String,
    /// Full record after the write; `None` for deletes.
    pub payload: Option<Value>,
    /// Local time of the write.
    pub created_at: i64,
}

impl OutboxEntry {
    /// An entry for a create or update carrying the written record.
    pub fn record<T: SyncRecord>(
        seq: u64,
        operation: Operation,
        record: &T,
        created_at: i64,
    ) -> SyncResult<Self> {
        let payload = serde_json::to_value(record).map_err(|e| SyncError::Codec(e.to_string()))?;
        Ok(Self {
            seq,
            location_id: record.location_id().to_string(),
            kind: T::KIND,
            operation,
            entity_id: record.id().to_string(),
            payload: Some(payload),
            created_at,
        })
    }

    /// An entry for a delete.
    pub fn delete(
        seq: u64,
        location_id: &str,
        kind: EntityKind,
        entity_id: &str,
        created_at: i64,
    ) -> Self {
        Self {
            seq,
            location_id: location_id.to_string(),
            kind,
            operation: Operation::Delete,
            entity_id: entity_id.to_string(),
            payload: None,
            created_at,
        }
    }
}

/// Folds pending entries, oldest first, into the change set to push.
///
/// Records appear in the order of their first pending entry.
pub fn fold_entries(entries: &[OutboxEntry]) -> SyncResult<ChangeSet> {
    let mut changes = ChangeSet::default();
    fold_kind::<Ticket>(entries, &mut changes)?;
    fold_kind::<TicketComment>(entries, &mut changes)?;
    fold_kind::<TicketAttachment>(entries, &mut changes)?;
    fold_kind::<PaymentRecord>(entries, &mut changes)?;
    Ok(changes)
}

enum Last<'a> {
    Write(&'a Value),
    Delete,
}

struct Folded<'a> {
    id: &'a str,
    local_only: bool,
    last: Last<'a>,
}

fn fold_kind<T: SyncRecord>(entries: &[OutboxEntry], changes: &mut ChangeSet) -> SyncResult<()> {
    let mut folded: Vec<Folded<'_>> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for entry in entries.iter().filter(|entry| entry.kind == T::KIND) {
        let last = match entry.operation {
            Operation::Delete => Last::Delete,
            Operation::Create | Operation::Update => {
                Last::Write(entry.payload.as_ref().ok_or_else(|| {
                    SyncError::Codec(format!(
                        "outbox entry {} for {} {} has no payload",
                        entry.seq,
                        T::KIND,
                        entry.entity_id
                    ))
                })?)
            }
        };
        match index.get(entry.entity_id.as_str()) {
            Some(&at) => folded[at].last = last,
            None => {
                index.insert(&entry.entity_id, folded.len());
                folded.push(Folded {
                    id: &entry.entity_id,
                    local_only: entry.operation == Operation::Create,
                    last,
                });
            }
        }
    }

    let slot = T::changes_mut(changes);
    for record in folded {
        match (record.local_only, record.last) {
            (true, Last::Write(payload)) => slot.created.push(decode::<T>(payload)?),
            (true, Last::Delete) => {}
            (false, Last::Write(payload)) => slot.updated.push(decode::<T>(payload)?),
            (false, Last::Delete) if T::KIND.soft_delete() => {
                slot.deleted.push(record.id.to_string());
            }
            (false, Last::Delete) => {
                warn!(
                    kind = %T::KIND,
                    id = %record.id,
                    "dropping delete for a kind without soft delete"
                );
            }
        }
    }
    Ok(())
}

fn decode<T: SyncRecord>(payload: &Value) -> SyncResult<T> {
    T::deserialize(payload).map_err(|e| SyncError::Codec(format!("{}: {e}", T::KIND)))
}
