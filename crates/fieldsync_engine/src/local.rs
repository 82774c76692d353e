//! Embedded client store: the local mirror, the outbox and checkpoints.
//!
//! Documents are kept as JSON values per tenant, collection and id. Commits
//! mutate the state in place under the write lock and are undone if they
//! fail part way.
//!
//! A file-backed store keeps a CBOR snapshot plus an append-only journal
//! next to it. Each commit appends its changes to the journal. Once the
//! journal grows past a threshold, and on open, it is folded into a new
//! snapshot written through a temporary file and a rename.

use crate::error::{SyncError, SyncResult};
use crate::journal::{Change, Journal};
use crate::outbox::{Operation, OutboxEntry};
use fieldsync_protocol::{
    ChangeSet, Clock, EntityKind, PaymentRecord, SyncRecord, SystemClock, Ticket,
    TicketAttachment, TicketComment,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const FORMAT_VERSION: u32 = 1;

/// Journal size past which a commit folds it into the snapshot.
const COMPACT_AFTER_BYTES: u64 = 1 << 20;

/// Persisted sync checkpoints, one per tenant.
pub trait CheckpointStore: Send + Sync {
    /// The tenant's checkpoint, `None` if never synced.
    fn checkpoint(&self, location_id: &str) -> SyncResult<Option<i64>>;

    /// Replaces the tenant's checkpoint.
    fn set_checkpoint(&self, location_id: &str, at: i64) -> SyncResult<()>;
}

/// Pending local writes.
pub trait OutboxStore: Send + Sync {
    /// The tenant's pending entries ordered by `(created_at, seq)`.
    fn pending(&self, location_id: &str) -> SyncResult<Vec<OutboxEntry>>;

    /// Removes pushed entries; returns how many were removed.
    fn acknowledge(&self, seqs: &[u64]) -> SyncResult<usize>;
}

/// Mirrored server documents.
pub trait MirrorStore: Send + Sync {
    /// Replaces a document by its `id`.
    fn upsert_document(&self, location_id: &str, kind: EntityKind, document: Value)
        -> SyncResult<()>;

    /// Soft-deletes a document at `at`, or removes it for kinds without
    /// soft delete. Returns false if the id is unknown.
    fn delete_document(
        &self,
        location_id: &str,
        kind: EntityKind,
        id: &str,
        at: i64,
    ) -> SyncResult<bool>;

    /// Reads one document.
    fn document(&self, location_id: &str, kind: EntityKind, id: &str) -> SyncResult<Option<Value>>;

    /// Reads every document of a kind, soft-deleted ones included.
    fn documents(&self, location_id: &str, kind: EntityKind) -> SyncResult<Vec<Value>>;

    /// Applies one pulled page in a single commit; returns the number of
    /// upserts and deletes applied.
    fn apply_changes(&self, location_id: &str, changes: &ChangeSet, at: i64) -> SyncResult<usize>;
}

/// Everything the sync engine needs from local storage.
pub trait LocalReplica: CheckpointStore + OutboxStore + MirrorStore {}

impl<T: CheckpointStore + OutboxStore + MirrorStore> LocalReplica for T {}

type Collection = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocalState {
    format: u32,
    /// Tenant → collection name → id → document.
    mirror: BTreeMap<String, BTreeMap<String, Collection>>,
    outbox: Vec<OutboxEntry>,
    checkpoints: BTreeMap<String, i64>,
    next_seq: u64,
}

impl LocalState {
    fn new() -> Self {
        Self {
            format: FORMAT_VERSION,
            next_seq: 1,
            ..Self::default()
        }
    }

    fn collection(&self, location_id: &str, kind: EntityKind) -> Option<&Collection> {
        self.mirror.get(location_id)?.get(kind.collection())
    }

    fn get(&self, location_id: &str, kind: EntityKind, id: &str) -> Option<&Value> {
        self.collection(location_id, kind)?.get(id)
    }

    /// Applies one change. Enqueues below `next_seq` are already present
    /// and are skipped.
    fn apply(&mut self, change: &Change) {
        match change {
            Change::Document {
                location_id,
                kind,
                id,
                document: Some(document),
            } => {
                self.mirror
                    .entry(location_id.clone())
                    .or_default()
                    .entry(kind.collection().to_string())
                    .or_default()
                    .insert(id.clone(), document.clone());
            }
            Change::Document {
                location_id,
                kind,
                id,
                document: None,
            } => {
                if let Some(collection) = self
                    .mirror
                    .get_mut(location_id)
                    .and_then(|tenant| tenant.get_mut(kind.collection()))
                {
                    collection.remove(id);
                }
            }
            Change::Enqueue(entry) => {
                if entry.seq >= self.next_seq {
                    self.next_seq = entry.seq + 1;
                    self.outbox.push(entry.clone());
                }
            }
            Change::Acknowledge(seqs) => {
                self.outbox.retain(|entry| !seqs.contains(&entry.seq));
            }
            Change::Checkpoint { location_id, at } => {
                self.checkpoints.insert(location_id.clone(), *at);
            }
        }
    }
}

/// What it takes to revert one applied [`Change`].
enum Undo {
    Document {
        location_id: String,
        kind: EntityKind,
        id: String,
        previous: Option<Value>,
    },
    Enqueue {
        next_seq: u64,
    },
    Acknowledge(Vec<OutboxEntry>),
    Checkpoint {
        location_id: String,
        previous: Option<i64>,
    },
}

impl Undo {
    fn revert(self, state: &mut LocalState) {
        match self {
            Undo::Document {
                location_id,
                kind,
                id,
                previous,
            } => state.apply(&Change::Document {
                location_id,
                kind,
                id,
                document: previous,
            }),
            Undo::Enqueue { next_seq } => {
                state.outbox.pop();
                state.next_seq = next_seq;
            }
            Undo::Acknowledge(entries) => {
                state.outbox.extend(entries);
                state.outbox.sort_by_key(|entry| entry.seq);
            }
            Undo::Checkpoint {
                location_id,
                previous: Some(at),
            } => {
                state.checkpoints.insert(location_id, at);
            }
            Undo::Checkpoint {
                location_id,
                previous: None,
            } => {
                state.checkpoints.remove(&location_id);
            }
        }
    }
}

/// Changes made in place under the write lock, reverted unless the commit
/// goes through.
struct Txn<'a> {
    state: &'a mut LocalState,
    changes: Vec<Change>,
    undo: Vec<Undo>,
}

impl<'a> Txn<'a> {
    fn new(state: &'a mut LocalState) -> Self {
        Self {
            state,
            changes: Vec::new(),
            undo: Vec::new(),
        }
    }

    fn record(&mut self, change: Change) {
        let undo = match &change {
            Change::Document {
                location_id,
                kind,
                id,
                ..
            } => Undo::Document {
                location_id: location_id.clone(),
                kind: *kind,
                id: id.clone(),
                previous: self.state.get(location_id, *kind, id).cloned(),
            },
            Change::Enqueue(_) => Undo::Enqueue {
                next_seq: self.state.next_seq,
            },
            Change::Acknowledge(seqs) => Undo::Acknowledge(
                self.state
                    .outbox
                    .iter()
                    .filter(|entry| seqs.contains(&entry.seq))
                    .cloned()
                    .collect(),
            ),
            Change::Checkpoint { location_id, .. } => Undo::Checkpoint {
                location_id: location_id.clone(),
                previous: self.state.checkpoints.get(location_id).copied(),
            },
        };
        self.state.apply(&change);
        self.undo.push(undo);
        self.changes.push(change);
    }

    fn rollback(self) {
        for undo in self.undo.into_iter().rev() {
            undo.revert(self.state);
        }
    }

    fn upsert(&mut self, location_id: &str, kind: EntityKind, document: Value) -> SyncResult<()> {
        let id = document
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SyncError::Codec(format!("{kind} document without an id")))?
            .to_string();
        self.record(Change::Document {
            location_id: location_id.to_string(),
            kind,
            id,
            document: Some(document),
        });
        Ok(())
    }

    fn delete(&mut self, location_id: &str, kind: EntityKind, id: &str, at: i64) -> bool {
        let Some(current) = self.state.get(location_id, kind, id) else {
            return false;
        };
        let document = if kind.soft_delete() {
            let mut document = current.clone();
            let Some(fields) = document.as_object_mut() else {
                return false;
            };
            fields.insert("deletedAt".into(), Value::from(at));
            fields.insert("updatedAt".into(), Value::from(at));
            Some(document)
        } else {
            None
        };
        self.record(Change::Document {
            location_id: location_id.to_string(),
            kind,
            id: id.to_string(),
            document,
        });
        true
    }

    fn enqueue(&mut self, entry: impl FnOnce(u64) -> SyncResult<OutboxEntry>) -> SyncResult<u64> {
        let seq = self.state.next_seq;
        self.record(Change::Enqueue(entry(seq)?));
        Ok(seq)
    }

    fn acknowledge(&mut self, seqs: &HashSet<u64>) -> usize {
        let hits: Vec<u64> = self
            .state
            .outbox
            .iter()
            .map(|entry| entry.seq)
            .filter(|seq| seqs.contains(seq))
            .collect();
        let count = hits.len();
        if count > 0 {
            self.record(Change::Acknowledge(hits));
        }
        count
    }

    fn set_checkpoint(&mut self, location_id: &str, at: i64) {
        self.record(Change::Checkpoint {
            location_id: location_id.to_string(),
            at,
        });
    }

    fn apply_kind<T: SyncRecord>(
        &mut self,
        location_id: &str,
        changes: &ChangeSet,
        at: i64,
    ) -> SyncResult<usize> {
        let slot = T::changes(changes);
        let mut applied = 0;
        for record in slot.created.iter().chain(slot.updated.iter()) {
            let document =
                serde_json::to_value(record).map_err(|e| SyncError::Codec(e.to_string()))?;
            self.upsert(location_id, T::KIND, document)?;
            applied += 1;
        }
        for id in &slot.deleted {
            if self.delete(location_id, T::KIND, id, at) {
                applied += 1;
            } else {
                debug!(kind = %T::KIND, id = %id, "pulled delete for unknown record");
            }
        }
        Ok(applied)
    }
}

impl Deref for Txn<'_> {
    type Target = LocalState;

    fn deref(&self) -> &LocalState {
        &*self.state
    }
}

/// The client's embedded store.
pub struct LocalStore {
    state: RwLock<LocalState>,
    path: Option<PathBuf>,
    journal: Option<Mutex<Journal>>,
    compact_after: u64,
    clock: Arc<dyn Clock>,
}

impl LocalStore {
    /// Creates a store that lives only in memory.
    pub fn in_memory() -> Self {
        Self::in_memory_with_clock(Arc::new(SystemClock))
    }

    /// Opens a file-backed store, creating it if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    /// Opens a file-backed store stamping local writes from `clock`.
    ///
    /// Journaled changes are replayed over the snapshot and then folded
    /// into a fresh one.
    pub fn open_with_clock(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut state = if path.exists() {
            load(&path)?
        } else {
            LocalState::new()
        };
        let (mut journal, frames) = Journal::open(&path.with_extension("journal"))?;
        let replayed = frames.len();
        for change in frames.iter().flatten() {
            state.apply(change);
        }
        if replayed > 0 {
            compact(&path, &state, &mut journal)?;
        }
        info!(
            path = %path.display(),
            pending = state.outbox.len(),
            replayed,
            "opened local store"
        );
        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
            journal: Some(Mutex::new(journal)),
            compact_after: COMPACT_AFTER_BYTES,
            clock,
        })
    }

    /// Creates an in-memory store stamping local writes from `clock`.
    pub fn in_memory_with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(LocalState::new()),
            path: None,
            journal: None,
            compact_after: COMPACT_AFTER_BYTES,
            clock,
        }
    }

    /// Backing snapshot file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Applies `mutate` to the state in place. A file-backed store journals
    /// the changes before the write lock is released. If `mutate` or the
    /// journal write fails, every change is undone.
    fn commit<R>(&self, mutate: impl FnOnce(&mut Txn<'_>) -> SyncResult<R>) -> SyncResult<R> {
        let mut state = self.state.write();
        let mut txn = Txn::new(&mut *state);
        let result = match mutate(&mut txn) {
            Ok(result) => result,
            Err(err) => {
                txn.rollback();
                return Err(err);
            }
        };
        if let (Some(path), Some(journal)) = (&self.path, &self.journal) {
            if !txn.changes.is_empty() {
                let mut journal = journal.lock();
                if let Err(err) = journal.append(&txn.changes) {
                    txn.rollback();
                    return Err(err);
                }
                if journal.len() >= self.compact_after {
                    if let Err(err) = compact(path, &*txn.state, &mut journal) {
                        warn!(error = %err, "journal compaction failed");
                    }
                }
            }
        }
        Ok(result)
    }

    /// Creates a record locally and queues it for push.
    ///
    /// `created_at` and `updated_at` are set to the local clock.
    pub fn create<T: SyncRecord>(&self, mut record: T) -> SyncResult<T> {
        check_ids(record.location_id(), record.id())?;
        let now = self.clock.now_millis();
        record.set_created_at(now);
        record.stamp(now);

        self.commit(|state| {
            if state
                .get(record.location_id(), T::KIND, record.id())
                .is_some()
            {
                return Err(SyncError::InvalidOperation(format!(
                    "{} {} already exists",
                    T::KIND,
                    record.id()
                )));
            }
            write_record(state, &record, Operation::Create, now)
        })?;
        debug!(kind = %T::KIND, id = %record.id(), "created locally");
        Ok(record)
    }

    /// Replaces a live record locally and queues the change for push.
    ///
    /// The stored `created_at` is kept.
    pub fn update<T: SyncRecord>(&self, mut record: T) -> SyncResult<T> {
        check_ids(record.location_id(), record.id())?;
        let now = self.clock.now_millis();

        self.commit(|state| {
            let current = live::<T>(state, record.location_id(), record.id())?;
            record.set_created_at(current.created_at());
            record.stamp(now);
            write_record(state, &record, Operation::Update, now)
        })?;
        debug!(kind = %T::KIND, id = %record.id(), "updated locally");
        Ok(record)
    }

    /// Soft-deletes a live record locally and queues the delete for push.
    ///
    /// Payment records cannot be deleted.
    pub fn delete<T: SyncRecord>(&self, location_id: &str, id: &str) -> SyncResult<()> {
        if !T::KIND.soft_delete() {
            return Err(SyncError::InvalidOperation(format!(
                "{} cannot be deleted",
                T::KIND
            )));
        }
        check_ids(location_id, id)?;
        let now = self.clock.now_millis();

        self.commit(|state| {
            live::<T>(state, location_id, id)?;
            state.delete(location_id, T::KIND, id, now);
            state.enqueue(|seq| Ok(OutboxEntry::delete(seq, location_id, T::KIND, id, now)))
        })?;
        debug!(kind = %T::KIND, id, "deleted locally");
        Ok(())
    }

    /// Reads a record, soft-deleted or not.
    pub fn get<T: SyncRecord>(&self, location_id: &str, id: &str) -> SyncResult<Option<T>> {
        let state = self.state.read();
        state
            .get(location_id, T::KIND, id)
            .map(decode::<T>)
            .transpose()
    }

    /// Lists the live records of a kind in id order.
    pub fn list<T: SyncRecord>(&self, location_id: &str) -> SyncResult<Vec<T>> {
        let state = self.state.read();
        let Some(collection) = state.collection(location_id, T::KIND) else {
            return Ok(Vec::new());
        };
        let mut records = Vec::with_capacity(collection.len());
        for document in collection.values() {
            let record = decode::<T>(document)?;
            if record.deleted_at().is_none() {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Number of pending outbox entries for a tenant.
    pub fn pending_count(&self, location_id: &str) -> usize {
        self.state
            .read()
            .outbox
            .iter()
            .filter(|entry| entry.location_id == location_id)
            .count()
    }

    /// Tickets of a tenant.
    pub fn tickets(&self, location_id: &str) -> SyncResult<Vec<Ticket>> {
        self.list(location_id)
    }

    /// Comments of a tenant.
    pub fn ticket_comments(&self, location_id: &str) -> SyncResult<Vec<TicketComment>> {
        self.list(location_id)
    }

    /// Attachment metadata of a tenant.
    pub fn ticket_attachments(&self, location_id: &str) -> SyncResult<Vec<TicketAttachment>> {
        self.list(location_id)
    }

    /// Payments of a tenant.
    pub fn payment_records(&self, location_id: &str) -> SyncResult<Vec<PaymentRecord>> {
        self.list(location_id)
    }
}

impl CheckpointStore for LocalStore {
    fn checkpoint(&self, location_id: &str) -> SyncResult<Option<i64>> {
        Ok(self.state.read().checkpoints.get(location_id).copied())
    }

    fn set_checkpoint(&self, location_id: &str, at: i64) -> SyncResult<()> {
        self.commit(|state| {
            state.set_checkpoint(location_id, at);
            Ok(())
        })
    }
}

impl OutboxStore for LocalStore {
    fn pending(&self, location_id: &str) -> SyncResult<Vec<OutboxEntry>> {
        let mut pending: Vec<OutboxEntry> = self
            .state
            .read()
            .outbox
            .iter()
            .filter(|entry| entry.location_id == location_id)
            .cloned()
            .collect();
        pending.sort_by_key(|entry| (entry.created_at, entry.seq));
        Ok(pending)
    }

    fn acknowledge(&self, seqs: &[u64]) -> SyncResult<usize> {
        if seqs.is_empty() {
            return Ok(0);
        }
        let seqs: HashSet<u64> = seqs.iter().copied().collect();
        self.commit(|state| Ok(state.acknowledge(&seqs)))
    }
}

impl MirrorStore for LocalStore {
    fn upsert_document(
        &self,
        location_id: &str,
        kind: EntityKind,
        document: Value,
    ) -> SyncResult<()> {
        self.commit(|state| state.upsert(location_id, kind, document))
    }

    fn delete_document(
        &self,
        location_id: &str,
        kind: EntityKind,
        id: &str,
        at: i64,
    ) -> SyncResult<bool> {
        self.commit(|state| Ok(state.delete(location_id, kind, id, at)))
    }

    fn document(&self, location_id: &str, kind: EntityKind, id: &str) -> SyncResult<Option<Value>> {
        Ok(self.state.read().get(location_id, kind, id).cloned())
    }

    fn documents(&self, location_id: &str, kind: EntityKind) -> SyncResult<Vec<Value>> {
        Ok(self
            .state
            .read()
            .collection(location_id, kind)
            .map(|collection| collection.values().cloned().collect())
            .unwrap_or_default())
    }

    fn apply_changes(&self, location_id: &str, changes: &ChangeSet, at: i64) -> SyncResult<usize> {
        if changes.is_empty() {
            return Ok(0);
        }
        self.commit(|state| {
            Ok(state.apply_kind::<Ticket>(location_id, changes, at)?
                + state.apply_kind::<TicketComment>(location_id, changes, at)?
                + state.apply_kind::<TicketAttachment>(location_id, changes, at)?
                + state.apply_kind::<PaymentRecord>(location_id, changes, at)?)
        })
    }
}

fn check_ids(location_id: &str, id: &str) -> SyncResult<()> {
    if location_id.is_empty() || id.is_empty() {
        return Err(SyncError::InvalidOperation(
            "records need a location and an id".into(),
        ));
    }
    Ok(())
}

fn live<T: SyncRecord>(state: &LocalState, location_id: &str, id: &str) -> SyncResult<T> {
    let not_found = || SyncError::NotFound {
        kind: T::KIND,
        id: id.to_string(),
    };
    let current = decode::<T>(state.get(location_id, T::KIND, id).ok_or_else(not_found)?)?;
    if current.deleted_at().is_some() {
        return Err(not_found());
    }
    Ok(current)
}

fn write_record<T: SyncRecord>(
    state: &mut Txn<'_>,
    record: &T,
    operation: Operation,
    now: i64,
) -> SyncResult<u64> {
    let document = serde_json::to_value(record).map_err(|e| SyncError::Codec(e.to_string()))?;
    state.upsert(record.location_id(), T::KIND, document)?;
    state.enqueue(|seq| OutboxEntry::record(seq, operation, record, now))
}

fn decode<T: SyncRecord>(document: &Value) -> SyncResult<T> {
    T::deserialize(document).map_err(|e| SyncError::Codec(format!("{}: {e}", T::KIND)))
}

fn load(path: &Path) -> SyncResult<LocalState> {
    let file = File::open(path)?;
    let state: LocalState = ciborium::from_reader(BufReader::new(file))
        .map_err(|e| SyncError::Storage(format!("{}: {e}", path.display())))?;
    if state.format != FORMAT_VERSION {
        return Err(SyncError::Storage(format!(
            "{}: unsupported store format {}",
            path.display(),
            state.format
        )));
    }
    Ok(state)
}

fn compact(path: &Path, state: &LocalState, journal: &mut Journal) -> SyncResult<()> {
    persist(path, state)?;
    journal.clear()?;
    debug!(path = %path.display(), "journal folded into snapshot");
    Ok(())
}

fn persist(path: &Path, state: &LocalState) -> SyncResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        ciborium::into_writer(state, &mut writer)
            .map_err(|e| SyncError::Storage(format!("{}: {e}", tmp.display())))?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_protocol::{ManualClock, TicketStatus};

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
            created_at: 0,
            updated_at: 0,
            deleted_at: None,
        }
    }

    fn payment(id: &str) -> PaymentRecord {
        PaymentRecord {
            id: id.into(),
            location_id: "loc-1".into(),
            ticket_id: "t1".into(),
            amount_cents: 4500,
            currency: "EUR".into(),
            method: "card".into(),
            recorded_by: None,
            note: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn store(now: i64) -> (LocalStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        (LocalStore::in_memory_with_clock(clock.clone()), clock)
    }

    #[test]
    fn writes_enqueue_one_entry_each() {
        let (store, clock) = store(100);

        let created = store.create(ticket("t1", "boiler")).unwrap();
        assert_eq!(created.created_at, 100);
        assert_eq!(created.updated_at, 100);

        clock.set(200);
        let updated = store.update(ticket("t1", "boiler, 2nd visit")).unwrap();
        assert_eq!(updated.created_at, 100);
        assert_eq!(updated.updated_at, 200);

        clock.set(300);
        store.delete::<Ticket>("loc-1", "t1").unwrap();

        let pending = store.pending("loc-1").unwrap();
        let ops: Vec<Operation> = pending.iter().map(|e| e.operation).collect();
        assert_eq!(
            ops,
            vec![Operation::Create, Operation::Update, Operation::Delete]
        );
        assert!(store.pending("loc-2").unwrap().is_empty());

        let stored = store.get::<Ticket>("loc-1", "t1").unwrap().unwrap();
        assert_eq!(stored.deleted_at, Some(300));
        assert!(store.tickets("loc-1").unwrap().is_empty());
    }

    #[test]
    fn business_rules_are_enforced() {
        let (store, _) = store(100);

        let err = store.update(ticket("t9", "missing")).unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));

        store.create(ticket("t1", "a")).unwrap();
        let err = store.create(ticket("t1", "again")).unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));

        store.create(payment("p1")).unwrap();
        let err = store.delete::<PaymentRecord>("loc-1", "p1").unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));

        store.delete::<Ticket>("loc-1", "t1").unwrap();
        let err = store.delete::<Ticket>("loc-1", "t1").unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));

        assert_eq!(store.pending_count("loc-1"), 3);
    }

    #[test]
    fn failed_writes_leave_no_outbox_entry() {
        let (store, _) = store(100);
        let _ = store.update(ticket("t1", "missing"));
        let _ = store.delete::<PaymentRecord>("loc-1", "p1");
        assert_eq!(store.pending_count("loc-1"), 0);
    }

    #[test]
    fn applying_a_page_twice_is_a_no_op() {
        let (store, _) = store(100);
        let mut changes = ChangeSet::default();
        let mut remote = ticket("t1", "from server");
        remote.sequence_number = Some(7);
        remote.updated_at = 50;
        changes.tickets.updated.push(remote);
        changes.ticket_comments.deleted.push("unknown".into());

        assert_eq!(store.apply_changes("loc-1", &changes, 60).unwrap(), 1);
        let once = store.documents("loc-1", EntityKind::Ticket).unwrap();
        assert_eq!(store.apply_changes("loc-1", &changes, 60).unwrap(), 1);
        let twice = store.documents("loc-1", EntityKind::Ticket).unwrap();
        assert_eq!(once, twice);
        assert_eq!(
            store.get::<Ticket>("loc-1", "t1").unwrap().unwrap().sequence_number,
            Some(7)
        );
        assert_eq!(store.pending_count("loc-1"), 0);
    }

    #[test]
    fn pulled_deletes_soft_delete_or_remove() {
        let (store, _) = store(100);
        let mut seed = ChangeSet::default();
        seed.tickets.created.push(ticket("t1", "a"));
        seed.payment_records.created.push(payment("p1"));
        store.apply_changes("loc-1", &seed, 10).unwrap();

        let mut deletes = ChangeSet::default();
        deletes.tickets.deleted.push("t1".into());
        deletes.payment_records.deleted.push("p1".into());
        store.apply_changes("loc-1", &deletes, 20).unwrap();

        let doc = store
            .document("loc-1", EntityKind::Ticket, "t1")
            .unwrap()
            .unwrap();
        assert_eq!(doc["deletedAt"], 20);
        assert!(store
            .document("loc-1", EntityKind::PaymentRecord, "p1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn acknowledge_removes_only_named_entries() {
        let (store, _) = store(100);
        store.create(ticket("t1", "a")).unwrap();
        store.create(ticket("t2", "b")).unwrap();
        let first = store.pending("loc-1").unwrap()[0].seq;

        assert_eq!(store.acknowledge(&[first, 999]).unwrap(), 1);
        let left = store.pending("loc-1").unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].entity_id, "t2");
    }

    #[test]
    fn upsert_requires_an_id() {
        let (store, _) = store(100);
        let err = store
            .upsert_document("loc-1", EntityKind::Ticket, serde_json::json!({ "title": "x" }))
            .unwrap_err();
        assert!(matches!(err, SyncError::Codec(_)));
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.cbor");
        let clock = Arc::new(ManualClock::new(100));

        {
            let store = LocalStore::open_with_clock(&path, clock.clone()).unwrap();
            store.create(ticket("t1", "boiler")).unwrap();
            store.set_checkpoint("loc-1", 90).unwrap();
        }

        let store = LocalStore::open_with_clock(&path, clock).unwrap();
        assert_eq!(store.checkpoint("loc-1").unwrap(), Some(90));
        assert_eq!(store.pending_count("loc-1"), 1);
        assert_eq!(store.tickets("loc-1").unwrap()[0].title, "boiler");

        store.create(ticket("t2", "sink")).unwrap();
        let seqs: Vec<u64> = store.pending("loc-1").unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn failed_page_leaves_mirror_untouched() {
        let (store, _) = store(100);
        let mut changes = ChangeSet::default();
        changes.tickets.updated.push(ticket("t1", "from server"));
        changes.ticket_comments.updated.push(TicketComment {
            id: String::new(),
            location_id: "loc-1".into(),
            ticket_id: "t1".into(),
            author_id: "tech-1".into(),
            body: "no id".into(),
            created_at: 10,
            updated_at: 10,
            deleted_at: None,
        });

        let err = store.apply_changes("loc-1", &changes, 60).unwrap_err();
        assert!(matches!(err, SyncError::Codec(_)));
        assert!(store.documents("loc-1", EntityKind::Ticket).unwrap().is_empty());
    }

    #[test]
    fn journal_failure_undoes_the_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.cbor");
        let clock = Arc::new(ManualClock::new(100));

        {
            let store = LocalStore::open_with_clock(&path, clock.clone()).unwrap();
            store.create(ticket("t1", "boiler")).unwrap();
            store.set_checkpoint("loc-1", 90).unwrap();

            let read_only = File::open(path.with_extension("journal")).unwrap();
            store
                .journal
                .as_ref()
                .unwrap()
                .lock()
                .replace_file(read_only);

            assert!(store.create(ticket("t2", "sink")).is_err());
            assert!(store.update(ticket("t1", "boiler, 2nd visit")).is_err());
            assert!(store.acknowledge(&[1]).is_err());
            assert!(store.set_checkpoint("loc-1", 95).is_err());

            assert!(store.get::<Ticket>("loc-1", "t2").unwrap().is_none());
            assert_eq!(store.tickets("loc-1").unwrap()[0].title, "boiler");
            assert_eq!(store.pending_count("loc-1"), 1);
            assert_eq!(store.checkpoint("loc-1").unwrap(), Some(90));
        }

        let store = LocalStore::open_with_clock(&path, clock).unwrap();
        assert_eq!(store.tickets("loc-1").unwrap().len(), 1);
        store.create(ticket("t2", "sink")).unwrap();
        let seqs: Vec<u64> = store.pending("loc-1").unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn journal_is_folded_into_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.cbor");
        let journal = path.with_extension("journal");
        let clock = Arc::new(ManualClock::new(100));

        {
            let mut store = LocalStore::open_with_clock(&path, clock.clone()).unwrap();
            store.create(ticket("t1", "boiler")).unwrap();
            assert!(!path.exists());
            assert!(fs::metadata(&journal).unwrap().len() > 0);

            store.compact_after = 0;
            store.create(ticket("t2", "sink")).unwrap();
            assert!(path.exists());
            assert_eq!(fs::metadata(&journal).unwrap().len(), 0);

            store.compact_after = COMPACT_AFTER_BYTES;
            store.acknowledge(&[1]).unwrap();
        }

        let store = LocalStore::open_with_clock(&path, clock).unwrap();
        assert_eq!(store.tickets("loc-1").unwrap().len(), 2);
        let pending = store.pending("loc-1").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_id, "t2");
        assert_eq!(fs::metadata(&journal).unwrap().len(), 0);
    }

    #[test]
    fn replaying_a_folded_journal_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.cbor");
        let journal = path.with_extension("journal");
        let clock = Arc::new(ManualClock::new(100));

        {
            let store = LocalStore::open_with_clock(&path, clock.clone()).unwrap();
            store.create(ticket("t1", "boiler")).unwrap();
            store.delete::<Ticket>("loc-1", "t1").unwrap();
            store.set_checkpoint("loc-1", 90).unwrap();
        }
        let frames = fs::read(&journal).unwrap();

        // Reopening folds the journal; restoring it mimics a crash before
        // the journal was cleared.
        drop(LocalStore::open_with_clock(&path, clock.clone()).unwrap());
        fs::write(&journal, &frames).unwrap();

        let store = LocalStore::open_with_clock(&path, clock).unwrap();
        let seqs: Vec<u64> = store.pending("loc-1").unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(store.checkpoint("loc-1").unwrap(), Some(90));
        let stored = store.get::<Ticket>("loc-1", "t1").unwrap().unwrap();
        assert_eq!(stored.deleted_at, Some(100));
    }
}
