//! # FieldSync Protocol
//!
//! Wire types and JSON codecs for FieldSync delta synchronization.
//!
//! This crate provides:
//! - `EntityKind` and the `SyncRecord` descriptor shared by every generic sync path
//! - The four synchronizable records (tickets, comments, attachments, payments)
//! - Protocol messages (`PullRequest`, `PullResponse`, `PushRequest`, `PushResponse`)
//! - Pagination `Cursor` and per-kind `ChangeSet`
//! - The `Clock` both sides stamp records with
//!
//! This is a pure protocol crate with no I/O operations. All timestamps are
//! Unix milliseconds.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod entity;
mod error;
mod messages;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::{
    EntityKind, PaymentRecord, SyncRecord, Ticket, TicketAttachment, TicketComment, TicketStatus,
};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    ChangeSet, Cursor, EntityChanges, ErrorBody, PullRequest, PullResponse, PushRequest,
    PushResponse, WireMessage, DEFAULT_PULL_LIMIT, PULL_PATH, PUSH_PATH,
};
