//! # FieldSync Engine
//!
//! Offline-first sync client for FieldSync.
//!
//! This crate provides:
//! - An embedded local store: mirrored documents, the outbox and checkpoints
//! - Outbox folding into one push per cycle
//! - The sync state machine (idle → pushing → pulling → synced)
//! - HTTP transport abstraction over `reqwest` or an in-process loopback
//! - A background scheduler with exponential backoff
//!
//! ## Architecture
//!
//! Every local write updates the mirror and appends one outbox entry in
//! the same commit. A sync cycle then runs **push-then-pull**:
//! 1. Fold the tenant's pending entries and push them with the checkpoint
//! 2. Acknowledge exactly the entries that were pushed
//! 3. Pull pages under one fixed snapshot and apply each to the mirror
//! 4. Persist the snapshot timestamp as the new checkpoint
//!
//! ## Key Invariants
//!
//! - At most one cycle in flight per engine
//! - A failed cycle leaves the outbox and checkpoint untouched
//! - Applying a pulled page twice is a no-op
//! - The checkpoint never moves backwards

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod http;
mod journal;
mod local;
mod outbox;
mod scheduler;
mod state;
mod transport;

pub use config::{RetryConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use http::{HttpClient, HttpReply, HttpTransport, LoopbackClient, LoopbackServer, ReqwestClient};
pub use local::{CheckpointStore, LocalReplica, LocalStore, MirrorStore, OutboxStore};
pub use outbox::{fold_entries, Operation, OutboxEntry};
pub use scheduler::SyncScheduler;
pub use state::{SyncCycleResult, SyncEngine, SyncOutcome, SyncSession, SyncState, SyncStats};
pub use transport::{MockTransport, SyncTransport};
