//! # FieldSync Testkit
//!
//! Test utilities for FieldSync.
//!
//! This crate provides:
//! - A sync server over an in-memory database with a manual clock
//! - Client devices wired to that server through the real HTTP transport
//! - Record builders and property-based test generators
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fieldsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn two_devices_converge() {
//!     let server = TestServer::new().await;
//!     let tablet = server.device("tablet", "tech-1", "loc-1");
//!     tablet.store().create(ticket("loc-1", "t1", "Boiler service")).unwrap();
//!     tablet.sync_ok().await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
