//! facia-store — SQLite-backed identity store.
//!
//! Implements the core's `IdentityStore` contract and keeps the access log.
//! The pipeline never sees SQL; it only talks to the narrow trait.

mod sqlite;

pub use sqlite::{AccessRecord, SqliteStore};
