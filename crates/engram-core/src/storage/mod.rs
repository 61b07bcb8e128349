//! Storage substrate
//!
//! One embedded SQLite database per user (+ WAL sibling). Schema evolves via
//! numbered forward-only migrations recorded in `schema_version`.

pub mod migrations;
pub mod sqlite;

pub use migrations::{Migration, MigrationOutcome, MigrationReport, MIGRATIONS};
pub use sqlite::{Result, Storage, StorageError};
