//! SQLite persistence layer for canonical play-state records.
//!
//! Provides schema creation, the `Store` CRUD/transaction surface, and the
//! SQL generation helpers (identifier quoting, external-id lookup) backed
//! by SQLite via rusqlite with the bundled feature.

pub mod schema;
pub mod sql;
pub mod store;

pub use rusqlite::Connection;
pub use schema::{create_schema, open_database, open_memory, SchemaError, CURRENT_VERSION};
pub use sql::{quote_identifier, Driver};
pub use store::{ActionCounts, CommitStats, Store, StoreError};
