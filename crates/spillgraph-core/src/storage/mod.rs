//! Persistent storage for node records and secondary indices.
//!
//! This module provides:
//! - `Store`: ordered `id -> bytes` map over SQLite (WAL journal)
//! - SQL schema definitions for the store file
//! - Persisted index tables beside the node records

pub mod index;
pub mod schema;
pub mod store;

pub use index::index_table_name;
pub use schema::STORE_SCHEMA_VERSION;
pub use store::{Store, StoreError};
