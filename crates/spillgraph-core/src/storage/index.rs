//! Persisted secondary index tables.
//!
//! Each index is a table `index_<name>` of `(value, id)` pairs plus a row in
//! `index_catalog` naming the indexed property key.

use rusqlite::{params, Result as SqliteResult};

use super::schema::{create_index_table_sql, INDEX_TABLE_PREFIX};
use super::store::{atomically, Store, StoreError};

/// Longest accepted index name
const MAX_INDEX_NAME_LEN: usize = 64;

/// Check an index name and return its table name
pub fn index_table_name(name: &str) -> Result<String, StoreError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_INDEX_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(StoreError::InvalidIndexName(name.to_string()));
    }
    Ok(format!("{INDEX_TABLE_PREFIX}{name}"))
}

impl Store {
    /// Replace the contents of an index
    pub fn save_index(
        &self,
        name: &str,
        property_key: &str,
        entries: &[(Vec<u8>, i64)],
    ) -> Result<(), StoreError> {
        let table = index_table_name(name)?;
        self.with_write(|conn| {
            atomically(conn, "save_index", |conn| {
                conn.execute(&create_index_table_sql(&table), [])?;
                conn.execute(
                    "INSERT OR REPLACE INTO index_catalog (name, property_key) VALUES (?1, ?2)",
                    params![name, property_key],
                )?;
                conn.execute(&format!("DELETE FROM {table}"), [])?;
                let mut stmt =
                    conn.prepare(&format!("INSERT OR IGNORE INTO {table} (value, id) VALUES (?1, ?2)"))?;
                for (value, id) in entries {
                    stmt.execute(params![value, id])?;
                }
                Ok(())
            })
        })
    }

    /// Load all `(value, id)` pairs of an index
    pub fn load_index(&self, name: &str) -> Result<Vec<(Vec<u8>, i64)>, StoreError> {
        let table = index_table_name(name)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT value, id FROM {table} ORDER BY value, id"))?;
            let entries = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<SqliteResult<Vec<_>>>()?;
            Ok(entries)
        })
    }

    /// All persisted indices as `(name, property_key)` pairs, sorted by name
    pub fn index_catalog(&self) -> Result<Vec<(String, String)>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT name, property_key FROM index_catalog ORDER BY name")?;
            let catalog = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<SqliteResult<Vec<_>>>()?;
            Ok(catalog)
        })
    }

    /// Drop an index table and its catalog entry
    pub fn drop_index(&self, name: &str) -> Result<bool, StoreError> {
        let table = index_table_name(name)?;
        self.with_write(|conn| {
            conn.execute(&format!("DROP TABLE IF EXISTS {table}"), [])?;
            let removed = conn.execute("DELETE FROM index_catalog WHERE name = ?1", [name])?;
            Ok(removed > 0)
        })
    }
}
