//! SQLite schema definitions for the node record store.
//!
//! One database file holds the serialized node bodies, a small metadata table
//! and the secondary index tables.

/// Schema version of the store file
pub const STORE_SCHEMA_VERSION: &str = "1";

/// SQL to create the nodes table
///
/// One row per node; `record` is the codec's encoding of the node body.
pub const SCHEMA_CREATE_NODES: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    id INTEGER PRIMARY KEY NOT NULL,
    record BLOB NOT NULL
)
"#;

/// SQL to create the metadata table
///
/// Holds the schema version, the next id to assign and the edge count.
pub const SCHEMA_CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS store_metadata (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
)
"#;

/// SQL to create the secondary index catalog
pub const SCHEMA_CREATE_INDEX_CATALOG: &str = r#"
CREATE TABLE IF NOT EXISTS index_catalog (
    name TEXT PRIMARY KEY NOT NULL,
    property_key TEXT NOT NULL
)
"#;

/// Prefix of per-index tables
pub const INDEX_TABLE_PREFIX: &str = "index_";

/// SQL to create the table backing one secondary index
///
/// `value` is the codec encoding of the indexed property value.
pub fn create_index_table_sql(table: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    value BLOB NOT NULL,
    id INTEGER NOT NULL,
    PRIMARY KEY (value, id)
) WITHOUT ROWID
"#
    )
}

/// Metadata keys
pub const META_SCHEMA_VERSION: &str = "schema_version";
pub const META_NEXT_ID: &str = "next_id";
pub const META_EDGE_COUNT: &str = "edge_count";

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();

        conn.execute(SCHEMA_CREATE_NODES, []).unwrap();
        conn.execute(SCHEMA_CREATE_METADATA, []).unwrap();
        conn.execute(SCHEMA_CREATE_INDEX_CATALOG, []).unwrap();
        conn.execute(&create_index_table_sql("index_by_name"), [])
            .unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(
            tables,
            vec![
                "index_by_name".to_string(),
                "index_catalog".to_string(),
                "nodes".to_string(),
                "store_metadata".to_string(),
            ]
        );
    }
}
