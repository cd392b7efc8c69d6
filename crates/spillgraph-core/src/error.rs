//! Error types for graph operations.

use crate::schema::Direction;
use crate::storage::StoreError;
use spillgraph_config::ConfigError;
use thiserror::Error;

/// Errors that can occur during graph operations
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Corrupt record for node {id}: {reason}")]
    CorruptRecord { id: i64, reason: String },

    #[error("Node {0} has a handle but no resident body and no stored record")]
    MissingBody(i64),

    #[error("Duplicate node id: {0}")]
    DuplicateId(i64),

    #[error("Unsupported value for property '{key}': {reason}")]
    UnsupportedPropertyType { key: String, reason: String },

    #[error("Unknown node label: {0}")]
    UnknownLabel(String),

    #[error("Unknown property '{key}' for label '{label}'")]
    UnknownPropertyKey { label: String, key: String },

    #[error("Unknown edge label: {0}")]
    UnknownEdgeLabel(String),

    #[error("Edge label '{edge_label}' is not declared as {direction} for label '{label}'")]
    EdgeLabelNotAllowed {
        label: String,
        edge_label: String,
        direction: Direction,
    },

    #[error("Node {0} has been removed")]
    NodeRemoved(i64),

    #[error("Temporary key {0} does not name a node added in this batch")]
    UnknownTempKey(String),

    #[error("Unknown index: {0}")]
    UnknownIndex(String),

    #[error("Index already exists: {0}")]
    IndexExists(String),

    #[error("Graph has been closed")]
    GraphClosed,

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl GraphError {
    /// Create a CorruptRecord error.
    pub fn corrupt(id: i64, reason: impl Into<String>) -> Self {
        Self::CorruptRecord {
            id,
            reason: reason.into(),
        }
    }

    /// Create an UnsupportedPropertyType error.
    pub fn unsupported(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedPropertyType {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for GraphError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidLocation { .. } => Self::Configuration(err.to_string()),
            other => Self::Store(other),
        }
    }
}

impl From<ConfigError> for GraphError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_invalid_location_maps_to_configuration() {
        let err: GraphError = StoreError::InvalidLocation {
            path: PathBuf::from("/tmp"),
            reason: "is a directory".to_string(),
        }
        .into();
        assert!(matches!(err, GraphError::Configuration(_)));
        assert!(err.to_string().contains("is a directory"));
    }

    #[test]
    fn test_store_error_wrapped() {
        let err: GraphError = StoreError::Closed.into();
        assert!(matches!(err, GraphError::Store(StoreError::Closed)));
    }

    #[test]
    fn test_corrupt_display() {
        let err = GraphError::corrupt(42, "varint truncated");
        assert_eq!(
            err.to_string(),
            "Corrupt record for node 42: varint truncated"
        );
    }
}
