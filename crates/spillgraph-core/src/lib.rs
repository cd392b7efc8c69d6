//! SpillGraph Core - Property-graph storage with node payload overflow
//!
//! This crate provides:
//! - Node handles with detachable bodies, reloaded from the store on demand
//! - A compact binary codec for node bodies
//! - A SQLite-backed record store with persisted secondary indices
//! - A node registry indexed by id and by label
//! - An eviction controller driven by a pluggable memory probe
//! - A diff/batch engine for bulk adds and removals

pub mod codec;
mod context;
pub mod diff;
pub mod error;
pub mod eviction;
pub mod graph;
mod index;
mod mutation;
pub mod node;
pub mod registry;
pub mod schema;
pub mod stats;
pub mod storage;
pub mod value;

// Graph re-exports
pub use graph::{Graph, NodeIter};
pub use node::{Adjacent, EdgeRef, NodeHandle};

// Batch re-exports
pub use diff::{ApplyReport, DiffBatch, NodeRef, TempKey};

// Schema and value re-exports
pub use schema::{
    Direction, EdgeLabelDef, EdgeLabelId, LabelId, NodeLabelDef, PropertyDef, Schema, SchemaDef,
};
pub use value::{PropertyValue, ValueKind};

// Error re-exports
pub use error::{GraphError, Result};
pub use storage::StoreError;

// Observability re-exports
pub use eviction::{EvictionMetrics, MemoryProbe, PoolProbe};
pub use stats::{GraphStats, SerializationStats, VerifyReport};

// Configuration re-exports
pub use spillgraph_config::{ConfigOverrides, EvictionPolicyKind, SpillConfig};
