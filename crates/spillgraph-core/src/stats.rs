//! Graph statistics and verification reports.

use crate::eviction::EvictionMetrics;
use serde::Serialize;
use std::collections::BTreeMap;

/// Persist counters, present when serialization stats are enabled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SerializationStats {
    /// Bodies encoded and written to the store
    pub persist_calls: u64,
    /// Total encoded bytes written
    pub bytes_written: u64,
}

/// Snapshot of an open graph
#[derive(Debug, Clone, Serialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: u64,
    /// Live nodes per label name
    pub nodes_by_label: BTreeMap<String, usize>,
    /// Estimated bytes of resident bodies
    pub resident_bytes: usize,
    /// Registry slot array size, including cleared slots
    pub registry_slots: usize,
    pub registry_compactions: u64,
    pub interned_strings: usize,
    /// Secondary index names
    pub indices: Vec<String>,
    pub overflow_enabled: bool,
    pub eviction_policy: String,
    pub eviction: EvictionMetrics,
    pub serialization: Option<SerializationStats>,
    pub ephemeral: bool,
}

/// Result of decoding every stored record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Records decoded
    pub records: usize,
    /// `(id, reason)` of every record that failed to decode or disagrees
    /// with its handle
    pub corrupt: Vec<(i64, String)>,
    /// Registered nodes with neither a resident body nor a stored record
    pub missing: Vec<i64>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.corrupt.is_empty() && self.missing.is_empty()
    }
}
