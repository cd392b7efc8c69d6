//! Common test utilities for integration tests.
//!
//! Provides the song/artist schema and configurations shared across
//! integration test files.

#![allow(dead_code)]

use std::path::Path;

use spillgraph_core::{
    EdgeLabelDef, EvictionPolicyKind, Graph, NodeHandle, NodeLabelDef, PropertyValue, Schema,
    SchemaDef, SpillConfig, ValueKind,
};

/// Songs follow each other; artists perform songs.
pub fn song_schema() -> Schema {
    Schema::new(
        SchemaDef::new()
            .edge_label(EdgeLabelDef::new("FollowedBy").property("weight", ValueKind::Int))
            .edge_label(EdgeLabelDef::new("Performed").property("year", ValueKind::Short))
            .node_label(
                NodeLabelDef::new("Song")
                    .property("name", ValueKind::String)
                    .property("plays", ValueKind::Long)
                    .property("tags", ValueKind::List)
                    .out_edge("FollowedBy")
                    .in_edge("FollowedBy")
                    .in_edge("Performed"),
            )
            .node_label(
                NodeLabelDef::new("Artist")
                    .property("name", ValueKind::String)
                    .out_edge("Performed"),
            ),
    )
    .expect("valid schema")
}

/// Configuration whose monitor never fires during a test
fn quiet(mut config: SpillConfig) -> SpillConfig {
    config.overflow.monitor_interval_ms = 60_000;
    config
}

pub fn ephemeral_config() -> SpillConfig {
    quiet(SpillConfig::ephemeral())
}

pub fn durable_config(location: &Path) -> SpillConfig {
    quiet(SpillConfig::durable(location))
}

pub fn policy_config(policy: EvictionPolicyKind) -> SpillConfig {
    let mut config = ephemeral_config();
    config.overflow.policy = policy;
    config
}

pub fn open_ephemeral() -> Graph {
    Graph::open(song_schema(), &ephemeral_config()).expect("open ephemeral graph")
}

pub fn open_durable(location: &Path) -> Graph {
    Graph::open(song_schema(), &durable_config(location)).expect("open durable graph")
}

pub fn add_song(graph: &Graph, name: &str) -> NodeHandle {
    graph
        .add_node("Song", &[("name", name.into())])
        .expect("add song")
}

pub fn name_of(node: &NodeHandle) -> Option<String> {
    node.property("name")
        .expect("read name")
        .and_then(|v| v.as_str().map(str::to_string))
}

pub fn weight(value: i32) -> (&'static str, PropertyValue) {
    ("weight", PropertyValue::Int(value))
}
