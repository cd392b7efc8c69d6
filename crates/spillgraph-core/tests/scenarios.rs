//! Graph mutation scenarios
//!
//! These tests exercise node and edge mutation through the graph facade and
//! the diff engine:
//! - Transparent reload after eviction
//! - Batch application with temp keys
//! - Idempotent node and edge removal
//! - Schema validation of nodes, edges and batches
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --package spillgraph-core --test scenarios
//! ```

mod common;

use pretty_assertions::assert_eq;

use common::{add_song, name_of, open_ephemeral, weight};
use spillgraph_core::{Direction, DiffBatch, GraphError, PropertyValue};

// ============================================================================
// Basic scenarios
// ============================================================================

#[test]
fn test_evicted_node_reads_back() {
    let graph = open_ephemeral();
    let a = add_song(&graph, "A");
    let b = add_song(&graph, "B");
    graph.add_edge(&a, &b, "FollowedBy", &[weight(5)]).unwrap();

    assert!(graph.evict(&a).unwrap());
    assert!(!a.is_resident());

    assert_eq!(name_of(&a).as_deref(), Some("A"));
    assert!(a.is_resident());
    assert_eq!(graph.node_count(), 2);
    assert_eq!(graph.edge_count(), 1);
    assert_eq!(graph.stats().eviction.reloads, 1);

    let out = a.adjacent("FollowedBy", Direction::Out).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].neighbor, b.id());
    assert_eq!(
        out[0].properties,
        vec![("weight".to_string(), PropertyValue::Int(5))]
    );
}

#[test]
fn test_batch_with_temp_keys() {
    let graph = open_ephemeral();

    let mut batch = DiffBatch::new();
    let first = batch.add_node("Song", &[]);
    let second = batch.add_node("Song", &[]);
    batch.add_edge(first, second, "FollowedBy", &[]);

    let report = graph.apply(batch).unwrap();
    assert_eq!(graph.node_count(), 2);
    assert_eq!(graph.edge_count(), 1);
    assert_eq!(report.nodes.len(), 2);
    assert_eq!(report.edges.len(), 1);

    let (n1, n2) = (&report.nodes[0], &report.nodes[1]);
    let out = n1.adjacent("FollowedBy", Direction::Out).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].neighbor, n2.id());
    assert!(n2.adjacent("FollowedBy", Direction::Out).unwrap().is_empty());
    assert_eq!(n2.in_degree().unwrap(), 1);
    assert_eq!(report.edges[0].out_node, n1.id());
    assert_eq!(report.edges[0].in_node, n2.id());
}

#[test]
fn test_batch_removing_node_twice() {
    let graph = open_ephemeral();
    let a = add_song(&graph, "A");
    let b = add_song(&graph, "B");

    let mut batch = DiffBatch::new();
    batch.remove_node(&a);
    batch.remove_node(&a);
    let report = graph.apply(batch).unwrap();

    assert_eq!(report.nodes_removed, 1);
    assert!(graph.node(a.id()).is_none());
    assert!(a.is_removed());
    assert_eq!(graph.node_count(), 1);
    assert_eq!(graph.node(b.id()), Some(b));

    // Removing an already-removed node in a later batch is also a no-op
    let mut again = DiffBatch::new();
    again.remove_node(&a);
    assert_eq!(graph.apply(again).unwrap().nodes_removed, 0);
}

// ============================================================================
// Removal
// ============================================================================

#[test]
fn test_remove_node_twice() {
    let graph = open_ephemeral();
    let a = add_song(&graph, "A");

    assert!(graph.remove_node(&a).unwrap());
    assert!(!graph.remove_node(&a).unwrap());
    assert_eq!(graph.node_count(), 0);
    assert!(matches!(a.property("name"), Err(GraphError::NodeRemoved(_))));
}

#[test]
fn test_remove_parallel_edge_twice() {
    let graph = open_ephemeral();
    let a = add_song(&graph, "A");
    let b = add_song(&graph, "B");
    let first = graph.add_edge(&a, &b, "FollowedBy", &[weight(1)]).unwrap();
    let second = graph.add_edge(&a, &b, "FollowedBy", &[weight(2)]).unwrap();
    assert_ne!(first, second);
    assert_eq!(graph.edge_count(), 2);

    assert!(graph.remove_edge(&first).unwrap());
    assert!(!graph.remove_edge(&first).unwrap());
    assert_eq!(graph.edge_count(), 1);

    let out = a.adjacent("FollowedBy", Direction::Out).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].edge, second);
    let incoming = b.adjacent("FollowedBy", Direction::In).unwrap();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].edge, second);
}

#[test]
fn test_edge_offsets_stable_after_removal() {
    let graph = open_ephemeral();
    let a = add_song(&graph, "A");
    let b = add_song(&graph, "B");
    let c = add_song(&graph, "C");
    let ab = graph.add_edge(&a, &b, "FollowedBy", &[]).unwrap();
    let ac = graph.add_edge(&a, &c, "FollowedBy", &[]).unwrap();

    graph.remove_edge(&ab).unwrap();
    graph.evict_all().unwrap();

    // The surviving edge keeps its address across eviction
    assert!(graph.remove_edge(&ac).unwrap());
    assert_eq!(graph.edge_count(), 0);
    assert_eq!(a.out_degree().unwrap(), 0);
    assert_eq!(c.in_degree().unwrap(), 0);
}

#[test]
fn test_remove_node_removes_incident_edges() {
    let graph = open_ephemeral();
    let a = add_song(&graph, "A");
    let b = add_song(&graph, "B");
    let c = add_song(&graph, "C");
    graph.add_edge(&a, &b, "FollowedBy", &[]).unwrap();
    graph.add_edge(&c, &a, "FollowedBy", &[]).unwrap();
    graph.add_edge(&b, &c, "FollowedBy", &[]).unwrap();
    graph.evict(&b).unwrap();

    assert!(graph.remove_node(&a).unwrap());
    assert_eq!(graph.edge_count(), 1);
    assert_eq!(b.in_degree().unwrap(), 0);
    assert_eq!(c.out_degree().unwrap(), 0);
    assert_eq!(b.out_degree().unwrap(), 1);
}

#[test]
fn test_self_loop_counts_once() {
    let graph = open_ephemeral();
    let a = add_song(&graph, "A");
    let edge = graph.add_edge(&a, &a, "FollowedBy", &[]).unwrap();
    assert_eq!(graph.edge_count(), 1);
    assert_eq!(a.out_degree().unwrap(), 1);
    assert_eq!(a.in_degree().unwrap(), 1);

    let incoming = a.adjacent("FollowedBy", Direction::In).unwrap();
    assert_eq!(incoming[0].edge, edge);

    graph.remove_node(&a).unwrap();
    assert_eq!(graph.edge_count(), 0);
}

#[test]
fn test_batch_removals_run_after_additions() {
    let graph = open_ephemeral();
    let a = add_song(&graph, "A");
    let b = add_song(&graph, "B");
    let ab = graph.add_edge(&a, &b, "FollowedBy", &[]).unwrap();

    let mut batch = DiffBatch::new();
    batch.remove_edge(ab);
    batch.remove_edge(ab);
    let c = batch.add_node("Song", &[("name", "C".into())]);
    batch.add_edge(&b, c, "FollowedBy", &[weight(3)]);
    batch.remove_node(&a);

    let report = graph.apply(batch).unwrap();
    assert_eq!(report.nodes.len(), 1);
    assert_eq!(report.nodes_removed, 1);
    assert_eq!(report.edges_removed, 1);
    assert_eq!(graph.node_count(), 2);
    assert_eq!(graph.edge_count(), 1);
    assert_eq!(name_of(&report.nodes[0]).as_deref(), Some("C"));
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn test_invalid_batch_leaves_graph_untouched() {
    let graph = open_ephemeral();
    let a = add_song(&graph, "A");

    let mut batch = DiffBatch::new();
    let b = batch.add_node("Song", &[("name", "B".into())]);
    batch.add_edge(&a, b, "FollowedBy", &[]);
    batch.remove_node(&a);
    batch.add_node("Album", &[]);

    assert!(matches!(
        graph.apply(batch),
        Err(GraphError::UnknownLabel(_))
    ));
    assert_eq!(graph.node_count(), 1);
    assert_eq!(graph.edge_count(), 0);
    assert!(!a.is_removed());
}

#[test]
fn test_temp_key_from_other_batch_rejected() {
    let graph = open_ephemeral();

    let mut other = DiffBatch::new();
    let foreign = other.add_node("Song", &[]);

    let mut batch = DiffBatch::new();
    let own = batch.add_node("Song", &[]);
    batch.add_edge(own, foreign, "FollowedBy", &[]);

    assert!(matches!(
        graph.apply(batch),
        Err(GraphError::UnknownTempKey(_))
    ));
    assert_eq!(graph.node_count(), 0);
}

#[test]
fn test_edge_direction_checked_against_schema() {
    let graph = open_ephemeral();
    let song = add_song(&graph, "A");
    let artist = graph
        .add_node("Artist", &[("name", "X".into())])
        .unwrap();

    let performed = graph
        .add_edge(&artist, &song, "Performed", &[("year", PropertyValue::Short(1999))])
        .unwrap();
    assert_eq!(performed.out_node, artist.id());

    assert!(matches!(
        graph.add_edge(&song, &artist, "Performed", &[]),
        Err(GraphError::EdgeLabelNotAllowed { .. })
    ));
    assert!(matches!(
        artist.adjacent("FollowedBy", Direction::Out),
        Err(GraphError::EdgeLabelNotAllowed { .. })
    ));
    assert!(matches!(
        graph.add_edge(&song, &song, "Covers", &[]),
        Err(GraphError::UnknownEdgeLabel(_))
    ));
    assert_eq!(graph.edge_count(), 1);
}

#[test]
fn test_property_kinds_enforced() {
    let graph = open_ephemeral();
    let a = add_song(&graph, "A");

    assert!(matches!(
        a.set_property("name", 5),
        Err(GraphError::UnsupportedPropertyType { .. })
    ));
    assert!(matches!(
        a.set_property("lyrics", "la"),
        Err(GraphError::UnknownPropertyKey { .. })
    ));
    assert!(matches!(
        a.set_property(
            "tags",
            vec![PropertyValue::List(vec![PropertyValue::Int(1)])]
        ),
        Err(GraphError::UnsupportedPropertyType { .. })
    ));
    assert!(matches!(
        graph.add_node("Song", &[("plays", "many".into())]),
        Err(GraphError::UnsupportedPropertyType { .. })
    ));

    let old = a
        .set_property("tags", vec![PropertyValue::from("rock"), PropertyValue::Int(1)])
        .unwrap();
    assert_eq!(old, None);
    assert_eq!(a.set_property("plays", 10i64).unwrap(), None);
    assert_eq!(
        a.remove_property("plays").unwrap(),
        Some(PropertyValue::Long(10))
    );
    assert_eq!(
        a.properties().unwrap(),
        vec![
            ("name".to_string(), PropertyValue::from("A")),
            (
                "tags".to_string(),
                PropertyValue::List(vec![PropertyValue::from("rock"), PropertyValue::Int(1)])
            ),
        ]
    );
}

// ============================================================================
// Enumeration
// ============================================================================

#[test]
fn test_nodes_iteration_is_restartable() {
    let graph = open_ephemeral();
    let handles: Vec<_> = (0..600)
        .map(|i| add_song(&graph, &format!("song-{i}")))
        .collect();
    for handle in handles.iter().step_by(3) {
        graph.remove_node(handle).unwrap();
    }

    let first: Vec<i64> = graph.nodes().map(|h| h.id()).collect();
    let second: Vec<i64> = graph.nodes().map(|h| h.id()).collect();
    assert_eq!(first.len(), 400);
    assert_eq!(first, second);
    assert!(first.windows(2).all(|w| w[0] < w[1]));

    graph.compact_registry();
    let after: Vec<i64> = graph.nodes().map(|h| h.id()).collect();
    assert_eq!(first, after);
}

#[test]
fn test_nodes_by_label() {
    let graph = open_ephemeral();
    let a = add_song(&graph, "A");
    let artist = graph.add_node("Artist", &[]).unwrap();
    let b = add_song(&graph, "B");

    assert_eq!(graph.nodes_by_label("Song").unwrap(), vec![a, b]);
    assert_eq!(graph.nodes_by_label("Artist").unwrap(), vec![artist]);
    assert!(graph.nodes_by_label("Album").is_err());

    let stats = graph.stats();
    assert_eq!(stats.nodes_by_label.get("Song"), Some(&2));
    assert_eq!(stats.nodes_by_label.get("Artist"), Some(&1));
}

#[test]
fn test_closed_graph_rejects_handles() {
    let graph = open_ephemeral();
    let a = add_song(&graph, "A");
    graph.close().unwrap();
    graph.close().unwrap();

    assert!(matches!(a.property("name"), Err(GraphError::GraphClosed)));
    assert!(matches!(
        graph.add_node("Song", &[]),
        Err(GraphError::GraphClosed)
    ));
}

// ============================================================================
// Secondary indices
// ============================================================================

#[test]
fn test_index_follows_property_writes() {
    let graph = open_ephemeral();
    let a = add_song(&graph, "Intro");
    let b = add_song(&graph, "Outro");
    let artist = graph
        .add_node("Artist", &[("name", "Intro".into())])
        .unwrap();

    assert_eq!(graph.create_index("by_name", "name").unwrap(), 3);
    assert_eq!(
        graph.lookup("by_name", "Intro").unwrap(),
        vec![a.clone(), artist.clone()]
    );

    b.set_property("name", "Intro").unwrap();
    a.remove_property("name").unwrap();
    assert_eq!(
        graph.lookup("by_name", "Intro").unwrap(),
        vec![b.clone(), artist.clone()]
    );
    assert!(graph.lookup("by_name", "Outro").unwrap().is_empty());

    graph.remove_node(&artist).unwrap();
    assert_eq!(graph.lookup("by_name", "Intro").unwrap(), vec![b]);

    let mut batch = DiffBatch::new();
    batch.add_node("Song", &[("name", "Intro".into())]);
    let report = graph.apply(batch).unwrap();
    assert_eq!(graph.lookup("by_name", "Intro").unwrap().len(), 2);
    assert!(graph.lookup("by_name", "Intro").unwrap().contains(&report.nodes[0]));
}

#[test]
fn test_index_errors() {
    let graph = open_ephemeral();
    add_song(&graph, "A");

    graph.create_index("plays", "plays").unwrap();
    assert!(matches!(
        graph.create_index("plays", "plays"),
        Err(GraphError::IndexExists(_))
    ));
    assert!(matches!(
        graph.create_index("lyrics", "lyrics"),
        Err(GraphError::UnknownPropertyKey { .. })
    ));
    assert!(matches!(
        graph.lookup("missing", 1i64),
        Err(GraphError::UnknownIndex(_))
    ));

    assert!(graph.drop_index("plays").unwrap());
    assert!(!graph.drop_index("plays").unwrap());
    assert!(graph.indices().is_empty());
}
