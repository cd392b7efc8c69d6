//! Structural mutations shared by the graph facade and the diff engine.
//!
//! Every function here expects the caller to hold `ctx.mutation`: mirror
//! offsets are read from range lengths before the append, so two structural
//! writers must never interleave.

use crate::context::GraphContext;
use crate::error::{GraphError, Result};
use crate::node::body::Body;
use crate::node::{EdgeRef, NodeHandle};
use crate::schema::{Direction, EdgeLabelId, NodeLayout, PropertyDef};
use crate::value::PropertyValue;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{trace, warn};

/// Pair bound slot values with their property names, skipping unset slots
pub(crate) fn named(
    defs: &[PropertyDef],
    values: &[Option<PropertyValue>],
) -> Vec<(String, PropertyValue)> {
    defs.iter()
        .zip(values)
        .filter_map(|(def, value)| value.clone().map(|v| (def.name.clone(), v)))
        .collect()
}

/// Fail unless the handle names a live node of this graph
pub(crate) fn ensure_live(ctx: &GraphContext, handle: &NodeHandle) -> Result<()> {
    if handle.is_removed() || !ctx.registry.read().contains(handle.id()) {
        return Err(GraphError::NodeRemoved(handle.id()));
    }
    Ok(())
}

/// Create and register a node from already-validated slot values
pub(crate) fn insert_node(
    ctx: &Arc<GraphContext>,
    layout: &NodeLayout,
    properties: Vec<Option<PropertyValue>>,
) -> Result<NodeHandle> {
    let id = ctx.allocate_id();
    let indexed = named(layout.properties(), &properties);
    let body = Body::new(id, layout, properties);
    let handle = NodeHandle::resident(body, ctx);

    if let Err(e) = ctx.registry.write().add(handle.clone()) {
        handle.mark_removed(ctx);
        return Err(e);
    }
    if let Err(e) = ctx.indices.on_insert(id, &indexed) {
        // Entries added before the failure are dropped with the node
        handle.mark_removed(ctx);
        ctx.registry.write().remove(&handle);
        if let Err(undo) = ctx.indices.on_remove(id, &indexed) {
            warn!("Failed to unindex node {}: {}", id, undo);
        }
        return Err(e);
    }
    trace!("Added node {} ({})", id, layout.name());
    Ok(handle)
}

/// Adjacency range of a node for an edge label and direction
fn range_of(
    ctx: &GraphContext,
    handle: &NodeHandle,
    edge_label: EdgeLabelId,
    direction: Direction,
) -> Result<usize> {
    ctx.schema.check_endpoint(handle.label(), edge_label, direction)
}

/// Append an edge to both endpoints. Properties must already be bound.
pub(crate) fn insert_edge(
    ctx: &GraphContext,
    out_node: &NodeHandle,
    in_node: &NodeHandle,
    edge_label: EdgeLabelId,
    properties: Vec<Option<PropertyValue>>,
) -> Result<EdgeRef> {
    let out_range = range_of(ctx, out_node, edge_label, Direction::Out)?;
    let in_range = range_of(ctx, in_node, edge_label, Direction::In)?;

    // Materializes both ends before either side is touched
    let out_offset =
        out_node.with_body(|body, _| Ok(body.adjacency.ranges()[out_range].len()))?;
    let in_offset = in_node.with_body(|body, _| Ok(body.adjacency.ranges()[in_range].len()))?;

    let in_id = in_node.id();
    let out_properties = properties.clone();
    out_node.with_body_mut(|body, _| {
        body.adjacency.append(out_range, in_id, in_offset, out_properties);
        body.dirty = true;
        Ok(())
    })?;

    let out_id = out_node.id();
    in_node.with_body_mut(|body, _| {
        body.adjacency.append(in_range, out_id, out_offset, properties);
        body.dirty = true;
        Ok(())
    })?;

    ctx.edge_count.fetch_add(1, Ordering::SeqCst);
    Ok(EdgeRef {
        out_node: out_id,
        in_node: in_id,
        label: edge_label,
        out_offset,
        in_offset,
    })
}

/// Tombstone an edge on both endpoints. Returns false if it was already gone.
pub(crate) fn delete_edge(ctx: &GraphContext, edge: &EdgeRef) -> Result<bool> {
    let (out_node, in_node) = {
        let registry = ctx.registry.read();
        (registry.get(edge.out_node), registry.get(edge.in_node))
    };
    let (Some(out_node), Some(in_node)) = (out_node, in_node) else {
        return Ok(false);
    };
    let Ok(out_range) = range_of(ctx, &out_node, edge.label, Direction::Out) else {
        return Ok(false);
    };
    let Ok(in_range) = range_of(ctx, &in_node, edge.label, Direction::In) else {
        return Ok(false);
    };

    let removed = out_node.with_body_mut(|body, _| {
        let removed =
            body.adjacency
                .tombstone(out_range, edge.out_offset, edge.in_node, edge.in_offset);
        body.dirty |= removed;
        Ok(removed)
    })?;
    if !removed {
        return Ok(false);
    }

    in_node.with_body_mut(|body, _| {
        let removed =
            body.adjacency
                .tombstone(in_range, edge.in_offset, edge.out_node, edge.out_offset);
        body.dirty |= removed;
        Ok(())
    })?;

    ctx.edge_count.fetch_sub(1, Ordering::SeqCst);
    Ok(true)
}

/// Live incident entries of one range: (edge label, direction, neighbor, offset, mirror)
type Incident = (EdgeLabelId, Direction, i64, usize, usize);

/// Remove a node and every edge incident to it
///
/// Returns the number of edges removed, or `None` if the node was already
/// gone.
pub(crate) fn delete_node(ctx: &GraphContext, handle: &NodeHandle) -> Result<Option<usize>> {
    if handle.is_removed() || !ctx.registry.read().contains(handle.id()) {
        return Ok(None);
    }
    let id = handle.id();

    let (incident, properties) = handle.with_body(|body, ctx| {
        let mut incident: Vec<Incident> = Vec::new();
        for (i, range) in body.adjacency.ranges().iter().enumerate() {
            incident.extend(
                body.adjacency
                    .live_neighbors(i)
                    .map(|(n, offset, mirror)| (range.edge_label, range.direction, n, offset, mirror)),
            );
        }
        let layout = ctx.schema.layout(body.label)?;
        Ok((incident, named(layout.properties(), &body.properties)))
    })?;

    // A self-loop shows up in both ranges of this node but is one edge
    let removed_edges = incident
        .iter()
        .filter(|(_, direction, neighbor, _, _)| *direction == Direction::Out || *neighbor != id)
        .count();

    for &(edge_label, direction, neighbor, offset, mirror) in &incident {
        if neighbor == id {
            continue;
        }
        let Some(other) = ctx.registry.read().get(neighbor) else {
            continue;
        };
        let range = range_of(ctx, &other, edge_label, direction.opposite())?;
        other.with_body_mut(|body, _| {
            let removed = body.adjacency.tombstone(range, mirror, id, offset);
            body.dirty |= removed;
            Ok(())
        })?;
    }

    // Detach first so a concurrent eviction cannot write the record back
    handle.mark_removed(ctx);
    ctx.registry.write().remove(handle);
    ctx.edge_count.fetch_sub(removed_edges as u64, Ordering::SeqCst);
    ctx.store.remove(id)?;
    ctx.indices.on_remove(id, &properties)?;

    trace!("Removed node {} with {} edges", id, removed_edges);
    Ok(Some(removed_edges))
}
