//! Diff / Batch Engine
//!
//! A [`DiffBatch`] accumulates node and edge additions and removals without
//! touching the graph. Applying it validates every operation first, then runs
//! node additions, edge additions and removals in that order. Removals are
//! idempotent.

use crate::context::GraphContext;
use crate::error::{GraphError, Result};
use crate::mutation;
use crate::node::{EdgeRef, NodeHandle};
use crate::schema::{Direction, EdgeLabelId, LabelId};
use crate::value::PropertyValue;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::debug;

/// Identity of one batch
///
/// Temp keys hold a strong reference and compare by pointer, so a key can
/// never match a batch other than the one that issued it.
#[derive(Debug, Default)]
struct BatchScope;

/// Placeholder for a node added earlier in the same batch
#[derive(Debug, Clone)]
pub struct TempKey {
    scope: Arc<BatchScope>,
    index: usize,
}

impl TempKey {
    fn issued_by(&self, batch: &DiffBatch) -> bool {
        Arc::ptr_eq(&self.scope, &batch.scope)
    }
}

impl PartialEq for TempKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.scope, &other.scope) && self.index == other.index
    }
}

impl Eq for TempKey {}

impl Hash for TempKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.scope).hash(state);
        self.index.hash(state);
    }
}

impl fmt::Display for TempKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tmp{}@{:p}", self.index, Arc::as_ptr(&self.scope))
    }
}

/// Endpoint of an edge in a batch
#[derive(Debug, Clone, PartialEq)]
pub enum NodeRef {
    /// A node already in the graph
    Existing(NodeHandle),
    /// A node added by this batch
    Pending(TempKey),
}

impl From<NodeHandle> for NodeRef {
    fn from(handle: NodeHandle) -> Self {
        Self::Existing(handle)
    }
}

impl From<&NodeHandle> for NodeRef {
    fn from(handle: &NodeHandle) -> Self {
        Self::Existing(handle.clone())
    }
}

impl From<TempKey> for NodeRef {
    fn from(key: TempKey) -> Self {
        Self::Pending(key)
    }
}

#[derive(Debug, Clone)]
enum Operation {
    AddNode {
        label: String,
        properties: Vec<(String, PropertyValue)>,
    },
    AddEdge {
        out_node: NodeRef,
        in_node: NodeRef,
        label: String,
        properties: Vec<(String, PropertyValue)>,
    },
    RemoveNode(NodeHandle),
    RemoveEdge(EdgeRef),
}

/// Accumulated graph operations
#[derive(Debug, Clone)]
pub struct DiffBatch {
    scope: Arc<BatchScope>,
    operations: Vec<Operation>,
    pending_nodes: usize,
}

impl Default for DiffBatch {
    fn default() -> Self {
        Self::new()
    }
}

fn owned(properties: &[(&str, PropertyValue)]) -> Vec<(String, PropertyValue)> {
    properties
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

impl DiffBatch {
    pub fn new() -> Self {
        Self {
            scope: Arc::new(BatchScope),
            operations: Vec::new(),
            pending_nodes: 0,
        }
    }

    /// Queue a node addition and return a reference usable by later edges
    pub fn add_node(&mut self, label: &str, properties: &[(&str, PropertyValue)]) -> NodeRef {
        let key = TempKey {
            scope: Arc::clone(&self.scope),
            index: self.pending_nodes,
        };
        self.pending_nodes += 1;
        self.operations.push(Operation::AddNode {
            label: label.to_string(),
            properties: owned(properties),
        });
        NodeRef::Pending(key)
    }

    /// Queue an edge addition
    pub fn add_edge(
        &mut self,
        out_node: impl Into<NodeRef>,
        in_node: impl Into<NodeRef>,
        label: &str,
        properties: &[(&str, PropertyValue)],
    ) {
        self.operations.push(Operation::AddEdge {
            out_node: out_node.into(),
            in_node: in_node.into(),
            label: label.to_string(),
            properties: owned(properties),
        });
    }

    /// Queue a node removal
    pub fn remove_node(&mut self, handle: &NodeHandle) {
        self.operations.push(Operation::RemoveNode(handle.clone()));
    }

    /// Queue an edge removal
    pub fn remove_edge(&mut self, edge: EdgeRef) {
        self.operations.push(Operation::RemoveEdge(edge));
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Outcome of applying a batch
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Created handles, in declaration order
    pub nodes: Vec<NodeHandle>,
    /// Created edges, in declaration order
    pub edges: Vec<EdgeRef>,
    /// Nodes actually removed
    pub nodes_removed: usize,
    /// Edges actually removed, including those incident to removed nodes
    pub edges_removed: usize,
}

// ============================================================================
// Validation
// ============================================================================

/// Endpoint after validation
enum Endpoint {
    Existing(NodeHandle),
    Pending(usize),
}

enum Step {
    AddNode {
        label: LabelId,
        properties: Vec<Option<PropertyValue>>,
    },
    AddEdge {
        out_node: Endpoint,
        in_node: Endpoint,
        label: EdgeLabelId,
        properties: Vec<Option<PropertyValue>>,
    },
    RemoveNode(NodeHandle),
    RemoveEdge(EdgeRef),
}

fn resolve(
    ctx: &GraphContext,
    batch: &DiffBatch,
    node: &NodeRef,
    pending_labels: &[LabelId],
) -> Result<(Endpoint, LabelId)> {
    match node {
        NodeRef::Existing(handle) => {
            mutation::ensure_live(ctx, handle)?;
            Ok((Endpoint::Existing(handle.clone()), handle.label()))
        }
        NodeRef::Pending(key) => match pending_labels.get(key.index) {
            Some(label) if key.issued_by(batch) => Ok((Endpoint::Pending(key.index), *label)),
            _ => Err(GraphError::UnknownTempKey(key.to_string())),
        },
    }
}

/// Check every operation against the schema without touching the graph
fn validate(ctx: &GraphContext, batch: &DiffBatch) -> Result<Vec<Step>> {
    let mut pending_labels = Vec::with_capacity(batch.pending_nodes);
    let mut steps = Vec::with_capacity(batch.operations.len());

    for operation in &batch.operations {
        let step = match operation {
            Operation::AddNode { label, properties } => {
                let layout = ctx.schema.node_label(label)?;
                let properties = layout.bind(properties)?;
                pending_labels.push(layout.id());
                Step::AddNode {
                    label: layout.id(),
                    properties,
                }
            }
            Operation::AddEdge {
                out_node,
                in_node,
                label,
                properties,
            } => {
                let edge = ctx.schema.edge_layout(label)?;
                let (out_node, out_label) = resolve(ctx, batch, out_node, &pending_labels)?;
                let (in_node, in_label) = resolve(ctx, batch, in_node, &pending_labels)?;
                ctx.schema.check_endpoint(out_label, edge.id(), Direction::Out)?;
                ctx.schema.check_endpoint(in_label, edge.id(), Direction::In)?;
                Step::AddEdge {
                    out_node,
                    in_node,
                    label: edge.id(),
                    properties: edge.bind(properties)?,
                }
            }
            Operation::RemoveNode(handle) => Step::RemoveNode(handle.clone()),
            Operation::RemoveEdge(edge) => Step::RemoveEdge(*edge),
        };
        steps.push(step);
    }
    Ok(steps)
}

// ============================================================================
// Apply
// ============================================================================

/// Validate and apply a batch. The caller holds `ctx.mutation`.
pub(crate) fn apply(ctx: &Arc<GraphContext>, batch: DiffBatch) -> Result<ApplyReport> {
    let steps = validate(ctx, &batch)?;
    let mut report = ApplyReport::default();

    for step in &steps {
        if let Step::AddNode { label, properties } = step {
            let layout = ctx.schema.layout(*label)?;
            let handle = mutation::insert_node(ctx, layout, properties.clone())?;
            report.nodes.push(handle);
        }
    }

    for step in &steps {
        if let Step::AddEdge {
            out_node,
            in_node,
            label,
            properties,
        } = step
        {
            let out_node = endpoint(out_node, &report.nodes)?;
            let in_node = endpoint(in_node, &report.nodes)?;
            let edge = mutation::insert_edge(ctx, out_node, in_node, *label, properties.clone())?;
            report.edges.push(edge);
        }
    }

    for step in &steps {
        match step {
            Step::RemoveEdge(edge) => {
                if mutation::delete_edge(ctx, edge)? {
                    report.edges_removed += 1;
                }
            }
            Step::RemoveNode(handle) => {
                if let Some(edges) = mutation::delete_node(ctx, handle)? {
                    report.nodes_removed += 1;
                    report.edges_removed += edges;
                }
            }
            Step::AddNode { .. } | Step::AddEdge { .. } => {}
        }
    }

    debug!(
        "Applied batch of {} operations: +{} nodes, +{} edges, -{} nodes, -{} edges",
        steps.len(),
        report.nodes.len(),
        report.edges.len(),
        report.nodes_removed,
        report.edges_removed
    );
    Ok(report)
}

fn endpoint<'a>(endpoint: &'a Endpoint, created: &'a [NodeHandle]) -> Result<&'a NodeHandle> {
    match endpoint {
        Endpoint::Existing(handle) => Ok(handle),
        Endpoint::Pending(index) => created
            .get(*index)
            .ok_or_else(|| GraphError::UnknownTempKey(format!("#{index}"))),
    }
}
