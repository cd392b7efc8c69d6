//! Node identity and payload.
//!
//! A [`NodeHandle`] is the permanent, lightweight identity of a node. Its
//! payload (the body) can be detached by the eviction controller and is
//! transparently reloaded from the store on the next access.

pub(crate) mod body;
mod handle;

pub use handle::{Adjacent, NodeHandle};

use crate::schema::EdgeLabelId;
use serde::Serialize;

/// Address of an edge in the adjacency of both endpoints
///
/// Offsets are positions within the (label, direction) range of each
/// endpoint and stay valid for the lifetime of the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EdgeRef {
    pub out_node: i64,
    pub in_node: i64,
    pub label: EdgeLabelId,
    pub out_offset: usize,
    pub in_offset: usize,
}
