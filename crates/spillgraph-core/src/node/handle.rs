//! Node handles and body materialization.
//!
//! The link from a handle to its body is guarded by a `parking_lot::RwLock`.
//! Readers share it; the first reader that finds the body detached takes an
//! upgradable lock and reloads it (double-checked), so concurrent readers
//! never decode the same record twice. Mutations and eviction take the lock
//! exclusively, which keeps eviction from observing a half-applied mutation.

use crate::context::GraphContext;
use crate::error::{GraphError, Result};
use crate::node::body::{AdjSlot, Body};
use crate::node::EdgeRef;
use crate::schema::{Direction, LabelId};
use crate::value::PropertyValue;
use parking_lot::{RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Link from a handle to its payload
pub(crate) enum BodyLink {
    Resident {
        body: Box<Body>,
        /// Bytes charged to the resident total for this body
        charged: usize,
    },
    Detached,
}

struct HandleInner {
    id: i64,
    label: LabelId,
    link: RwLock<BodyLink>,
    removed: AtomicBool,
    ctx: Weak<GraphContext>,
}

/// Permanent identity of a node
///
/// Cheap to clone. Two handles are equal if their ids are equal.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<HandleInner>,
}

/// One live entry of a node's adjacency
#[derive(Debug, Clone, PartialEq)]
pub struct Adjacent {
    /// Id of the node at the other end
    pub neighbor: i64,
    /// Address of the edge
    pub edge: EdgeRef,
    /// Edge properties that are set, in schema order
    pub properties: Vec<(String, PropertyValue)>,
}

impl NodeHandle {
    /// Handle for a freshly created body, charged to the resident total
    pub(crate) fn resident(body: Body, ctx: &Arc<GraphContext>) -> Self {
        let charged = body.estimated_size();
        ctx.charge(charged);
        let handle = Self {
            inner: Arc::new(HandleInner {
                id: body.id,
                label: body.label,
                link: RwLock::new(BodyLink::Resident {
                    body: Box::new(body),
                    charged,
                }),
                removed: AtomicBool::new(false),
                ctx: Arc::downgrade(ctx),
            }),
        };
        ctx.eviction.admit(&handle);
        handle
    }

    /// Handle whose body lives only in the store
    pub(crate) fn detached(id: i64, label: LabelId, ctx: Weak<GraphContext>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                label,
                link: RwLock::new(BodyLink::Detached),
                removed: AtomicBool::new(false),
                ctx,
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn unbound(id: i64, label: LabelId) -> Self {
        Self::detached(id, label, Weak::new())
    }

    pub fn id(&self) -> i64 {
        self.inner.id
    }

    pub fn label(&self) -> LabelId {
        self.inner.label
    }

    /// Whether the node has been removed from its graph
    pub fn is_removed(&self) -> bool {
        self.inner.removed.load(Ordering::Acquire)
    }

    /// Whether the body is currently attached
    pub fn is_resident(&self) -> bool {
        matches!(*self.inner.link.read(), BodyLink::Resident { .. })
    }

    fn context(&self) -> Result<Arc<GraphContext>> {
        self.inner
            .ctx
            .upgrade()
            .filter(|ctx| !ctx.is_closed())
            .ok_or(GraphError::GraphClosed)
    }

    fn live_context(&self) -> Result<Arc<GraphContext>> {
        let ctx = self.context()?;
        if self.is_removed() {
            return Err(GraphError::NodeRemoved(self.id()));
        }
        Ok(ctx)
    }

    // =========================================================================
    // Body access
    // =========================================================================

    /// Run `f` against the body, reloading it from the store if detached
    pub(crate) fn with_body<R>(
        &self,
        f: impl FnOnce(&Body, &GraphContext) -> Result<R>,
    ) -> Result<R> {
        let ctx = self.live_context()?;

        {
            let link = self.inner.link.read();
            if let BodyLink::Resident { body, .. } = &*link {
                ctx.eviction.touch(self);
                return f(body, &ctx);
            }
        }

        let link = self.inner.link.upgradable_read();
        let link = if matches!(&*link, BodyLink::Resident { .. }) {
            RwLockUpgradableReadGuard::downgrade(link)
        } else {
            let body = ctx.load_body(self.id(), self.label())?;
            let charged = body.estimated_size();
            let mut link = RwLockUpgradableReadGuard::upgrade(link);
            *link = BodyLink::Resident {
                body: Box::new(body),
                charged,
            };
            ctx.charge(charged);
            ctx.eviction.admit(self);
            RwLockWriteGuard::downgrade(link)
        };

        match &*link {
            BodyLink::Resident { body, .. } => f(body, &ctx),
            BodyLink::Detached => Err(GraphError::MissingBody(self.id())),
        }
    }

    /// Run a mutation against the body under the exclusive lock
    ///
    /// The resident charge is adjusted to the body's new size afterwards.
    pub(crate) fn with_body_mut<R>(
        &self,
        f: impl FnOnce(&mut Body, &GraphContext) -> Result<R>,
    ) -> Result<R> {
        let ctx = self.live_context()?;
        let mut link = self.inner.link.write();

        let reloaded = if matches!(&*link, BodyLink::Detached) {
            let body = ctx.load_body(self.id(), self.label())?;
            *link = BodyLink::Resident {
                body: Box::new(body),
                charged: 0,
            };
            true
        } else {
            false
        };

        let BodyLink::Resident { body, charged } = &mut *link else {
            return Err(GraphError::MissingBody(self.id()));
        };
        let result = f(body, &ctx);

        let size = body.estimated_size();
        ctx.recharge(*charged, size);
        *charged = size;

        if reloaded {
            ctx.eviction.admit(self);
        } else {
            ctx.eviction.touch(self);
        }
        result
    }

    /// Persist the body if dirty and detach it
    ///
    /// Returns the bytes released and whether a write-back happened, or
    /// `None` if the body was not resident.
    pub(crate) fn detach(&self, ctx: &GraphContext) -> Result<Option<(usize, bool)>> {
        let mut link = self.inner.link.write();
        let BodyLink::Resident { body, charged } = &mut *link else {
            return Ok(None);
        };
        let persisted = body.dirty;
        if persisted {
            ctx.persist_body(body)?;
            body.dirty = false;
        }
        let released = *charged;
        *link = BodyLink::Detached;
        ctx.uncharge(released);
        Ok(Some((released, persisted)))
    }

    /// Persist the body if it is resident and dirty
    pub(crate) fn persist_if_dirty(&self, ctx: &GraphContext) -> Result<bool> {
        let mut link = self.inner.link.write();
        if let BodyLink::Resident { body, .. } = &mut *link {
            if body.dirty {
                ctx.persist_body(body)?;
                body.dirty = false;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Mark the node removed and drop its body
    pub(crate) fn mark_removed(&self, ctx: &GraphContext) {
        self.inner.removed.store(true, Ordering::Release);
        let mut link = self.inner.link.write();
        if let BodyLink::Resident { charged, .. } = &*link {
            ctx.uncharge(*charged);
        }
        *link = BodyLink::Detached;
        ctx.eviction.forget(self.id());
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Name of the node's label
    pub fn label_name(&self) -> Result<String> {
        let ctx = self.context()?;
        Ok(ctx.schema.layout(self.label())?.name().to_string())
    }

    /// Read a property
    pub fn property(&self, key: &str) -> Result<Option<PropertyValue>> {
        let slot = self.live_context()?.schema.layout(self.label())?.slot(key)?;
        self.with_body(|body, _| Ok(body.properties[slot].clone()))
    }

    /// Set a property, returning the previous value
    pub fn set_property(
        &self,
        key: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<Option<PropertyValue>> {
        let value = value.into();
        let ctx = self.live_context()?;
        let layout = ctx.schema.layout(self.label())?;
        let slot = layout.slot(key)?;
        layout.check(slot, &value)?;

        let stored = value.clone();
        let old = self.with_body_mut(|body, _| Ok(body.set_property(slot, Some(stored))))?;
        ctx.indices.on_update(self.id(), key, old.as_ref(), Some(&value))?;
        Ok(old)
    }

    /// Clear a property, returning the previous value
    pub fn remove_property(&self, key: &str) -> Result<Option<PropertyValue>> {
        let ctx = self.live_context()?;
        let slot = ctx.schema.layout(self.label())?.slot(key)?;

        let old = self.with_body_mut(|body, _| Ok(body.set_property(slot, None)))?;
        if old.is_some() {
            ctx.indices.on_update(self.id(), key, old.as_ref(), None)?;
        }
        Ok(old)
    }

    /// All set properties in schema order
    pub fn properties(&self) -> Result<Vec<(String, PropertyValue)>> {
        self.with_body(|body, ctx| {
            let layout = ctx.schema.layout(body.label)?;
            Ok(layout
                .properties()
                .iter()
                .zip(&body.properties)
                .filter_map(|(def, value)| value.clone().map(|v| (def.name.clone(), v)))
                .collect())
        })
    }

    // =========================================================================
    // Adjacency
    // =========================================================================

    /// Live edges of one label in one direction, in offset order
    pub fn adjacent(&self, edge_label: &str, direction: Direction) -> Result<Vec<Adjacent>> {
        let ctx = self.live_context()?;
        let edge = ctx.schema.edge_layout(edge_label)?;
        let range = ctx
            .schema
            .check_endpoint(self.label(), edge.id(), direction)?;
        let id = self.id();

        self.with_body(|body, _| {
            let adjacent = body
                .adjacency
                .slots(range)
                .iter()
                .enumerate()
                .filter_map(|(offset, slot)| match slot {
                    AdjSlot::Edge {
                        neighbor,
                        mirror,
                        properties,
                    } => {
                        let (out_node, in_node, out_offset, in_offset) = match direction {
                            Direction::Out => (id, *neighbor, offset, *mirror),
                            Direction::In => (*neighbor, id, *mirror, offset),
                        };
                        Some(Adjacent {
                            neighbor: *neighbor,
                            edge: EdgeRef {
                                out_node,
                                in_node,
                                label: edge.id(),
                                out_offset,
                                in_offset,
                            },
                            properties: edge
                                .properties()
                                .iter()
                                .zip(properties)
                                .filter_map(|(def, v)| v.clone().map(|v| (def.name.clone(), v)))
                                .collect(),
                        })
                    }
                    AdjSlot::Tombstone => None,
                })
                .collect();
            Ok(adjacent)
        })
    }

    /// Number of live outgoing edges across all edge labels
    pub fn out_degree(&self) -> Result<usize> {
        self.with_body(|body, _| Ok(body.degree(Direction::Out)))
    }

    /// Number of live incoming edges across all edge labels
    pub fn in_degree(&self) -> Result<usize> {
        self.with_body(|body, _| Ok(body.degree(Direction::In)))
    }
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for NodeHandle {}

impl Hash for NodeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("id", &self.id())
            .field("label", &self.label())
            .field("removed", &self.is_removed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_and_hash_by_id() {
        let a = NodeHandle::unbound(1, LabelId(0));
        let b = NodeHandle::unbound(1, LabelId(3));
        let c = NodeHandle::unbound(2, LabelId(0));

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<NodeHandle> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_unbound_handle_reports_closed_graph() {
        let handle = NodeHandle::unbound(5, LabelId(0));
        assert!(!handle.is_resident());
        assert!(matches!(
            handle.property("name"),
            Err(GraphError::GraphClosed)
        ));
        assert!(matches!(handle.out_degree(), Err(GraphError::GraphClosed)));
    }
}
