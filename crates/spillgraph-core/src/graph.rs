//! Graph facade.
//!
//! [`Graph`] owns the per-open [`GraphContext`] and exposes node and edge
//! mutation, lookup, eviction, secondary indices and lifecycle.
//!
//! Opening a durable store rebuilds the registry from record headers only
//! (decoded in parallel); bodies stay detached until first access.

use crate::codec::{decode_header, encode_value, RecordHeader, MAX_HEADER_LEN};
use crate::context::GraphContext;
use crate::diff::{self, ApplyReport, DiffBatch};
use crate::error::{GraphError, Result};
use crate::eviction::{EvictionController, MemoryProbe, Monitor, PoolProbe};
use crate::index::IndexManager;
use crate::mutation;
use crate::node::{EdgeRef, NodeHandle};
use crate::schema::{Direction, Schema};
use crate::stats::{GraphStats, SerializationStats, VerifyReport};
use crate::storage::schema::{META_EDGE_COUNT, META_NEXT_ID};
use crate::storage::{Store, StoreError};
use crate::value::PropertyValue;
use parking_lot::Mutex;
use rayon::prelude::*;
use spillgraph_config::SpillConfig;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Handles fetched from the registry per refill of a node iterator
const NODE_ITER_CHUNK: usize = 256;

/// An open property graph
pub struct Graph {
    ctx: Arc<GraphContext>,
    monitor: Mutex<Option<Monitor>>,
}

impl Graph {
    /// Open a graph with the default memory probe
    pub fn open(schema: Schema, config: &SpillConfig) -> Result<Self> {
        Self::open_inner(schema, config, None)
    }

    /// Open an ephemeral graph with default settings
    pub fn open_ephemeral(schema: Schema) -> Result<Self> {
        Self::open(schema, &SpillConfig::ephemeral())
    }

    /// Open a graph whose eviction is driven by a custom memory probe
    pub fn open_with_probe(
        schema: Schema,
        config: &SpillConfig,
        probe: Box<dyn MemoryProbe>,
    ) -> Result<Self> {
        Self::open_inner(schema, config, Some(probe))
    }

    fn open_inner(
        schema: Schema,
        config: &SpillConfig,
        probe: Option<Box<dyn MemoryProbe>>,
    ) -> Result<Self> {
        config.validate()?;

        let store = match &config.storage.location {
            Some(location) => Store::open(location)?,
            None => Store::ephemeral()?,
        };
        store.probe()?;

        let next_id = parse_meta(&store, META_NEXT_ID)?.unwrap_or(0);
        let stored_edges = parse_meta(&store, META_EDGE_COUNT)?;
        let indices = IndexManager::load(&store)?;

        let resident_bytes = Arc::new(AtomicUsize::new(0));
        let probe = probe.unwrap_or_else(|| {
            Box::new(PoolProbe::new(
                resident_bytes.clone(),
                config.overflow.memory_pool_bytes(),
            ))
        });
        let eviction = EvictionController::new(&config.overflow, probe);

        let ctx = Arc::new(GraphContext::new(
            config.clone(),
            schema,
            store,
            indices,
            eviction,
            resident_bytes,
            next_id,
            stored_edges.unwrap_or(0) as u64,
        ));

        let max_id = rebuild_registry(&ctx)?;
        ctx.next_id.fetch_max(max_id + 1, Ordering::SeqCst);
        if stored_edges.is_none() && !ctx.registry.read().is_empty() {
            let edges = count_edges(&ctx)?;
            ctx.edge_count.store(edges, Ordering::SeqCst);
        }

        let monitor = if config.overflow.enabled {
            let interval = Duration::from_millis(config.overflow.monitor_interval_ms.max(1));
            Some(Monitor::spawn(Arc::downgrade(&ctx), interval).map_err(StoreError::from)?)
        } else {
            None
        };

        info!(
            "Opened graph at {:?} ({} nodes, {} edges, overflow {})",
            ctx.store.path(),
            ctx.registry.read().len(),
            ctx.edge_count.load(Ordering::SeqCst),
            if config.overflow.enabled {
                "enabled"
            } else {
                "disabled"
            }
        );

        Ok(Self {
            ctx,
            monitor: Mutex::new(monitor),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.ctx.is_closed() {
            return Err(GraphError::GraphClosed);
        }
        Ok(())
    }

    pub fn schema(&self) -> &Schema {
        &self.ctx.schema
    }

    pub fn config(&self) -> &SpillConfig {
        &self.ctx.config
    }

    /// Backing file of the store
    pub fn path(&self) -> &Path {
        self.ctx.store.path()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ctx.store.is_ephemeral()
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.is_closed()
    }

    // =========================================================================
    // Nodes and edges
    // =========================================================================

    /// Add a node. Properties are checked against the label's declared kinds.
    pub fn add_node(&self, label: &str, properties: &[(&str, PropertyValue)]) -> Result<NodeHandle> {
        self.ensure_open()?;
        let layout = self.ctx.schema.node_label(label)?;
        let properties = layout.bind(properties)?;

        let _guard = self.ctx.mutation.lock();
        mutation::insert_node(&self.ctx, layout, properties)
    }

    /// Add an edge from `out_node` to `in_node`
    pub fn add_edge(
        &self,
        out_node: &NodeHandle,
        in_node: &NodeHandle,
        label: &str,
        properties: &[(&str, PropertyValue)],
    ) -> Result<EdgeRef> {
        self.ensure_open()?;
        let edge = self.ctx.schema.edge_layout(label)?;
        let properties = edge.bind(properties)?;

        let _guard = self.ctx.mutation.lock();
        mutation::ensure_live(&self.ctx, out_node)?;
        mutation::ensure_live(&self.ctx, in_node)?;
        mutation::insert_edge(&self.ctx, out_node, in_node, edge.id(), properties)
    }

    /// Look up a node by id
    pub fn node(&self, id: i64) -> Option<NodeHandle> {
        self.ctx.registry.read().get(id)
    }

    /// Lazy iterator over all nodes in ascending id order
    ///
    /// Each call starts a fresh pass. Nodes added during iteration with
    /// larger ids are yielded; removed ones are skipped.
    pub fn nodes(&self) -> NodeIter {
        NodeIter {
            ctx: self.ctx.clone(),
            after: None,
            buffer: Vec::new().into_iter(),
            exhausted: false,
        }
    }

    /// All nodes of one label, in ascending id order
    pub fn nodes_by_label(&self, label: &str) -> Result<Vec<NodeHandle>> {
        let label = self.ctx.schema.label_id(label)?;
        Ok(self.ctx.registry.read().by_label(label))
    }

    pub fn node_count(&self) -> usize {
        self.ctx.registry.read().len()
    }

    pub fn edge_count(&self) -> u64 {
        self.ctx.edge_count.load(Ordering::SeqCst)
    }

    /// Remove a node and all its edges. Returns false if it was already gone.
    pub fn remove_node(&self, handle: &NodeHandle) -> Result<bool> {
        self.ensure_open()?;
        let _guard = self.ctx.mutation.lock();
        Ok(mutation::delete_node(&self.ctx, handle)?.is_some())
    }

    /// Remove an edge. Returns false if it was already gone.
    pub fn remove_edge(&self, edge: &EdgeRef) -> Result<bool> {
        self.ensure_open()?;
        let _guard = self.ctx.mutation.lock();
        mutation::delete_edge(&self.ctx, edge)
    }

    /// Validate and apply a batch of operations
    ///
    /// A validation failure leaves the graph untouched. Failures during
    /// execution are not rolled back.
    pub fn apply(&self, batch: DiffBatch) -> Result<ApplyReport> {
        self.ensure_open()?;
        let _guard = self.ctx.mutation.lock();
        diff::apply(&self.ctx, batch)
    }

    /// Live edges per edge label name
    ///
    /// Reads every body, reloading detached ones.
    pub fn edge_counts_by_label(&self) -> Result<BTreeMap<String, u64>> {
        self.ensure_open()?;
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for handle in self.nodes() {
            handle.with_body(|body, ctx| {
                for (i, range) in body.adjacency.ranges().iter().enumerate() {
                    if range.direction != Direction::Out {
                        continue;
                    }
                    let live = body.adjacency.live_count(i) as u64;
                    if live == 0 {
                        continue;
                    }
                    if let Some(edge) = ctx.schema.edge_label(range.edge_label) {
                        *counts.entry(edge.name().to_string()).or_default() += live;
                    }
                }
                Ok(())
            })?;
        }
        Ok(counts)
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Persist-if-dirty and detach one body
    pub fn evict(&self, handle: &NodeHandle) -> Result<bool> {
        self.ensure_open()?;
        self.ctx.eviction.evict(&self.ctx, handle)
    }

    /// Evict up to `n` bodies in policy order
    pub fn evict_batch(&self, n: usize) -> Result<usize> {
        self.ensure_open()?;
        self.ctx.eviction.evict_batch(&self.ctx, n)
    }

    /// Evict every resident body
    pub fn evict_all(&self) -> Result<usize> {
        self.ensure_open()?;
        let evicted = self.ctx.eviction.evict_all(&self.ctx)?;
        debug!("Evicted all resident bodies ({})", evicted);
        Ok(evicted)
    }

    // =========================================================================
    // Secondary indices
    // =========================================================================

    /// Index every node carrying `key` under `name`. Returns the entry count.
    pub fn create_index(&self, name: &str, key: &str) -> Result<usize> {
        self.ensure_open()?;
        self.ctx.indices.check_new(name)?;
        if !self.ctx.schema.labels().iter().any(|l| l.has_property(key)) {
            return Err(GraphError::UnknownPropertyKey {
                label: "*".to_string(),
                key: key.to_string(),
            });
        }
        let entries = self.index_entries(key)?;
        let len = self.ctx.indices.create(name, key, entries)?;
        info!("Created index '{}' on '{}' ({} entries)", name, key, len);
        Ok(len)
    }

    /// Nodes whose indexed property equals `value`, in ascending id order
    pub fn lookup(&self, name: &str, value: impl Into<PropertyValue>) -> Result<Vec<NodeHandle>> {
        self.ensure_open()?;
        let ids = self.ctx.indices.lookup(name, &value.into())?;
        let registry = self.ctx.registry.read();
        Ok(ids.into_iter().filter_map(|id| registry.get(id)).collect())
    }

    /// Rebuild every index from a full registry scan
    pub fn rebuild_indices(&self) -> Result<usize> {
        self.ensure_open()?;
        let catalog = self.ctx.indices.catalog();
        for (name, key) in &catalog {
            let entries = self.index_entries(key)?;
            let len = self.ctx.indices.replace(name, entries)?;
            debug!("Rebuilt index '{}' ({} entries)", name, len);
        }
        Ok(catalog.len())
    }

    /// Drop an index and its persisted table
    pub fn drop_index(&self, name: &str) -> Result<bool> {
        self.ensure_open()?;
        self.ctx.indices.drop_index(name, &self.ctx.store)
    }

    /// `(name, property key)` of every index
    pub fn indices(&self) -> Vec<(String, String)> {
        self.ctx.indices.catalog()
    }

    fn index_entries(&self, key: &str) -> Result<Vec<(Vec<u8>, i64)>> {
        let mut entries = Vec::new();
        for handle in self.nodes() {
            let layout = self.ctx.schema.layout(handle.label())?;
            if !layout.has_property(key) {
                continue;
            }
            if let Some(value) = handle.property(key)? {
                entries.push((encode_value(&value, key)?, handle.id()));
            }
        }
        Ok(entries)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Compact the registry slot array. Returns the number of slots reclaimed.
    pub fn compact_registry(&self) -> usize {
        self.ctx.registry.write().compact()
    }

    /// Persist dirty bodies, indices and counters, then commit
    ///
    /// Returns the number of bodies written.
    pub fn flush(&self) -> Result<usize> {
        self.ensure_open()?;
        self.flush_inner()
    }

    fn flush_inner(&self) -> Result<usize> {
        let ctx = &self.ctx;
        let handles: Vec<NodeHandle> = ctx.registry.read().iter().cloned().collect();
        let mut written = 0;
        for handle in &handles {
            if handle.persist_if_dirty(ctx)? {
                written += 1;
            }
        }
        ctx.indices.persist(&ctx.store)?;
        ctx.persist_counters()?;
        ctx.store.flush()?;
        debug!("Flushed {} bodies", written);
        Ok(written)
    }

    /// Fully decode every stored record and cross-check the registry
    pub fn verify(&self) -> Result<VerifyReport> {
        self.ensure_open()?;
        let ctx = &self.ctx;
        let codec = ctx.codec();
        let mut report = VerifyReport::default();

        {
            let registry = ctx.registry.read();
            ctx.store.scan(|id, bytes| {
                report.records += 1;
                match codec.decode(id, bytes) {
                    Ok(body) => match registry.get(id) {
                        Some(handle) if handle.label() != body.label => report.corrupt.push((
                            id,
                            format!("label {} but handle has {}", body.label, handle.label()),
                        )),
                        Some(_) => {}
                        None => report
                            .corrupt
                            .push((id, "record without registered node".to_string())),
                    },
                    Err(e) => report.corrupt.push((id, e.to_string())),
                }
            })?;
        }

        let handles: Vec<NodeHandle> = ctx.registry.read().iter().cloned().collect();
        for handle in handles {
            if !handle.is_resident() && !ctx.store.contains(handle.id())? {
                report.missing.push(handle.id());
            }
        }
        Ok(report)
    }

    /// Snapshot of counters and sizes
    pub fn stats(&self) -> GraphStats {
        let ctx = &self.ctx;
        let registry = ctx.registry.read();
        let nodes_by_label = registry
            .label_counts()
            .into_iter()
            .filter_map(|(label, count)| {
                ctx.schema
                    .label(label)
                    .map(|layout| (layout.name().to_string(), count))
            })
            .collect();

        GraphStats {
            nodes: registry.len(),
            edges: ctx.edge_count.load(Ordering::SeqCst),
            nodes_by_label,
            resident_bytes: ctx.resident_bytes.load(Ordering::Relaxed),
            registry_slots: registry.slot_count(),
            registry_compactions: registry.compactions(),
            interned_strings: ctx.interner.len(),
            indices: ctx.indices.catalog().into_iter().map(|(name, _)| name).collect(),
            overflow_enabled: ctx.eviction.is_enabled(),
            eviction_policy: ctx.eviction.policy().to_string(),
            eviction: ctx.eviction.metrics(),
            serialization: ctx.serialization.as_ref().map(|s| SerializationStats {
                persist_calls: s.persist_calls.load(Ordering::Relaxed),
                bytes_written: s.bytes_written.load(Ordering::Relaxed),
            }),
            ephemeral: ctx.store.is_ephemeral(),
        }
    }

    /// Stop the monitor, flush everything and release the store
    ///
    /// Ephemeral graphs skip the flush; their backing file is deleted.
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.stop();
        }
        if !self.ctx.mark_closed() {
            return Ok(());
        }

        let flushed = if self.ctx.store.is_ephemeral() {
            Ok(0)
        } else {
            self.flush_inner()
        };
        let closed = self.ctx.store.close();

        info!(
            "Closed graph at {:?} ({} nodes, {} edges)",
            self.ctx.store.path(),
            self.ctx.registry.read().len(),
            self.ctx.edge_count.load(Ordering::SeqCst)
        );
        flushed?;
        closed?;
        Ok(())
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close graph cleanly: {}", e);
        }
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("store", &self.ctx.store)
            .field("nodes", &self.node_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}

/// Lazy iterator over the nodes of a graph, see [`Graph::nodes`]
pub struct NodeIter {
    ctx: Arc<GraphContext>,
    after: Option<i64>,
    buffer: std::vec::IntoIter<NodeHandle>,
    exhausted: bool,
}

impl Iterator for NodeIter {
    type Item = NodeHandle;

    fn next(&mut self) -> Option<NodeHandle> {
        loop {
            if let Some(handle) = self.buffer.next() {
                self.after = Some(handle.id());
                if handle.is_removed() {
                    continue;
                }
                return Some(handle);
            }
            if self.exhausted {
                return None;
            }
            let chunk = self
                .ctx
                .registry
                .read()
                .handles_after(self.after, NODE_ITER_CHUNK);
            if chunk.len() < NODE_ITER_CHUNK {
                self.exhausted = true;
            }
            if chunk.is_empty() {
                return None;
            }
            self.buffer = chunk.into_iter();
        }
    }
}

// ============================================================================
// Startup
// ============================================================================

fn parse_meta(store: &Store, key: &str) -> Result<Option<i64>> {
    store
        .get_metadata(key)?
        .map(|value| {
            value.parse::<i64>().map_err(|e| {
                GraphError::Configuration(format!("invalid store metadata '{key}': {e}"))
            })
        })
        .transpose()
}

/// Register a detached handle for every stored record. Returns the largest id.
fn rebuild_registry(ctx: &Arc<GraphContext>) -> Result<i64> {
    let prefixes = ctx.store.scan_prefixes(MAX_HEADER_LEN)?;
    let headers = prefixes
        .par_iter()
        .map(|(id, prefix)| decode_header(*id, prefix))
        .collect::<Result<Vec<RecordHeader>>>()?;

    let weak = Arc::downgrade(ctx);
    let mut registry = ctx.registry.write();
    let mut max_id = -1;
    for header in headers {
        if ctx.schema.label(header.label).is_none() {
            return Err(GraphError::corrupt(
                header.id,
                format!("label {} is not in the schema", header.label),
            ));
        }
        registry.add(NodeHandle::detached(header.id, header.label, weak.clone()))?;
        max_id = max_id.max(header.id);
    }

    debug!("Rebuilt registry with {} nodes", registry.len());
    Ok(max_id)
}

/// Count live edges by decoding every record
fn count_edges(ctx: &GraphContext) -> Result<u64> {
    let codec = ctx.codec();
    let mut edges = 0u64;
    let mut failure = None;
    ctx.store.scan(|id, bytes| {
        if failure.is_some() {
            return;
        }
        match codec.decode(id, bytes) {
            Ok(body) => edges += body.degree(Direction::Out) as u64,
            Err(e) => failure = Some(e),
        }
    })?;
    failure.map_or(Ok(edges), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::body::Body;
    use crate::schema::{EdgeLabelDef, NodeLabelDef, SchemaDef};
    use crate::value::ValueKind;
    use pretty_assertions::assert_eq;

    fn schema() -> Schema {
        Schema::new(
            SchemaDef::new()
                .edge_label(EdgeLabelDef::new("FollowedBy"))
                .node_label(
                    NodeLabelDef::new("Song")
                        .property("name", ValueKind::String)
                        .property("tags", ValueKind::List)
                        .out_edge("FollowedBy")
                        .in_edge("FollowedBy"),
                )
                .node_label(NodeLabelDef::new("Artist").property("name", ValueKind::String)),
        )
        .unwrap()
    }

    fn open() -> Graph {
        let mut config = SpillConfig::ephemeral();
        config.overflow.monitor_interval_ms = 60_000;
        Graph::open(schema(), &config).unwrap()
    }

    fn song(graph: &Graph, name: &str) -> NodeHandle {
        graph.add_node("Song", &[("name", name.into())]).unwrap()
    }

    #[test]
    fn test_missing_record_reported() {
        let graph = open();
        let a = song(&graph, "A");
        let b = song(&graph, "B");
        assert!(graph.evict(&a).unwrap());
        assert!(graph.ctx.store.remove(a.id()).unwrap());

        assert!(matches!(a.property("name"), Err(GraphError::MissingBody(id)) if id == a.id()));
        assert!(matches!(
            graph.add_edge(&a, &b, "FollowedBy", &[]),
            Err(GraphError::MissingBody(_))
        ));
        assert!(!a.is_resident());

        // The failed edge left the other endpoint untouched
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(b.in_degree().unwrap(), 0);

        let report = graph.verify().unwrap();
        assert_eq!(report.missing, vec![a.id()]);
    }

    #[test]
    fn test_corrupt_record_reported() {
        let graph = open();
        let a = song(&graph, "A");
        assert!(graph.evict(&a).unwrap());
        let good = graph.ctx.store.read(a.id()).unwrap().unwrap();

        graph.ctx.store.persist(a.id(), &good[..good.len() / 2]).unwrap();
        assert!(matches!(
            a.property("name"),
            Err(GraphError::CorruptRecord { id, .. }) if id == a.id()
        ));

        graph.ctx.store.persist(a.id(), &[0xff, 0xff, 0xff]).unwrap();
        assert!(matches!(a.property("name"), Err(GraphError::CorruptRecord { .. })));
        assert!(!a.is_resident());

        // A well-formed record of another label under the same id
        let artist = graph.ctx.schema.node_label("Artist").unwrap();
        let foreign = Body::new(a.id(), artist, vec![Some("X".into())]);
        let bytes = graph.ctx.codec().encode(&foreign).unwrap();
        graph.ctx.store.persist(a.id(), &bytes).unwrap();
        match a.property("name") {
            Err(GraphError::CorruptRecord { reason, .. }) => {
                assert!(reason.contains("does not match"), "{reason}")
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(graph.verify().unwrap().corrupt.len(), 1);

        graph.ctx.store.persist(a.id(), &good).unwrap();
        assert_eq!(a.property("name").unwrap(), Some("A".into()));
    }

    #[test]
    fn test_failed_index_update_unwinds_insert() {
        let graph = open();
        graph.create_index("by_name", "name").unwrap();
        graph.create_index("by_tags", "tags").unwrap();

        // Bypasses kind checks: a nested list cannot be encoded as an index key
        let layout = graph.ctx.schema.node_label("Song").unwrap();
        let nested = PropertyValue::List(vec![PropertyValue::List(vec![])]);
        let result = {
            let _guard = graph.ctx.mutation.lock();
            mutation::insert_node(&graph.ctx, layout, vec![Some("X".into()), Some(nested)])
        };
        assert!(matches!(
            result,
            Err(GraphError::UnsupportedPropertyType { .. })
        ));

        assert_eq!(graph.node_count(), 0);
        assert!(graph.lookup("by_name", "X").unwrap().is_empty());
        let stats = graph.stats();
        assert_eq!(stats.resident_bytes, 0);
        assert_eq!(stats.eviction.queued, 0);

        let kept = song(&graph, "X");
        assert_eq!(graph.lookup("by_name", "X").unwrap(), vec![kept]);
    }
}
