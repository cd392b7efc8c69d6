//! Per-open graph context.
//!
//! Everything an open graph shares between its facade, its handles and the
//! memory monitor: configuration, schema, store, interner, registry, indices,
//! eviction state and counters. Created by `Graph::open` and torn down by
//! `Graph::close`.

use crate::codec::{Codec, Interner};
use crate::error::{GraphError, Result};
use crate::eviction::EvictionController;
use crate::index::IndexManager;
use crate::node::body::Body;
use crate::registry::Registry;
use crate::schema::{LabelId, Schema};
use crate::storage::schema::{META_EDGE_COUNT, META_NEXT_ID};
use crate::storage::Store;
use parking_lot::{Mutex, RwLock};
use spillgraph_config::SpillConfig;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Persist counters, kept only when serialization stats are enabled
#[derive(Debug, Default)]
pub(crate) struct SerializationCounters {
    pub persist_calls: AtomicU64,
    pub bytes_written: AtomicU64,
}

pub(crate) struct GraphContext {
    pub config: SpillConfig,
    pub schema: Schema,
    pub store: Store,
    pub interner: Interner,
    pub registry: RwLock<Registry>,
    pub indices: IndexManager,
    pub eviction: EvictionController,
    pub next_id: AtomicI64,
    pub edge_count: AtomicU64,
    /// Estimated bytes of all resident bodies
    pub resident_bytes: Arc<AtomicUsize>,
    pub serialization: Option<SerializationCounters>,
    /// Serializes structural writers (edge and node insertion or removal)
    pub mutation: Mutex<()>,
    closed: AtomicBool,
}

impl GraphContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SpillConfig,
        schema: Schema,
        store: Store,
        indices: IndexManager,
        eviction: EvictionController,
        resident_bytes: Arc<AtomicUsize>,
        next_id: i64,
        edge_count: u64,
    ) -> Self {
        let registry = Registry::new(&config.registry);
        let serialization = config
            .stats
            .serialization_stats
            .then(SerializationCounters::default);
        Self {
            config,
            schema,
            store,
            interner: Interner::new(),
            registry: RwLock::new(registry),
            indices,
            eviction,
            next_id: AtomicI64::new(next_id),
            edge_count: AtomicU64::new(edge_count),
            resident_bytes,
            serialization,
            mutation: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn codec(&self) -> Codec<'_> {
        Codec::new(&self.schema, &self.interner)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed. Returns false if it already was.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Reserve the next node id
    pub fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    // =========================================================================
    // Body persistence
    // =========================================================================

    /// Read and fully decode the stored body of a node
    pub fn load_body(&self, id: i64, label: LabelId) -> Result<Body> {
        let bytes = self.store.read(id)?.ok_or(GraphError::MissingBody(id))?;
        let body = self.codec().decode(id, &bytes)?;
        if body.label != label {
            return Err(GraphError::corrupt(
                id,
                format!("label {} does not match handle label {}", body.label, label),
            ));
        }
        self.eviction.record_reload();
        debug!("Reloaded body of node {} ({} bytes)", id, bytes.len());
        Ok(body)
    }

    /// Encode and write a body
    pub fn persist_body(&self, body: &Body) -> Result<()> {
        let bytes = self.codec().encode(body)?;
        self.store.persist(body.id, &bytes)?;
        if let Some(counters) = &self.serialization {
            counters.persist_calls.fetch_add(1, Ordering::Relaxed);
            counters
                .bytes_written
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    // =========================================================================
    // Resident byte accounting
    // =========================================================================

    pub fn charge(&self, bytes: usize) {
        self.resident_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn uncharge(&self, bytes: usize) {
        // Saturating: a concurrent recharge may briefly undercount
        let _ = self
            .resident_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    pub fn recharge(&self, old: usize, new: usize) {
        if new > old {
            self.charge(new - old);
        } else {
            self.uncharge(old - new);
        }
    }

    /// Write next id and edge count to the store metadata
    pub fn persist_counters(&self) -> Result<()> {
        self.store.set_metadata(
            META_NEXT_ID,
            &self.next_id.load(Ordering::SeqCst).to_string(),
        )?;
        self.store.set_metadata(
            META_EDGE_COUNT,
            &self.edge_count.load(Ordering::SeqCst).to_string(),
        )?;
        Ok(())
    }
}
