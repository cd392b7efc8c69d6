//! Eviction Controller
//!
//! Bounds resident body memory. Resident handles are tracked in a candidate
//! queue (FIFO or LRU). When the memory probe reports usage above the
//! configured threshold, up to `eviction_batch_size` candidates are persisted
//! if dirty and detached from their handles.
//!
//! Thread-safe via interior mutability: the queue sits behind a
//! `parking_lot::Mutex` and counters are atomics. The queue lock is never held
//! while a body lock is acquired.

mod monitor;
mod policy;

pub(crate) use monitor::Monitor;

use crate::context::GraphContext;
use crate::error::Result;
use crate::node::NodeHandle;
use parking_lot::Mutex;
use policy::{new_queue, EvictionQueue};
use serde::Serialize;
use spillgraph_config::{EvictionPolicyKind, OverflowConfig};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Source of the memory-pressure signal
pub trait MemoryProbe: Send + Sync {
    /// Bytes currently in use
    fn used_bytes(&self) -> usize;

    /// Bytes available in total
    fn capacity_bytes(&self) -> usize;

    /// Usage as a ratio (0.0 - 1.0+)
    fn usage_ratio(&self) -> f64 {
        let capacity = self.capacity_bytes();
        if capacity == 0 {
            0.0
        } else {
            self.used_bytes() as f64 / capacity as f64
        }
    }
}

/// Default probe: estimated resident body bytes against a fixed pool
pub struct PoolProbe {
    resident: Arc<AtomicUsize>,
    pool_bytes: usize,
}

impl PoolProbe {
    pub fn new(resident: Arc<AtomicUsize>, pool_bytes: usize) -> Self {
        Self {
            resident,
            pool_bytes,
        }
    }
}

impl MemoryProbe for PoolProbe {
    fn used_bytes(&self) -> usize {
        self.resident.load(Ordering::Relaxed)
    }

    fn capacity_bytes(&self) -> usize {
        self.pool_bytes
    }
}

/// Eviction metrics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionMetrics {
    /// Bodies detached
    pub evictions: u64,
    /// Estimated bytes released by detaching
    pub bytes_released: u64,
    /// Bodies reloaded from the store
    pub reloads: u64,
    /// Dirty bodies written back by eviction
    pub persisted: u64,
    /// Monitor rounds that found the probe above threshold
    pub pressure_rounds: u64,
    /// Handles currently tracked as eviction candidates
    pub queued: usize,
}

#[derive(Debug, Default)]
struct Counters {
    evictions: AtomicU64,
    bytes_released: AtomicU64,
    reloads: AtomicU64,
    persisted: AtomicU64,
    pressure_rounds: AtomicU64,
}

/// Selects and detaches resident bodies
pub(crate) struct EvictionController {
    enabled: bool,
    threshold: f64,
    batch_size: usize,
    policy: EvictionPolicyKind,
    queue: Mutex<Box<dyn EvictionQueue>>,
    probe: Box<dyn MemoryProbe>,
    counters: Counters,
}

impl EvictionController {
    pub fn new(config: &OverflowConfig, probe: Box<dyn MemoryProbe>) -> Self {
        Self {
            enabled: config.enabled,
            threshold: config.threshold_ratio(),
            batch_size: config.eviction_batch_size.max(1),
            policy: config.policy,
            queue: Mutex::new(new_queue(config.policy)),
            probe,
            counters: Counters::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn policy(&self) -> EvictionPolicyKind {
        self.policy
    }

    /// Track a body that just became resident
    pub fn admit(&self, handle: &NodeHandle) {
        if self.enabled {
            self.queue.lock().admit(handle);
        }
    }

    /// Record a body reloaded from the store
    pub fn record_reload(&self) {
        self.counters.reloads.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an access to a resident body
    pub fn touch(&self, handle: &NodeHandle) {
        if self.enabled && self.policy == EvictionPolicyKind::Lru {
            self.queue.lock().touch(handle.id());
        }
    }

    pub fn forget(&self, id: i64) {
        if self.enabled {
            self.queue.lock().forget(id);
        }
    }

    /// Whether the probe currently reports usage at or above the threshold
    pub fn under_pressure(&self) -> bool {
        self.enabled && self.probe.usage_ratio() >= self.threshold
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Persist-if-dirty and detach one body. No-op when overflow is disabled.
    pub fn evict(&self, ctx: &GraphContext, handle: &NodeHandle) -> Result<bool> {
        if !self.enabled || handle.is_removed() {
            return Ok(false);
        }
        self.forget(handle.id());
        match self.detach(ctx, handle) {
            Ok(detached) => Ok(detached),
            Err(e) => {
                self.admit(handle);
                Err(e)
            }
        }
    }

    /// Evict up to `n` candidates in policy order. Returns the number detached.
    pub fn evict_batch(&self, ctx: &GraphContext, n: usize) -> Result<usize> {
        if !self.enabled || n == 0 {
            return Ok(0);
        }
        let candidates = self.queue.lock().pop_candidates(n);

        let mut evicted = 0;
        for (i, handle) in candidates.iter().enumerate() {
            if handle.is_removed() {
                continue;
            }
            match self.detach(ctx, handle) {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => {
                    // Candidates not yet detached go back into the queue
                    let requeue: Vec<&NodeHandle> = candidates[i..]
                        .iter()
                        .filter(|h| !h.is_removed() && h.is_resident())
                        .collect();
                    let mut queue = self.queue.lock();
                    for rest in requeue {
                        queue.admit(rest);
                    }
                    return Err(e);
                }
            }
        }

        debug!(
            "Evicted {} of {} candidates ({} policy)",
            evicted,
            candidates.len(),
            self.policy
        );
        Ok(evicted)
    }

    /// Detach every resident body
    pub fn evict_all(&self, ctx: &GraphContext) -> Result<usize> {
        let mut total = 0;
        while self.enabled && self.queue.lock().len() > 0 {
            total += self.evict_batch(ctx, self.batch_size)?;
        }
        Ok(total)
    }

    /// One monitor round: evict a batch if the probe is above threshold
    pub fn relieve_pressure(&self, ctx: &GraphContext) -> Result<usize> {
        if !self.under_pressure() {
            return Ok(0);
        }
        self.counters.pressure_rounds.fetch_add(1, Ordering::Relaxed);
        self.evict_batch(ctx, self.batch_size)
    }

    fn detach(&self, ctx: &GraphContext, handle: &NodeHandle) -> Result<bool> {
        let Some((released, persisted)) = handle.detach(ctx)? else {
            return Ok(false);
        };
        if persisted {
            self.counters.persisted.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_released
            .fetch_add(released as u64, Ordering::Relaxed);
        Ok(true)
    }

    pub fn metrics(&self) -> EvictionMetrics {
        EvictionMetrics {
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            bytes_released: self.counters.bytes_released.load(Ordering::Relaxed),
            reloads: self.counters.reloads.load(Ordering::Relaxed),
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            pressure_rounds: self.counters.pressure_rounds.load(Ordering::Relaxed),
            queued: self.queue.lock().len(),
        }
    }
}
