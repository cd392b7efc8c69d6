//! Eviction candidate queues.

use crate::node::NodeHandle;
use lru::LruCache;
use spillgraph_config::EvictionPolicyKind;
use std::collections::{HashMap, VecDeque};

/// Stale FIFO entries tolerated before the queue is rebuilt
const FIFO_COMPACT_SLACK: usize = 1024;

/// Ordered set of resident handles that may be evicted
pub(crate) trait EvictionQueue: Send {
    /// Track a handle whose body just became resident
    fn admit(&mut self, handle: &NodeHandle);

    /// Record an access to a resident body
    fn touch(&mut self, id: i64);

    /// Stop tracking a handle
    fn forget(&mut self, id: i64);

    /// Remove and return up to `n` candidates, best first
    fn pop_candidates(&mut self, n: usize) -> Vec<NodeHandle>;

    /// Number of tracked handles
    fn len(&self) -> usize;
}

/// Build the queue for a policy
pub(crate) fn new_queue(kind: EvictionPolicyKind) -> Box<dyn EvictionQueue> {
    match kind {
        EvictionPolicyKind::Fifo => Box::new(FifoQueue::default()),
        EvictionPolicyKind::Lru => Box::new(LruQueue::new()),
    }
}

// ============================================================================
// FIFO
// ============================================================================

/// Evicts in the order bodies became resident. Accesses are ignored.
///
/// Each admission is stamped with a generation so that entries left behind
/// by `forget` never count for a later readmission of the same id.
#[derive(Default)]
pub(crate) struct FifoQueue {
    order: VecDeque<(u64, NodeHandle)>,
    members: HashMap<i64, u64>,
    next_generation: u64,
}

impl FifoQueue {
    fn is_live(&self, generation: u64, handle: &NodeHandle) -> bool {
        self.members.get(&handle.id()) == Some(&generation)
    }
}

impl EvictionQueue for FifoQueue {
    fn admit(&mut self, handle: &NodeHandle) {
        if self.members.contains_key(&handle.id()) {
            return;
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        self.members.insert(handle.id(), generation);
        self.order.push_back((generation, handle.clone()));
    }

    fn touch(&mut self, _id: i64) {}

    fn forget(&mut self, id: i64) {
        if self.members.remove(&id).is_none() {
            return;
        }
        // Stale entries stay in `order` until popped; rebuild once they
        // outnumber the live ones by a wide margin.
        if self.order.len() > 2 * self.members.len() + FIFO_COMPACT_SLACK {
            let members = &self.members;
            self.order
                .retain(|(generation, h)| members.get(&h.id()) == Some(generation));
        }
    }

    fn pop_candidates(&mut self, n: usize) -> Vec<NodeHandle> {
        let mut out = Vec::with_capacity(n.min(self.members.len()));
        while out.len() < n {
            let Some((generation, handle)) = self.order.pop_front() else {
                break;
            };
            if self.is_live(generation, &handle) {
                self.members.remove(&handle.id());
                out.push(handle);
            }
        }
        out
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}

// ============================================================================
// LRU
// ============================================================================

/// Evicts the least recently accessed body first
pub(crate) struct LruQueue {
    entries: LruCache<i64, NodeHandle>,
}

impl LruQueue {
    pub fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
        }
    }
}

impl EvictionQueue for LruQueue {
    fn admit(&mut self, handle: &NodeHandle) {
        self.entries.put(handle.id(), handle.clone());
    }

    fn touch(&mut self, id: i64) {
        self.entries.promote(&id);
    }

    fn forget(&mut self, id: i64) {
        self.entries.pop(&id);
    }

    fn pop_candidates(&mut self, n: usize) -> Vec<NodeHandle> {
        std::iter::from_fn(|| self.entries.pop_lru().map(|(_, h)| h))
            .take(n)
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LabelId;
    use pretty_assertions::assert_eq;

    fn handle(id: i64) -> NodeHandle {
        NodeHandle::unbound(id, LabelId(0))
    }

    fn ids(handles: Vec<NodeHandle>) -> Vec<i64> {
        handles.iter().map(NodeHandle::id).collect()
    }

    #[test]
    fn test_fifo_ignores_access() {
        let mut queue = FifoQueue::default();
        for id in 1..=4 {
            queue.admit(&handle(id));
        }
        queue.touch(1);
        queue.admit(&handle(2));

        assert_eq!(queue.len(), 4);
        assert_eq!(ids(queue.pop_candidates(3)), vec![1, 2, 3]);
        assert_eq!(ids(queue.pop_candidates(3)), vec![4]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_fifo_forget_skips_entry() {
        let mut queue = FifoQueue::default();
        for id in 1..=3 {
            queue.admit(&handle(id));
        }
        queue.forget(2);
        queue.forget(2);

        assert_eq!(queue.len(), 2);
        assert_eq!(ids(queue.pop_candidates(10)), vec![1, 3]);
    }

    #[test]
    fn test_fifo_readmit_after_forget() {
        let mut queue = FifoQueue::default();
        queue.admit(&handle(1));
        queue.admit(&handle(2));
        queue.forget(1);
        queue.admit(&handle(1));

        // The readmitted id goes behind everything already queued
        assert_eq!(queue.len(), 2);
        assert_eq!(ids(queue.pop_candidates(1)), vec![2]);
        assert_eq!(ids(queue.pop_candidates(10)), vec![1]);
    }

    #[test]
    fn test_fifo_compaction_keeps_order() {
        let mut queue = FifoQueue::default();
        let total = FIFO_COMPACT_SLACK as i64 + 16;
        for id in 0..total {
            queue.admit(&handle(id));
        }
        queue.forget(0);
        queue.admit(&handle(0));
        for id in 1..total - 2 {
            queue.forget(id);
        }

        assert!(queue.order.len() < total as usize);
        assert_eq!(ids(queue.pop_candidates(10)), vec![total - 2, total - 1, 0]);
    }

    #[test]
    fn test_lru_orders_by_access() {
        let mut queue = LruQueue::new();
        for id in 1..=4 {
            queue.admit(&handle(id));
        }
        queue.touch(1);
        queue.touch(3);

        assert_eq!(ids(queue.pop_candidates(2)), vec![2, 4]);
        assert_eq!(ids(queue.pop_candidates(5)), vec![1, 3]);
    }

    #[test]
    fn test_lru_forget() {
        let mut queue = LruQueue::new();
        queue.admit(&handle(1));
        queue.admit(&handle(2));
        queue.forget(1);
        queue.touch(1);

        assert_eq!(queue.len(), 1);
        assert_eq!(ids(queue.pop_candidates(5)), vec![2]);
    }

    #[test]
    fn test_new_queue_selects_policy() {
        let mut fifo = new_queue(EvictionPolicyKind::Fifo);
        let mut lru = new_queue(EvictionPolicyKind::Lru);
        for queue in [&mut fifo, &mut lru] {
            queue.admit(&handle(1));
            queue.admit(&handle(2));
            queue.touch(1);
        }
        assert_eq!(ids(fifo.pop_candidates(1)), vec![1]);
        assert_eq!(ids(lru.pop_candidates(1)), vec![2]);
    }
}
