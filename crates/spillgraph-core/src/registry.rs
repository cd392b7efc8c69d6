//! Node Registry
//!
//! In-memory collection of every live node handle, indexed by id and by label.
//!
//! Handles live in a slot array kept in ascending id order. Removal clears a
//! slot without shifting; compaction drops cleared slots once they make up a
//! large enough fraction of the array.

use crate::error::{GraphError, Result};
use crate::node::NodeHandle;
use crate::schema::LabelId;
use spillgraph_config::RegistryConfig;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// One position of the slot array
#[derive(Debug)]
struct Slot {
    id: i64,
    handle: Option<NodeHandle>,
}

/// Registry of live node handles
#[derive(Debug)]
pub struct Registry {
    slots: Vec<Slot>,
    /// Map from node id to its slot
    by_id: HashMap<i64, usize>,
    /// Map from label to the handles carrying it
    by_label: HashMap<LabelId, HashSet<NodeHandle>>,
    compaction_threshold: f64,
    min_compaction_slots: usize,
    compactions: u64,
}

impl Registry {
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            slots: Vec::new(),
            by_id: HashMap::new(),
            by_label: HashMap::new(),
            compaction_threshold: config.compaction_threshold,
            min_compaction_slots: config.min_compaction_slots,
            compactions: 0,
        }
    }

    /// Register a handle. Fails if its id is already present.
    pub fn add(&mut self, handle: NodeHandle) -> Result<()> {
        let id = handle.id();
        if self.by_id.contains_key(&id) {
            return Err(GraphError::DuplicateId(id));
        }

        self.by_label
            .entry(handle.label())
            .or_default()
            .insert(handle.clone());

        let in_order = self.slots.last().map_or(true, |last| last.id < id);
        if in_order {
            self.by_id.insert(id, self.slots.len());
            self.slots.push(Slot {
                id,
                handle: Some(handle),
            });
        } else {
            // Out-of-order id: insert in place and renumber the tail
            let at = self.slots.partition_point(|s| s.id < id);
            self.slots.insert(
                at,
                Slot {
                    id,
                    handle: Some(handle),
                },
            );
            for (slot, entry) in self.slots.iter().enumerate().skip(at) {
                if entry.handle.is_some() {
                    self.by_id.insert(entry.id, slot);
                }
            }
        }
        Ok(())
    }

    /// Unregister a handle. Returns false if it was not registered.
    pub fn remove(&mut self, handle: &NodeHandle) -> bool {
        let Some(slot) = self.by_id.remove(&handle.id()) else {
            return false;
        };
        let removed = self.slots[slot].handle.take();
        if let Some(removed) = removed {
            if let Some(set) = self.by_label.get_mut(&removed.label()) {
                set.remove(&removed);
                if set.is_empty() {
                    self.by_label.remove(&removed.label());
                }
            }
        }
        self.maybe_compact();
        true
    }

    /// Look up a handle by id
    pub fn get(&self, id: i64) -> Option<NodeHandle> {
        self.by_id
            .get(&id)
            .and_then(|&slot| self.slots[slot].handle.clone())
    }

    pub fn contains(&self, id: i64) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Size of the slot array, including cleared slots
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Fraction of cleared slots (0.0 - 1.0)
    pub fn empty_fraction(&self) -> f64 {
        if self.slots.is_empty() {
            0.0
        } else {
            (self.slots.len() - self.len()) as f64 / self.slots.len() as f64
        }
    }

    /// Number of compactions performed so far
    pub fn compactions(&self) -> u64 {
        self.compactions
    }

    fn maybe_compact(&mut self) {
        if self.slots.len() >= self.min_compaction_slots
            && self.empty_fraction() > self.compaction_threshold
        {
            let reclaimed = self.compact();
            debug!("Registry auto-compaction reclaimed {} slots", reclaimed);
        }
    }

    /// Drop cleared slots and remap ids. Returns the number of slots reclaimed.
    pub fn compact(&mut self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|s| s.handle.is_some());
        self.slots.shrink_to_fit();
        self.by_id.clear();
        for (slot, entry) in self.slots.iter().enumerate() {
            self.by_id.insert(entry.id, slot);
        }
        self.compactions += 1;
        before - self.slots.len()
    }

    /// Live handles in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = &NodeHandle> {
        self.slots.iter().filter_map(|s| s.handle.as_ref())
    }

    /// Up to `limit` live handles with ids greater than `after`, in id order
    ///
    /// Lets an iterator resume by id even if the slot array was compacted
    /// between calls.
    pub fn handles_after(&self, after: Option<i64>, limit: usize) -> Vec<NodeHandle> {
        let start = match after {
            Some(last) => self.slots.partition_point(|s| s.id <= last),
            None => 0,
        };
        self.slots[start..]
            .iter()
            .filter_map(|s| s.handle.clone())
            .take(limit)
            .collect()
    }

    /// Handles of one label, in ascending id order
    pub fn by_label(&self, label: LabelId) -> Vec<NodeHandle> {
        let mut handles: Vec<NodeHandle> = self
            .by_label
            .get(&label)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        handles.sort_by_key(NodeHandle::id);
        handles
    }

    /// Live handle count per label
    pub fn label_counts(&self) -> HashMap<LabelId, usize> {
        self.by_label
            .iter()
            .map(|(label, set)| (*label, set.len()))
            .collect()
    }
}
