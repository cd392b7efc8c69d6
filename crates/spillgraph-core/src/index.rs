//! Secondary property indices.
//!
//! A named index maps encoded values of one property key to the set of node
//! ids carrying that value. Indices are maintained in memory on every
//! property write and persisted to `index_<name>` tables on flush.

use crate::codec::encode_value;
use crate::error::{GraphError, Result};
use crate::storage::{index_table_name, Store};
use crate::value::PropertyValue;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

#[derive(Debug)]
struct PropertyIndex {
    key: String,
    entries: HashMap<Vec<u8>, BTreeSet<i64>>,
    /// Changed since the last persist
    dirty: bool,
}

impl PropertyIndex {
    fn from_entries(key: String, entries: Vec<(Vec<u8>, i64)>) -> Self {
        let mut index = Self {
            key,
            entries: HashMap::new(),
            dirty: true,
        };
        for (value, id) in entries {
            index.insert(value, id);
        }
        index
    }

    fn insert(&mut self, value: Vec<u8>, id: i64) {
        self.entries.entry(value).or_default().insert(id);
        self.dirty = true;
    }

    fn remove(&mut self, value: &[u8], id: i64) {
        if let Some(ids) = self.entries.get_mut(value) {
            if ids.remove(&id) {
                self.dirty = true;
            }
            if ids.is_empty() {
                self.entries.remove(value);
            }
        }
    }

    fn pairs(&self) -> Vec<(Vec<u8>, i64)> {
        self.entries
            .iter()
            .flat_map(|(value, ids)| ids.iter().map(move |id| (value.clone(), *id)))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }
}

/// All secondary indices of an open graph
#[derive(Debug, Default)]
pub(crate) struct IndexManager {
    indices: RwLock<BTreeMap<String, PropertyIndex>>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore every index named in the store catalog
    pub fn load(store: &Store) -> Result<Self> {
        let manager = Self::new();
        {
            let mut indices = manager.indices.write();
            for (name, key) in store.index_catalog()? {
                let entries = store.load_index(&name)?;
                let mut index = PropertyIndex::from_entries(key, entries);
                index.dirty = false;
                debug!("Restored index '{}' ({} entries)", name, index.len());
                indices.insert(name, index);
            }
        }
        Ok(manager)
    }

    /// `(name, property key)` of every index, sorted by name
    pub fn catalog(&self) -> Vec<(String, String)> {
        self.indices
            .read()
            .iter()
            .map(|(name, index)| (name.clone(), index.key.clone()))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.indices.read().contains_key(name)
    }

    /// Fail unless `name` is a valid, unused index name
    pub fn check_new(&self, name: &str) -> Result<()> {
        index_table_name(name)?;
        if self.contains(name) {
            return Err(GraphError::IndexExists(name.to_string()));
        }
        Ok(())
    }

    /// Register a new index over prebuilt `(encoded value, id)` pairs
    pub fn create(&self, name: &str, key: &str, entries: Vec<(Vec<u8>, i64)>) -> Result<usize> {
        self.check_new(name)?;
        let index = PropertyIndex::from_entries(key.to_string(), entries);
        let len = index.len();
        self.indices.write().insert(name.to_string(), index);
        Ok(len)
    }

    /// Replace the contents of an existing index
    pub fn replace(&self, name: &str, entries: Vec<(Vec<u8>, i64)>) -> Result<usize> {
        let mut indices = self.indices.write();
        let index = indices
            .get_mut(name)
            .ok_or_else(|| GraphError::UnknownIndex(name.to_string()))?;
        let key = std::mem::take(&mut index.key);
        *index = PropertyIndex::from_entries(key, entries);
        Ok(index.len())
    }

    /// Ids whose indexed property equals `value`, ascending
    pub fn lookup(&self, name: &str, value: &PropertyValue) -> Result<Vec<i64>> {
        let indices = self.indices.read();
        let index = indices
            .get(name)
            .ok_or_else(|| GraphError::UnknownIndex(name.to_string()))?;
        let encoded = encode_value(value, &index.key)?;
        Ok(index
            .entries
            .get(&encoded)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default())
    }

    /// Reflect a property write in every index over `key`
    pub fn on_update(
        &self,
        id: i64,
        key: &str,
        old: Option<&PropertyValue>,
        new: Option<&PropertyValue>,
    ) -> Result<()> {
        if old == new || !self.watches(key) {
            return Ok(());
        }
        let old = old.map(|v| encode_value(v, key)).transpose()?;
        let new = new.map(|v| encode_value(v, key)).transpose()?;

        let mut indices = self.indices.write();
        for index in indices.values_mut().filter(|index| index.key == key) {
            if let Some(old) = &old {
                index.remove(old, id);
            }
            if let Some(new) = &new {
                index.insert(new.clone(), id);
            }
        }
        Ok(())
    }

    /// Add a new node's properties to every matching index
    pub fn on_insert(&self, id: i64, properties: &[(String, PropertyValue)]) -> Result<()> {
        for (key, value) in properties {
            self.on_update(id, key, None, Some(value))?;
        }
        Ok(())
    }

    /// Drop a removed node's properties from every matching index
    pub fn on_remove(&self, id: i64, properties: &[(String, PropertyValue)]) -> Result<()> {
        for (key, value) in properties {
            self.on_update(id, key, Some(value), None)?;
        }
        Ok(())
    }

    fn watches(&self, key: &str) -> bool {
        self.indices.read().values().any(|index| index.key == key)
    }

    /// Forget an index and delete its table
    pub fn drop_index(&self, name: &str, store: &Store) -> Result<bool> {
        let existed = self.indices.write().remove(name).is_some();
        let stored = store.drop_index(name)?;
        Ok(existed || stored)
    }

    /// Write every changed index to the store. Returns the number written.
    pub fn persist(&self, store: &Store) -> Result<usize> {
        let mut indices = self.indices.write();
        let mut written = 0;
        for (name, index) in indices.iter_mut().filter(|(_, index)| index.dirty) {
            store.save_index(name, &index.key, &index.pairs())?;
            index.dirty = false;
            written += 1;
        }
        Ok(written)
    }
}
