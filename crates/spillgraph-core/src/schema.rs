//! Graph schema descriptor
//!
//! Declares node labels, edge labels, their property keys, and which edge
//! labels a node label carries in each direction. Labels and edge labels are
//! assigned small integer ids in declaration order; the ids index the
//! per-label layouts (property slots and adjacency ranges) used by node bodies.
//!
//! Schemas are plain serde data, so they can be kept in JSON or TOML files.

use crate::error::{GraphError, Result};
use crate::value::{PropertyValue, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Identifier of a node label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelId(pub u32);

/// Identifier of an edge label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeLabelId(pub u32);

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "label#{}", self.0)
    }
}

impl fmt::Display for EdgeLabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "edge#{}", self.0)
    }
}

/// Edge direction relative to a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    /// Wire representation
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Out => 0,
            Self::In => 1,
        }
    }

    /// Parse the wire representation
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Out),
            1 => Some(Self::In),
            _ => None,
        }
    }

    /// The direction seen from the other endpoint
    pub fn opposite(self) -> Self {
        match self {
            Self::Out => Self::In,
            Self::In => Self::Out,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Out => f.write_str("out"),
            Self::In => f.write_str("in"),
        }
    }
}

// ============================================================================
// Serializable definition
// ============================================================================

/// A property key and its value kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDef {
    pub name: String,
    pub kind: ValueKind,
}

/// Definition of a node label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLabelDef {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<PropertyDef>,
    /// Edge labels this node may have as the out endpoint
    #[serde(default)]
    pub out_edges: Vec<String>,
    /// Edge labels this node may have as the in endpoint
    #[serde(default)]
    pub in_edges: Vec<String>,
}

impl NodeLabelDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
            out_edges: Vec::new(),
            in_edges: Vec::new(),
        }
    }

    pub fn property(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.properties.push(PropertyDef {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn out_edge(mut self, edge_label: impl Into<String>) -> Self {
        self.out_edges.push(edge_label.into());
        self
    }

    pub fn in_edge(mut self, edge_label: impl Into<String>) -> Self {
        self.in_edges.push(edge_label.into());
        self
    }
}

/// Definition of an edge label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeLabelDef {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<PropertyDef>,
}

impl EdgeLabelDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
        }
    }

    pub fn property(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.properties.push(PropertyDef {
            name: name.into(),
            kind,
        });
        self
    }
}

/// Serializable schema definition
///
/// # Example TOML
///
/// ```toml
/// [[node_labels]]
/// name = "Song"
/// out_edges = ["FollowedBy"]
/// in_edges = ["FollowedBy"]
/// properties = [{ name = "name", kind = "string" }]
///
/// [[edge_labels]]
/// name = "FollowedBy"
/// properties = [{ name = "weight", kind = "int" }]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDef {
    #[serde(default)]
    pub node_labels: Vec<NodeLabelDef>,
    #[serde(default)]
    pub edge_labels: Vec<EdgeLabelDef>,
}

impl SchemaDef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_label(mut self, label: NodeLabelDef) -> Self {
        self.node_labels.push(label);
        self
    }

    pub fn edge_label(mut self, label: EdgeLabelDef) -> Self {
        self.edge_labels.push(label);
        self
    }
}

// ============================================================================
// Resolved layouts
// ============================================================================

/// Property keys of a label mapped to dense slots
#[derive(Debug, Clone)]
struct PropertyTable {
    defs: Vec<PropertyDef>,
    slots: HashMap<String, usize>,
}

impl PropertyTable {
    fn new(owner: &str, defs: &[PropertyDef]) -> Result<Self> {
        let mut slots = HashMap::with_capacity(defs.len());
        for (slot, def) in defs.iter().enumerate() {
            if slots.insert(def.name.clone(), slot).is_some() {
                return Err(GraphError::Configuration(format!(
                    "duplicate property '{}' on '{}'",
                    def.name, owner
                )));
            }
        }
        Ok(Self {
            defs: defs.to_vec(),
            slots,
        })
    }

    fn slot(&self, owner: &str, key: &str) -> Result<usize> {
        self.slots
            .get(key)
            .copied()
            .ok_or_else(|| GraphError::UnknownPropertyKey {
                label: owner.to_string(),
                key: key.to_string(),
            })
    }

    fn bind<K: AsRef<str>>(
        &self,
        owner: &str,
        properties: &[(K, PropertyValue)],
    ) -> Result<Vec<Option<PropertyValue>>> {
        let mut values = vec![None; self.defs.len()];
        for (key, value) in properties {
            let slot = self.slot(owner, key.as_ref())?;
            check_kind(&self.defs[slot], value)?;
            values[slot] = Some(value.clone());
        }
        Ok(values)
    }
}

/// Check that a value matches the declared kind of a property
fn check_kind(def: &PropertyDef, value: &PropertyValue) -> Result<()> {
    if value.kind() != def.kind {
        return Err(GraphError::unsupported(
            &def.name,
            format!("expected {}, got {}", def.kind, value.kind()),
        ));
    }
    if let PropertyValue::List(items) = value {
        if let Some(bad) = items.iter().find(|item| !item.is_scalar()) {
            return Err(GraphError::unsupported(
                &def.name,
                format!("list elements must be scalars, got {}", bad.kind()),
            ));
        }
    }
    Ok(())
}

/// Resolved layout of a node label
#[derive(Debug, Clone)]
pub struct NodeLayout {
    id: LabelId,
    name: String,
    properties: PropertyTable,
    ranges: Vec<(EdgeLabelId, Direction)>,
}

impl NodeLayout {
    pub fn id(&self) -> LabelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared properties in slot order
    pub fn properties(&self) -> &[PropertyDef] {
        &self.properties.defs
    }

    /// Slot of a property key
    pub fn slot(&self, key: &str) -> Result<usize> {
        self.properties.slot(&self.name, key)
    }

    /// Whether the label declares a property key
    pub fn has_property(&self, key: &str) -> bool {
        self.properties.slots.contains_key(key)
    }

    /// Adjacency ranges in body order
    pub fn ranges(&self) -> &[(EdgeLabelId, Direction)] {
        &self.ranges
    }

    /// Index of the adjacency range for an edge label and direction
    pub fn range_index(&self, edge_label: EdgeLabelId, direction: Direction) -> Option<usize> {
        self.ranges
            .iter()
            .position(|&(e, d)| e == edge_label && d == direction)
    }

    /// Validate a value for a property slot
    pub fn check(&self, slot: usize, value: &PropertyValue) -> Result<()> {
        check_kind(&self.properties.defs[slot], value)
    }

    /// Validate properties and place them in slot order
    pub fn bind<K: AsRef<str>>(
        &self,
        properties: &[(K, PropertyValue)],
    ) -> Result<Vec<Option<PropertyValue>>> {
        self.properties.bind(&self.name, properties)
    }
}

/// Resolved layout of an edge label
#[derive(Debug, Clone)]
pub struct EdgeLayout {
    id: EdgeLabelId,
    name: String,
    properties: PropertyTable,
}

impl EdgeLayout {
    pub fn id(&self) -> EdgeLabelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &[PropertyDef] {
        &self.properties.defs
    }

    pub fn slot(&self, key: &str) -> Result<usize> {
        self.properties.slot(&self.name, key)
    }

    pub fn bind<K: AsRef<str>>(
        &self,
        properties: &[(K, PropertyValue)],
    ) -> Result<Vec<Option<PropertyValue>>> {
        self.properties.bind(&self.name, properties)
    }
}

/// Validated schema with resolved label layouts
#[derive(Debug, Clone)]
pub struct Schema {
    def: SchemaDef,
    labels: Vec<NodeLayout>,
    edge_labels: Vec<EdgeLayout>,
    label_ids: HashMap<String, LabelId>,
    edge_label_ids: HashMap<String, EdgeLabelId>,
}

impl Schema {
    /// Validate a definition and resolve its layouts
    pub fn new(def: SchemaDef) -> Result<Self> {
        let mut edge_label_ids = HashMap::new();
        let mut edge_labels = Vec::with_capacity(def.edge_labels.len());
        for (i, edge) in def.edge_labels.iter().enumerate() {
            let id = EdgeLabelId(i as u32);
            if edge_label_ids.insert(edge.name.clone(), id).is_some() {
                return Err(GraphError::Configuration(format!(
                    "duplicate edge label '{}'",
                    edge.name
                )));
            }
            edge_labels.push(EdgeLayout {
                id,
                name: edge.name.clone(),
                properties: PropertyTable::new(&edge.name, &edge.properties)?,
            });
        }

        let mut label_ids = HashMap::new();
        let mut labels = Vec::with_capacity(def.node_labels.len());
        for (i, label) in def.node_labels.iter().enumerate() {
            let id = LabelId(i as u32);
            if label_ids.insert(label.name.clone(), id).is_some() {
                return Err(GraphError::Configuration(format!(
                    "duplicate node label '{}'",
                    label.name
                )));
            }

            let mut ranges = Vec::new();
            let declared = label
                .out_edges
                .iter()
                .map(|e| (e, Direction::Out))
                .chain(label.in_edges.iter().map(|e| (e, Direction::In)));
            for (edge_name, direction) in declared {
                let edge_id = *edge_label_ids
                    .get(edge_name)
                    .ok_or_else(|| GraphError::UnknownEdgeLabel(edge_name.clone()))?;
                if !ranges.contains(&(edge_id, direction)) {
                    ranges.push((edge_id, direction));
                }
            }

            labels.push(NodeLayout {
                id,
                name: label.name.clone(),
                properties: PropertyTable::new(&label.name, &label.properties)?,
                ranges,
            });
        }

        Ok(Self {
            def,
            labels,
            edge_labels,
            label_ids,
            edge_label_ids,
        })
    }

    /// Parse a schema from JSON text
    pub fn from_json_str(text: &str) -> Result<Self> {
        let def: SchemaDef = serde_json::from_str(text)
            .map_err(|e| GraphError::Configuration(format!("invalid schema JSON: {e}")))?;
        Self::new(def)
    }

    /// Parse a schema from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let def: SchemaDef = toml::from_str(text)
            .map_err(|e| GraphError::Configuration(format!("invalid schema TOML: {e}")))?;
        Self::new(def)
    }

    /// Load a schema file, choosing the format by extension (`.toml` or JSON)
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            GraphError::Configuration(format!("cannot read schema '{}': {e}", path.display()))
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            _ => Self::from_json_str(&text),
        }
    }

    /// The definition this schema was built from
    pub fn definition(&self) -> &SchemaDef {
        &self.def
    }

    /// Resolve a label name
    pub fn label_id(&self, name: &str) -> Result<LabelId> {
        self.label_ids
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownLabel(name.to_string()))
    }

    /// Layout of a label by id
    pub fn label(&self, id: LabelId) -> Option<&NodeLayout> {
        self.labels.get(id.0 as usize)
    }

    /// Layout of a label by id, failing for ids outside the schema
    pub fn layout(&self, id: LabelId) -> Result<&NodeLayout> {
        self.label(id)
            .ok_or_else(|| GraphError::UnknownLabel(id.to_string()))
    }

    /// Layout of a label by name
    pub fn node_label(&self, name: &str) -> Result<&NodeLayout> {
        self.layout(self.label_id(name)?)
    }

    /// All node label layouts in id order
    pub fn labels(&self) -> &[NodeLayout] {
        &self.labels
    }

    /// Resolve an edge label name
    pub fn edge_label_id(&self, name: &str) -> Result<EdgeLabelId> {
        self.edge_label_ids
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownEdgeLabel(name.to_string()))
    }

    /// Layout of an edge label by id
    pub fn edge_label(&self, id: EdgeLabelId) -> Option<&EdgeLayout> {
        self.edge_labels.get(id.0 as usize)
    }

    /// Layout of an edge label by name
    pub fn edge_layout(&self, name: &str) -> Result<&EdgeLayout> {
        let id = self.edge_label_id(name)?;
        self.edge_label(id)
            .ok_or_else(|| GraphError::UnknownEdgeLabel(name.to_string()))
    }

    /// Ensure `label` may carry `edge_label` in `direction`
    pub fn check_endpoint(
        &self,
        label: LabelId,
        edge_label: EdgeLabelId,
        direction: Direction,
    ) -> Result<usize> {
        let layout = self.layout(label)?;
        layout
            .range_index(edge_label, direction)
            .ok_or_else(|| GraphError::EdgeLabelNotAllowed {
                label: layout.name().to_string(),
                edge_label: self
                    .edge_label(edge_label)
                    .map(|e| e.name().to_string())
                    .unwrap_or_else(|| edge_label.to_string()),
                direction,
            })
    }
}
