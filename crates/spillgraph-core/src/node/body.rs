//! Node body: the detachable payload of a node.
//!
//! Holds property values in schema slot order and the adjacency block. All
//! adjacency entries of a body live in one shared array; an offset table maps
//! each (edge label, direction) pair to its `[start, end)` range within it.

use crate::schema::{Direction, EdgeLabelId, LabelId, NodeLayout};
use crate::value::PropertyValue;

/// Base footprint of a body without properties or adjacency
const BODY_BASE_SIZE: usize = 96;
/// Footprint of one adjacency entry without edge properties
const ENTRY_BASE_SIZE: usize = 40;

/// One slot of an adjacency range
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AdjSlot {
    Edge {
        neighbor: i64,
        /// Offset of the matching entry in the neighbor's opposite range
        mirror: usize,
        properties: Vec<Option<PropertyValue>>,
    },
    /// Left behind by a removed edge so sibling offsets stay stable
    Tombstone,
}

impl AdjSlot {
    fn estimated_size(&self) -> usize {
        match self {
            Self::Edge { properties, .. } => {
                ENTRY_BASE_SIZE
                    + properties
                        .iter()
                        .flatten()
                        .map(PropertyValue::estimated_size)
                        .sum::<usize>()
            }
            Self::Tombstone => ENTRY_BASE_SIZE,
        }
    }
}

/// Range of the shared adjacency array owned by one (edge label, direction)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AdjRange {
    pub edge_label: EdgeLabelId,
    pub direction: Direction,
    pub start: usize,
    pub end: usize,
}

impl AdjRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }
}

/// Adjacency block of a body
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Adjacency {
    entries: Vec<AdjSlot>,
    ranges: Vec<AdjRange>,
}

impl Adjacency {
    /// Empty ranges for every (edge label, direction) the layout declares
    pub fn for_layout(layout: &NodeLayout) -> Self {
        let ranges = layout
            .ranges()
            .iter()
            .map(|&(edge_label, direction)| AdjRange {
                edge_label,
                direction,
                start: 0,
                end: 0,
            })
            .collect();
        Self {
            entries: Vec::new(),
            ranges,
        }
    }

    /// Build from per-range slot lists, in layout order
    pub fn from_parts(parts: Vec<(EdgeLabelId, Direction, Vec<AdjSlot>)>) -> Self {
        let total = parts.iter().map(|(_, _, slots)| slots.len()).sum();
        let mut entries = Vec::with_capacity(total);
        let mut ranges = Vec::with_capacity(parts.len());
        for (edge_label, direction, slots) in parts {
            let start = entries.len();
            entries.extend(slots);
            ranges.push(AdjRange {
                edge_label,
                direction,
                start,
                end: entries.len(),
            });
        }
        Self { entries, ranges }
    }

    pub fn ranges(&self) -> &[AdjRange] {
        &self.ranges
    }

    /// Slots of one range
    pub fn slots(&self, range: usize) -> &[AdjSlot] {
        let r = self.ranges[range];
        &self.entries[r.start..r.end]
    }

    /// Append an entry at the end of a range and return its offset within it.
    ///
    /// Only entries after the range shift; later ranges move by one.
    pub fn append(
        &mut self,
        range: usize,
        neighbor: i64,
        mirror: usize,
        properties: Vec<Option<PropertyValue>>,
    ) -> usize {
        let insert_at = self.ranges[range].end;
        let offset = self.ranges[range].len();
        self.entries.insert(
            insert_at,
            AdjSlot::Edge {
                neighbor,
                mirror,
                properties,
            },
        );
        self.ranges[range].end += 1;
        for later in &mut self.ranges[range + 1..] {
            later.start += 1;
            later.end += 1;
        }
        offset
    }

    /// Tombstone the entry at `offset` if it is a live edge to `neighbor`
    /// whose mirror entry sits at `mirror`.
    pub fn tombstone(
        &mut self,
        range: usize,
        offset: usize,
        neighbor: i64,
        mirror: usize,
    ) -> bool {
        let r = self.ranges[range];
        if offset >= r.len() {
            return false;
        }
        let idx = r.start + offset;
        let matches = matches!(
            &self.entries[idx],
            AdjSlot::Edge { neighbor: n, mirror: m, .. } if *n == neighbor && *m == mirror
        );
        if matches {
            self.entries[idx] = AdjSlot::Tombstone;
            true
        } else {
            false
        }
    }

    /// Number of live entries in a range
    pub fn live_count(&self, range: usize) -> usize {
        self.slots(range)
            .iter()
            .filter(|s| matches!(s, AdjSlot::Edge { .. }))
            .count()
    }

    /// Live `(neighbor, offset, mirror)` triples of a range
    pub fn live_neighbors(&self, range: usize) -> impl Iterator<Item = (i64, usize, usize)> + '_ {
        self.slots(range)
            .iter()
            .enumerate()
            .filter_map(|(offset, slot)| match slot {
                AdjSlot::Edge {
                    neighbor, mirror, ..
                } => Some((*neighbor, offset, *mirror)),
                AdjSlot::Tombstone => None,
            })
    }

    fn estimated_size(&self) -> usize {
        self.entries.iter().map(AdjSlot::estimated_size).sum()
    }
}

/// The heavy, detachable part of a node
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Body {
    pub id: i64,
    pub label: LabelId,
    pub properties: Vec<Option<PropertyValue>>,
    pub adjacency: Adjacency,
    /// Set by any mutation, cleared by a successful persist
    pub dirty: bool,
}

impl Body {
    /// A fresh body for a new node. New bodies start dirty.
    pub fn new(id: i64, layout: &NodeLayout, properties: Vec<Option<PropertyValue>>) -> Self {
        Self {
            id,
            label: layout.id(),
            properties,
            adjacency: Adjacency::for_layout(layout),
            dirty: true,
        }
    }

    /// Replace a property slot, returning the previous value
    pub fn set_property(
        &mut self,
        slot: usize,
        value: Option<PropertyValue>,
    ) -> Option<PropertyValue> {
        let old = std::mem::replace(&mut self.properties[slot], value);
        if old != self.properties[slot] {
            self.dirty = true;
        }
        old
    }

    /// Total live edges in one direction across all edge labels
    pub fn degree(&self, direction: Direction) -> usize {
        self.adjacency
            .ranges()
            .iter()
            .enumerate()
            .filter(|(_, r)| r.direction == direction)
            .map(|(i, _)| self.adjacency.live_count(i))
            .sum()
    }

    /// Estimated in-memory footprint in bytes
    pub fn estimated_size(&self) -> usize {
        BODY_BASE_SIZE
            + self
                .properties
                .iter()
                .flatten()
                .map(PropertyValue::estimated_size)
                .sum::<usize>()
            + self.adjacency.estimated_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EdgeLabelDef, NodeLabelDef, Schema, SchemaDef};
    use crate::value::ValueKind;

    fn layout() -> NodeLayout {
        let schema = Schema::new(
            SchemaDef::new()
                .node_label(
                    NodeLabelDef::new("Song")
                        .property("name", ValueKind::String)
                        .out_edge("FollowedBy")
                        .out_edge("Covers")
                        .in_edge("FollowedBy"),
                )
                .edge_label(EdgeLabelDef::new("FollowedBy"))
                .edge_label(EdgeLabelDef::new("Covers")),
        )
        .unwrap();
        schema.node_label("Song").unwrap().clone()
    }

    #[test]
    fn test_append_shifts_later_ranges_only() {
        let mut adj = Adjacency::for_layout(&layout());

        assert_eq!(adj.append(1, 10, 0, vec![]), 0);
        assert_eq!(adj.append(2, 11, 0, vec![]), 0);
        assert_eq!(adj.append(0, 12, 0, vec![]), 0);
        assert_eq!(adj.append(0, 13, 4, vec![]), 1);

        let ranges: Vec<(usize, usize)> = adj.ranges().iter().map(|r| (r.start, r.end)).collect();
        assert_eq!(ranges, vec![(0, 2), (2, 3), (3, 4)]);

        let first: Vec<i64> = adj.live_neighbors(0).map(|(n, _, _)| n).collect();
        assert_eq!(first, vec![12, 13]);
        assert_eq!(adj.live_neighbors(0).nth(1), Some((13, 1, 4)));
        assert_eq!(adj.live_neighbors(2).next(), Some((11, 0, 0)));
    }

    #[test]
    fn test_tombstone_keeps_offsets() {
        let mut adj = Adjacency::for_layout(&layout());
        adj.append(0, 5, 0, vec![]);
        adj.append(0, 5, 1, vec![]);
        adj.append(0, 6, 0, vec![]);

        assert!(!adj.tombstone(0, 0, 5, 1));
        assert!(adj.tombstone(0, 0, 5, 0));
        assert!(!adj.tombstone(0, 0, 5, 0));
        assert!(!adj.tombstone(0, 2, 5, 0));
        assert!(!adj.tombstone(0, 9, 6, 0));

        let live: Vec<(i64, usize, usize)> = adj.live_neighbors(0).collect();
        assert_eq!(live, vec![(5, 1, 1), (6, 2, 0)]);
        assert_eq!(adj.live_count(0), 2);
    }

    #[test]
    fn test_set_property_tracks_dirty() {
        let layout = layout();
        let mut body = Body::new(1, &layout, vec![None]);
        body.dirty = false;

        assert_eq!(body.set_property(0, None), None);
        assert!(!body.dirty);

        body.set_property(0, Some(PropertyValue::from("x")));
        assert!(body.dirty);
    }

    #[test]
    fn test_degree_and_size() {
        let layout = layout();
        let mut body = Body::new(1, &layout, vec![None]);
        let empty = body.estimated_size();

        body.adjacency.append(0, 2, 0, vec![]);
        body.adjacency.append(1, 3, 0, vec![]);
        body.adjacency.append(2, 4, 0, vec![]);

        assert_eq!(body.degree(Direction::Out), 2);
        assert_eq!(body.degree(Direction::In), 1);
        assert!(body.estimated_size() > empty);
    }
}
