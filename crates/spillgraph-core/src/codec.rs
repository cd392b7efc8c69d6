//! Binary record codec for node bodies.
//!
//! Record layout (integers are LEB128 varints, signed ones zig-zag encoded):
//!
//! ```text
//! record    := version:u8 id:i64 label:u32 props adjacency
//! props     := count (key:string value)*
//! adjacency := range_count (edge_label:u32 direction:u8 len)* entry*
//! entry     := slot:u64 [mirror:u64 value_count value*]   slot 0 = tombstone, else neighbor + 1
//! value     := tag:u8 payload
//! string    := len bytes
//! ```
//!
//! Floats are stored as little-endian IEEE bits so they round-trip exactly.

use crate::error::{GraphError, Result};
use crate::node::body::{AdjSlot, Adjacency, Body};
use crate::schema::{Direction, EdgeLabelId, LabelId, NodeLayout, PropertyDef, Schema};
use crate::value::PropertyValue;
use dashmap::DashSet;
use std::sync::Arc;

/// Current record format version
pub const RECORD_VERSION: u8 = 1;

/// Upper bound on the encoded size of a record header
pub const MAX_HEADER_LEN: usize = 1 + 10 + 5;

const TAG_ABSENT: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_BYTE: u8 = 2;
const TAG_SHORT: u8 = 3;
const TAG_INT: u8 = 4;
const TAG_LONG: u8 = 5;
const TAG_FLOAT: u8 = 6;
const TAG_DOUBLE: u8 = 7;
const TAG_CHAR: u8 = 8;
const TAG_STRING: u8 = 9;
const TAG_LIST: u8 = 10;
const TAG_NODE_REF: u8 = 11;

const SLOT_TOMBSTONE: u64 = 0;

/// String interner shared by all decodes of one open graph
///
/// Repeated identical strings decode to the same `Arc<str>`.
#[derive(Debug, Default)]
pub struct Interner {
    strings: DashSet<Arc<str>>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the shared copy of `s`, inserting it on first sight
    pub fn intern(&self, s: &str) -> Arc<str> {
        if let Some(existing) = self.strings.get(s) {
            return Arc::clone(existing.key());
        }
        let fresh: Arc<str> = Arc::from(s);
        if self.strings.insert(Arc::clone(&fresh)) {
            return fresh;
        }
        // Lost a race with another inserter; use the winner's copy
        match self.strings.get(s) {
            Some(existing) => Arc::clone(existing.key()),
            None => fresh,
        }
    }

    /// Number of distinct strings
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

/// Identity fields of a record, readable without decoding the rest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub id: i64,
    pub label: LabelId,
}

/// Encoder/decoder bound to a schema and an interner
pub(crate) struct Codec<'a> {
    schema: &'a Schema,
    interner: &'a Interner,
}

impl<'a> Codec<'a> {
    pub fn new(schema: &'a Schema, interner: &'a Interner) -> Self {
        Self { schema, interner }
    }

    /// Encode a body into a record
    pub fn encode(&self, body: &Body) -> Result<Vec<u8>> {
        let layout = self.schema.layout(body.label)?;
        let mut out = Vec::with_capacity(64);

        out.push(RECORD_VERSION);
        write_var_i64(body.id, &mut out);
        write_var_u64(u64::from(body.label.0), &mut out);

        let set: Vec<(usize, &PropertyValue)> = body
            .properties
            .iter()
            .enumerate()
            .filter_map(|(slot, v)| v.as_ref().map(|v| (slot, v)))
            .collect();
        write_var_u64(set.len() as u64, &mut out);
        for (slot, value) in set {
            let key = &layout.properties()[slot].name;
            write_str(key, &mut out);
            write_value(value, key, &mut out)?;
        }

        let ranges = body.adjacency.ranges();
        write_var_u64(ranges.len() as u64, &mut out);
        for range in ranges {
            write_var_u64(u64::from(range.edge_label.0), &mut out);
            out.push(range.direction.as_u8());
            write_var_u64(range.len() as u64, &mut out);
        }
        for (i, range) in ranges.iter().enumerate() {
            let edge_name = self
                .schema
                .edge_label(range.edge_label)
                .map(|e| e.name())
                .unwrap_or("edge");
            for slot in body.adjacency.slots(i) {
                match slot {
                    AdjSlot::Tombstone => write_var_u64(SLOT_TOMBSTONE, &mut out),
                    AdjSlot::Edge {
                        neighbor,
                        mirror,
                        properties,
                    } => {
                        let encoded = u64::try_from(*neighbor).map_err(|_| {
                            GraphError::unsupported(edge_name, "negative neighbor id")
                        })?;
                        write_var_u64(encoded + 1, &mut out);
                        write_var_u64(*mirror as u64, &mut out);
                        write_var_u64(properties.len() as u64, &mut out);
                        for value in properties {
                            match value {
                                Some(v) => write_value(v, edge_name, &mut out)?,
                                None => out.push(TAG_ABSENT),
                            }
                        }
                    }
                }
            }
        }

        Ok(out)
    }

    /// Decode a full record into a body
    pub fn decode(&self, id: i64, bytes: &[u8]) -> Result<Body> {
        let mut r = Reader::new(bytes, id);
        let header = read_header(&mut r)?;
        let layout = self
            .schema
            .label(header.label)
            .ok_or_else(|| GraphError::corrupt(id, format!("unknown {}", header.label)))?;

        let mut properties = vec![None; layout.properties().len()];
        let prop_count = r.len("property count")?;
        for _ in 0..prop_count {
            let key = r.str()?;
            let slot = layout
                .slot(key)
                .map_err(|_| GraphError::corrupt(id, format!("unknown property key '{key}'")))?;
            if properties[slot].is_some() {
                return Err(r.corrupt(format!("duplicate property key '{key}'")));
            }
            let value = self.read_value(&mut r)?;
            check_decoded_kind(&r, &layout.properties()[slot], &value)?;
            properties[slot] = Some(value);
        }

        let adjacency = self.read_adjacency(&mut r, layout)?;

        if !r.is_at_end() {
            return Err(GraphError::corrupt(id, "trailing bytes after record"));
        }

        Ok(Body {
            id: header.id,
            label: header.label,
            properties,
            adjacency,
            dirty: false,
        })
    }

    fn read_adjacency(&self, r: &mut Reader<'_>, layout: &NodeLayout) -> Result<Adjacency> {
        let range_count = r.len("range count")?;
        let mut declared = Vec::with_capacity(range_count);
        for _ in 0..range_count {
            let edge_label = EdgeLabelId(r.u32("edge label")?);
            let direction = Direction::from_u8(r.u8()?)
                .ok_or_else(|| r.corrupt("invalid edge direction"))?;
            let len = r.len("range length")?;
            if layout.range_index(edge_label, direction).is_none() {
                return Err(r.corrupt(format!(
                    "{edge_label} ({direction}) is not declared for '{}'",
                    layout.name()
                )));
            }
            if declared
                .iter()
                .any(|&(e, d, _)| e == edge_label && d == direction)
            {
                return Err(r.corrupt(format!("duplicate range {edge_label} ({direction})")));
            }
            declared.push((edge_label, direction, len));
        }

        let mut decoded: Vec<(EdgeLabelId, Direction, Vec<AdjSlot>)> =
            Vec::with_capacity(declared.len());
        for (edge_label, direction, len) in declared {
            let edge_props = self
                .schema
                .edge_label(edge_label)
                .map(|e| e.properties())
                .unwrap_or(&[]);
            let mut slots = Vec::with_capacity(len);
            for _ in 0..len {
                slots.push(self.read_slot(r, edge_props)?);
            }
            decoded.push((edge_label, direction, slots));
        }

        // Lay ranges out in schema order; ranges added to the schema later stay empty
        let parts = layout
            .ranges()
            .iter()
            .map(|&(edge_label, direction)| {
                let slots = decoded
                    .iter_mut()
                    .find(|(e, d, _)| *e == edge_label && *d == direction)
                    .map(|(_, _, slots)| std::mem::take(slots))
                    .unwrap_or_default();
                (edge_label, direction, slots)
            })
            .collect();
        Ok(Adjacency::from_parts(parts))
    }

    fn read_slot(&self, r: &mut Reader<'_>, edge_props: &[PropertyDef]) -> Result<AdjSlot> {
        let slot = r.var_u64()?;
        if slot == SLOT_TOMBSTONE {
            return Ok(AdjSlot::Tombstone);
        }
        let neighbor =
            i64::try_from(slot - 1).map_err(|_| r.corrupt("neighbor id out of range"))?;
        let mirror = usize::try_from(r.var_u64()?)
            .map_err(|_| r.corrupt("mirror offset out of range"))?;
        let value_count = r.len("edge value count")?;
        if value_count > edge_props.len() {
            return Err(r.corrupt(format!(
                "edge carries {value_count} values, schema declares {}",
                edge_props.len()
            )));
        }
        let mut properties = Vec::with_capacity(edge_props.len());
        for def in &edge_props[..value_count] {
            let value = self.read_opt_value(r)?;
            if let Some(value) = &value {
                check_decoded_kind(r, def, value)?;
            }
            properties.push(value);
        }
        properties.resize(edge_props.len(), None);
        Ok(AdjSlot::Edge {
            neighbor,
            mirror,
            properties,
        })
    }

    fn read_opt_value(&self, r: &mut Reader<'_>) -> Result<Option<PropertyValue>> {
        let tag = r.u8()?;
        if tag == TAG_ABSENT {
            return Ok(None);
        }
        self.read_tagged(r, tag, false).map(Some)
    }

    fn read_value(&self, r: &mut Reader<'_>) -> Result<PropertyValue> {
        let tag = r.u8()?;
        self.read_tagged(r, tag, false)
    }

    fn read_tagged(&self, r: &mut Reader<'_>, tag: u8, in_list: bool) -> Result<PropertyValue> {
        let value = match tag {
            TAG_BOOL => match r.u8()? {
                0 => PropertyValue::Bool(false),
                1 => PropertyValue::Bool(true),
                other => return Err(r.corrupt(format!("invalid bool byte {other}"))),
            },
            TAG_BYTE => PropertyValue::Byte(r.u8()? as i8),
            TAG_SHORT => {
                let v = r.var_i64()?;
                PropertyValue::Short(i16::try_from(v).map_err(|_| r.corrupt("short overflow"))?)
            }
            TAG_INT => {
                let v = r.var_i64()?;
                PropertyValue::Int(i32::try_from(v).map_err(|_| r.corrupt("int overflow"))?)
            }
            TAG_LONG => PropertyValue::Long(r.var_i64()?),
            TAG_FLOAT => {
                let bytes = r.take(4)?;
                let mut arr = [0u8; 4];
                arr.copy_from_slice(bytes);
                PropertyValue::Float(f32::from_bits(u32::from_le_bytes(arr)))
            }
            TAG_DOUBLE => {
                let bytes = r.take(8)?;
                let mut arr = [0u8; 8];
                arr.copy_from_slice(bytes);
                PropertyValue::Double(f64::from_bits(u64::from_le_bytes(arr)))
            }
            TAG_CHAR => {
                let code = r.u32("char")?;
                PropertyValue::Char(
                    char::from_u32(code).ok_or_else(|| r.corrupt("invalid char code point"))?,
                )
            }
            TAG_STRING => PropertyValue::String(self.interner.intern(r.str()?)),
            TAG_LIST if !in_list => {
                let count = r.len("list length")?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    let tag = r.u8()?;
                    items.push(self.read_tagged(r, tag, true)?);
                }
                PropertyValue::List(items)
            }
            TAG_NODE_REF if !in_list => PropertyValue::NodeRef(r.var_i64()?),
            TAG_LIST | TAG_NODE_REF => {
                return Err(r.corrupt("non-scalar value inside list"));
            }
            other => return Err(r.corrupt(format!("unknown value tag {other}"))),
        };
        Ok(value)
    }
}

fn check_decoded_kind(r: &Reader<'_>, def: &PropertyDef, value: &PropertyValue) -> Result<()> {
    if value.kind() != def.kind {
        return Err(r.corrupt(format!(
            "'{}' holds {}, schema declares {}",
            def.name,
            value.kind(),
            def.kind
        )));
    }
    Ok(())
}

/// Decode only the identity fields of a record
pub fn decode_header(id: i64, bytes: &[u8]) -> Result<RecordHeader> {
    let mut r = Reader::new(bytes, id);
    read_header(&mut r)
}

fn read_header(r: &mut Reader<'_>) -> Result<RecordHeader> {
    let version = r.u8()?;
    if version != RECORD_VERSION {
        return Err(r.corrupt(format!("unsupported record version {version}")));
    }
    let id = r.var_i64()?;
    if id != r.id {
        return Err(r.corrupt(format!("record carries id {id}")));
    }
    let label = LabelId(r.u32("label")?);
    Ok(RecordHeader { id, label })
}

/// Encode a standalone value, as used for secondary index keys
pub fn encode_value(value: &PropertyValue, key: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(16);
    write_value(value, key, &mut out)?;
    Ok(out)
}

fn write_value(value: &PropertyValue, key: &str, out: &mut Vec<u8>) -> Result<()> {
    match value {
        PropertyValue::Bool(v) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*v));
        }
        PropertyValue::Byte(v) => {
            out.push(TAG_BYTE);
            out.push(*v as u8);
        }
        PropertyValue::Short(v) => {
            out.push(TAG_SHORT);
            write_var_i64(i64::from(*v), out);
        }
        PropertyValue::Int(v) => {
            out.push(TAG_INT);
            write_var_i64(i64::from(*v), out);
        }
        PropertyValue::Long(v) => {
            out.push(TAG_LONG);
            write_var_i64(*v, out);
        }
        PropertyValue::Float(v) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        PropertyValue::Double(v) => {
            out.push(TAG_DOUBLE);
            out.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        PropertyValue::Char(v) => {
            out.push(TAG_CHAR);
            write_var_u64(u64::from(u32::from(*v)), out);
        }
        PropertyValue::String(v) => {
            out.push(TAG_STRING);
            write_str(v, out);
        }
        PropertyValue::List(items) => {
            out.push(TAG_LIST);
            write_var_u64(items.len() as u64, out);
            for item in items {
                if !item.is_scalar() {
                    return Err(GraphError::unsupported(
                        key,
                        format!("{} is not allowed inside a list", item.kind()),
                    ));
                }
                write_value(item, key, out)?;
            }
        }
        PropertyValue::NodeRef(id) => {
            out.push(TAG_NODE_REF);
            write_var_i64(*id, out);
        }
    }
    Ok(())
}

fn write_str(s: &str, out: &mut Vec<u8>) {
    write_var_u64(s.len() as u64, out);
    out.extend_from_slice(s.as_bytes());
}

fn write_var_u64(mut v: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        } else {
            out.push(byte | 0x80);
        }
    }
}

fn write_var_i64(v: i64, out: &mut Vec<u8>) {
    let zigzag = ((v << 1) ^ (v >> 63)) as u64;
    write_var_u64(zigzag, out);
}

/// Cursor over a record that reports failures against the record's id
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    id: i64,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], id: i64) -> Self {
        Self { buf, pos: 0, id }
    }

    fn corrupt(&self, reason: impl Into<String>) -> GraphError {
        GraphError::corrupt(self.id, reason)
    }

    fn is_at_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| self.corrupt("record truncated"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| self.corrupt("record truncated"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn var_u64(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for _ in 0..10 {
            let byte = self.u8().map_err(|_| self.corrupt("varint truncated"))?;
            result |= u64::from(byte & 0x7f) << shift;
            if (byte & 0x80) == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(self.corrupt("varint too long"))
    }

    fn var_i64(&mut self) -> Result<i64> {
        let raw = self.var_u64()?;
        Ok(((raw >> 1) as i64) ^ (-((raw & 1) as i64)))
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        let v = self.var_u64()?;
        u32::try_from(v).map_err(|_| self.corrupt(format!("{what} out of range")))
    }

    /// A length prefix, bounded by the bytes left in the record
    fn len(&mut self, what: &str) -> Result<usize> {
        let v = self.var_u64()?;
        let remaining = (self.buf.len() - self.pos) as u64;
        if v > remaining {
            return Err(self.corrupt(format!("{what} {v} exceeds record size")));
        }
        Ok(v as usize)
    }

    fn str(&mut self) -> Result<&'a str> {
        let len = self.len("string length")?;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|_| self.corrupt("invalid UTF-8 in string"))
    }
}
