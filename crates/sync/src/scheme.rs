//! Declarative serialization schemes.
//!
//! A scheme is the ordered `(type, compression level, default)` recipe for a
//! fixed sequence of values, registered once under a [`SchemeId`]. Hosts use
//! schemes to encode controller inputs and trickled payloads without writing
//! codec code by hand: every entry is preceded by a 1-bit "is default"
//! marker, so idle inputs compress to a handful of bits.

use glam::{Vec2, Vec3};

use crate::buffer::{CompressionLevel, DataBuffer, DataType};
use crate::value::VarValue;

#[derive(Debug, Clone)]
pub struct SchemeEntry {
    pub kind: DataType,
    pub level: CompressionLevel,
    pub default: VarValue,
}

impl SchemeEntry {
    pub fn new(kind: DataType, level: CompressionLevel, default: VarValue) -> Self {
        Self {
            kind,
            level,
            default,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SerializationScheme {
    entries: Vec<SchemeEntry>,
}

impl SerializationScheme {
    pub fn new(entries: Vec<SchemeEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[SchemeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Worst-case encoded size: the "is default" bit plus the full payload
    /// of every entry. `None` when any entry is variable-length.
    pub fn max_size_in_bits(&self) -> Option<usize> {
        let mut total = 0;
        for entry in &self.entries {
            total += 1 + DataBuffer::size_in_bits(entry.kind, entry.level)?;
        }
        Some(total)
    }

    /// Encodes `values` (one per entry, missing entries fall back to the
    /// default) into `buffer` at its current cursor.
    pub fn encode(&self, values: &[VarValue], buffer: &mut DataBuffer) {
        for (i, entry) in self.entries.iter().enumerate() {
            let value = values.get(i).unwrap_or(&entry.default);
            let is_default = value.compare(&entry.default, 0.0);
            buffer.add_bool(is_default);
            if !is_default {
                encode_value(entry, value, buffer);
            }
        }
    }

    /// Decodes one value per entry from `buffer` at its current cursor.
    pub fn decode(&self, buffer: &mut DataBuffer) -> Vec<VarValue> {
        let mut out = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            if buffer.read_bool() {
                out.push(entry.default.clone());
            } else {
                out.push(decode_value(entry, buffer));
            }
        }
        out
    }

    /// Bits one encoded record occupies in `buffer`, starting at its current
    /// cursor. The cursor is left where it started.
    pub fn count_bits(&self, buffer: &mut DataBuffer) -> usize {
        let start = buffer.bit_offset();
        let _ = self.decode(buffer);
        let bits = buffer.bit_offset() - start;
        buffer.seek(start);
        bits
    }

    /// True when the two encoded records decode to different value
    /// sequences. Reads both buffers from their current cursors.
    pub fn are_different(&self, a: &mut DataBuffer, b: &mut DataBuffer) -> bool {
        let va = self.decode(a);
        let vb = self.decode(b);
        va.iter()
            .zip(vb.iter())
            .any(|(x, y)| !x.compare(y, 0.0))
    }
}

fn encode_value(entry: &SchemeEntry, value: &VarValue, buffer: &mut DataBuffer) {
    match entry.kind {
        DataType::Bool => {
            buffer.add_bool(value.as_bool().unwrap_or(false));
        }
        DataType::Int => {
            buffer.add_int(value.as_int().unwrap_or(0), entry.level);
        }
        DataType::Uint => {
            buffer.add_uint(value.as_int().unwrap_or(0).max(0) as u64, entry.level);
        }
        DataType::Real => {
            buffer.add_real(value.as_real().unwrap_or(0.0), entry.level);
        }
        DataType::PositiveUnitReal => {
            buffer.add_positive_unit_real(value.as_real().unwrap_or(0.0) as f32, entry.level);
        }
        DataType::UnitReal => {
            buffer.add_unit_real(value.as_real().unwrap_or(0.0) as f32, entry.level);
        }
        DataType::Vector2 => {
            buffer.add_vector2(value.as_vector2().unwrap_or(Vec2::ZERO), entry.level);
        }
        DataType::NormalizedVector2 => {
            buffer.add_normalized_vector2(value.as_vector2().unwrap_or(Vec2::X), entry.level);
        }
        DataType::Vector3 => {
            buffer.add_vector3(value.as_vector3().unwrap_or(Vec3::ZERO), entry.level);
        }
        DataType::NormalizedVector3 => {
            buffer.add_normalized_vector3(value.as_vector3().unwrap_or(Vec3::X), entry.level);
        }
        DataType::Variant => {
            buffer.add_variant(value);
        }
    }
}

fn decode_value(entry: &SchemeEntry, buffer: &mut DataBuffer) -> VarValue {
    match entry.kind {
        DataType::Bool => VarValue::Bool(buffer.read_bool()),
        DataType::Int => VarValue::Int(buffer.read_int(entry.level)),
        DataType::Uint => VarValue::Int(buffer.read_uint(entry.level) as i64),
        DataType::Real => VarValue::Real(buffer.read_real(entry.level)),
        DataType::PositiveUnitReal => {
            VarValue::Real(buffer.read_positive_unit_real(entry.level) as f64)
        }
        DataType::UnitReal => VarValue::Real(buffer.read_unit_real(entry.level) as f64),
        DataType::Vector2 => VarValue::Vector2(buffer.read_vector2(entry.level)),
        DataType::NormalizedVector2 => VarValue::Vector2(buffer.read_normalized_vector2(entry.level)),
        DataType::Vector3 => VarValue::Vector3(buffer.read_vector3(entry.level)),
        DataType::NormalizedVector3 => VarValue::Vector3(buffer.read_normalized_vector3(entry.level)),
        DataType::Variant => buffer.read_variant(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn movement_scheme() -> SerializationScheme {
        SerializationScheme::new(vec![
            SchemeEntry::new(
                DataType::NormalizedVector2,
                CompressionLevel::L1,
                VarValue::Vector2(Vec2::X),
            ),
            SchemeEntry::new(DataType::Bool, CompressionLevel::L0, VarValue::Bool(false)),
            SchemeEntry::new(DataType::Real, CompressionLevel::L2, VarValue::Real(0.0)),
        ])
    }

    #[test]
    fn defaults_compress_to_marker_bits() {
        let scheme = movement_scheme();
        let mut db = DataBuffer::new();
        db.begin_write(0);
        scheme.encode(&[], &mut db);
        assert_eq!(db.size(), 3);
    }

    #[test]
    fn roundtrip_non_default_values() {
        let scheme = movement_scheme();
        let values = vec![
            VarValue::Vector2(Vec2::new(0.0, 1.0)),
            VarValue::Bool(true),
            VarValue::Real(2.5),
        ];

        let mut db = DataBuffer::new();
        db.begin_write(0);
        scheme.encode(&values, &mut db);
        db.begin_read();
        let decoded = scheme.decode(&mut db);

        assert!(decoded[0].compare(&values[0], 0.01));
        assert_eq!(decoded[1], values[1]);
        assert!(decoded[2].compare(&values[2], 0.01));
    }

    #[test]
    fn count_bits_restores_cursor() {
        let scheme = movement_scheme();
        let mut db = DataBuffer::new();
        db.begin_write(0);
        scheme.encode(&[VarValue::Vector2(Vec2::Y)], &mut db);
        db.begin_read();
        let bits = scheme.count_bits(&mut db);
        assert_eq!(db.bit_offset(), 0);
        assert_eq!(bits, db.size());
    }

    #[test]
    fn are_different_detects_changes() {
        let scheme = movement_scheme();

        let mut a = DataBuffer::new();
        a.begin_write(0);
        scheme.encode(&[], &mut a);

        let mut b = DataBuffer::new();
        b.begin_write(0);
        scheme.encode(&[VarValue::Vector2(Vec2::Y), VarValue::Bool(true)], &mut b);

        a.begin_read();
        b.begin_read();
        assert!(scheme.are_different(&mut a, &mut b));

        a.begin_read();
        let mut a2 = a.clone();
        a2.begin_read();
        assert!(!scheme.are_different(&mut a, &mut a2));
    }
}
