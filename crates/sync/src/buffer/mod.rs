//! Bit-packed, seekable typed buffer.
//!
//! Every value that crosses the wire goes through this buffer. The caller
//! records the exact `(type, compression level)` sequence used while writing
//! and mirrors it while reading; [`DataBuffer::size_in_bits`] is the
//! deterministic contract both sides rely on to reserve space.
//!
//! Reading past the end never fails: it returns the type default and latches
//! the [`DataBuffer::is_overflowed`] flag so the caller can reject the packet
//! afterwards.

mod bits;

pub use bits::BitArray;

use glam::{Vec2, Vec3};

use crate::value::VarValue;

/// Compression level of a primitive. `L0` is the widest encoding, `L3` the
/// most compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum CompressionLevel {
    L0 = 0,
    L1 = 1,
    L2 = 2,
    L3 = 3,
}

impl CompressionLevel {
    pub fn from_u8(v: u8) -> CompressionLevel {
        match v {
            0 => CompressionLevel::L0,
            1 => CompressionLevel::L1,
            2 => CompressionLevel::L2,
            _ => CompressionLevel::L3,
        }
    }
}

/// Data types understood by the buffer, used by the serialization schemes
/// and by `size_in_bits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DataType {
    Bool,
    Int,
    Uint,
    Real,
    PositiveUnitReal,
    UnitReal,
    Vector2,
    NormalizedVector2,
    Vector3,
    NormalizedVector3,
    Variant,
}

const fn int_bits(level: CompressionLevel) -> usize {
    match level {
        CompressionLevel::L0 => 64,
        CompressionLevel::L1 => 32,
        CompressionLevel::L2 => 16,
        CompressionLevel::L3 => 8,
    }
}

const fn real_bits(level: CompressionLevel) -> usize {
    match level {
        CompressionLevel::L0 => 64,
        CompressionLevel::L1 => 32,
        CompressionLevel::L2 => 16,
        CompressionLevel::L3 => 8,
    }
}

/// Quantization width for reals constrained to `[0, 1]`.
///
/// Worst case rounding error is half a step: ~0.05% at `L0` down to ~3% at
/// `L3`.
const fn unit_real_bits(level: CompressionLevel) -> usize {
    match level {
        CompressionLevel::L0 => 10,
        CompressionLevel::L1 => 8,
        CompressionLevel::L2 => 6,
        CompressionLevel::L3 => 4,
    }
}

/// Quantization width for packed angles used by the normalized vector
/// codecs.
const fn angle_bits(level: CompressionLevel) -> usize {
    match level {
        CompressionLevel::L0 => 16,
        CompressionLevel::L1 => 12,
        CompressionLevel::L2 => 10,
        CompressionLevel::L3 => 8,
    }
}

/// Variant type tags. 3 bits on the wire.
const TAG_NIL: u64 = 0;
const TAG_BOOL: u64 = 1;
const TAG_INT: u64 = 2;
const TAG_REAL: u64 = 3;
const TAG_VECTOR2: u64 = 4;
const TAG_VECTOR3: u64 = 5;
const TAG_BYTES: u64 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Write,
    Read,
}

/// Bit-aligned typed read/write buffer.
///
/// The buffer keeps a `metadata` prefix (sized in bits at `begin_write`)
/// distinct from the payload: `size()` reports payload bits only, matching
/// the input-record layout where a 1-bit `has_data` header precedes the
/// payload.
#[derive(Debug, Clone)]
pub struct DataBuffer {
    bits: BitArray,
    metadata_bits: usize,
    /// Bits in use beyond the metadata prefix.
    payload_bits: usize,
    cursor: usize,
    mode: Mode,
    overflowed: bool,
}

impl Default for DataBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl DataBuffer {
    pub fn new() -> Self {
        Self {
            bits: BitArray::new(),
            metadata_bits: 0,
            payload_bits: 0,
            cursor: 0,
            mode: Mode::Write,
            overflowed: false,
        }
    }

    /// Wraps raw bytes for reading; the payload spans the whole slice.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let bit_len = bytes.len() * 8;
        Self {
            bits: BitArray::from_bytes(bytes),
            metadata_bits: 0,
            payload_bits: bit_len,
            cursor: 0,
            mode: Mode::Read,
            overflowed: false,
        }
    }

    /// Wraps a bit array whose first `metadata_bits` bits are metadata and
    /// whose payload is `payload_bits` long.
    pub fn from_bit_array(bits: BitArray, metadata_bits: usize, payload_bits: usize) -> Self {
        Self {
            bits,
            metadata_bits,
            payload_bits,
            cursor: 0,
            mode: Mode::Read,
            overflowed: false,
        }
    }

    /// Resets the buffer for writing, reserving a metadata prefix.
    pub fn begin_write(&mut self, metadata_bits: usize) {
        self.bits.clear();
        self.metadata_bits = metadata_bits;
        self.payload_bits = 0;
        self.cursor = metadata_bits;
        self.mode = Mode::Write;
        self.overflowed = false;
        if metadata_bits > 0 {
            self.bits.resize_in_bits(metadata_bits);
        }
    }

    /// Rewinds the cursor and switches to read mode.
    pub fn begin_read(&mut self) {
        self.cursor = 0;
        self.mode = Mode::Read;
        self.overflowed = false;
    }

    /// Moves the cursor to an absolute bit offset (metadata included).
    pub fn seek(&mut self, bit: usize) {
        self.cursor = bit;
    }

    pub fn bit_offset(&self) -> usize {
        self.cursor
    }

    /// Payload size in bits, metadata excluded.
    pub fn size(&self) -> usize {
        self.payload_bits
    }

    pub fn metadata_size(&self) -> usize {
        self.metadata_bits
    }

    /// Total buffer span in bits, metadata included.
    pub fn total_bits(&self) -> usize {
        self.metadata_bits + self.payload_bits
    }

    /// True once any read ran past the valid payload.
    pub fn is_overflowed(&self) -> bool {
        self.overflowed
    }

    /// Re-frames this buffer: the region before `metadata_bits` becomes
    /// metadata and the payload is truncated to `payload_bits`.
    pub fn shrink_to(&mut self, metadata_bits: usize, payload_bits: usize) {
        self.metadata_bits = metadata_bits;
        self.payload_bits = payload_bits;
    }

    /// Trims the backing storage to the bytes actually in use.
    pub fn dry(&mut self) {
        self.bits.resize_in_bits(self.total_bits());
    }

    /// Copies out the used bytes.
    pub fn to_byte_vec(&self) -> Vec<u8> {
        let byte_len = self.total_bits().div_ceil(8);
        let mut out = self.bits.bytes().to_vec();
        out.resize(byte_len, 0);
        out
    }

    pub fn bit_array(&self) -> &BitArray {
        &self.bits
    }

    pub fn into_bit_array(self) -> BitArray {
        self.bits
    }

    fn write_bits(&mut self, value: u64, count: usize) -> usize {
        debug_assert!(self.mode == Mode::Write);
        self.bits.store(self.cursor, value, count);
        self.cursor += count;
        if self.cursor > self.metadata_bits {
            self.payload_bits = self.payload_bits.max(self.cursor - self.metadata_bits);
        }
        count
    }

    fn read_bits(&mut self, count: usize) -> u64 {
        if self.cursor + count > self.total_bits() {
            self.overflowed = true;
            self.cursor = self.total_bits();
            return 0;
        }
        let v = self.bits.read(self.cursor, count);
        self.cursor += count;
        v
    }

    // -- bool --

    pub fn add_bool(&mut self, value: bool) -> usize {
        self.write_bits(value as u64, 1)
    }

    pub fn read_bool(&mut self) -> bool {
        self.read_bits(1) != 0
    }

    // -- integers --

    pub fn add_int(&mut self, value: i64, level: CompressionLevel) -> usize {
        let bits = int_bits(level);
        let clamped = if bits == 64 {
            value
        } else {
            let max = (1i64 << (bits - 1)) - 1;
            let min = -(1i64 << (bits - 1));
            value.clamp(min, max)
        };
        self.write_bits(clamped as u64, bits)
    }

    pub fn read_int(&mut self, level: CompressionLevel) -> i64 {
        let bits = int_bits(level);
        let raw = self.read_bits(bits);
        if bits == 64 {
            raw as i64
        } else {
            // Sign extend.
            let shift = 64 - bits;
            ((raw << shift) as i64) >> shift
        }
    }

    pub fn add_uint(&mut self, value: u64, level: CompressionLevel) -> usize {
        let bits = int_bits(level);
        let clamped = if bits == 64 {
            value
        } else {
            value.min((1u64 << bits) - 1)
        };
        self.write_bits(clamped, bits)
    }

    pub fn read_uint(&mut self, level: CompressionLevel) -> u64 {
        self.read_bits(int_bits(level))
    }

    // -- reals --

    pub fn add_real(&mut self, value: f64, level: CompressionLevel) -> usize {
        match level {
            CompressionLevel::L0 => self.write_bits(value.to_bits(), 64),
            CompressionLevel::L1 => self.write_bits((value as f32).to_bits() as u64, 32),
            CompressionLevel::L2 => self.write_bits(encode_small_float(value as f32, 5, 10), 16),
            CompressionLevel::L3 => self.write_bits(encode_small_float(value as f32, 4, 3), 8),
        }
    }

    pub fn read_real(&mut self, level: CompressionLevel) -> f64 {
        match level {
            CompressionLevel::L0 => f64::from_bits(self.read_bits(64)),
            CompressionLevel::L1 => f32::from_bits(self.read_bits(32) as u32) as f64,
            CompressionLevel::L2 => decode_small_float(self.read_bits(16), 5, 10) as f64,
            CompressionLevel::L3 => decode_small_float(self.read_bits(8), 4, 3) as f64,
        }
    }

    // -- unit reals --

    pub fn add_positive_unit_real(&mut self, value: f32, level: CompressionLevel) -> usize {
        let bits = unit_real_bits(level);
        let max = ((1u64 << bits) - 1) as f32;
        let quantized = (value.clamp(0.0, 1.0) * max).round() as u64;
        self.write_bits(quantized, bits)
    }

    pub fn read_positive_unit_real(&mut self, level: CompressionLevel) -> f32 {
        let bits = unit_real_bits(level);
        let max = ((1u64 << bits) - 1) as f32;
        self.read_bits(bits) as f32 / max
    }

    pub fn add_unit_real(&mut self, value: f32, level: CompressionLevel) -> usize {
        let written = self.add_bool(value < 0.0);
        written + self.add_positive_unit_real(value.abs(), level)
    }

    pub fn read_unit_real(&mut self, level: CompressionLevel) -> f32 {
        let negative = self.read_bool();
        let v = self.read_positive_unit_real(level);
        if negative { -v } else { v }
    }

    // -- vectors --

    pub fn add_vector2(&mut self, value: Vec2, level: CompressionLevel) -> usize {
        self.add_real(value.x as f64, level) + self.add_real(value.y as f64, level)
    }

    pub fn read_vector2(&mut self, level: CompressionLevel) -> Vec2 {
        Vec2::new(self.read_real(level) as f32, self.read_real(level) as f32)
    }

    pub fn add_vector3(&mut self, value: Vec3, level: CompressionLevel) -> usize {
        self.add_real(value.x as f64, level)
            + self.add_real(value.y as f64, level)
            + self.add_real(value.z as f64, level)
    }

    pub fn read_vector3(&mut self, level: CompressionLevel) -> Vec3 {
        Vec3::new(
            self.read_real(level) as f32,
            self.read_real(level) as f32,
            self.read_real(level) as f32,
        )
    }

    /// Angle-packed unit vector. The input must already be normalized; the
    /// zero vector decodes as `(1, 0)`.
    pub fn add_normalized_vector2(&mut self, value: Vec2, level: CompressionLevel) -> usize {
        let bits = angle_bits(level);
        let angle = value.y.atan2(value.x);
        let unit = (angle + std::f32::consts::PI) / std::f32::consts::TAU;
        let max = ((1u64 << bits) - 1) as f32;
        self.write_bits((unit.clamp(0.0, 1.0) * max).round() as u64, bits)
    }

    pub fn read_normalized_vector2(&mut self, level: CompressionLevel) -> Vec2 {
        let bits = angle_bits(level);
        let max = ((1u64 << bits) - 1) as f32;
        let unit = self.read_bits(bits) as f32 / max;
        let angle = unit * std::f32::consts::TAU - std::f32::consts::PI;
        Vec2::new(angle.cos(), angle.sin())
    }

    /// Two angle-packed components (azimuth, elevation).
    pub fn add_normalized_vector3(&mut self, value: Vec3, level: CompressionLevel) -> usize {
        let bits = angle_bits(level);
        let max = ((1u64 << bits) - 1) as f32;

        let azimuth = value.z.atan2(value.x);
        let elevation = value.y.clamp(-1.0, 1.0).asin();

        let azimuth_unit = (azimuth + std::f32::consts::PI) / std::f32::consts::TAU;
        let elevation_unit = (elevation + std::f32::consts::FRAC_PI_2) / std::f32::consts::PI;

        self.write_bits((azimuth_unit.clamp(0.0, 1.0) * max).round() as u64, bits)
            + self.write_bits((elevation_unit.clamp(0.0, 1.0) * max).round() as u64, bits)
    }

    pub fn read_normalized_vector3(&mut self, level: CompressionLevel) -> Vec3 {
        let bits = angle_bits(level);
        let max = ((1u64 << bits) - 1) as f32;

        let azimuth = (self.read_bits(bits) as f32 / max) * std::f32::consts::TAU
            - std::f32::consts::PI;
        let elevation = (self.read_bits(bits) as f32 / max) * std::f32::consts::PI
            - std::f32::consts::FRAC_PI_2;

        let (sin_e, cos_e) = elevation.sin_cos();
        Vec3::new(cos_e * azimuth.cos(), sin_e, cos_e * azimuth.sin())
    }

    // -- strings / blobs --

    pub fn add_string(&mut self, value: &str) -> usize {
        self.add_bytes(value.as_bytes())
    }

    pub fn read_string(&mut self) -> String {
        String::from_utf8_lossy(&self.read_bytes()).into_owned()
    }

    pub fn add_bytes(&mut self, value: &[u8]) -> usize {
        let len = value.len().min(u16::MAX as usize);
        let mut written = self.write_bits(len as u64, 16);
        for b in &value[..len] {
            written += self.write_bits(*b as u64, 8);
        }
        written
    }

    pub fn read_bytes(&mut self) -> Vec<u8> {
        let len = self.read_bits(16) as usize;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            if self.overflowed {
                break;
            }
            out.push(self.read_bits(8) as u8);
        }
        out
    }

    // -- variants --

    pub fn add_variant(&mut self, value: &VarValue) -> usize {
        match value {
            VarValue::Nil => self.write_bits(TAG_NIL, 3),
            VarValue::Bool(v) => self.write_bits(TAG_BOOL, 3) + self.add_bool(*v),
            VarValue::Int(v) => self.write_bits(TAG_INT, 3) + self.add_int(*v, CompressionLevel::L0),
            VarValue::Real(v) => {
                self.write_bits(TAG_REAL, 3) + self.add_real(*v, CompressionLevel::L0)
            }
            VarValue::Vector2(v) => {
                self.write_bits(TAG_VECTOR2, 3) + self.add_vector2(*v, CompressionLevel::L1)
            }
            VarValue::Vector3(v) => {
                self.write_bits(TAG_VECTOR3, 3) + self.add_vector3(*v, CompressionLevel::L1)
            }
            VarValue::Bytes(v) => self.write_bits(TAG_BYTES, 3) + self.add_bytes(v),
        }
    }

    pub fn read_variant(&mut self) -> VarValue {
        match self.read_bits(3) {
            TAG_BOOL => VarValue::Bool(self.read_bool()),
            TAG_INT => VarValue::Int(self.read_int(CompressionLevel::L0)),
            TAG_REAL => VarValue::Real(self.read_real(CompressionLevel::L0)),
            TAG_VECTOR2 => VarValue::Vector2(self.read_vector2(CompressionLevel::L1)),
            TAG_VECTOR3 => VarValue::Vector3(self.read_vector3(CompressionLevel::L1)),
            TAG_BYTES => VarValue::Bytes(self.read_bytes()),
            _ => VarValue::Nil,
        }
    }

    /// Bits consumed by one value of `kind` at `level`, when fixed.
    ///
    /// `Variant` (and therefore anything containing strings or blobs) is
    /// length-prefixed and returns `None`.
    pub fn size_in_bits(kind: DataType, level: CompressionLevel) -> Option<usize> {
        match kind {
            DataType::Bool => Some(1),
            DataType::Int | DataType::Uint => Some(int_bits(level)),
            DataType::Real => Some(real_bits(level)),
            DataType::PositiveUnitReal => Some(unit_real_bits(level)),
            DataType::UnitReal => Some(unit_real_bits(level) + 1),
            DataType::Vector2 => Some(real_bits(level) * 2),
            DataType::Vector3 => Some(real_bits(level) * 3),
            DataType::NormalizedVector2 => Some(angle_bits(level)),
            DataType::NormalizedVector3 => Some(angle_bits(level) * 2),
            DataType::Variant => None,
        }
    }
}

/// Packs an `f32` into a small float with `exp_bits` exponent and `man_bits`
/// mantissa bits (IEEE-style, round to nearest).
fn encode_small_float(value: f32, exp_bits: u32, man_bits: u32) -> u64 {
    let bits = value.to_bits();
    let sign = (bits >> 31) as u64;
    let exp = ((bits >> 23) & 0xFF) as i32 - 127;
    let man = bits & 0x7F_FFFF;

    let bias = (1 << (exp_bits - 1)) - 1;
    let max_exp = (1 << exp_bits) - 1;

    let total_bits = 1 + exp_bits + man_bits;
    debug_assert!(total_bits <= 64);

    if value.is_nan() {
        return (sign << (exp_bits + man_bits)) | ((max_exp as u64) << man_bits) | 1;
    }
    if value.is_infinite() || exp + bias >= max_exp {
        // Overflow saturates to infinity.
        return (sign << (exp_bits + man_bits)) | ((max_exp as u64) << man_bits);
    }
    if exp + bias <= 0 {
        // Underflow flushes to signed zero; small-float subnormals are not
        // worth the bits at this precision.
        return sign << (exp_bits + man_bits);
    }

    let small_exp = (exp + bias) as u64;
    let small_man = (man >> (23 - man_bits)) as u64;
    (sign << (exp_bits + man_bits)) | (small_exp << man_bits) | small_man
}

fn decode_small_float(encoded: u64, exp_bits: u32, man_bits: u32) -> f32 {
    let sign = (encoded >> (exp_bits + man_bits)) & 1;
    let exp = ((encoded >> man_bits) & ((1 << exp_bits) - 1)) as i32;
    let man = encoded & ((1 << man_bits) - 1);

    let bias = (1 << (exp_bits - 1)) - 1;
    let max_exp = (1 << exp_bits) - 1;

    if exp == max_exp {
        let inf = if man == 0 { f32::INFINITY } else { f32::NAN };
        return if sign == 1 { -inf } else { inf };
    }
    if exp == 0 {
        return if sign == 1 { -0.0 } else { 0.0 };
    }

    let f32_exp = ((exp - bias + 127) as u32) << 23;
    let f32_man = (man as u32) << (23 - man_bits);
    f32::from_bits(((sign as u32) << 31) | f32_exp | f32_man)
}
