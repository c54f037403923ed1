//! Typed variable values.
//!
//! The core only knows typed scalars and vectors plus an opaque byte blob as
//! the "serializable" escape hatch; the host converts its own types at the
//! registry boundary.

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VarValue {
    Nil,
    Bool(bool),
    Int(i64),
    Real(f64),
    Vector2(Vec2),
    Vector3(Vec3),
    Bytes(Vec<u8>),
}

impl Default for VarValue {
    fn default() -> Self {
        VarValue::Nil
    }
}

impl VarValue {
    /// Compares two values under the configured float tolerance.
    ///
    /// Floats compare element-wise with an absolute tolerance; every other
    /// type compares exactly. Mismatched types are never equal.
    pub fn compare(&self, other: &VarValue, tolerance: f64) -> bool {
        match (self, other) {
            (VarValue::Nil, VarValue::Nil) => true,
            (VarValue::Bool(a), VarValue::Bool(b)) => a == b,
            (VarValue::Int(a), VarValue::Int(b)) => a == b,
            (VarValue::Real(a), VarValue::Real(b)) => (a - b).abs() <= tolerance,
            (VarValue::Vector2(a), VarValue::Vector2(b)) => {
                (a.x as f64 - b.x as f64).abs() <= tolerance
                    && (a.y as f64 - b.y as f64).abs() <= tolerance
            }
            (VarValue::Vector3(a), VarValue::Vector3(b)) => {
                (a.x as f64 - b.x as f64).abs() <= tolerance
                    && (a.y as f64 - b.y as f64).abs() <= tolerance
                    && (a.z as f64 - b.z as f64).abs() <= tolerance
            }
            (VarValue::Bytes(a), VarValue::Bytes(b)) => a == b,
            _ => false,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, VarValue::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            VarValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            VarValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            VarValue::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_vector2(&self) -> Option<Vec2> {
        match self {
            VarValue::Vector2(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_vector3(&self) -> Option<Vec3> {
        match self {
            VarValue::Vector3(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<bool> for VarValue {
    fn from(v: bool) -> Self {
        VarValue::Bool(v)
    }
}

impl From<i64> for VarValue {
    fn from(v: i64) -> Self {
        VarValue::Int(v)
    }
}

impl From<f64> for VarValue {
    fn from(v: f64) -> Self {
        VarValue::Real(v)
    }
}

impl From<f32> for VarValue {
    fn from(v: f32) -> Self {
        VarValue::Real(v as f64)
    }
}

impl From<Vec2> for VarValue {
    fn from(v: Vec2) -> Self {
        VarValue::Vector2(v)
    }
}

impl From<Vec3> for VarValue {
    fn from(v: Vec3) -> Self {
        VarValue::Vector3(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerance_applies_to_reals_only() {
        assert!(VarValue::Real(1.0).compare(&VarValue::Real(1.0005), 0.001));
        assert!(!VarValue::Real(1.0).compare(&VarValue::Real(1.01), 0.001));
        assert!(!VarValue::Int(1).compare(&VarValue::Int(2), 10.0));
    }

    #[test]
    fn vectors_compare_element_wise() {
        let a = VarValue::Vector3(Vec3::new(1.0, 2.0, 3.0));
        let b = VarValue::Vector3(Vec3::new(1.0005, 2.0, 3.0));
        assert!(a.compare(&b, 0.001));
        let c = VarValue::Vector3(Vec3::new(1.0, 2.5, 3.0));
        assert!(!a.compare(&c, 0.001));
    }

    #[test]
    fn mismatched_types_differ() {
        assert!(!VarValue::Bool(true).compare(&VarValue::Int(1), 0.0));
        assert!(!VarValue::Nil.compare(&VarValue::Bool(false), 0.0));
    }
}
