//! Scalar measurement values.

use crate::measurements::column::ColumnType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single image- or experiment-scope value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MeasurementValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl MeasurementValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MeasurementValue::Integer(v) => Some(*v as f64),
            MeasurementValue::Float(v) => Some(*v),
            MeasurementValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MeasurementValue::Integer(v) => Some(*v),
            MeasurementValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            MeasurementValue::Float(_) => None,
            MeasurementValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Equality that treats two NaN floats as the same value.
    pub fn same_as(&self, other: &MeasurementValue) -> bool {
        match (self, other) {
            (MeasurementValue::Float(a), MeasurementValue::Float(b)) => {
                a == b || (a.is_nan() && b.is_nan())
            }
            _ => self == other,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MeasurementValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Column type a value of this shape is stored as when no column was
    /// declared for it.
    pub fn inferred_type(&self) -> ColumnType {
        match self {
            MeasurementValue::Integer(_) => ColumnType::Integer,
            MeasurementValue::Float(_) => ColumnType::Float,
            MeasurementValue::Text(_) => ColumnType::varchar(),
        }
    }

    /// Whether this value can be stored in a column of `column_type`.
    pub fn fits(&self, column_type: ColumnType) -> bool {
        match (self, column_type) {
            (MeasurementValue::Text(s), ColumnType::Varchar(len)) => s.len() <= len,
            (MeasurementValue::Text(_), _) => false,
            (MeasurementValue::Float(_), ColumnType::Integer) => false,
            _ => true,
        }
    }
}

impl fmt::Display for MeasurementValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementValue::Integer(v) => write!(f, "{}", v),
            MeasurementValue::Float(v) => write!(f, "{}", v),
            MeasurementValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for MeasurementValue {
    fn from(v: i64) -> Self {
        MeasurementValue::Integer(v)
    }
}

impl From<i32> for MeasurementValue {
    fn from(v: i32) -> Self {
        MeasurementValue::Integer(v as i64)
    }
}

impl From<u32> for MeasurementValue {
    fn from(v: u32) -> Self {
        MeasurementValue::Integer(v as i64)
    }
}

impl From<f64> for MeasurementValue {
    fn from(v: f64) -> Self {
        MeasurementValue::Float(v)
    }
}

impl From<&str> for MeasurementValue {
    fn from(v: &str) -> Self {
        MeasurementValue::Text(v.to_string())
    }
}

impl From<String> for MeasurementValue {
    fn from(v: String) -> Self {
        MeasurementValue::Text(v)
    }
}
