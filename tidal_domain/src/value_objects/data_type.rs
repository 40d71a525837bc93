// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Field Data Types
//!
//! This module provides the physical data types a schema field can take and
//! the dynamically-typed `FieldValue` used when records are constructed or
//! inspected outside compiled stages.
//!
//! ## Overview
//!
//! The type system is deliberately flat: fixed-width integers, floats, bool,
//! char, and a variable-sized byte type. Each fixed-width type knows its
//! exact on-buffer size, which makes schema sizes and layout offsets
//! deterministic. `Varsized` fields occupy a fixed 4-byte cell in the parent
//! buffer holding a child-buffer index; the payload itself lives in the child
//! buffer as a length-prefixed byte run.
//!
//! `Undefined` exists only as the type of not-yet-bound expressions in plan
//! descriptors; a schema containing an `Undefined` field is rejected at
//! registration.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::EngineError;

/// Physical type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Bool,
    Char,
    /// Variable-sized bytes; the fixed cell stores a child-buffer index.
    Varsized,
    /// Placeholder for unbound plan expressions; invalid inside a schema.
    Undefined,
}

impl DataType {
    /// Size in bytes of the fixed cell this type occupies inside a buffer.
    ///
    /// `Varsized` occupies 4 bytes (the child-buffer index). `Undefined` has
    /// no size; callers must validate schemas before asking.
    pub fn fixed_size(&self) -> usize {
        match self {
            DataType::Int8 | DataType::UInt8 | DataType::Bool | DataType::Char => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 | DataType::Varsized => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
            DataType::Undefined => 0,
        }
    }

    /// Whether values of this type are stored inline in the parent buffer.
    pub fn is_fixed_width(&self) -> bool {
        !matches!(self, DataType::Varsized | DataType::Undefined)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::Int8
                | DataType::Int16
                | DataType::Int32
                | DataType::Int64
                | DataType::UInt8
                | DataType::UInt16
                | DataType::UInt32
                | DataType::UInt64
                | DataType::Float32
                | DataType::Float64
        )
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::UInt8 => "uint8",
            DataType::UInt16 => "uint16",
            DataType::UInt32 => "uint32",
            DataType::UInt64 => "uint64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::Bool => "bool",
            DataType::Char => "char",
            DataType::Varsized => "varsized",
            DataType::Undefined => "undefined",
        };
        f.write_str(name)
    }
}

/// Dynamically-typed field value.
///
/// Compiled stages read and write raw cells through the memory layouts; the
/// dynamic representation is used at the edges: record construction in
/// sources and tests, join predicates, and aggregation inputs/outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    Bool(bool),
    Char(u8),
    Bytes(Vec<u8>),
    Null,
}

impl FieldValue {
    /// Numeric view as `i64`, the common currency of aggregation inputs.
    ///
    /// # Errors
    /// Returns `EngineError::BufferAccess` for non-numeric values.
    pub fn as_i64(&self) -> Result<i64, EngineError> {
        match self {
            FieldValue::Int64(v) => Ok(*v),
            FieldValue::UInt64(v) => Ok(*v as i64),
            FieldValue::Float64(v) => Ok(*v as i64),
            FieldValue::Bool(v) => Ok(*v as i64),
            FieldValue::Char(v) => Ok(*v as i64),
            other => Err(EngineError::BufferAccess(format!(
                "cannot read {other:?} as i64"
            ))),
        }
    }

    /// Numeric view as `u64`, used for keys and timestamps.
    pub fn as_u64(&self) -> Result<u64, EngineError> {
        match self {
            FieldValue::UInt64(v) => Ok(*v),
            FieldValue::Int64(v) if *v >= 0 => Ok(*v as u64),
            FieldValue::Int64(v) => Err(EngineError::BufferAccess(format!(
                "negative value {v} cannot be read as u64"
            ))),
            other => Err(EngineError::BufferAccess(format!(
                "cannot read {other:?} as u64"
            ))),
        }
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int64(v) => write!(f, "{v}"),
            FieldValue::UInt64(v) => write!(f, "{v}"),
            FieldValue::Float64(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Char(v) => write!(f, "{}", *v as char),
            FieldValue::Bytes(b) => write!(f, "bytes[{}]", b.len()),
            FieldValue::Null => f.write_str("null"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_sizes_are_deterministic() {
        assert_eq!(DataType::Int8.fixed_size(), 1);
        assert_eq!(DataType::UInt16.fixed_size(), 2);
        assert_eq!(DataType::Float32.fixed_size(), 4);
        assert_eq!(DataType::Int64.fixed_size(), 8);
        // Varsized occupies the 4-byte child index cell.
        assert_eq!(DataType::Varsized.fixed_size(), 4);
    }

    #[test]
    fn test_undefined_is_not_fixed_width() {
        assert!(!DataType::Undefined.is_fixed_width());
        assert!(!DataType::Varsized.is_fixed_width());
        assert!(DataType::Bool.is_fixed_width());
    }

    #[test]
    fn test_field_value_numeric_views() {
        assert_eq!(FieldValue::Int64(-3).as_i64().unwrap(), -3);
        assert_eq!(FieldValue::UInt64(9).as_u64().unwrap(), 9);
        assert!(FieldValue::Int64(-1).as_u64().is_err());
        assert!(FieldValue::Bytes(vec![1]).as_i64().is_err());
    }
}
