// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Memory Layouts
//!
//! This module provides the typed accessors that map `(row_index,
//! field_index)` to byte offsets inside a tuple buffer, for both row and
//! column arrangements.
//!
//! ## Overview
//!
//! - **Row layout**: a record's cells are contiguous;
//!   `offset = row_index * tuple_size + field_offset`
//! - **Column layout**: a field's cells are contiguous;
//!   `offset = column_start + row_index * field_size`
//!
//! Offsets are precomputed per field when the layout is built from a schema
//! and a buffer size. On the access path there is a single bounds check per
//! record index; field positions are resolved by array indexing, never by a
//! name lookup.
//!
//! ## Variable-sized fields
//!
//! A `Varsized` field's fixed cell holds a `u32` child-buffer index. The
//! payload itself is stored in the child buffer as a `u32` length followed by
//! the bytes; attaching and resolving child buffers is the tuple buffer's
//! job, the layout only reads and writes the index cell.
//!
//! All cells are little-endian, matching the network frame encoding.

use crate::value_objects::data_type::{DataType, FieldValue};
use crate::value_objects::schema::{MemoryLayoutType, Schema};
use crate::EngineError;

/// Precomputed offset table for one schema inside one buffer size.
#[derive(Debug, Clone)]
pub struct MemoryLayout {
    schema: Schema,
    layout_type: MemoryLayoutType,
    tuple_size: usize,
    capacity: usize,
    field_sizes: Vec<usize>,
    field_types: Vec<DataType>,
    /// Row layout: offset of each field within a record.
    /// Column layout: start of each field's column run.
    field_starts: Vec<usize>,
}

impl MemoryLayout {
    /// Builds the layout for `schema` inside buffers of `buffer_size` bytes.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidSchema` when not even one record fits.
    pub fn for_schema(schema: &Schema, buffer_size: usize) -> Result<Self, EngineError> {
        let tuple_size = schema.size_in_bytes();
        if tuple_size == 0 || tuple_size > buffer_size {
            return Err(EngineError::InvalidSchema(format!(
                "record of {tuple_size} bytes does not fit a {buffer_size}-byte buffer"
            )));
        }
        let capacity = buffer_size / tuple_size;
        let field_sizes: Vec<usize> = schema.fields().iter().map(|f| f.data_type().fixed_size()).collect();
        let field_types: Vec<DataType> = schema.fields().iter().map(|f| f.data_type()).collect();

        let field_starts = match schema.layout_type() {
            MemoryLayoutType::Row => {
                let mut offsets = Vec::with_capacity(field_sizes.len());
                let mut acc = 0usize;
                for size in &field_sizes {
                    offsets.push(acc);
                    acc += size;
                }
                offsets
            }
            MemoryLayoutType::Column => {
                let mut starts = Vec::with_capacity(field_sizes.len());
                let mut acc = 0usize;
                for size in &field_sizes {
                    starts.push(acc);
                    acc += size * capacity;
                }
                starts
            }
        };

        Ok(Self {
            layout_type: schema.layout_type(),
            schema: schema.clone(),
            tuple_size,
            capacity,
            field_sizes,
            field_types,
            field_starts,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn layout_type(&self) -> MemoryLayoutType {
        self.layout_type
    }

    /// Bytes of one record's fixed cells.
    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    /// Records that fit one buffer under this layout.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The single bounds check on the access path.
    #[inline]
    fn check_row(&self, row: usize) -> Result<(), EngineError> {
        if row >= self.capacity {
            return Err(EngineError::BufferAccess(format!(
                "row {row} out of bounds (capacity {})",
                self.capacity
            )));
        }
        Ok(())
    }

    /// Byte offset of `(row, field)`; arithmetic only, no lookups.
    #[inline]
    fn cell_offset(&self, row: usize, field: usize) -> usize {
        match self.layout_type {
            MemoryLayoutType::Row => row * self.tuple_size + self.field_starts[field],
            MemoryLayoutType::Column => self.field_starts[field] + row * self.field_sizes[field],
        }
    }

    #[inline]
    fn cell<'a>(&self, bytes: &'a [u8], row: usize, field: usize) -> &'a [u8] {
        let offset = self.cell_offset(row, field);
        &bytes[offset..offset + self.field_sizes[field]]
    }

    #[inline]
    fn cell_mut<'a>(&self, bytes: &'a mut [u8], row: usize, field: usize) -> &'a mut [u8] {
        let offset = self.cell_offset(row, field);
        &mut bytes[offset..offset + self.field_sizes[field]]
    }

    #[inline]
    fn check_type(&self, field: usize, expected: DataType) -> Result<(), EngineError> {
        let actual = self.field_types[field];
        if actual != expected {
            return Err(EngineError::BufferAccess(format!(
                "field {field} is {actual}, accessed as {expected}"
            )));
        }
        Ok(())
    }

    /// Reads a `u64` cell.
    pub fn read_u64(&self, bytes: &[u8], row: usize, field: usize) -> Result<u64, EngineError> {
        self.check_row(row)?;
        self.check_type(field, DataType::UInt64)?;
        let cell = self.cell(bytes, row, field);
        Ok(u64::from_le_bytes(cell.try_into().map_err(|_| {
            EngineError::BufferAccess("truncated u64 cell".into())
        })?))
    }

    /// Writes a `u64` cell.
    pub fn write_u64(&self, bytes: &mut [u8], row: usize, field: usize, value: u64) -> Result<(), EngineError> {
        self.check_row(row)?;
        self.check_type(field, DataType::UInt64)?;
        self.cell_mut(bytes, row, field).copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Reads an `i64` cell.
    pub fn read_i64(&self, bytes: &[u8], row: usize, field: usize) -> Result<i64, EngineError> {
        self.check_row(row)?;
        self.check_type(field, DataType::Int64)?;
        let cell = self.cell(bytes, row, field);
        Ok(i64::from_le_bytes(cell.try_into().map_err(|_| {
            EngineError::BufferAccess("truncated i64 cell".into())
        })?))
    }

    /// Writes an `i64` cell.
    pub fn write_i64(&self, bytes: &mut [u8], row: usize, field: usize, value: i64) -> Result<(), EngineError> {
        self.check_row(row)?;
        self.check_type(field, DataType::Int64)?;
        self.cell_mut(bytes, row, field).copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Reads the child-buffer index cell of a varsized field.
    pub fn read_child_index(&self, bytes: &[u8], row: usize, field: usize) -> Result<u32, EngineError> {
        self.check_row(row)?;
        self.check_type(field, DataType::Varsized)?;
        let cell = self.cell(bytes, row, field);
        Ok(u32::from_le_bytes(cell.try_into().map_err(|_| {
            EngineError::BufferAccess("truncated child-index cell".into())
        })?))
    }

    /// Writes the child-buffer index cell of a varsized field.
    pub fn write_child_index(&self, bytes: &mut [u8], row: usize, field: usize, child: u32) -> Result<(), EngineError> {
        self.check_row(row)?;
        self.check_type(field, DataType::Varsized)?;
        self.cell_mut(bytes, row, field).copy_from_slice(&child.to_le_bytes());
        Ok(())
    }

    /// Reads a cell dynamically, widening to the `FieldValue` currency.
    pub fn read_value(&self, bytes: &[u8], row: usize, field: usize) -> Result<FieldValue, EngineError> {
        self.check_row(row)?;
        let cell = self.cell(bytes, row, field);
        let value = match self.field_types[field] {
            DataType::Int8 => FieldValue::Int64(cell[0] as i8 as i64),
            DataType::Int16 => FieldValue::Int64(i16::from_le_bytes([cell[0], cell[1]]) as i64),
            DataType::Int32 => {
                FieldValue::Int64(i32::from_le_bytes([cell[0], cell[1], cell[2], cell[3]]) as i64)
            }
            DataType::Int64 => FieldValue::Int64(i64::from_le_bytes(cell.try_into().unwrap())),
            DataType::UInt8 => FieldValue::UInt64(cell[0] as u64),
            DataType::UInt16 => FieldValue::UInt64(u16::from_le_bytes([cell[0], cell[1]]) as u64),
            DataType::UInt32 => {
                FieldValue::UInt64(u32::from_le_bytes([cell[0], cell[1], cell[2], cell[3]]) as u64)
            }
            DataType::UInt64 => FieldValue::UInt64(u64::from_le_bytes(cell.try_into().unwrap())),
            DataType::Float32 => {
                FieldValue::Float64(f32::from_le_bytes([cell[0], cell[1], cell[2], cell[3]]) as f64)
            }
            DataType::Float64 => FieldValue::Float64(f64::from_le_bytes(cell.try_into().unwrap())),
            DataType::Bool => FieldValue::Bool(cell[0] != 0),
            DataType::Char => FieldValue::Char(cell[0]),
            DataType::Varsized => {
                FieldValue::UInt64(u32::from_le_bytes(cell.try_into().unwrap()) as u64)
            }
            DataType::Undefined => {
                return Err(EngineError::BufferAccess("undefined field type".into()));
            }
        };
        Ok(value)
    }

    /// Writes a cell dynamically, narrowing from the `FieldValue` currency.
    ///
    /// # Errors
    /// Returns `EngineError::BufferAccess` when the value does not coerce to
    /// the field's type.
    pub fn write_value(
        &self,
        bytes: &mut [u8],
        row: usize,
        field: usize,
        value: &FieldValue,
    ) -> Result<(), EngineError> {
        self.check_row(row)?;
        let ty = self.field_types[field];
        let offset = self.cell_offset(row, field);
        let cell = &mut bytes[offset..offset + self.field_sizes[field]];
        match ty {
            DataType::Int8 => cell.copy_from_slice(&(value.as_i64()? as i8).to_le_bytes()),
            DataType::Int16 => cell.copy_from_slice(&(value.as_i64()? as i16).to_le_bytes()),
            DataType::Int32 => cell.copy_from_slice(&(value.as_i64()? as i32).to_le_bytes()),
            DataType::Int64 => cell.copy_from_slice(&value.as_i64()?.to_le_bytes()),
            DataType::UInt8 => cell.copy_from_slice(&(value.as_u64()? as u8).to_le_bytes()),
            DataType::UInt16 => cell.copy_from_slice(&(value.as_u64()? as u16).to_le_bytes()),
            DataType::UInt32 => cell.copy_from_slice(&(value.as_u64()? as u32).to_le_bytes()),
            DataType::UInt64 => cell.copy_from_slice(&value.as_u64()?.to_le_bytes()),
            DataType::Float32 => match value {
                FieldValue::Float64(v) => cell.copy_from_slice(&(*v as f32).to_le_bytes()),
                other => cell.copy_from_slice(&(other.as_i64()? as f32).to_le_bytes()),
            },
            DataType::Float64 => match value {
                FieldValue::Float64(v) => cell.copy_from_slice(&v.to_le_bytes()),
                other => cell.copy_from_slice(&(other.as_i64()? as f64).to_le_bytes()),
            },
            DataType::Bool => {
                cell[0] = match value {
                    FieldValue::Bool(b) => *b as u8,
                    other => (other.as_i64()? != 0) as u8,
                }
            }
            DataType::Char => {
                cell[0] = match value {
                    FieldValue::Char(c) => *c,
                    other => other.as_u64()? as u8,
                }
            }
            DataType::Varsized => cell.copy_from_slice(&(value.as_u64()? as u32).to_le_bytes()),
            DataType::Undefined => {
                return Err(EngineError::BufferAccess("undefined field type".into()));
            }
        }
        Ok(())
    }

    /// Reads a whole record as dynamic values.
    pub fn read_record(&self, bytes: &[u8], row: usize) -> Result<Vec<FieldValue>, EngineError> {
        self.check_row(row)?;
        (0..self.field_types.len())
            .map(|field| self.read_value(bytes, row, field))
            .collect()
    }

    /// Writes a whole record from dynamic values.
    ///
    /// # Errors
    /// Returns `EngineError::BufferAccess` on arity mismatch or value
    /// coercion failure.
    pub fn write_record(&self, bytes: &mut [u8], row: usize, values: &[FieldValue]) -> Result<(), EngineError> {
        if values.len() != self.field_types.len() {
            return Err(EngineError::BufferAccess(format!(
                "record arity {} does not match schema arity {}",
                values.len(),
                self.field_types.len()
            )));
        }
        self.check_row(row)?;
        for (field, value) in values.iter().enumerate() {
            self.write_value(bytes, row, field, value)?;
        }
        Ok(())
    }
}

/// Encodes a varsized payload as stored inside a child buffer: `u32` length
/// followed by the bytes.
pub fn encode_varsized(payload: &[u8], out: &mut [u8]) -> Result<usize, EngineError> {
    let needed = 4 + payload.len();
    if out.len() < needed {
        return Err(EngineError::BufferAccess(format!(
            "varsized payload of {} bytes does not fit child buffer of {} bytes",
            payload.len(),
            out.len()
        )));
    }
    out[..4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    out[4..needed].copy_from_slice(payload);
    Ok(needed)
}

/// Decodes a varsized payload from a child buffer region.
pub fn decode_varsized(bytes: &[u8]) -> Result<&[u8], EngineError> {
    if bytes.len() < 4 {
        return Err(EngineError::BufferAccess("truncated varsized header".into()));
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    bytes
        .get(4..4 + len)
        .ok_or_else(|| EngineError::BufferAccess("truncated varsized payload".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_objects::schema::Schema;
    use proptest::prelude::*;

    fn row_layout() -> MemoryLayout {
        let schema = Schema::build(
            MemoryLayoutType::Row,
            [
                ("s$key", DataType::UInt64),
                ("s$value", DataType::Int64),
                ("s$flag", DataType::Bool),
            ],
        )
        .unwrap();
        MemoryLayout::for_schema(&schema, 4096).unwrap()
    }

    fn column_layout() -> MemoryLayout {
        let schema = Schema::build(
            MemoryLayoutType::Column,
            [
                ("s$key", DataType::UInt64),
                ("s$value", DataType::Int64),
                ("s$flag", DataType::Bool),
            ],
        )
        .unwrap();
        MemoryLayout::for_schema(&schema, 4096).unwrap()
    }

    #[test]
    fn test_capacity_from_buffer_size() {
        let layout = row_layout();
        assert_eq!(layout.tuple_size(), 17);
        assert_eq!(layout.capacity(), 4096 / 17);
    }

    #[test]
    fn test_row_and_column_round_trip_bit_equal() {
        for layout in [row_layout(), column_layout()] {
            let mut bytes = vec![0u8; 4096];
            layout.write_u64(&mut bytes, 3, 0, 0xDEAD_BEEF).unwrap();
            layout.write_i64(&mut bytes, 3, 1, -42).unwrap();
            layout.write_value(&mut bytes, 3, 2, &FieldValue::Bool(true)).unwrap();

            assert_eq!(layout.read_u64(&bytes, 3, 0).unwrap(), 0xDEAD_BEEF);
            assert_eq!(layout.read_i64(&bytes, 3, 1).unwrap(), -42);
            assert_eq!(layout.read_value(&bytes, 3, 2).unwrap(), FieldValue::Bool(true));
        }
    }

    #[test]
    fn test_row_bounds_check() {
        let layout = row_layout();
        let mut bytes = vec![0u8; 4096];
        let out_of_bounds = layout.capacity();
        assert!(layout.write_u64(&mut bytes, out_of_bounds, 0, 1).is_err());
        assert!(layout.read_u64(&bytes, out_of_bounds, 0).is_err());
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let layout = row_layout();
        let mut bytes = vec![0u8; 4096];
        // Field 1 is Int64; accessing it as UInt64 is a caller bug.
        assert!(layout.write_u64(&mut bytes, 0, 1, 1).is_err());
    }

    #[test]
    fn test_column_layout_keeps_rows_separate() {
        let layout = column_layout();
        let mut bytes = vec![0u8; 4096];
        for row in 0..10 {
            layout.write_u64(&mut bytes, row, 0, row as u64 * 100).unwrap();
        }
        for row in 0..10 {
            assert_eq!(layout.read_u64(&bytes, row, 0).unwrap(), row as u64 * 100);
        }
    }

    #[test]
    fn test_varsized_child_encoding() {
        let payload = b"hello stream";
        let mut child = vec![0u8; 64];
        let used = encode_varsized(payload, &mut child).unwrap();
        assert_eq!(used, 4 + payload.len());
        assert_eq!(decode_varsized(&child).unwrap(), payload);
    }

    #[test]
    fn test_varsized_rejects_overflow() {
        let mut child = vec![0u8; 8];
        assert!(encode_varsized(b"way too long for eight", &mut child).is_err());
    }

    #[test]
    fn test_record_too_large_for_buffer() {
        let schema = Schema::build(MemoryLayoutType::Row, [("s$a", DataType::Int64)]).unwrap();
        assert!(MemoryLayout::for_schema(&schema, 4).is_err());
    }

    proptest! {
        /// Writing a record and reading it back through the same layout
        /// returns the same values, for any row inside capacity.
        #[test]
        fn prop_record_round_trip(key in any::<u64>(), value in any::<i64>(), row in 0usize..240) {
            let layout = row_layout();
            let mut bytes = vec![0u8; 4096];
            let record = vec![FieldValue::UInt64(key), FieldValue::Int64(value), FieldValue::Bool(key % 2 == 0)];
            layout.write_record(&mut bytes, row, &record).unwrap();
            prop_assert_eq!(layout.read_record(&bytes, row).unwrap(), record);
        }
    }
}
