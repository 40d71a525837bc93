// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Record Schemas
//!
//! A `Schema` is an ordered sequence of typed fields together with a declared
//! memory layout (row or column). Schemas describe the shape of every tuple
//! buffer that flows between pipeline stages; the memory layouts in
//! `services::memory_layout` are derived from them.
//!
//! ## Overview
//!
//! - **Qualified names**: Fields carry fully-qualified names of the form
//!   `stream$field`; qualification keeps field references unambiguous after
//!   joins merge two sides into one output schema
//! - **Deterministic sizing**: `size_in_bytes()` is computed from the field
//!   types alone, so layouts on different nodes agree byte-for-byte
//! - **Validation**: Field names are checked against a conservative
//!   identifier grammar, duplicates and `Undefined`-typed fields are rejected
//!
//! ## Usage
//!
//! ```rust,ignore
//! let schema = Schema::build(MemoryLayoutType::Row, [
//!     ("input$key", DataType::UInt64),
//!     ("input$value", DataType::Int64),
//!     ("input$ts", DataType::UInt64),
//! ])?;
//! assert_eq!(schema.size_in_bytes(), 24);
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::sync::OnceLock;

use crate::value_objects::data_type::DataType;
use crate::EngineError;

/// Declared physical arrangement of records inside a tuple buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLayoutType {
    /// Tuples stored contiguously: `row_index * tuple_size + field_offset`.
    Row,
    /// Fields stored contiguously: `column_start + row_index * field_size`.
    Column,
}

/// One typed, named field of a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    name: String,
    data_type: DataType,
    nullable: bool,
}

fn field_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // `stream$field` or a bare identifier for intermediate results.
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\$[A-Za-z_][A-Za-z0-9_]*)?$").unwrap()
    })
}

impl Field {
    /// Creates a field, validating the (optionally qualified) name.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidSchema` for malformed names or the
    /// `Undefined` data type.
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Result<Self, EngineError> {
        let name = name.into();
        if !field_name_pattern().is_match(&name) {
            return Err(EngineError::InvalidSchema(format!(
                "field name '{name}' is not a valid (qualified) identifier"
            )));
        }
        if data_type == DataType::Undefined {
            return Err(EngineError::InvalidSchema(format!(
                "field '{name}' has undefined type"
            )));
        }
        Ok(Self { name, data_type, nullable })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// The unqualified part of the field name.
    pub fn local_name(&self) -> &str {
        self.name.rsplit('$').next().unwrap_or(&self.name)
    }
}

impl Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.data_type)
    }
}

/// Ordered, validated sequence of fields with a declared layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    layout: MemoryLayoutType,
    fields: Vec<Field>,
}

impl Schema {
    /// Creates a schema from pre-built fields.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidSchema` when the schema is empty or two
    /// fields share a name.
    pub fn new(layout: MemoryLayoutType, fields: Vec<Field>) -> Result<Self, EngineError> {
        if fields.is_empty() {
            return Err(EngineError::InvalidSchema("schema has no fields".into()));
        }
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(EngineError::InvalidSchema(format!(
                    "duplicate field name '{}'",
                    field.name
                )));
            }
        }
        Ok(Self { layout, fields })
    }

    /// Convenience constructor from `(name, type)` pairs, non-nullable.
    pub fn build<'a, I>(layout: MemoryLayoutType, fields: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = (&'a str, DataType)>,
    {
        let fields = fields
            .into_iter()
            .map(|(name, ty)| Field::new(name, ty, false))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(layout, fields)
    }

    pub fn layout_type(&self) -> MemoryLayoutType {
        self.layout
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Index of the field with the given (qualified or local) name.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .or_else(|| self.fields.iter().position(|f| f.local_name() == name))
    }

    /// Bytes one record occupies, summed over the fixed field cells.
    ///
    /// Deterministic from the field types: varsized fields count their
    /// 4-byte child-index cell, the payload lives in child buffers.
    pub fn size_in_bytes(&self) -> usize {
        self.fields.iter().map(|f| f.data_type.fixed_size()).sum()
    }

    /// Whether any field stores its payload in a child buffer.
    pub fn has_varsized_fields(&self) -> bool {
        self.fields.iter().any(|f| f.data_type == DataType::Varsized)
    }

    /// A new schema with every field re-qualified under `prefix`.
    ///
    /// Used when a join merges both input schemas into one output schema.
    pub fn requalified(&self, prefix: &str) -> Result<Schema, EngineError> {
        let fields = self
            .fields
            .iter()
            .map(|f| Field::new(format!("{prefix}${}", f.local_name()), f.data_type, f.nullable))
            .collect::<Result<Vec<_>, _>>()?;
        Schema::new(self.layout, fields)
    }
}

impl Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Schema[{:?}](", self.layout)?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{field}")?;
        }
        f.write_str(")")
    }
}
