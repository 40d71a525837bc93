// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Value Objects
//!
//! Immutable, validated values of the stream engine: identifiers, sequence
//! numbers, timestamps and watermarks, data types, schemas, network
//! partitions, window specifications, and buffer metadata. Value objects are
//! compared by value, never by identity, and construction is the only place
//! validation happens.

pub mod buffer_metadata;
pub mod data_type;
pub mod identifiers;
pub mod partition;
pub mod schema;
pub mod sequence;
pub mod timestamp;
pub mod window_spec;
pub mod worker_count;

pub use buffer_metadata::BufferMetadata;
pub use data_type::{DataType, FieldValue};
pub use identifiers::{OriginId, PipelineId, QueryId, WorkerThreadId};
pub use partition::{NodeLocation, Partition};
pub use schema::{Field, MemoryLayoutType, Schema};
pub use sequence::{ChunkNumber, SequenceData, SequenceNumber};
pub use timestamp::{Timestamp, Watermark};
pub use window_spec::{WindowBounds, WindowSpec};
pub use worker_count::WorkerCount;
