// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Tidal Domain Layer
//!
//! Pure, reusable stream-processing logic for the Tidal engine: the types
//! and algorithms that define *what* the engine computes, free of threads,
//! I/O, and the async runtime. The engine crate composes these pieces into
//! the running system.
//!
//! ## Layer contents
//!
//! - **Value objects**: strongly-typed identifiers, sequence numbers,
//!   timestamps/watermarks, data types and schemas, network partitions,
//!   window specifications, buffer metadata
//! - **Entities**: the query lifecycle state machine and per-query
//!   statistics counters
//! - **Events**: in-band stream events and the reconfiguration vocabulary
//! - **Services**: memory layouts over raw buffer bytes, the
//!   lift/combine/lower aggregation algebra, contiguous-prefix watermark
//!   processing, thread-local and global slice stores, bounded cache
//!   policies, and paged vectors for the join engine
//!
//! ## Design rules
//!
//! - No `tokio`, no `tracing`, no I/O: everything here is deterministic
//!   computation testable without a runtime
//! - All failures are `EngineError`; no panics on reachable paths
//! - Concurrency discipline is documented per type; the only synchronization
//!   primitive used is the watermark processor's short `std::sync::Mutex`
//!   critical section

pub mod entities;
pub mod error;
pub mod events;
pub mod services;
pub mod value_objects;

pub use error::EngineError;

pub use entities::{ExecutionStatus, QueryStatistics, StatisticsSnapshot, TerminationKind, TerminationResult};
pub use events::{ReconfigurationType, StreamEvent};
pub use services::{
    aggregation_for, AggregateState, AggregationFunction, AggregationKind, CacheCounters,
    CachePolicy, CrossThreadWatermarkProcessor, GlobalSliceStore, KeyedSlice, MemoryLayout,
    MultiOriginWatermarkProcessor, PagedVector, SliceCache, SliceState, ThreadLocalSliceStore,
    WatermarkProcessor, WatermarkUpdate,
};
pub use value_objects::{
    BufferMetadata, ChunkNumber, DataType, Field, FieldValue, MemoryLayoutType, NodeLocation,
    OriginId, Partition, PipelineId, QueryId, Schema, SequenceData, SequenceNumber, Timestamp,
    Watermark, WindowBounds, WindowSpec, WorkerCount, WorkerThreadId,
};
