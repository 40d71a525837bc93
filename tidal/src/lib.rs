// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Tidal Stream Engine
//!
//! A single-node stream-processing execution engine. Compiled query plans
//! are registered with the node engine, driven by data sources, executed by
//! a worker pool over pooled tuple buffers, aggregated in watermark-driven
//! windows, joined over intervals, and shipped between nodes through
//! partition-addressed network transport.
//!
//! ## Layers
//!
//! - `application`: the `NodeEngine` facade and CLI use cases
//! - `infrastructure`: buffer pools, the query manager and its worker
//!   pool, operator handlers and stages, source drivers, the network
//!   transport, configuration, metrics, and logging
//! - `presentation`: string rendering for the command line
//!
//! The pure types and algorithms (schemas, layouts, watermark processing,
//! slice stores, caches, aggregation) live in the `tidal-domain` crate and
//! are re-exported where they form the engine's public vocabulary.
//!
//! ## Quick tour
//!
//! ```rust,ignore
//! let engine = NodeEngine::start(WorkerConfiguration::default())?;
//! let mut builder = engine.plan_builder(query_id);
//! // … add sources, pipelines, sinks …
//! let plan = builder.build()?;
//! engine.register_query(plan.clone(), sources)?;
//! engine.start_query(query_id)?;
//! engine.stop_query(query_id, TerminationKind::Graceful)?;
//! engine.unregister_query(query_id)?;
//! ```

pub mod application;
pub mod infrastructure;
pub mod presentation;

// The engine's public vocabulary from the domain layer.
pub use tidal_domain::{
    AggregationKind, DataType, EngineError, ExecutionStatus, FieldValue, MemoryLayoutType,
    OriginId, Partition, PipelineId, QueryId, Schema, StatisticsSnapshot, TerminationKind,
    Watermark, WindowSpec, WorkerThreadId,
};

pub use application::services::node_engine::NodeEngine;
pub use application::use_cases::run_benchmark::{run_benchmark, BenchmarkOptions, BenchmarkReport};
pub use infrastructure::config::engine_config::{QueryManagerMode, WorkerConfiguration};
