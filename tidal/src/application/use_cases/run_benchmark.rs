// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Benchmark Use Case
//!
//! Deploys a self-contained windowed-aggregation query over the generator
//! source and runs it to completion: generator → keyed tumbling-sum window
//! → collecting sink. This is the binary's smoke workload; it exercises
//! the full path from source driver through the worker pool, thread-local
//! pre-aggregation, watermark-driven triggering, and graceful end-of-stream
//! flush, and reports what came out the other end.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

use tidal_domain::{
    aggregation_for, AggregationKind, DataType, EngineError, ExecutionStatus, FieldValue,
    MemoryLayout, MemoryLayoutType, OriginId, PipelineId, QueryId, Schema, TerminationKind,
    WindowSpec,
};

use crate::application::services::node_engine::NodeEngine;
use crate::infrastructure::memory::tuple_buffer::TupleBuffer;
use crate::infrastructure::operators::window_operator::{WindowBuildStage, WindowOperatorHandler};
use crate::infrastructure::runtime::executable_plan::{DataSink, SinkId, SuccessorTarget};
use crate::infrastructure::sources::generator_source::GeneratorSource;
use crate::infrastructure::sources::managed_source::ManagedSource;

/// Parameters of the benchmark query.
#[derive(Debug, Clone)]
pub struct BenchmarkOptions {
    pub query_id: u64,
    pub buffers_to_produce: u64,
    pub tuples_per_buffer: usize,
    pub distinct_keys: u64,
    pub window_size_ms: u64,
    /// Event-time distance between consecutive records.
    pub timestamp_step_ms: u64,
    pub completion_deadline: Duration,
}

impl Default for BenchmarkOptions {
    fn default() -> Self {
        Self {
            query_id: 1,
            buffers_to_produce: 64,
            tuples_per_buffer: 100,
            distinct_keys: 8,
            window_size_ms: 1000,
            timestamp_step_ms: 1,
            completion_deadline: Duration::from_secs(30),
        }
    }
}

/// What the benchmark produced.
#[derive(Debug, Clone)]
pub struct BenchmarkReport {
    pub produced_buffers: u64,
    pub produced_tuples: u64,
    pub window_rows: Vec<Vec<FieldValue>>,
    pub elapsed: Duration,
}

/// A sink collecting decoded result rows in memory.
pub struct CollectingSink {
    layout: MemoryLayout,
    rows: Mutex<Vec<Vec<FieldValue>>>,
}

impl CollectingSink {
    pub fn new(schema: &Schema, buffer_size: usize) -> Result<Arc<Self>, EngineError> {
        Ok(Arc::new(Self {
            layout: MemoryLayout::for_schema(schema, buffer_size)?,
            rows: Mutex::new(Vec::new()),
        }))
    }

    pub fn rows(&self) -> Vec<Vec<FieldValue>> {
        self.rows.lock().clone()
    }
}

impl DataSink for CollectingSink {
    fn write(&self, buffer: TupleBuffer) -> Result<(), EngineError> {
        let bytes = buffer.bytes();
        let mut rows = self.rows.lock();
        for row in 0..buffer.number_of_tuples() {
            rows.push(self.layout.read_record(&bytes, row)?);
        }
        Ok(())
    }
}

/// Runs the benchmark query on `engine` and reports the outcome.
pub fn run_benchmark(engine: &Arc<NodeEngine>, options: BenchmarkOptions) -> Result<BenchmarkReport, EngineError> {
    let begin = Instant::now();
    let buffer_size = engine.config().buffer_size_bytes;
    let worker_count = engine.config().number_of_worker_threads;

    let input_schema = Schema::build(
        MemoryLayoutType::Row,
        [
            ("bench$key", DataType::UInt64),
            ("bench$value", DataType::Int64),
            ("bench$ts", DataType::UInt64),
        ],
    )?;
    let result_schema = Schema::build(
        MemoryLayoutType::Row,
        [
            ("bench$window_start", DataType::UInt64),
            ("bench$window_end", DataType::UInt64),
            ("bench$key", DataType::UInt64),
            ("bench$sum", DataType::Int64),
        ],
    )?;

    let query_id = QueryId::new(options.query_id)?;
    let origin = OriginId::new(options.query_id)?;
    let build_pipeline = PipelineId::new(1)?;
    let sink_id = SinkId(1);

    let window = WindowSpec::tumbling(options.window_size_ms)?;
    let handler = WindowOperatorHandler::new(
        window,
        options.window_size_ms,
        0,
        vec![aggregation_for(AggregationKind::Sum)],
        vec![origin],
        worker_count,
        &result_schema,
        buffer_size,
        None,
    )?;
    let sink = CollectingSink::new(&result_schema, buffer_size)?;

    let mut builder = engine.plan_builder(query_id);
    let handler_index = builder.add_operator_handler(handler);
    let plan = builder
        .add_source(origin, vec![SuccessorTarget::Pipeline(build_pipeline)])
        .add_pipeline(
            build_pipeline,
            Arc::new(WindowBuildStage::new(
                handler_index,
                &input_schema,
                buffer_size,
                "bench$ts",
                "bench$key",
                "bench$value",
            )?),
            vec![SuccessorTarget::Sink(sink_id)],
            vec![handler_index],
        )
        .add_sink(sink_id, sink.clone())
        .build()?;

    let keys = options.distinct_keys.max(1);
    let step = options.timestamp_step_ms.max(1);
    let generator = GeneratorSource::new(
        &input_schema,
        buffer_size,
        options.tuples_per_buffer,
        2,
        Duration::ZERO,
        Box::new(move |i| {
            vec![
                FieldValue::UInt64(i % keys),
                FieldValue::Int64((i % 100) as i64),
                FieldValue::UInt64(i * step),
            ]
        }),
    )?;
    let runner = engine.create_source_runner(
        origin,
        Box::new(generator),
        &plan,
        options.buffers_to_produce,
    )?;

    engine.register_query(Arc::clone(&plan), vec![runner as Arc<dyn ManagedSource>])?;
    engine.start_query(query_id)?;

    // The generator exhausts itself; wait for the natural completion.
    let deadline = Instant::now() + options.completion_deadline;
    loop {
        match engine.query_status(query_id) {
            Some(status) if status.is_terminal() => break,
            Some(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(20)),
            Some(_) => {
                engine.stop_query(query_id, TerminationKind::Hard)?;
                break;
            }
            None => {
                return Err(EngineError::QueryNotFound(format!("query {query_id}")));
            }
        }
    }
    if engine.query_status(query_id) == Some(ExecutionStatus::Failed) {
        return Err(EngineError::stage_execution("benchmark query failed"));
    }

    let statistics = engine
        .statistics(query_id)
        .ok_or_else(|| EngineError::QueryNotFound(format!("query {query_id}")))?;
    engine.sample_metrics();
    let window_rows = sink.rows();
    engine.unregister_query(query_id)?;

    let report = BenchmarkReport {
        produced_buffers: statistics.processed_buffers,
        produced_tuples: statistics.processed_tuples,
        window_rows,
        elapsed: begin.elapsed(),
    };
    info!(
        buffers = report.produced_buffers,
        tuples = report.produced_tuples,
        windows = report.window_rows.len(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "benchmark finished"
    );
    Ok(report)
}
