// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Common Test Helpers
//!
//! Shared fixtures for the integration suite: small engine configurations,
//! schemas, pass-through stages, and instrumented sinks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use tidal::infrastructure::memory::tuple_buffer::TupleBuffer;
use tidal::infrastructure::runtime::executable_plan::{DataSink, ExecutablePipelineStage};
use tidal::infrastructure::runtime::pipeline_execution_context::{
    ContinuationPolicy, PipelineExecutionContext,
};
use tidal::{
    DataType, EngineError, FieldValue, MemoryLayoutType, NodeEngine, Schema, TerminationKind,
    WorkerConfiguration,
};
use tidal_domain::{MemoryLayout, Watermark};

/// A compact engine configuration for tests.
pub fn test_config(workers: usize) -> WorkerConfiguration {
    WorkerConfiguration {
        number_of_buffers_in_global_pool: 256,
        number_of_buffers_per_source_local_pool: 8,
        number_of_buffers_per_worker: 8,
        buffer_size_bytes: 4096,
        number_of_worker_threads: workers,
        termination_deadline_secs: 10,
        ..Default::default()
    }
}

pub fn test_engine(workers: usize) -> Arc<NodeEngine> {
    NodeEngine::start(test_config(workers)).expect("engine starts")
}

/// The `(key, value, ts)` input schema most tests use.
pub fn input_schema() -> Schema {
    Schema::build(
        MemoryLayoutType::Row,
        [
            ("in$key", DataType::UInt64),
            ("in$value", DataType::Int64),
            ("in$ts", DataType::UInt64),
        ],
    )
    .expect("schema builds")
}

/// The `(window_start, window_end, key, sum)` window result schema.
pub fn window_result_schema() -> Schema {
    Schema::build(
        MemoryLayoutType::Row,
        [
            ("out$window_start", DataType::UInt64),
            ("out$window_end", DataType::UInt64),
            ("out$key", DataType::UInt64),
            ("out$sum", DataType::Int64),
        ],
    )
    .expect("schema builds")
}

/// Record constructor for the input schema.
pub fn record(key: u64, value: i64, ts: u64) -> Vec<FieldValue> {
    vec![FieldValue::UInt64(key), FieldValue::Int64(value), FieldValue::UInt64(ts)]
}

/// Forwards every buffer unchanged to all successors.
pub struct PassthroughStage;

impl ExecutablePipelineStage for PassthroughStage {
    fn execute(&self, buffer: TupleBuffer, ctx: &mut PipelineExecutionContext<'_>) -> Result<(), EngineError> {
        ctx.emit_buffer(buffer, ContinuationPolicy::Required)
    }
}

/// A stage that always fails, for error-propagation tests.
pub struct FailingStage;

impl ExecutablePipelineStage for FailingStage {
    fn execute(&self, _buffer: TupleBuffer, _ctx: &mut PipelineExecutionContext<'_>) -> Result<(), EngineError> {
        Err(EngineError::stage_execution("deliberate stage failure"))
    }
}

/// Decodes rows, remembers watermarks, and counts end-of-stream calls.
pub struct RecordingSink {
    layout: MemoryLayout,
    rows: Mutex<Vec<Vec<FieldValue>>>,
    watermarks: Mutex<Vec<Watermark>>,
    eos_calls: AtomicUsize,
    eos_kinds: Mutex<Vec<TerminationKind>>,
}

impl RecordingSink {
    pub fn new(schema: &Schema, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            layout: MemoryLayout::for_schema(schema, buffer_size).expect("layout builds"),
            rows: Mutex::new(Vec::new()),
            watermarks: Mutex::new(Vec::new()),
            eos_calls: AtomicUsize::new(0),
            eos_kinds: Mutex::new(Vec::new()),
        })
    }

    pub fn rows(&self) -> Vec<Vec<FieldValue>> {
        self.rows.lock().clone()
    }

    pub fn watermarks(&self) -> Vec<Watermark> {
        self.watermarks.lock().clone()
    }

    pub fn eos_calls(&self) -> usize {
        self.eos_calls.load(Ordering::Acquire)
    }

    pub fn eos_kinds(&self) -> Vec<TerminationKind> {
        self.eos_kinds.lock().clone()
    }
}

impl DataSink for RecordingSink {
    fn write(&self, buffer: TupleBuffer) -> Result<(), EngineError> {
        let bytes = buffer.bytes();
        let mut rows = self.rows.lock();
        for row in 0..buffer.number_of_tuples() {
            rows.push(self.layout.read_record(&bytes, row)?);
        }
        self.watermarks.lock().push(buffer.watermark());
        Ok(())
    }

    fn handle_end_of_stream(&self, kind: TerminationKind) -> Result<(), EngineError> {
        self.eos_calls.fetch_add(1, Ordering::AcqRel);
        self.eos_kinds.lock().push(kind);
        Ok(())
    }
}

/// Polls until `predicate` holds or the deadline passes.
pub fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}
