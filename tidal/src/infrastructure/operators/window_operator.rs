// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Window Operator
//!
//! Keyed tumbling/sliding window aggregation with thread-local
//! pre-aggregation. The operator comes in two parts:
//!
//! - `WindowOperatorHandler`: the long-lived state: one slice store per
//!   worker, the mutexed global slice store, two watermark processors (one
//!   over the feeding origins, one over the worker threads), and the result
//!   layout
//! - `WindowBuildStage`: the per-buffer stage: lifts records into the
//!   worker's local store, advances watermarks, merges closed slices into
//!   the global store, and emits finished windows
//!
//! ## Protocol per input buffer
//!
//! 1. Lift every record into the worker's local slice store (optionally
//!    fronted by a per-worker slice cache)
//! 2. Advance the local watermark to `max(record_ts) - allowed_lateness`
//!    and feed it, with the buffer's `(sequence, origin)`, to the
//!    multi-origin watermark processor
//! 3. If the effective watermark advanced: merge closed local slices into
//!    the global store, then feed the new watermark to the cross-thread
//!    processor keyed by the worker id
//! 4. If the cross-thread watermark advanced: materialize every window that
//!    completed in the interval and emit one result row per key, with the
//!    result buffer's watermark set to the new cross-thread watermark
//!
//! At a graceful end-of-stream every worker flushes its local store in the
//! broadcast's per-worker hook; the last worker then triggers all remaining
//! windows and emits them downstream. Hard and failure stops drop state.

use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

use tracing::{debug, trace};

use tidal_domain::{
    AggregationFunction, CachePolicy, CrossThreadWatermarkProcessor, EngineError, FieldValue,
    GlobalSliceStore, MemoryLayout, MultiOriginWatermarkProcessor, OriginId, ReconfigurationType,
    Schema, SequenceNumber, SliceCache, TerminationKind, ThreadLocalSliceStore, Watermark,
    WindowSpec, WorkerThreadId,
};

use crate::infrastructure::memory::tuple_buffer::TupleBuffer;
use crate::infrastructure::runtime::executable_plan::{ExecutablePipelineStage, OperatorHandler};
use crate::infrastructure::runtime::pipeline_execution_context::{
    ContinuationPolicy, PipelineExecutionContext,
};

/// Per-worker build-side state; each worker locks only its own slot.
struct WorkerWindowState {
    store: ThreadLocalSliceStore,
    /// Dense sequence for this worker's cross-thread watermark updates.
    cross_sequence: SequenceNumber,
    cache: Option<SliceCache<u64>>,
}

/// Long-lived window state shared by all workers of one query.
pub struct WindowOperatorHandler {
    window: WindowSpec,
    slice_size: u64,
    allowed_lateness: u64,
    aggregations: Vec<Arc<dyn AggregationFunction>>,
    origin_watermarks: MultiOriginWatermarkProcessor,
    cross_thread: CrossThreadWatermarkProcessor,
    per_worker: Vec<Mutex<WorkerWindowState>>,
    global: Mutex<GlobalSliceStore>,
    /// Highest watermark windows were triggered for.
    last_trigger: Mutex<u64>,
    result_layout: MemoryLayout,
}

impl WindowOperatorHandler {
    /// Builds the handler for a fixed origin set and worker count.
    ///
    /// The result schema is `(window_start, window_end, key, one column per
    /// aggregation)`; `result_schema` must match that arity.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        window: WindowSpec,
        slice_size: u64,
        allowed_lateness: u64,
        aggregations: Vec<Arc<dyn AggregationFunction>>,
        origins: Vec<OriginId>,
        worker_count: usize,
        result_schema: &Schema,
        buffer_size: usize,
        cache: Option<(CachePolicy, usize)>,
    ) -> Result<Arc<Self>, EngineError> {
        window.validate_slice_size(slice_size)?;
        if aggregations.is_empty() {
            return Err(EngineError::invalid_config("window needs at least one aggregation"));
        }
        if result_schema.field_count() != 3 + aggregations.len() {
            return Err(EngineError::InvalidSchema(format!(
                "window result schema has {} fields, expected {}",
                result_schema.field_count(),
                3 + aggregations.len()
            )));
        }
        let result_layout = MemoryLayout::for_schema(result_schema, buffer_size)?;
        let worker_count = worker_count.max(1);
        let per_worker = (0..worker_count)
            .map(|_| {
                Mutex::new(WorkerWindowState {
                    store: ThreadLocalSliceStore::new(slice_size),
                    cross_sequence: SequenceNumber::INITIAL,
                    cache: cache.map(|(policy, capacity)| SliceCache::new(policy, capacity)),
                })
            })
            .collect();
        Ok(Arc::new(Self {
            window,
            slice_size,
            allowed_lateness,
            aggregations,
            origin_watermarks: MultiOriginWatermarkProcessor::new(origins),
            cross_thread: CrossThreadWatermarkProcessor::new(
                (0..worker_count as u32).map(WorkerThreadId),
            ),
            per_worker,
            global: Mutex::new(GlobalSliceStore::new(slice_size)),
            last_trigger: Mutex::new(0),
            result_layout,
        }))
    }

    pub fn window(&self) -> WindowSpec {
        self.window
    }

    pub fn slice_size(&self) -> u64 {
        self.slice_size
    }

    /// Aggregate cache counters across workers, for metrics sampling.
    pub fn cache_counters(&self) -> tidal_domain::CacheCounters {
        let mut total = tidal_domain::CacheCounters::default();
        for slot in &self.per_worker {
            if let Some(cache) = &slot.lock().cache {
                let counters = cache.counters();
                total.hits += counters.hits;
                total.misses += counters.misses;
            }
        }
        total
    }

    /// Processes one input buffer on `worker`; the stage delegates here.
    fn consume_buffer(
        &self,
        worker: WorkerThreadId,
        buffer: &TupleBuffer,
        layout: &MemoryLayout,
        ts_field: usize,
        key_field: usize,
        value_field: usize,
        ctx: &mut PipelineExecutionContext<'_>,
    ) -> Result<(), EngineError> {
        let metadata = buffer.metadata();
        let origin = metadata
            .origin_id
            .ok_or_else(|| EngineError::internal("window input buffer without origin"))?;
        let sequence = metadata
            .sequence_number()
            .ok_or_else(|| EngineError::internal("window input buffer without sequence"))?;

        let slot = self
            .per_worker
            .get(worker.index())
            .ok_or_else(|| EngineError::internal(format!("no window state for {worker}")))?;
        let mut state = slot.lock();

        let tuples = metadata.number_of_tuples;
        let mut max_ts: u64 = 0;
        {
            let bytes = buffer.bytes();
            for row in 0..tuples {
                let ts = layout.read_value(&bytes, row, ts_field)?.as_u64()?;
                let key = layout.read_value(&bytes, row, key_field)?.as_u64()?;
                let value = layout.read_value(&bytes, row, value_field)?;
                max_ts = max_ts.max(ts);

                if let Some(cache) = state.cache.as_mut() {
                    // The cache fronts the slice lookup; on miss the store
                    // computes the slice and the cache learns its bounds.
                    // Results never depend on the outcome.
                    if cache.lookup(ts).is_none() {
                        let start = ts - ts % self.slice_size;
                        cache.insert(start, start + self.slice_size, start);
                    }
                }
                let slice = state.store.slice_for(ts)?;
                let states = slice.states_for(key, &self.aggregations);
                for (i, aggregation) in self.aggregations.iter().enumerate() {
                    aggregation.lift(&mut states[i], &value)?;
                }
            }
        }

        // Per-buffer watermark advance.
        let local_watermark = max_ts.saturating_sub(self.allowed_lateness);
        let update = self
            .origin_watermarks
            .update(Watermark(local_watermark), sequence, origin)?;
        let effective = update.current.0;
        if effective <= state.store.last_local_watermark() {
            return Ok(());
        }

        let closed = state.store.drain_closed(effective)?;
        if !closed.is_empty() {
            let mut global = self.global.lock();
            for slice in closed {
                global.merge(slice, &self.aggregations)?;
            }
        }
        state.store.set_last_local_watermark(effective);
        if let Some(cache) = state.cache.as_mut() {
            cache.invalidate_below(effective);
        }

        let cross_sequence = state.cross_sequence;
        state.cross_sequence = cross_sequence.next();
        // The merge above happened before this worker's watermark becomes
        // visible to the trigger, so triggered windows always see it.
        let cross = self.cross_thread.update(Watermark(effective), cross_sequence, worker)?;
        drop(state);

        if cross.advanced() {
            self.trigger_windows(cross.previous.0, cross.current.0, ctx)?;
        }
        Ok(())
    }

    /// Materializes and emits every window completed in `(w_old, w_new]`.
    fn trigger_windows(
        &self,
        w_old: u64,
        w_new: u64,
        ctx: &mut PipelineExecutionContext<'_>,
    ) -> Result<(), EngineError> {
        let windows = {
            let mut last = self.last_trigger.lock();
            let from = (*last).max(w_old);
            if w_new <= from {
                return Ok(());
            }
            *last = w_new;
            self.window.windows_between(from, w_new)
        };
        if windows.is_empty() {
            return Ok(());
        }

        let mut rows: Vec<Vec<FieldValue>> = Vec::new();
        {
            let mut global = self.global.lock();
            for bounds in &windows {
                let states = global.window_states(*bounds, &self.aggregations)?;
                global.mark_triggered(*bounds);
                for (key, partials) in states {
                    let mut row = Vec::with_capacity(3 + self.aggregations.len());
                    row.push(FieldValue::UInt64(bounds.start));
                    row.push(FieldValue::UInt64(bounds.end));
                    row.push(FieldValue::UInt64(key));
                    for (i, aggregation) in self.aggregations.iter().enumerate() {
                        row.push(aggregation.lower(&partials[i])?);
                    }
                    rows.push(row);
                }
            }
            let purged = global.purge_consumed(w_new, self.window.size());
            trace!(purged, w_new, "window slices purged");
        }

        debug!(windows = windows.len(), rows = rows.len(), w_old, w_new, "windows triggered");
        self.emit_rows(rows, Watermark(w_new), ctx)
    }

    fn emit_rows(
        &self,
        rows: Vec<Vec<FieldValue>>,
        watermark: Watermark,
        ctx: &mut PipelineExecutionContext<'_>,
    ) -> Result<(), EngineError> {
        let capacity = self.result_layout.capacity();
        for chunk in rows.chunks(capacity) {
            let out = ctx.allocate_buffer()?;
            {
                let mut bytes = out.bytes_mut();
                for (row, values) in chunk.iter().enumerate() {
                    self.result_layout.write_record(&mut bytes, row, values)?;
                }
            }
            out.set_number_of_tuples(chunk.len());
            out.set_watermark(watermark);
            ctx.emit_buffer(out, ContinuationPolicy::Possible)?;
        }
        Ok(())
    }

    /// Final flush at a graceful end-of-stream: every remaining window is
    /// triggered and emitted. The horizon extends past the last slice so
    /// that sliding windows reaching beyond it are included.
    fn flush_all(&self, ctx: &mut PipelineExecutionContext<'_>) -> Result<(), EngineError> {
        let Some(last_slice_end) = self.global.lock().max_end() else {
            return Ok(());
        };
        let horizon = last_slice_end + (self.window.size() - self.window.slide());
        let from = *self.last_trigger.lock();
        self.trigger_windows(from, horizon, ctx)
    }
}

impl OperatorHandler for WindowOperatorHandler {
    fn reconfigure(&self, rtype: ReconfigurationType, worker_id: WorkerThreadId) {
        // Graceful end-of-stream: each worker folds its local slices into
        // the global store. Hard and failure stops abandon local state.
        if rtype == ReconfigurationType::SoftEndOfStream {
            if let Some(slot) = self.per_worker.get(worker_id.index()) {
                let mut state = slot.lock();
                if let Ok(closed) = state.store.drain_closed(u64::MAX) {
                    if !closed.is_empty() {
                        let mut global = self.global.lock();
                        for slice in closed {
                            let _ = global.merge(slice, &self.aggregations);
                        }
                    }
                }
            }
        }
    }

    fn post_reconfiguration(
        &self,
        rtype: ReconfigurationType,
        ctx: &mut PipelineExecutionContext<'_>,
    ) -> Result<(), EngineError> {
        if rtype == ReconfigurationType::SoftEndOfStream {
            self.flush_all(ctx)?;
        }
        Ok(())
    }

    fn terminate(&self, kind: TerminationKind) -> Result<(), EngineError> {
        debug!(%kind, "window handler terminating");
        let mut global = self.global.lock();
        let purged = global.purge_consumed(u64::MAX, 0);
        trace!(purged, "window handler dropped remaining slices");
        Ok(())
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// The compiled build stage: reads `(ts, key, value)` fields through the
/// input layout and drives the handler protocol.
pub struct WindowBuildStage {
    handler_index: usize,
    input_layout: MemoryLayout,
    ts_field: usize,
    key_field: usize,
    value_field: usize,
}

impl WindowBuildStage {
    pub fn new(
        handler_index: usize,
        input_schema: &Schema,
        buffer_size: usize,
        ts_field: &str,
        key_field: &str,
        value_field: &str,
    ) -> Result<Self, EngineError> {
        let input_layout = MemoryLayout::for_schema(input_schema, buffer_size)?;
        let resolve = |name: &str| {
            input_schema
                .field_index(name)
                .ok_or_else(|| EngineError::InvalidSchema(format!("unknown field '{name}'")))
        };
        Ok(Self {
            handler_index,
            ts_field: resolve(ts_field)?,
            key_field: resolve(key_field)?,
            value_field: resolve(value_field)?,
            input_layout,
        })
    }
}

impl ExecutablePipelineStage for WindowBuildStage {
    fn execute(&self, buffer: TupleBuffer, ctx: &mut PipelineExecutionContext<'_>) -> Result<(), EngineError> {
        let handler: Arc<WindowOperatorHandler> = ctx.operator_handler(self.handler_index)?;
        let worker = ctx.worker_thread_id();
        handler.consume_buffer(
            worker,
            &buffer,
            &self.input_layout,
            self.ts_field,
            self.key_field,
            self.value_field,
            ctx,
        )
    }
}
