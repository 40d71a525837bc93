// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Interval Join
//!
//! Build-probe join over per-interval paged vectors. The handler keeps one
//! `Interval` per tumbling window of the interval size; each interval owns
//! a left-side paged vector and one right-side paged vector per worker.
//! Build stages append records to the interval covering their timestamp;
//! when the watermark (minimum across both feeding origins) passes an
//! interval's end, the build side emits a trigger task carrying the
//! interval id toward the probe pipeline.
//!
//! The probe resolves the interval, consolidates the left side into its
//! first page, scans every right-side vector per left row, evaluates the
//! predicate, and hands joined records `(interval_start, interval_end,
//! left fields, right fields)` to its successors. The probed interval is
//! marked for deletion and removed.
//!
//! ## Right-side retention
//!
//! Right rows are additionally retained per worker so that an interval
//! created late (its first left row arriving after right rows already
//! passed) still sees them. At the end of each probe, if the smallest live
//! interval start moved past the last cleanup mark, retention vectors are
//! rebuilt, dropping rows older than the new expiration.
//!
//! Predicate faults are fatal to the query: a failed predicate evaluation
//! cannot be recovered into correct output.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use tidal_domain::{
    EngineError, FieldValue, MemoryLayout, MultiOriginWatermarkProcessor, OriginId, PagedVector,
    ReconfigurationType, Schema, TerminationKind, Watermark, WorkerThreadId,
};

use crate::infrastructure::memory::tuple_buffer::TupleBuffer;
use crate::infrastructure::runtime::executable_plan::{ExecutablePipelineStage, OperatorHandler};
use crate::infrastructure::runtime::pipeline_execution_context::{
    ContinuationPolicy, PipelineExecutionContext,
};

/// Which input stream a build stage feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinSide {
    Left,
    Right,
}

/// Join predicate over dynamic left/right records.
pub type JoinPredicate =
    Arc<dyn Fn(&[FieldValue], &[FieldValue]) -> Result<bool, EngineError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntervalState {
    Open,
    MarkedForDeletion,
}

/// One tumbling interval's build state.
struct Interval {
    start: u64,
    end: u64,
    state: IntervalState,
    left: PagedVector<Vec<FieldValue>>,
    right: Vec<PagedVector<Vec<FieldValue>>>,
    trigger_sent: bool,
}

impl Interval {
    fn new(start: u64, end: u64, worker_count: usize, page_capacity: usize) -> Self {
        Self {
            start,
            end,
            state: IntervalState::Open,
            left: PagedVector::new(page_capacity),
            right: (0..worker_count).map(|_| PagedVector::new(page_capacity)).collect(),
            trigger_sent: false,
        }
    }
}

/// Retained right rows per worker: `(timestamp, record)`.
type RetainedRows = PagedVector<(u64, Vec<FieldValue>)>;

/// Long-lived interval-join state shared by all workers of one query.
pub struct IntervalJoinHandler {
    interval_size: u64,
    page_capacity: usize,
    worker_count: usize,
    predicate: JoinPredicate,
    left_ts_field: usize,
    right_ts_field: usize,
    watermarks: MultiOriginWatermarkProcessor,
    intervals: Mutex<BTreeMap<u64, Interval>>,
    retained_right: Vec<Mutex<RetainedRows>>,
    latest_right_clean_ts: Mutex<u64>,
    /// Build pipelines that have not yet delivered their graceful EoS; the
    /// final flush waits for the last one, otherwise the side still running
    /// would find its intervals already probed.
    build_eos_remaining: std::sync::atomic::AtomicUsize,
    output_layout: MemoryLayout,
}

impl IntervalJoinHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        interval_size: u64,
        left_schema: &Schema,
        right_schema: &Schema,
        left_ts_field: &str,
        right_ts_field: &str,
        predicate: JoinPredicate,
        origins: Vec<OriginId>,
        worker_count: usize,
        buffer_size: usize,
        page_capacity: usize,
        build_pipeline_count: usize,
    ) -> Result<Arc<Self>, EngineError> {
        if interval_size == 0 {
            return Err(EngineError::invalid_config("interval size must be positive"));
        }
        let left_ts = left_schema
            .field_index(left_ts_field)
            .ok_or_else(|| EngineError::InvalidSchema(format!("unknown left field '{left_ts_field}'")))?;
        let right_ts = right_schema
            .field_index(right_ts_field)
            .ok_or_else(|| EngineError::InvalidSchema(format!("unknown right field '{right_ts_field}'")))?;

        let output_schema = joined_schema(left_schema, right_schema)?;
        let output_layout = MemoryLayout::for_schema(&output_schema, buffer_size)?;
        let worker_count = worker_count.max(1);
        Ok(Arc::new(Self {
            interval_size,
            page_capacity: page_capacity.max(1),
            worker_count,
            predicate,
            left_ts_field: left_ts,
            right_ts_field: right_ts,
            watermarks: MultiOriginWatermarkProcessor::new(origins),
            intervals: Mutex::new(BTreeMap::new()),
            retained_right: (0..worker_count)
                .map(|_| Mutex::new(PagedVector::new(page_capacity.max(1))))
                .collect(),
            latest_right_clean_ts: Mutex::new(0),
            build_eos_remaining: std::sync::atomic::AtomicUsize::new(build_pipeline_count.max(1)),
            output_layout,
        }))
    }

    pub fn output_schema(&self) -> &Schema {
        self.output_layout.schema()
    }

    pub fn interval_count(&self) -> usize {
        self.intervals.lock().len()
    }

    /// Appends one left record, creating its interval on demand. Intervals
    /// exist only once a left row defines them; a freshly created interval
    /// is seeded with the retained right rows falling inside it.
    fn append_left(&self, ts: u64, record: Vec<FieldValue>) -> Result<(), EngineError> {
        let start = ts - ts % self.interval_size;
        // Records behind the effective watermark target intervals that were
        // already probed; re-creating those would replay retained rows.
        if start + self.interval_size <= self.watermarks.current_watermark().0 {
            trace!(start, ts, "late left record behind watermark dropped");
            return Ok(());
        }
        let mut intervals = self.intervals.lock();
        if !intervals.contains_key(&start) {
            let mut fresh =
                Interval::new(start, start + self.interval_size, self.worker_count, self.page_capacity);
            // Right rows that arrived before this interval existed.
            for slot in &self.retained_right {
                for (row_ts, row) in slot.lock().iter() {
                    if *row_ts >= fresh.start && *row_ts < fresh.end {
                        fresh.right[0].push(row.clone());
                    }
                }
            }
            intervals.insert(start, fresh);
        }
        let interval = intervals.get_mut(&start).expect("just ensured");
        interval.left.push(record);
        Ok(())
    }

    /// Stores one right record: into the covering interval when it already
    /// exists, and always into this worker's retention vector so intervals
    /// created later still see it. An existing interval is never re-seeded,
    /// so the two stores cannot double-count.
    fn append_right(&self, worker: WorkerThreadId, ts: u64, record: Vec<FieldValue>) {
        let start = ts - ts % self.interval_size;
        {
            let mut intervals = self.intervals.lock();
            if let Some(interval) = intervals.get_mut(&start) {
                if interval.state == IntervalState::Open {
                    interval.right[worker.index()].push(record.clone());
                }
            }
        }
        self.retained_right[worker.index()].lock().push((ts, record));
    }

    /// Emits trigger tasks for every interval the watermark has passed.
    fn emit_ready_triggers(
        &self,
        watermark: u64,
        ctx: &mut PipelineExecutionContext<'_>,
    ) -> Result<(), EngineError> {
        let ready: Vec<u64> = {
            let mut intervals = self.intervals.lock();
            intervals
                .values_mut()
                .filter(|interval| {
                    interval.end <= watermark
                        && interval.state == IntervalState::Open
                        && !interval.trigger_sent
                })
                .map(|interval| {
                    interval.trigger_sent = true;
                    interval.start
                })
                .collect()
        };
        for interval_id in ready {
            let trigger = ctx.allocate_buffer()?;
            {
                let mut bytes = trigger.bytes_mut();
                bytes[..8].copy_from_slice(&interval_id.to_le_bytes());
            }
            trigger.set_number_of_tuples(1);
            trigger.set_watermark(Watermark(watermark));
            debug!(interval_id, watermark, "interval trigger emitted");
            ctx.emit_buffer(trigger, ContinuationPolicy::Required)?;
        }
        Ok(())
    }

    /// The probe: nested-loop join of one interval, then deletion and
    /// right-side retention cleanup.
    fn probe(&self, interval_id: u64, ctx: &mut PipelineExecutionContext<'_>) -> Result<(), EngineError> {
        let interval = {
            let mut intervals = self.intervals.lock();
            match intervals.get_mut(&interval_id) {
                Some(interval) => {
                    interval.state = IntervalState::MarkedForDeletion;
                    intervals.remove(&interval_id)
                }
                None => {
                    warn!(interval_id, "trigger for unknown interval");
                    return Ok(());
                }
            }
        };
        let Some(mut interval) = interval else { return Ok(()) };

        interval.left.consolidate();
        let left_rows = interval.left.page(0).unwrap_or(&[]);
        let mut joined: Vec<Vec<FieldValue>> = Vec::new();
        for left in left_rows {
            for right_vector in &interval.right {
                for right in right_vector.iter() {
                    if (self.predicate)(left, right)? {
                        let mut row =
                            Vec::with_capacity(2 + left.len() + right.len());
                        row.push(FieldValue::UInt64(interval.start));
                        row.push(FieldValue::UInt64(interval.end));
                        row.extend(left.iter().cloned());
                        row.extend(right.iter().cloned());
                        joined.push(row);
                    }
                }
            }
        }
        debug!(interval_id, matches = joined.len(), "interval probed");

        let capacity = self.output_layout.capacity();
        for chunk in joined.chunks(capacity) {
            let out = ctx.allocate_buffer()?;
            {
                let mut bytes = out.bytes_mut();
                for (row, values) in chunk.iter().enumerate() {
                    self.output_layout.write_record(&mut bytes, row, values)?;
                }
            }
            out.set_number_of_tuples(chunk.len());
            out.set_watermark(Watermark(interval.end));
            ctx.emit_buffer(out, ContinuationPolicy::Possible)?;
        }

        self.clean_retained_right();
        Ok(())
    }

    /// Drops retained right rows no interval can use anymore: a row expires
    /// once its covering interval ended below both the watermark (it cannot
    /// be re-created) and the smallest live interval start (nothing older
    /// is waiting for a probe).
    fn clean_retained_right(&self) {
        let watermark = self.watermarks.current_watermark().0;
        let smallest_live = self
            .intervals
            .lock()
            .keys()
            .next()
            .copied()
            .unwrap_or(u64::MAX);
        let expiration = watermark.min(smallest_live);
        let mut latest = self.latest_right_clean_ts.lock();
        if expiration <= *latest {
            return;
        }
        let interval_size = self.interval_size;
        for slot in &self.retained_right {
            slot.lock()
                .retain(|(ts, _)| *ts - *ts % interval_size + interval_size > expiration);
        }
        *latest = expiration;
        trace!(expiration, "right retention cleaned");
    }

    fn consume_build_buffer(
        &self,
        side: JoinSide,
        layout: &MemoryLayout,
        ts_field: usize,
        buffer: &TupleBuffer,
        ctx: &mut PipelineExecutionContext<'_>,
    ) -> Result<(), EngineError> {
        let metadata = buffer.metadata();
        let origin = metadata
            .origin_id
            .ok_or_else(|| EngineError::internal("join input buffer without origin"))?;
        let sequence = metadata
            .sequence_number()
            .ok_or_else(|| EngineError::internal("join input buffer without sequence"))?;
        let worker = ctx.worker_thread_id();

        let mut max_ts: u64 = 0;
        {
            let bytes = buffer.bytes();
            for row in 0..metadata.number_of_tuples {
                let record = layout.read_record(&bytes, row)?;
                let ts = record[ts_field].as_u64()?;
                max_ts = max_ts.max(ts);
                match side {
                    JoinSide::Left => self.append_left(ts, record)?,
                    JoinSide::Right => self.append_right(worker, ts, record),
                }
            }
        }

        let update = self.watermarks.update(Watermark(max_ts), sequence, origin)?;
        if update.advanced() {
            self.emit_ready_triggers(update.current.0, ctx)?;
        }
        Ok(())
    }

    /// Final graceful flush: trigger every remaining open interval.
    fn flush_all(&self, ctx: &mut PipelineExecutionContext<'_>) -> Result<(), EngineError> {
        self.emit_ready_triggers(u64::MAX, ctx)
    }
}

impl OperatorHandler for IntervalJoinHandler {
    fn post_reconfiguration(
        &self,
        rtype: ReconfigurationType,
        ctx: &mut PipelineExecutionContext<'_>,
    ) -> Result<(), EngineError> {
        if rtype == ReconfigurationType::SoftEndOfStream {
            use std::sync::atomic::Ordering;
            // Only the last build pipeline's EoS flushes; the probe pipeline
            // also carries this handler but its EoS arrives after the
            // counter is exhausted and must not underflow it.
            let previous = self
                .build_eos_remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
            if previous == Ok(1) {
                self.flush_all(ctx)?;
            }
        }
        Ok(())
    }

    fn terminate(&self, kind: TerminationKind) -> Result<(), EngineError> {
        let dropped = {
            let mut intervals = self.intervals.lock();
            let dropped = intervals.len();
            intervals.clear();
            dropped
        };
        for slot in &self.retained_right {
            slot.lock().clear();
        }
        debug!(%kind, dropped, "interval join terminated, all intervals deleted");
        Ok(())
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Output schema: interval bounds, then both sides re-qualified.
fn joined_schema(left: &Schema, right: &Schema) -> Result<Schema, EngineError> {
    use tidal_domain::{DataType, Field};
    let mut fields = vec![
        Field::new("joined$interval_start", DataType::UInt64, false)?,
        Field::new("joined$interval_end", DataType::UInt64, false)?,
    ];
    for field in left.requalified("left")?.fields() {
        fields.push(field.clone());
    }
    for field in right.requalified("right")?.fields() {
        fields.push(field.clone());
    }
    Schema::new(left.layout_type(), fields)
}

/// Build stage for one join side.
pub struct IntervalJoinBuildStage {
    handler_index: usize,
    side: JoinSide,
    input_layout: MemoryLayout,
    ts_field: usize,
}

impl IntervalJoinBuildStage {
    pub fn new(
        handler_index: usize,
        side: JoinSide,
        input_schema: &Schema,
        buffer_size: usize,
        ts_field: &str,
    ) -> Result<Self, EngineError> {
        let input_layout = MemoryLayout::for_schema(input_schema, buffer_size)?;
        let ts_field = input_schema
            .field_index(ts_field)
            .ok_or_else(|| EngineError::InvalidSchema(format!("unknown field '{ts_field}'")))?;
        Ok(Self { handler_index, side, input_layout, ts_field })
    }
}

impl ExecutablePipelineStage for IntervalJoinBuildStage {
    fn execute(&self, buffer: TupleBuffer, ctx: &mut PipelineExecutionContext<'_>) -> Result<(), EngineError> {
        let handler: Arc<IntervalJoinHandler> = ctx.operator_handler(self.handler_index)?;
        handler.consume_build_buffer(self.side, &self.input_layout, self.ts_field, &buffer, ctx)
    }
}

/// Probe stage consuming trigger tasks.
pub struct IntervalJoinProbeStage {
    handler_index: usize,
}

impl IntervalJoinProbeStage {
    pub fn new(handler_index: usize) -> Self {
        Self { handler_index }
    }
}

impl ExecutablePipelineStage for IntervalJoinProbeStage {
    fn execute(&self, buffer: TupleBuffer, ctx: &mut PipelineExecutionContext<'_>) -> Result<(), EngineError> {
        let handler: Arc<IntervalJoinHandler> = ctx.operator_handler(self.handler_index)?;
        let interval_id = {
            let bytes = buffer.bytes();
            if bytes.len() < 8 {
                return Err(EngineError::BufferAccess("trigger buffer too small".into()));
            }
            u64::from_le_bytes(bytes[..8].try_into().expect("checked length"))
        };
        handler.probe(interval_id, ctx)
    }
}
