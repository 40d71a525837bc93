// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Generator Source
//!
//! A deterministic record generator for benchmarks and load tests. Records
//! are produced by a caller-supplied function of the running record index,
//! so a benchmark can shape keys, values, and event-time progression
//! without a new source type. An optional inter-buffer delay paces
//! production; the delay waits on the stop token, which keeps hard stops
//! inside their latency budget.

use std::time::Duration;

use tidal_domain::{EngineError, FieldValue, MemoryLayout, Schema, Watermark};

use crate::infrastructure::memory::tuple_buffer::TupleBuffer;
use crate::infrastructure::sources::data_source::{DataSource, SourceKind};
use crate::infrastructure::sources::managed_source::StopToken;

/// Produces one record for the running record index.
pub type RecordFn = Box<dyn FnMut(u64) -> Vec<FieldValue> + Send>;

/// Deterministic benchmark-style generator.
pub struct GeneratorSource {
    layout: MemoryLayout,
    record_fn: RecordFn,
    tuples_per_buffer: usize,
    /// Index of the event-time field used to stamp the buffer watermark.
    timestamp_field: usize,
    /// Pause between buffers; zero produces at full speed.
    delay_between_buffers: Duration,
    next_record: u64,
}

impl GeneratorSource {
    pub fn new(
        schema: &Schema,
        buffer_size: usize,
        tuples_per_buffer: usize,
        timestamp_field: usize,
        delay_between_buffers: Duration,
        record_fn: RecordFn,
    ) -> Result<Self, EngineError> {
        let layout = MemoryLayout::for_schema(schema, buffer_size)?;
        if timestamp_field >= schema.field_count() {
            return Err(EngineError::invalid_config(format!(
                "timestamp field index {timestamp_field} outside schema"
            )));
        }
        let tuples_per_buffer = tuples_per_buffer.clamp(1, layout.capacity());
        Ok(Self {
            layout,
            record_fn,
            tuples_per_buffer,
            timestamp_field,
            delay_between_buffers,
            next_record: 0,
        })
    }
}

impl DataSource for GeneratorSource {
    fn fill_buffer(&mut self, buffer: &TupleBuffer, stop: &StopToken) -> Result<bool, EngineError> {
        if !self.delay_between_buffers.is_zero() && stop.wait_timeout(self.delay_between_buffers) {
            return Ok(false);
        }
        let mut bytes = buffer.bytes_mut();
        let mut max_ts: u64 = 0;
        for row in 0..self.tuples_per_buffer {
            let record = (self.record_fn)(self.next_record);
            self.next_record += 1;
            let ts = record
                .get(self.timestamp_field)
                .ok_or_else(|| EngineError::internal("generator record misses timestamp field"))?
                .as_u64()?;
            max_ts = max_ts.max(ts);
            self.layout.write_record(&mut bytes, row, &record)?;
        }
        drop(bytes);
        buffer.set_number_of_tuples(self.tuples_per_buffer);
        buffer.set_watermark(Watermark(max_ts));
        Ok(true)
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Generator
    }
}
