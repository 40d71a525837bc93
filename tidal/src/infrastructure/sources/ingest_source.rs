// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Ingest Source
//!
//! An in-process push source: embedders (and tests) hand record batches to
//! an `IngestHandle`, the driver turns each batch into one buffer. Closing
//! the handle drains the queue and ends the stream gracefully. The pop path
//! polls in short interruptible waits so a stop request unblocks the driver
//! well inside its latency budget.

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use tidal_domain::{EngineError, FieldValue, MemoryLayout, Schema, Watermark};

use crate::infrastructure::memory::tuple_buffer::TupleBuffer;
use crate::infrastructure::sources::data_source::{DataSource, SourceKind};
use crate::infrastructure::sources::managed_source::StopToken;

/// One pushed batch: records become one buffer.
pub type RecordBatch = Vec<Vec<FieldValue>>;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Producer side handed to the embedder.
#[derive(Clone)]
pub struct IngestHandle {
    tx: Sender<RecordBatch>,
}

impl IngestHandle {
    /// Pushes one batch; each batch becomes one emitted buffer.
    ///
    /// # Errors
    /// Returns `EngineError::Cancelled` after the source shut down.
    pub fn push(&self, batch: RecordBatch) -> Result<(), EngineError> {
        self.tx
            .send(batch)
            .map_err(|_| EngineError::Cancelled("ingest source closed".into()))
    }

    /// Ends the stream: queued batches still drain, then EoS follows.
    pub fn finish(self) {
        drop(self.tx);
    }
}

/// In-process push queue source.
pub struct IngestSource {
    layout: MemoryLayout,
    rx: Receiver<RecordBatch>,
    /// Index of the event-time field used to stamp the buffer watermark.
    timestamp_field: usize,
}

impl IngestSource {
    /// Creates the source and its producer handle.
    pub fn create(
        schema: &Schema,
        buffer_size: usize,
        timestamp_field: usize,
    ) -> Result<(Self, IngestHandle), EngineError> {
        let layout = MemoryLayout::for_schema(schema, buffer_size)?;
        if timestamp_field >= schema.field_count() {
            return Err(EngineError::invalid_config(format!(
                "timestamp field index {timestamp_field} outside schema"
            )));
        }
        let (tx, rx) = unbounded();
        Ok((Self { layout, rx, timestamp_field }, IngestHandle { tx }))
    }
}

impl DataSource for IngestSource {
    fn fill_buffer(&mut self, buffer: &TupleBuffer, stop: &StopToken) -> Result<bool, EngineError> {
        // Wait for a batch in short slices so stop stays responsive.
        let batch = loop {
            if stop.is_stopped() {
                return Ok(false);
            }
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(batch) => break batch,
                Err(RecvTimeoutError::Timeout) => continue,
                // All handles dropped: the stream ended gracefully.
                Err(RecvTimeoutError::Disconnected) => return Ok(false),
            }
        };

        if batch.len() > self.layout.capacity() {
            return Err(EngineError::BufferAccess(format!(
                "batch of {} records exceeds buffer capacity {}",
                batch.len(),
                self.layout.capacity()
            )));
        }

        let mut bytes = buffer.bytes_mut();
        let mut max_ts: u64 = 0;
        for (row, record) in batch.iter().enumerate() {
            let ts = record
                .get(self.timestamp_field)
                .ok_or_else(|| EngineError::BufferAccess("record misses timestamp field".into()))?
                .as_u64()?;
            max_ts = max_ts.max(ts);
            self.layout.write_record(&mut bytes, row, record)?;
        }
        drop(bytes);
        buffer.set_number_of_tuples(batch.len());
        buffer.set_watermark(Watermark(max_ts));
        Ok(true)
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Ingest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory::buffer_manager::BufferManager;
    use tidal_domain::{DataType, MemoryLayoutType};

    fn schema() -> Schema {
        Schema::build(
            MemoryLayoutType::Row,
            [("in$key", DataType::UInt64), ("in$value", DataType::Int64), ("in$ts", DataType::UInt64)],
        )
        .unwrap()
    }

    #[test]
    fn test_pushed_batch_fills_one_buffer() {
        let manager = BufferManager::new(2, 4096).unwrap();
        let buffer = manager.get_buffer_blocking().unwrap();
        let (mut source, handle) = IngestSource::create(&schema(), 4096, 2).unwrap();
        let stop = StopToken::new();

        handle
            .push(vec![
                vec![FieldValue::UInt64(1), FieldValue::Int64(10), FieldValue::UInt64(1)],
                vec![FieldValue::UInt64(1), FieldValue::Int64(20), FieldValue::UInt64(3)],
            ])
            .unwrap();

        assert!(source.fill_buffer(&buffer, &stop).unwrap());
        assert_eq!(buffer.number_of_tuples(), 2);
        assert_eq!(buffer.watermark(), Watermark(3));
    }

    #[test]
    fn test_finish_drains_then_ends_stream() {
        let manager = BufferManager::new(2, 4096).unwrap();
        let buffer = manager.get_buffer_blocking().unwrap();
        let (mut source, handle) = IngestSource::create(&schema(), 4096, 2).unwrap();
        let stop = StopToken::new();

        handle
            .push(vec![vec![FieldValue::UInt64(1), FieldValue::Int64(1), FieldValue::UInt64(1)]])
            .unwrap();
        handle.finish();

        assert!(source.fill_buffer(&buffer, &stop).unwrap());
        assert!(!source.fill_buffer(&buffer, &stop).unwrap());
    }

    #[test]
    fn test_stop_unblocks_empty_queue() {
        let manager = BufferManager::new(2, 4096).unwrap();
        let buffer = manager.get_buffer_blocking().unwrap();
        let (mut source, _handle) = IngestSource::create(&schema(), 4096, 2).unwrap();
        let stop = StopToken::new();
        stop.stop();
        assert!(!source.fill_buffer(&buffer, &stop).unwrap());
    }
}
