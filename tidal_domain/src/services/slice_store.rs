// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Slice Stores
//!
//! Two stores back the windowing engine:
//!
//! - `ThreadLocalSliceStore`: one per worker thread, append-only, ordered by
//!   slice start. Records are lifted into it without any synchronization.
//!   When the worker's local watermark advances, closed slices are drained
//!   out for merging.
//! - `GlobalSliceStore`: one per window operator, shared by all workers
//!   under the operator handler's mutex. Local slices are combined into it,
//!   windows are materialized from it at trigger time, and slices are purged
//!   once the cross-thread watermark passes them.
//!
//! ## Slice location
//!
//! The thread-local store keeps slices contiguous: locating the slice for a
//! timestamp is pure arithmetic, `index = (t - first.start) / slice_size`.
//! A record beyond the last slice extends the store by appending empty
//! slices until one covers it. Large event-time gaps therefore extend the
//! store linearly; the store bounds the extension and reports a gap that
//! would exceed it, since such a jump indicates a broken timestamp
//! expression rather than data.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::services::aggregation::{AggregateState, AggregationFunction};
use crate::services::slice::{KeyedSlice, SliceState};
use crate::value_objects::window_spec::WindowBounds;
use crate::EngineError;

/// Upper bound on slices a single record may force the store to append.
const MAX_GAP_SLICES: u64 = 1 << 20;

/// Per-worker pre-aggregation store; no internal synchronization.
#[derive(Debug)]
pub struct ThreadLocalSliceStore {
    slice_size: u64,
    slices: VecDeque<KeyedSlice>,
    last_local_watermark: u64,
}

impl ThreadLocalSliceStore {
    pub fn new(slice_size: u64) -> Self {
        debug_assert!(slice_size > 0);
        Self {
            slice_size,
            slices: VecDeque::new(),
            last_local_watermark: 0,
        }
    }

    pub fn slice_size(&self) -> u64 {
        self.slice_size
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// The last local watermark this worker merged up to.
    pub fn last_local_watermark(&self) -> u64 {
        self.last_local_watermark
    }

    pub fn set_last_local_watermark(&mut self, watermark: u64) {
        self.last_local_watermark = watermark;
    }

    /// The slice covering `ts`, appending empty slices as needed.
    ///
    /// # Errors
    /// Returns `EngineError::InternalError` for a record older than the
    /// store's first slice (the watermark protocol already merged that
    /// range) or a gap beyond the extension bound.
    pub fn slice_for(&mut self, ts: u64) -> Result<&mut KeyedSlice, EngineError> {
        if self.slices.is_empty() {
            let start = ts - ts % self.slice_size;
            self.slices.push_back(KeyedSlice::new(start, start + self.slice_size));
            return Ok(self.slices.back_mut().expect("just pushed"));
        }

        let first_start = self.slices[0].start_ts();
        if ts < first_start {
            return Err(EngineError::internal(format!(
                "record at {ts} predates the local slice store starting at {first_start}"
            )));
        }

        let index = (ts - first_start) / self.slice_size;
        if index >= self.slices.len() as u64 {
            let missing = index - self.slices.len() as u64 + 1;
            if missing > MAX_GAP_SLICES {
                return Err(EngineError::internal(format!(
                    "timestamp {ts} would extend the slice store by {missing} slices"
                )));
            }
            let mut next_start = first_start + self.slices.len() as u64 * self.slice_size;
            for _ in 0..missing {
                self.slices.push_back(KeyedSlice::new(next_start, next_start + self.slice_size));
                next_start += self.slice_size;
            }
        }
        Ok(&mut self.slices[index as usize])
    }

    /// Removes and returns every slice with `end <= watermark`, transitioned
    /// to `LocalClosed`, ready for merging into the global store. Empty
    /// slices are dropped rather than returned.
    pub fn drain_closed(&mut self, watermark: u64) -> Result<Vec<KeyedSlice>, EngineError> {
        let mut closed = Vec::new();
        while let Some(front) = self.slices.front() {
            if front.end_ts() > watermark {
                break;
            }
            let mut slice = self.slices.pop_front().expect("front checked");
            slice.advance(SliceState::LocalClosed)?;
            if !slice.is_empty() {
                closed.push(slice);
            }
        }
        Ok(closed)
    }
}

/// Shared, merged store; the owning operator handler serializes access.
#[derive(Debug)]
pub struct GlobalSliceStore {
    slice_size: u64,
    slices: BTreeMap<u64, KeyedSlice>,
}

impl GlobalSliceStore {
    pub fn new(slice_size: u64) -> Self {
        Self { slice_size, slices: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Combines one local slice into the matching global slice, creating it
    /// on first merge.
    pub fn merge(
        &mut self,
        local: KeyedSlice,
        aggregations: &[Arc<dyn AggregationFunction>],
    ) -> Result<(), EngineError> {
        match self.slices.entry(local.start_ts()) {
            Entry::Vacant(vacant) => {
                let mut slice = local;
                slice.advance(SliceState::Merged)?;
                vacant.insert(slice);
            }
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().combine_from(&local, aggregations)?;
            }
        }
        Ok(())
    }

    /// Materializes the combined per-key states of every slice tiling
    /// `bounds`. Slices outside the store (never merged because no record
    /// fell into them) contribute nothing.
    pub fn window_states(
        &self,
        bounds: WindowBounds,
        aggregations: &[Arc<dyn AggregationFunction>],
    ) -> Result<HashMap<u64, Vec<AggregateState>>, EngineError> {
        let mut combined: HashMap<u64, Vec<AggregateState>> = HashMap::new();
        for (_, slice) in self.slices.range(bounds.start..bounds.end) {
            for (key, partials) in slice.entries() {
                let into = combined
                    .entry(*key)
                    .or_insert_with(|| aggregations.iter().map(|a| a.reset()).collect());
                for (i, agg) in aggregations.iter().enumerate() {
                    agg.combine(&mut into[i], &partials[i])?;
                }
            }
        }
        Ok(combined)
    }

    /// Marks every slice tiling `bounds` as part of a triggered window.
    pub fn mark_triggered(&mut self, bounds: WindowBounds) {
        for (_, slice) in self.slices.range_mut(bounds.start..bounds.end) {
            if slice.state() == SliceState::Merged {
                // A slice shared by several sliding windows triggers once.
                let _ = slice.advance(SliceState::Triggered);
            }
        }
    }

    /// Purges every slice no window can reference anymore: those with
    /// `start + window_size <= watermark`. Returns the number removed.
    pub fn purge_consumed(&mut self, watermark: u64, window_size: u64) -> usize {
        let threshold = watermark.saturating_sub(window_size);
        let keep = self.slices.split_off(&(threshold.saturating_add(1)));
        let purged = std::mem::replace(&mut self.slices, keep);
        purged.len()
    }

    /// Smallest slice start currently held, for introspection and tests.
    pub fn first_start(&self) -> Option<u64> {
        self.slices.keys().next().copied()
    }

    /// Largest slice end currently held; the end-of-stream flush horizon.
    pub fn max_end(&self) -> Option<u64> {
        self.slices.values().next_back().map(|slice| slice.end_ts())
    }

    pub fn slice_size(&self) -> u64 {
        self.slice_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::aggregation::{aggregation_for, AggregationKind};
    use crate::value_objects::data_type::FieldValue;

    fn aggs() -> Vec<Arc<dyn AggregationFunction>> {
        vec![aggregation_for(AggregationKind::Sum)]
    }

    fn lift(store: &mut ThreadLocalSliceStore, aggs: &[Arc<dyn AggregationFunction>], key: u64, value: i64, ts: u64) {
        let slice = store.slice_for(ts).unwrap();
        let states = slice.states_for(key, aggs);
        aggs[0].lift(&mut states[0], &FieldValue::Int64(value)).unwrap();
    }

    #[test]
    fn test_slice_location_is_arithmetic() {
        let mut store = ThreadLocalSliceStore::new(10);
        assert_eq!(store.slice_for(5).unwrap().start_ts(), 0);
        assert_eq!(store.slice_for(25).unwrap().start_ts(), 20);
        // The gap at [10, 20) was filled with an empty slice.
        assert_eq!(store.len(), 3);
        assert_eq!(store.slice_for(13).unwrap().start_ts(), 10);
    }

    #[test]
    fn test_first_slice_aligns_to_slice_boundary() {
        let mut store = ThreadLocalSliceStore::new(10);
        let slice = store.slice_for(17).unwrap();
        assert_eq!(slice.start_ts(), 10);
        assert_eq!(slice.end_ts(), 20);
    }

    #[test]
    fn test_record_behind_store_is_rejected() {
        let mut store = ThreadLocalSliceStore::new(10);
        store.slice_for(25).unwrap();
        store.drain_closed(30).unwrap();
        // The store is empty again, so an old record re-seeds it; seed and
        // then go backwards instead.
        store.slice_for(40).unwrap();
        assert!(store.slice_for(35).is_err());
    }

    #[test]
    fn test_gap_bound_is_enforced() {
        let mut store = ThreadLocalSliceStore::new(1);
        store.slice_for(0).unwrap();
        assert!(store.slice_for(u64::MAX / 2).is_err());
    }

    #[test]
    fn test_drain_closed_respects_watermark_and_drops_empties() {
        let mut store = ThreadLocalSliceStore::new(10);
        let aggs = aggs();
        lift(&mut store, &aggs, 1, 10, 5);
        lift(&mut store, &aggs, 1, 20, 25);
        // Slices: [0,10) with data, [10,20) empty, [20,30) with data.
        let closed = store.drain_closed(20).unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].start_ts(), 0);
        assert_eq!(closed[0].state(), SliceState::LocalClosed);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_global_merge_combines_across_workers() {
        let aggs = aggs();
        let mut global = GlobalSliceStore::new(10);

        for value in [30, 70] {
            let mut worker = ThreadLocalSliceStore::new(10);
            lift(&mut worker, &aggs, 1, value, 5);
            for slice in worker.drain_closed(10).unwrap() {
                global.merge(slice, &aggs).unwrap();
            }
        }

        let states = global
            .window_states(WindowBounds { start: 0, end: 10 }, &aggs)
            .unwrap();
        assert_eq!(aggs[0].lower(&states[&1][0]).unwrap(), FieldValue::Int64(100));
    }

    #[test]
    fn test_window_states_combine_multiple_slices() {
        let aggs = aggs();
        let mut global = GlobalSliceStore::new(10);
        let mut worker = ThreadLocalSliceStore::new(10);
        lift(&mut worker, &aggs, 7, 1, 5);
        lift(&mut worker, &aggs, 7, 2, 15);
        for slice in worker.drain_closed(20).unwrap() {
            global.merge(slice, &aggs).unwrap();
        }
        let states = global
            .window_states(WindowBounds { start: 0, end: 20 }, &aggs)
            .unwrap();
        assert_eq!(aggs[0].lower(&states[&7][0]).unwrap(), FieldValue::Int64(3));
    }

    #[test]
    fn test_purge_removes_only_consumed_slices() {
        let aggs = aggs();
        let mut global = GlobalSliceStore::new(10);
        let mut worker = ThreadLocalSliceStore::new(10);
        lift(&mut worker, &aggs, 1, 1, 5);
        lift(&mut worker, &aggs, 1, 1, 15);
        for slice in worker.drain_closed(20).unwrap() {
            global.merge(slice, &aggs).unwrap();
        }
        // Tumbling windows of size 10; watermark 20 consumes both windows.
        assert_eq!(global.purge_consumed(20, 10), 2);
        assert!(global.is_empty());
    }
}
