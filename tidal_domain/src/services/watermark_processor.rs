// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Watermark Processors
//!
//! The watermark processor is the one coordination point between workers for
//! event-time progress. It tracks, per origin, the highest *contiguous*
//! sequence number observed together with the watermark that buffer carried,
//! and exposes the minimum across origins as the effective watermark.
//!
//! ## Why contiguity matters
//!
//! Buffers of one origin are produced with dense ascending sequence numbers,
//! but parallel dispatch may reorder them across workers. Advancing the
//! origin's watermark on the highest sequence number *seen* would overrun
//! buffers still in flight; advancing only along the contiguous prefix is
//! what repairs the reordering. Out-of-prefix updates are parked in a small
//! pending map until the gap closes.
//!
//! The processor is generic over its key: the same mechanism tracks origins
//! feeding an operator (`MultiOriginWatermarkProcessor`) and worker threads
//! feeding the cross-thread trigger (keyed by `WorkerThreadId`).
//!
//! The critical section is a short `std::sync::Mutex` hold: one map probe
//! and a bounded prefix drain. Nothing else in the engine blocks on it.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Mutex;

use crate::value_objects::identifiers::{OriginId, WorkerThreadId};
use crate::value_objects::sequence::SequenceNumber;
use crate::value_objects::timestamp::Watermark;
use crate::EngineError;

/// Result of one watermark update: the effective watermark before and after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkUpdate {
    pub previous: Watermark,
    pub current: Watermark,
}

impl WatermarkUpdate {
    pub fn advanced(&self) -> bool {
        self.current > self.previous
    }
}

#[derive(Debug)]
struct KeyState {
    /// Next sequence number expected to close the contiguous prefix.
    next_seq: u64,
    /// Watermark of the highest contiguous sequence number.
    watermark: u64,
    /// Whether at least one update has been applied.
    observed: bool,
    /// Out-of-prefix updates parked until the gap closes: seq -> watermark.
    pending: BTreeMap<u64, u64>,
}

impl KeyState {
    fn new() -> Self {
        Self {
            next_seq: SequenceNumber::INITIAL.0,
            watermark: 0,
            observed: false,
            pending: BTreeMap::new(),
        }
    }
}

/// Tracks watermark progress per key and exposes the minimum across keys
/// with at least one observation.
#[derive(Debug)]
pub struct WatermarkProcessor<K: Eq + Hash + Copy + Debug> {
    state: Mutex<HashMap<K, KeyState>>,
}

/// The processor coordinating origins that feed one operator.
pub type MultiOriginWatermarkProcessor = WatermarkProcessor<OriginId>;

/// The processor coordinating worker threads behind one trigger.
pub type CrossThreadWatermarkProcessor = WatermarkProcessor<WorkerThreadId>;

impl<K: Eq + Hash + Copy + Debug> WatermarkProcessor<K> {
    /// Creates a processor for a fixed key set. Updates for unknown keys are
    /// rejected; they indicate mis-wired plans, not data conditions.
    pub fn new(keys: impl IntoIterator<Item = K>) -> Self {
        let state = keys.into_iter().map(|k| (k, KeyState::new())).collect();
        Self { state: Mutex::new(state) }
    }

    /// Applies one `(watermark, sequence)` observation for `key` and returns
    /// the effective watermark before and after.
    ///
    /// # Errors
    /// - `EngineError::InternalError` for unknown keys or duplicate sequence
    ///   numbers (each sequence number must be reported exactly once)
    /// - `EngineError::WatermarkRegression` when, along the contiguous
    ///   prefix, a watermark is strictly smaller than its predecessor
    pub fn update(
        &self,
        watermark: Watermark,
        sequence: SequenceNumber,
        key: K,
    ) -> Result<WatermarkUpdate, EngineError> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = Self::effective(&state);

        let entry = state
            .get_mut(&key)
            .ok_or_else(|| EngineError::internal(format!("watermark update for unknown key {key:?}")))?;

        if sequence.0 < entry.next_seq || entry.pending.contains_key(&sequence.0) {
            return Err(EngineError::internal(format!(
                "duplicate sequence {sequence} for key {key:?}"
            )));
        }
        entry.pending.insert(sequence.0, watermark.0);

        // Drain the contiguous prefix; regression is checked in sequence
        // order, which is the order the source stamped the buffers in.
        while let Some(wm) = entry.pending.remove(&entry.next_seq) {
            if entry.observed && wm < entry.watermark {
                return Err(EngineError::watermark_regression(format!(
                    "key {key:?}: watermark {wm} after {} at sequence {}",
                    entry.watermark, entry.next_seq
                )));
            }
            entry.watermark = wm;
            entry.observed = true;
            entry.next_seq += 1;
        }

        let current = Self::effective(&state);
        Ok(WatermarkUpdate { previous, current })
    }

    /// The effective watermark: minimum over keys with observations, zero
    /// while nothing has been observed.
    pub fn current_watermark(&self) -> Watermark {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Self::effective(&state)
    }

    fn effective(state: &HashMap<K, KeyState>) -> Watermark {
        state
            .values()
            .filter(|s| s.observed)
            .map(|s| s.watermark)
            .min()
            .map(Watermark)
            .unwrap_or(Watermark::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(raw: u64) -> OriginId {
        OriginId::new(raw).unwrap()
    }

    #[test]
    fn test_single_origin_advances_in_order() {
        let processor = MultiOriginWatermarkProcessor::new([origin(1)]);
        let update = processor.update(Watermark(10), SequenceNumber(1), origin(1)).unwrap();
        assert_eq!(update.previous, Watermark::ZERO);
        assert_eq!(update.current, Watermark(10));
        let update = processor.update(Watermark(20), SequenceNumber(2), origin(1)).unwrap();
        assert!(update.advanced());
        assert_eq!(update.current, Watermark(20));
    }

    #[test]
    fn test_only_contiguous_prefix_advances() {
        let processor = MultiOriginWatermarkProcessor::new([origin(1)]);
        // Sequence 2 arrives before sequence 1: parked, no progress.
        let update = processor.update(Watermark(20), SequenceNumber(2), origin(1)).unwrap();
        assert_eq!(update.current, Watermark::ZERO);
        // Sequence 1 closes the gap; both apply.
        let update = processor.update(Watermark(10), SequenceNumber(1), origin(1)).unwrap();
        assert_eq!(update.current, Watermark(20));
    }

    #[test]
    fn test_effective_is_min_across_observed_origins() {
        let processor = MultiOriginWatermarkProcessor::new([origin(1), origin(2)]);
        processor.update(Watermark(50), SequenceNumber(1), origin(1)).unwrap();
        // Origin 2 unobserved: the minimum is over observed origins only.
        assert_eq!(processor.current_watermark(), Watermark(50));
        processor.update(Watermark(30), SequenceNumber(1), origin(2)).unwrap();
        assert_eq!(processor.current_watermark(), Watermark(30));
        processor.update(Watermark(60), SequenceNumber(2), origin(2)).unwrap();
        assert_eq!(processor.current_watermark(), Watermark(50));
    }

    #[test]
    fn test_regression_is_an_invariant_violation() {
        let processor = MultiOriginWatermarkProcessor::new([origin(1)]);
        processor.update(Watermark(20), SequenceNumber(1), origin(1)).unwrap();
        let err = processor.update(Watermark(10), SequenceNumber(2), origin(1)).unwrap_err();
        assert!(matches!(err, EngineError::WatermarkRegression(_)));
    }

    #[test]
    fn test_reordered_equal_watermarks_are_not_regression() {
        let processor = MultiOriginWatermarkProcessor::new([origin(1)]);
        processor.update(Watermark(10), SequenceNumber(1), origin(1)).unwrap();
        // Same watermark on the next sequence is legal (idle origin).
        processor.update(Watermark(10), SequenceNumber(2), origin(1)).unwrap();
        assert_eq!(processor.current_watermark(), Watermark(10));
    }

    #[test]
    fn test_duplicate_sequence_rejected() {
        let processor = MultiOriginWatermarkProcessor::new([origin(1)]);
        processor.update(Watermark(10), SequenceNumber(1), origin(1)).unwrap();
        assert!(processor.update(Watermark(11), SequenceNumber(1), origin(1)).is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let processor = MultiOriginWatermarkProcessor::new([origin(1)]);
        assert!(processor.update(Watermark(1), SequenceNumber(1), origin(9)).is_err());
    }

    #[test]
    fn test_worker_keyed_processor() {
        let processor = CrossThreadWatermarkProcessor::new([WorkerThreadId(0), WorkerThreadId(1)]);
        processor.update(Watermark(100), SequenceNumber(1), WorkerThreadId(0)).unwrap();
        assert_eq!(processor.current_watermark(), Watermark(100));
        let update = processor.update(Watermark(80), SequenceNumber(1), WorkerThreadId(1)).unwrap();
        assert_eq!(update.current, Watermark(80));
    }
}
