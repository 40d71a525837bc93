// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Keyed Slices
//!
//! A slice is the half-open time interval `[start_ts, end_ts)` holding
//! per-key partial aggregates. Slices are the sub-unit of windows: windows
//! never store their own state, they are materialized at trigger time by
//! combining the slices that tile them.
//!
//! ## Lifecycle
//!
//! ```text
//! Open ──local watermark ≥ end──▶ LocalClosed ──merge──▶ Merged
//!                                                          │
//!                    Deleted ◀──purge── Triggered ◀──trigger┘
//! ```
//!
//! A slice is created `Open` by the first record falling in its range,
//! closed when its worker's local watermark passes its end, merged into the
//! global store, part of one or more triggered windows, and purged once the
//! cross-thread watermark guarantees it can never be referenced again.
//! Transitions are total under the watermark protocol: the state machine
//! rejects anything else as an internal error.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;

use crate::services::aggregation::{AggregateState, AggregationFunction};
use crate::EngineError;

/// Lifecycle state of a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SliceState {
    Open,
    LocalClosed,
    Merged,
    Triggered,
    Deleted,
}

impl SliceState {
    fn rank(&self) -> u8 {
        match self {
            SliceState::Open => 0,
            SliceState::LocalClosed => 1,
            SliceState::Merged => 2,
            SliceState::Triggered => 3,
            SliceState::Deleted => 4,
        }
    }
}

impl Display for SliceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SliceState::Open => "Open",
            SliceState::LocalClosed => "LocalClosed",
            SliceState::Merged => "Merged",
            SliceState::Triggered => "Triggered",
            SliceState::Deleted => "Deleted",
        };
        f.write_str(name)
    }
}

/// A half-open time interval with per-key partial aggregates.
#[derive(Debug, Clone)]
pub struct KeyedSlice {
    start_ts: u64,
    end_ts: u64,
    state: SliceState,
    entries: HashMap<u64, Vec<AggregateState>>,
}

impl KeyedSlice {
    pub fn new(start_ts: u64, end_ts: u64) -> Self {
        debug_assert!(start_ts < end_ts);
        Self {
            start_ts,
            end_ts,
            state: SliceState::Open,
            entries: HashMap::new(),
        }
    }

    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    pub fn end_ts(&self) -> u64 {
        self.end_ts
    }

    pub fn state(&self) -> SliceState {
        self.state
    }

    pub fn covers(&self, ts: u64) -> bool {
        self.start_ts <= ts && ts < self.end_ts
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Per-key entries, for trigger materialization.
    pub fn entries(&self) -> impl Iterator<Item = (&u64, &Vec<AggregateState>)> {
        self.entries.iter()
    }

    /// Advances the lifecycle state.
    ///
    /// # Errors
    /// Returns `EngineError::InternalError` on a backward or skipped-past-
    /// `Deleted` transition; under the watermark protocol these indicate a
    /// coordination bug, never valid input.
    pub fn advance(&mut self, next: SliceState) -> Result<(), EngineError> {
        if next.rank() <= self.state.rank() {
            return Err(EngineError::internal(format!(
                "slice [{}, {}) cannot move {} -> {}",
                self.start_ts, self.end_ts, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// The partial states for `key`, created via `reset` on first touch.
    pub fn states_for(
        &mut self,
        key: u64,
        aggregations: &[Arc<dyn AggregationFunction>],
    ) -> &mut Vec<AggregateState> {
        self.entries
            .entry(key)
            .or_insert_with(|| aggregations.iter().map(|a| a.reset()).collect())
    }

    /// Combines every key of `other` into this slice.
    ///
    /// # Errors
    /// Returns `EngineError::InternalError` when the slices do not share
    /// bounds or a partial state does not match its aggregation.
    pub fn combine_from(
        &mut self,
        other: &KeyedSlice,
        aggregations: &[Arc<dyn AggregationFunction>],
    ) -> Result<(), EngineError> {
        if self.start_ts != other.start_ts || self.end_ts != other.end_ts {
            return Err(EngineError::internal(format!(
                "cannot combine slice [{}, {}) into [{}, {})",
                other.start_ts, other.end_ts, self.start_ts, self.end_ts
            )));
        }
        for (key, partials) in &other.entries {
            let into = self.states_for(*key, aggregations);
            for (i, agg) in aggregations.iter().enumerate() {
                agg.combine(&mut into[i], &partials[i])?;
            }
        }
        Ok(())
    }
}

impl Display for KeyedSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Slice[{}, {})/{} keys={}",
            self.start_ts,
            self.end_ts,
            self.state,
            self.entries.len()
        )
    }
}
