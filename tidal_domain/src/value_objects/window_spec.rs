// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Window Specifications
//!
//! This module provides the time-window descriptors the windowing engine is
//! parameterized over, and the trigger-enumeration logic that turns watermark
//! progress into a list of complete windows.
//!
//! ## Overview
//!
//! Two window shapes are supported:
//!
//! - **Tumbling**: consecutive, non-overlapping windows of a fixed size
//! - **Sliding**: fixed-size windows starting every `slide` milliseconds;
//!   a record belongs to `size / slide` windows
//!
//! Windows are aligned to the epoch: a tumbling window of size `S` covers
//! `[k*S, (k+1)*S)`, a sliding window starts at every multiple of the slide.
//! Slices are the unit of pre-aggregation below windows; the slice size must
//! divide both size and slide so that slice boundaries align with every
//! window edge.
//!
//! ## Trigger enumeration
//!
//! When the cross-thread watermark advances from `w_old` to `w_new`, exactly
//! the windows `[s, e)` with `e <= w_new` and `e > w_old` become complete.
//! `windows_between` enumerates them in ascending end order; the windowing
//! operator materializes one result row per key for each.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::EngineError;

/// Time-window shape and measures, in event-time milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum WindowSpec {
    Tumbling { size: u64 },
    Sliding { size: u64, slide: u64 },
}

/// One concrete window instance `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowBounds {
    pub start: u64,
    pub end: u64,
}

impl WindowSpec {
    /// Creates a tumbling window spec.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidConfiguration` for a zero size.
    pub fn tumbling(size: u64) -> Result<Self, EngineError> {
        if size == 0 {
            return Err(EngineError::invalid_config("window size must be positive"));
        }
        Ok(WindowSpec::Tumbling { size })
    }

    /// Creates a sliding window spec.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidConfiguration` when either measure is
    /// zero, the slide exceeds the size, or the slide does not divide the
    /// size (window edges would then fall inside slices).
    pub fn sliding(size: u64, slide: u64) -> Result<Self, EngineError> {
        if size == 0 || slide == 0 {
            return Err(EngineError::invalid_config("window measures must be positive"));
        }
        if slide > size {
            return Err(EngineError::invalid_config(format!(
                "slide {slide} exceeds window size {size}; records would be dropped"
            )));
        }
        if size % slide != 0 {
            return Err(EngineError::invalid_config(format!(
                "slide {slide} must divide window size {size}"
            )));
        }
        Ok(WindowSpec::Sliding { size, slide })
    }

    pub fn size(&self) -> u64 {
        match self {
            WindowSpec::Tumbling { size } => *size,
            WindowSpec::Sliding { size, .. } => *size,
        }
    }

    /// Distance between consecutive window starts.
    pub fn slide(&self) -> u64 {
        match self {
            WindowSpec::Tumbling { size } => *size,
            WindowSpec::Sliding { slide, .. } => *slide,
        }
    }

    /// The natural slice size for this window: the gcd of size and slide is
    /// the slide itself (validated at construction), so slices of one slide
    /// length tile every window exactly.
    pub fn natural_slice_size(&self) -> u64 {
        self.slide()
    }

    /// Validates a slice size chosen by the plan against this window.
    pub fn validate_slice_size(&self, slice_size: u64) -> Result<(), EngineError> {
        if slice_size == 0 {
            return Err(EngineError::invalid_config("slice size must be positive"));
        }
        if self.slide() % slice_size != 0 {
            return Err(EngineError::invalid_config(format!(
                "slice size {slice_size} must divide the window slide {}",
                self.slide()
            )));
        }
        Ok(())
    }

    /// Enumerates the windows completed when the watermark advances from
    /// `w_old` to `w_new`: all `[s, e)` with `w_old < e <= w_new`, ascending.
    pub fn windows_between(&self, w_old: u64, w_new: u64) -> Vec<WindowBounds> {
        if w_new <= w_old {
            return Vec::new();
        }
        let size = self.size();
        let slide = self.slide();
        let mut windows = Vec::new();
        // Ends are `k*slide + size`; start from the smallest end > w_old.
        let first_k = if w_old < size { 0 } else { (w_old - size) / slide + 1 };
        let mut end = first_k * slide + size;
        while end <= w_new {
            windows.push(WindowBounds { start: end - size, end });
            end += slide;
        }
        windows
    }

    /// All windows a record with timestamp `ts` belongs to.
    pub fn windows_for_timestamp(&self, ts: u64) -> Vec<WindowBounds> {
        let size = self.size();
        let slide = self.slide();
        let mut windows = Vec::new();
        let last_start = (ts / slide) * slide;
        let mut start = last_start;
        loop {
            if start + size > ts {
                windows.push(WindowBounds { start, end: start + size });
            }
            if start < slide || start + size <= ts {
                break;
            }
            start -= slide;
        }
        windows.reverse();
        windows
    }
}

impl Display for WindowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowSpec::Tumbling { size } => write!(f, "tumbling({size}ms)"),
            WindowSpec::Sliding { size, slide } => write!(f, "sliding({size}ms/{slide}ms)"),
        }
    }
}

impl Display for WindowBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tumbling_trigger_enumeration() {
        let spec = WindowSpec::tumbling(10).unwrap();
        let windows = spec.windows_between(0, 30);
        assert_eq!(
            windows,
            vec![
                WindowBounds { start: 0, end: 10 },
                WindowBounds { start: 10, end: 20 },
                WindowBounds { start: 20, end: 30 },
            ]
        );
        // No window completes when the watermark does not cross an edge.
        assert!(spec.windows_between(30, 35).is_empty());
        // The half-open contract: end == w_old is not re-triggered.
        assert_eq!(spec.windows_between(10, 20), vec![WindowBounds { start: 10, end: 20 }]);
    }

    #[test]
    fn test_sliding_trigger_enumeration() {
        let spec = WindowSpec::sliding(10, 5).unwrap();
        let windows = spec.windows_between(0, 20);
        assert_eq!(
            windows,
            vec![
                WindowBounds { start: 0, end: 10 },
                WindowBounds { start: 5, end: 15 },
                WindowBounds { start: 10, end: 20 },
            ]
        );
    }

    #[test]
    fn test_windows_for_timestamp() {
        let spec = WindowSpec::sliding(10, 5).unwrap();
        assert_eq!(
            spec.windows_for_timestamp(7),
            vec![WindowBounds { start: 0, end: 10 }, WindowBounds { start: 5, end: 15 }]
        );
        let tumbling = WindowSpec::tumbling(10).unwrap();
        assert_eq!(
            tumbling.windows_for_timestamp(7),
            vec![WindowBounds { start: 0, end: 10 }]
        );
    }

    #[test]
    fn test_invalid_measures_rejected() {
        assert!(WindowSpec::tumbling(0).is_err());
        assert!(WindowSpec::sliding(10, 0).is_err());
        assert!(WindowSpec::sliding(10, 20).is_err());
        assert!(WindowSpec::sliding(10, 3).is_err());
    }

    #[test]
    fn test_slice_size_validation() {
        let spec = WindowSpec::sliding(20, 10).unwrap();
        assert!(spec.validate_slice_size(5).is_ok());
        assert!(spec.validate_slice_size(10).is_ok());
        assert!(spec.validate_slice_size(3).is_err());
        assert!(spec.validate_slice_size(0).is_err());
    }
}
