// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Event-Time Timestamps and Watermarks
//!
//! Event time in the engine is a millisecond `u64`. A `Watermark` is the same
//! quantity with a contract attached: once a watermark `T` has been observed
//! for an origin, no record with event time `< T` will arrive on that origin
//! again. Windowing, slice merging, and trigger enumeration all run off
//! watermark progress rather than wall-clock time.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Millisecond event-time timestamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn millis(&self) -> u64 {
        self.0
    }

    /// Saturating subtraction, used to apply allowed lateness without
    /// underflowing near the epoch.
    pub fn saturating_sub(&self, other: u64) -> Timestamp {
        Timestamp(self.0.saturating_sub(other))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A watermark: the promise that no record older than this timestamp will
/// arrive on the associated origin.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Watermark(pub u64);

impl Watermark {
    pub const ZERO: Watermark = Watermark(0);

    pub fn millis(&self) -> u64 {
        self.0
    }
}

impl From<Timestamp> for Watermark {
    fn from(ts: Timestamp) -> Self {
        Watermark(ts.0)
    }
}

impl Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wm({}ms)", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturating_lateness() {
        assert_eq!(Timestamp(100).saturating_sub(30), Timestamp(70));
        assert_eq!(Timestamp(10).saturating_sub(30), Timestamp::ZERO);
    }

    #[test]
    fn test_watermark_from_timestamp() {
        let wm: Watermark = Timestamp(500).into();
        assert_eq!(wm.millis(), 500);
    }
}
