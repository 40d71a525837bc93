// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Buffer Metadata
//!
//! The metadata block every tuple buffer carries alongside its byte region.
//! Sources stamp it once when a buffer is emitted; pipeline stages read it
//! and propagate (or re-stamp) it on their output buffers. The block is a
//! plain value object so that the buffer pool can reset it wholesale when a
//! buffer returns to the pool.
//!
//! Fields:
//!
//! - `origin_id`: the logical stream the buffer belongs to (`None` until
//!   stamped; a pooled buffer fresh from the allocator has no origin)
//! - `sequence_data`: dense per-origin sequence number plus chunk position
//! - `watermark`: the watermark in effect when the buffer was produced
//! - `creation_ts`: wall-clock stamp for latency accounting
//! - `number_of_tuples`: the valid record prefix of the byte region

use serde::{Deserialize, Serialize};

use crate::value_objects::identifiers::OriginId;
use crate::value_objects::sequence::{SequenceData, SequenceNumber};
use crate::value_objects::timestamp::Watermark;

/// Metadata stamped on an emitted tuple buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferMetadata {
    pub origin_id: Option<OriginId>,
    pub sequence_data: Option<SequenceData>,
    pub watermark: Watermark,
    /// Milliseconds since the Unix epoch at emission time.
    pub creation_ts: u64,
    pub number_of_tuples: usize,
}

impl BufferMetadata {
    /// Resets the block to the fresh-from-pool state.
    pub fn reset(&mut self) {
        *self = BufferMetadata::default();
    }

    /// Whether the buffer has been stamped by a source.
    pub fn is_stamped(&self) -> bool {
        self.origin_id.is_some() && self.sequence_data.is_some()
    }

    /// The sequence number, if stamped.
    pub fn sequence_number(&self) -> Option<SequenceNumber> {
        self.sequence_data.map(|s| s.sequence_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_objects::sequence::SequenceData;

    #[test]
    fn test_fresh_metadata_is_unstamped() {
        let meta = BufferMetadata::default();
        assert!(!meta.is_stamped());
        assert_eq!(meta.number_of_tuples, 0);
        assert_eq!(meta.watermark, Watermark::ZERO);
    }

    #[test]
    fn test_reset_clears_stamp() {
        let mut meta = BufferMetadata {
            origin_id: Some(OriginId::new(1).unwrap()),
            sequence_data: Some(SequenceData::unchunked(SequenceNumber(3))),
            watermark: Watermark(9),
            creation_ts: 1234,
            number_of_tuples: 42,
        };
        assert!(meta.is_stamped());
        meta.reset();
        assert!(!meta.is_stamped());
        assert_eq!(meta.number_of_tuples, 0);
    }
}
