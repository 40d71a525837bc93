// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Sequence and Chunk Numbering
//!
//! Every buffer a source emits carries a `SequenceNumber` that is dense and
//! strictly ascending within its origin, starting at 1. Large logical records
//! may span several buffers; the `ChunkNumber`/`is_last_chunk` pair tracks
//! that split. The `(sequence, chunk, last)` triple travels together often
//! enough that it gets its own value object, `SequenceData`.
//!
//! Sequence numbers are the backbone of watermark processing: the watermark
//! processor only advances on contiguous sequence prefixes, which repairs any
//! reordering introduced by parallel dispatch across workers.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Monotonic, dense per-origin buffer sequence number. The first buffer of an
/// origin carries sequence number 1; zero marks "not stamped yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// The sequence number of the first buffer an origin emits.
    pub const INITIAL: SequenceNumber = SequenceNumber(1);

    /// The successor of this sequence number.
    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.0 + 1)
    }

    /// Whether this number has been stamped by a source (non-zero).
    pub fn is_stamped(&self) -> bool {
        self.0 != 0
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq({})", self.0)
    }
}

/// Position of a buffer within a chunked logical record. Sources that do not
/// chunk always stamp chunk number 1 with `is_last_chunk = true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkNumber(pub u64);

impl ChunkNumber {
    /// The chunk number of an unchunked buffer.
    pub const FIRST: ChunkNumber = ChunkNumber(1);
}

impl Display for ChunkNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk({})", self.0)
    }
}

/// The `(sequence, chunk, last)` triple stamped on every emitted buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceData {
    pub sequence_number: SequenceNumber,
    pub chunk_number: ChunkNumber,
    pub is_last_chunk: bool,
}

impl SequenceData {
    /// Sequence data for an unchunked buffer.
    pub fn unchunked(sequence_number: SequenceNumber) -> Self {
        Self {
            sequence_number,
            chunk_number: ChunkNumber::FIRST,
            is_last_chunk: true,
        }
    }
}

impl Display for SequenceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}{}",
            self.sequence_number,
            self.chunk_number,
            if self.is_last_chunk { " last" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_and_next() {
        let first = SequenceNumber::INITIAL;
        assert_eq!(first.0, 1);
        assert_eq!(first.next(), SequenceNumber(2));
        assert!(first.is_stamped());
        assert!(!SequenceNumber(0).is_stamped());
    }

    #[test]
    fn test_unchunked_sequence_data() {
        let data = SequenceData::unchunked(SequenceNumber(5));
        assert_eq!(data.chunk_number, ChunkNumber::FIRST);
        assert!(data.is_last_chunk);
    }
}
