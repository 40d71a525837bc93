// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Data Source Contract
//!
//! The small trait every source implementation fulfills, plus the kind tag.
//! There is deliberately no hierarchy here: a source is `open`,
//! `fill_buffer` in a loop, `close`, nothing else. The `SourceRunner` owns
//! the driving; sources only produce bytes.

use std::fmt::{self, Display};

use tidal_domain::EngineError;

use crate::infrastructure::memory::tuple_buffer::TupleBuffer;
use crate::infrastructure::sources::managed_source::StopToken;

/// Tag identifying the source implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Deterministic record generator (benchmarks and tests).
    Generator,
    /// In-process push queue (embedders and tests).
    Ingest,
    /// Buffers arriving over the network transport.
    Network,
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::Generator => "generator",
            SourceKind::Ingest => "ingest",
            SourceKind::Network => "network",
        };
        f.write_str(name)
    }
}

/// A produced-data source.
///
/// `fill_buffer` writes records into `buffer` (bytes, tuple count, and
/// watermark) and reports whether data was produced: `Ok(false)` means the
/// source is exhausted and the runner winds down gracefully. Sources that
/// wait for input must wait through the stop token so that `stop` unblocks
/// them.
pub trait DataSource: Send {
    fn open(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn fill_buffer(&mut self, buffer: &TupleBuffer, stop: &StopToken) -> Result<bool, EngineError>;

    fn close(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn kind(&self) -> SourceKind;
}
