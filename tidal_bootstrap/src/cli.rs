// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Command-Line Interface
//!
//! Argument parsing for the engine binary. The bootstrap layer owns only
//! the surface: flags are plain data handed to the application layer, no
//! engine types leak in here.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Tidal stream engine node.
#[derive(Debug, Parser)]
#[command(name = "tidal", version, about = "Single-node stream-processing execution engine")]
pub struct CliArgs {
    /// Path to a TOML worker configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `tidal=debug`.
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    #[command(subcommand)]
    pub command: Option<EngineCommand>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum EngineCommand {
    /// Run the engine until a shutdown signal arrives.
    Serve,
    /// Run the self-contained windowed-aggregation benchmark and exit.
    Benchmark {
        /// Buffers the generator produces before ending the stream.
        #[arg(long, default_value_t = 64)]
        buffers: u64,

        /// Records per generated buffer.
        #[arg(long, default_value_t = 100)]
        tuples_per_buffer: usize,

        /// Distinct keys in the generated stream.
        #[arg(long, default_value_t = 8)]
        keys: u64,

        /// Tumbling window size in event-time milliseconds.
        #[arg(long, default_value_t = 1000)]
        window_ms: u64,
    },
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
