// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Use cases driven from the command line.

pub mod run_benchmark;

pub use run_benchmark::{run_benchmark, BenchmarkOptions, BenchmarkReport};
