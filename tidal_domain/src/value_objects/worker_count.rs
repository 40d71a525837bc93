// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Worker Count Value Object
//!
//! This module provides a validated worker-thread count for the engine's
//! worker pool. The count is bounded to protect the host from accidental
//! oversubscription: a worker is an OS thread that runs pipeline tasks to
//! completion, so there is no benefit in spawning far more workers than
//! cores, and per-worker state partitions (slice stores, paged vectors,
//! local buffer pools) all scale linearly with this number.
//!
//! ## Overview
//!
//! - **Bounded**: clamped into `[MIN_WORKERS, MAX_WORKERS]`
//! - **Auto-detection**: `optimal_for_host(cores)` leaves one core for the
//!   source driver threads and the network runtime
//! - **Explicit**: construction never fails; out-of-range requests are
//!   clamped, matching the engine's "start with something sane" policy

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Validated number of worker threads in the engine's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerCount(usize);

impl WorkerCount {
    /// At least one worker; a pool of zero threads would strand every task.
    pub const MIN_WORKERS: usize = 1;

    /// Upper bound; beyond this, per-worker state partitions dominate memory
    /// and context switching dominates CPU.
    pub const MAX_WORKERS: usize = 64;

    /// Creates a worker count, clamping into the valid range.
    pub fn new(count: usize) -> Self {
        Self(count.clamp(Self::MIN_WORKERS, Self::MAX_WORKERS))
    }

    /// A sensible count for a host with `available_cores` cores: one core is
    /// left for source drivers and the network runtime.
    pub fn optimal_for_host(available_cores: usize) -> Self {
        Self::new(available_cores.saturating_sub(1).max(1))
    }

    pub fn count(&self) -> usize {
        self.0
    }
}

impl Default for WorkerCount {
    fn default() -> Self {
        Self(1)
    }
}

impl Display for WorkerCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} workers", self.0)
    }
}
