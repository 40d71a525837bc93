// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Per-Query Statistics
//!
//! Running counters the engine maintains for every deployed query. Workers
//! bump them on the hot path, so they are relaxed atomics; an external
//! collector samples them through `snapshot()`. The counters are monotonic
//! within a query's lifetime and reset only on unregistration.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::value_objects::identifiers::QueryId;

/// Live counters for one deployed query. Shared across workers; all updates
/// are relaxed since the collector needs a consistent-enough sample, not a
/// linearizable one.
#[derive(Debug)]
pub struct QueryStatistics {
    query_id: QueryId,
    processed_buffers: AtomicU64,
    processed_tasks: AtomicU64,
    processed_tuples: AtomicU64,
    /// Milliseconds since the Unix epoch; zero until the query starts.
    timestamp_query_start: AtomicU64,
}

/// Point-in-time sample of a query's statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub query_id: u64,
    pub processed_buffers: u64,
    pub processed_tasks: u64,
    pub processed_tuples: u64,
    pub timestamp_query_start: u64,
}

impl StatisticsSnapshot {
    /// The start timestamp as a UTC datetime, `None` until the query ran.
    pub fn started_at_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        if self.timestamp_query_start == 0 {
            return None;
        }
        chrono::DateTime::from_timestamp_millis(self.timestamp_query_start as i64)
    }
}

impl QueryStatistics {
    pub fn new(query_id: QueryId) -> Self {
        Self {
            query_id,
            processed_buffers: AtomicU64::new(0),
            processed_tasks: AtomicU64::new(0),
            processed_tuples: AtomicU64::new(0),
            timestamp_query_start: AtomicU64::new(0),
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn record_buffer(&self, tuples: u64) {
        self.processed_buffers.fetch_add(1, Ordering::Relaxed);
        self.processed_tuples.fetch_add(tuples, Ordering::Relaxed);
    }

    pub fn record_task(&self) {
        self.processed_tasks.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the start timestamp once; later calls keep the first value,
    /// which is the expected behavior across stop-then-start redeploys.
    pub fn mark_started(&self, now_millis: u64) {
        let _ = self.timestamp_query_start.compare_exchange(
            0,
            now_millis,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            query_id: self.query_id.raw(),
            processed_buffers: self.processed_buffers.load(Ordering::Relaxed),
            processed_tasks: self.processed_tasks.load(Ordering::Relaxed),
            processed_tuples: self.processed_tuples.load(Ordering::Relaxed),
            timestamp_query_start: self.timestamp_query_start.load(Ordering::Relaxed),
        }
    }
}
