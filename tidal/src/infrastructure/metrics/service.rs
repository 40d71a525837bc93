// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Metrics Service
//!
//! Prometheus metrics for the engine: query throughput counters, pool
//! occupancy gauges, and cache effectiveness. The service owns one shared
//! registry; the statistics collector samples per-query counters into it,
//! and `export()` renders the text exposition format for scraping.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::warn;

use tidal_domain::{CacheCounters, EngineError, StatisticsSnapshot};

use crate::infrastructure::memory::buffer_manager::BufferManager;

/// Engine-wide metrics on a shared prometheus registry.
pub struct MetricsService {
    registry: Registry,
    queries_running: IntGauge,
    processed_buffers: IntGaugeVec,
    processed_tasks: IntGaugeVec,
    processed_tuples: IntGaugeVec,
    buffer_pool_available: IntGauge,
    buffer_pool_total: IntGauge,
    cache_events: IntCounterVec,
    stop_latency: Histogram,
}

impl MetricsService {
    pub fn new() -> Result<Arc<Self>, EngineError> {
        let registry = Registry::new();
        let to_err = |e: prometheus::Error| EngineError::internal(format!("metrics registry: {e}"));

        let queries_running =
            IntGauge::with_opts(Opts::new("tidal_queries_running", "Queries currently running"))
                .map_err(to_err)?;
        let processed_buffers = IntGaugeVec::new(
            Opts::new("tidal_query_processed_buffers", "Buffers processed per query"),
            &["query"],
        )
        .map_err(to_err)?;
        let processed_tasks = IntGaugeVec::new(
            Opts::new("tidal_query_processed_tasks", "Tasks processed per query"),
            &["query"],
        )
        .map_err(to_err)?;
        let processed_tuples = IntGaugeVec::new(
            Opts::new("tidal_query_processed_tuples", "Tuples processed per query"),
            &["query"],
        )
        .map_err(to_err)?;
        let buffer_pool_available = IntGauge::with_opts(Opts::new(
            "tidal_buffer_pool_available",
            "Free buffers in the global pool",
        ))
        .map_err(to_err)?;
        let buffer_pool_total = IntGauge::with_opts(Opts::new(
            "tidal_buffer_pool_total",
            "Total buffers in the global pool",
        ))
        .map_err(to_err)?;
        let cache_events = IntCounterVec::new(
            Opts::new("tidal_cache_events", "Slice/prediction cache hits and misses"),
            &["cache", "outcome"],
        )
        .map_err(to_err)?;
        let stop_latency = Histogram::with_opts(
            HistogramOpts::new("tidal_query_stop_seconds", "Observed stop_query latency")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        )
        .map_err(to_err)?;

        for collector in [
            Box::new(queries_running.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(processed_buffers.clone()),
            Box::new(processed_tasks.clone()),
            Box::new(processed_tuples.clone()),
            Box::new(buffer_pool_available.clone()),
            Box::new(buffer_pool_total.clone()),
            Box::new(cache_events.clone()),
            Box::new(stop_latency.clone()),
        ] {
            registry.register(collector).map_err(to_err)?;
        }

        Ok(Arc::new(Self {
            registry,
            queries_running,
            processed_buffers,
            processed_tasks,
            processed_tuples,
            buffer_pool_available,
            buffer_pool_total,
            cache_events,
            stop_latency,
        }))
    }

    pub fn set_queries_running(&self, count: i64) {
        self.queries_running.set(count);
    }

    /// Folds one per-query statistics sample into the registry.
    pub fn observe_statistics(&self, snapshot: &StatisticsSnapshot) {
        let query = snapshot.query_id.to_string();
        self.processed_buffers
            .with_label_values(&[&query])
            .set(snapshot.processed_buffers as i64);
        self.processed_tasks
            .with_label_values(&[&query])
            .set(snapshot.processed_tasks as i64);
        self.processed_tuples
            .with_label_values(&[&query])
            .set(snapshot.processed_tuples as i64);
    }

    /// Samples global pool occupancy.
    pub fn sample_buffer_pool(&self, manager: &BufferManager) {
        self.buffer_pool_available.set(manager.available_buffers() as i64);
        self.buffer_pool_total.set(manager.total_buffers() as i64);
    }

    /// Records cache counters under a named cache instance.
    pub fn observe_cache(&self, cache: &str, counters: CacheCounters) {
        // Counter semantics: callers pass cumulative values, the registry
        // needs increments. Reset-free caches only ever grow, so the delta
        // is the difference to what the registry already saw.
        let hits = self.cache_events.with_label_values(&[cache, "hit"]);
        let misses = self.cache_events.with_label_values(&[cache, "miss"]);
        let seen_hits = hits.get();
        let seen_misses = misses.get();
        if counters.hits >= seen_hits {
            hits.inc_by(counters.hits - seen_hits);
        } else {
            warn!(cache, "cache hit counter went backwards");
        }
        if counters.misses >= seen_misses {
            misses.inc_by(counters.misses - seen_misses);
        }
    }

    pub fn observe_stop_latency(&self, seconds: f64) {
        self.stop_latency.observe(seconds);
    }

    /// Renders the registry in the text exposition format.
    pub fn export(&self) -> Result<String, EngineError> {
        let encoder = TextEncoder::new();
        let mut out = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut out)
            .map_err(|e| EngineError::internal(format!("metrics encode: {e}")))?;
        String::from_utf8(out).map_err(|e| EngineError::internal(format!("metrics utf8: {e}")))
    }
}

impl std::fmt::Debug for MetricsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsService").finish()
    }
}
