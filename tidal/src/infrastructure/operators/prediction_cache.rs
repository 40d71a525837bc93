// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Prediction Cache Handler
//!
//! A bounded per-worker cache in front of model inference: feature vectors
//! hash to a key, cached inference outputs are returned on a hit, and the
//! inference stage stores fresh outputs on a miss. The inference kernels
//! themselves live outside the engine; this handler only provides the
//! lookup front and its counters. Policies 2Q and LFU fit inference
//! workloads, where a small set of hot feature vectors dominates.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tidal_domain::{CacheCounters, CachePolicy, EngineError, FieldValue, SliceCache, TerminationKind, WorkerThreadId};

use crate::infrastructure::runtime::executable_plan::OperatorHandler;

/// Per-worker inference-output cache.
pub struct PredictionCacheHandler {
    per_worker: Vec<Mutex<SliceCache<Vec<u8>>>>,
}

impl PredictionCacheHandler {
    pub fn new(policy: CachePolicy, capacity: usize, worker_count: usize) -> Arc<Self> {
        let per_worker = (0..worker_count.max(1))
            .map(|_| Mutex::new(SliceCache::new(policy, capacity)))
            .collect();
        Arc::new(Self { per_worker })
    }

    /// Stable hash of a feature vector, the cache key.
    pub fn feature_key(features: &[FieldValue]) -> u64 {
        let mut hasher = DefaultHasher::new();
        for feature in features {
            match feature {
                FieldValue::Int64(v) => (0u8, v).hash(&mut hasher),
                FieldValue::UInt64(v) => (1u8, v).hash(&mut hasher),
                FieldValue::Float64(v) => (2u8, v.to_bits()).hash(&mut hasher),
                FieldValue::Bool(v) => (3u8, v).hash(&mut hasher),
                FieldValue::Char(v) => (4u8, v).hash(&mut hasher),
                FieldValue::Bytes(v) => (5u8, v).hash(&mut hasher),
                FieldValue::Null => 6u8.hash(&mut hasher),
            }
        }
        hasher.finish()
    }

    /// Cached inference output for `key` on `worker`, if present.
    pub fn lookup(&self, worker: WorkerThreadId, key: u64) -> Option<Vec<u8>> {
        let mut cache = self.per_worker[worker.index() % self.per_worker.len()].lock();
        cache.lookup(key).cloned()
    }

    /// Stores one inference output.
    pub fn store(&self, worker: WorkerThreadId, key: u64, output: Vec<u8>) {
        let mut cache = self.per_worker[worker.index() % self.per_worker.len()].lock();
        cache.insert_point(key, output);
    }

    /// Aggregate hit/miss counters across workers.
    pub fn counters(&self) -> CacheCounters {
        let mut total = CacheCounters::default();
        for slot in &self.per_worker {
            let counters = slot.lock().counters();
            total.hits += counters.hits;
            total.misses += counters.misses;
        }
        total
    }
}

impl OperatorHandler for PredictionCacheHandler {
    fn terminate(&self, _kind: TerminationKind) -> Result<(), EngineError> {
        Ok(())
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
