// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Worker Configuration
//!
//! Startup configuration of one engine node: pool sizes, worker threads,
//! queue mode, optional core pinning, and the network endpoint. Values are
//! loaded from a TOML file with `TIDAL_`-prefixed environment overrides and
//! validated before anything allocates.
//!
//! ## Keys and defaults
//!
//! | Key | Default |
//! |-----|---------|
//! | `number_of_buffers_in_global_pool` | 1024 |
//! | `number_of_buffers_per_source_local_pool` | 128 |
//! | `number_of_buffers_per_worker` | 12 |
//! | `buffer_size_bytes` | 4096 |
//! | `number_of_worker_threads` | 1 |
//! | `worker_to_core_mapping` | empty (no pinning) |
//! | `numa_awareness` | disabled |
//! | `query_manager_mode` | dynamic |
//! | `enable_query_reconfiguration` | false |

use byte_unit::Byte;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::Path;
use std::time::Duration;

use tidal_domain::EngineError;

/// Task-queue topology of the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryManagerMode {
    /// One shared queue; any worker takes the next task.
    Dynamic,
    /// One queue per worker; tasks are routed by target id.
    Static,
}

impl Default for QueryManagerMode {
    fn default() -> Self {
        QueryManagerMode::Dynamic
    }
}

/// Network endpoint configuration; absent means a single-node engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfiguration {
    pub listen_host: String,
    pub listen_port: u16,
    /// Dial attempts before a partition counts as unavailable.
    #[serde(default = "default_retry_times")]
    pub retry_times: usize,
    /// Pause between dial attempts, in milliseconds.
    #[serde(default = "default_wait_time_ms")]
    pub wait_time_ms: u64,
}

fn default_retry_times() -> usize {
    5
}

fn default_wait_time_ms() -> u64 {
    1000
}

impl NetworkConfiguration {
    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }
}

/// Startup configuration of one engine node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfiguration {
    pub number_of_buffers_in_global_pool: usize,
    pub number_of_buffers_per_source_local_pool: usize,
    pub number_of_buffers_per_worker: usize,
    pub buffer_size_bytes: usize,
    pub number_of_worker_threads: usize,
    /// Comma-separated core indices; empty disables pinning.
    pub worker_to_core_mapping: String,
    pub numa_awareness: bool,
    pub query_manager_mode: QueryManagerMode,
    /// Redeploy-by-stop-then-start is the implemented path; the in-place
    /// reconfiguration this flag once gated stays deferred.
    pub enable_query_reconfiguration: bool,
    /// Bound on `stop_query` waiting for a plan to terminate, in seconds.
    pub termination_deadline_secs: u64,
    pub network: Option<NetworkConfiguration>,
}

impl Default for WorkerConfiguration {
    fn default() -> Self {
        Self {
            number_of_buffers_in_global_pool: 1024,
            number_of_buffers_per_source_local_pool: 128,
            number_of_buffers_per_worker: 12,
            buffer_size_bytes: 4096,
            number_of_worker_threads: 1,
            worker_to_core_mapping: String::new(),
            numa_awareness: false,
            query_manager_mode: QueryManagerMode::Dynamic,
            enable_query_reconfiguration: false,
            termination_deadline_secs: 600,
            network: None,
        }
    }
}

impl WorkerConfiguration {
    /// Loads configuration from an optional TOML file with `TIDAL_`
    /// environment overrides on top.
    ///
    /// # Errors
    /// `EngineError::InvalidConfiguration` for unreadable files, malformed
    /// keys, or failed validation.
    pub fn load(path: Option<&Path>) -> Result<Self, EngineError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix("TIDAL"));
        let loaded: WorkerConfiguration = builder
            .build()
            .map_err(|e| EngineError::invalid_config(format!("configuration load: {e}")))?
            .try_deserialize()
            .map_err(|e| EngineError::invalid_config(format!("configuration parse: {e}")))?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Validates dimension and mapping consistency.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.buffer_size_bytes < 64 {
            return Err(EngineError::invalid_config(format!(
                "buffer_size_bytes {} is below the 64-byte minimum",
                self.buffer_size_bytes
            )));
        }
        if self.number_of_worker_threads == 0 {
            return Err(EngineError::invalid_config("number_of_worker_threads must be positive"));
        }
        if self.number_of_buffers_in_global_pool == 0 {
            return Err(EngineError::invalid_config("global buffer pool must not be empty"));
        }
        let reserved_by_workers = self.number_of_buffers_per_worker * self.number_of_worker_threads;
        if reserved_by_workers >= self.number_of_buffers_in_global_pool {
            return Err(EngineError::invalid_config(format!(
                "{} worker-pool buffers leave nothing of the global pool of {}",
                reserved_by_workers, self.number_of_buffers_in_global_pool
            )));
        }
        let mapping = self.parsed_core_mapping()?;
        if !mapping.is_empty() && mapping.len() < self.number_of_worker_threads {
            return Err(EngineError::invalid_config(format!(
                "worker_to_core_mapping names {} cores for {} workers",
                mapping.len(),
                self.number_of_worker_threads
            )));
        }
        Ok(())
    }

    /// The parsed core mapping; empty when pinning is disabled.
    pub fn parsed_core_mapping(&self) -> Result<Vec<usize>, EngineError> {
        if self.worker_to_core_mapping.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.worker_to_core_mapping
            .split(',')
            .map(|part| {
                part.trim().parse::<usize>().map_err(|_| {
                    EngineError::invalid_config(format!(
                        "worker_to_core_mapping entry '{part}' is not a core index"
                    ))
                })
            })
            .collect()
    }

    pub fn termination_deadline(&self) -> Duration {
        Duration::from_secs(self.termination_deadline_secs)
    }

    /// Total bytes the global pool will pin.
    pub fn global_pool_bytes(&self) -> u64 {
        (self.number_of_buffers_in_global_pool * self.buffer_size_bytes) as u64
    }
}

impl Display for WorkerConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pool = Byte::from_u64(self.global_pool_bytes()).get_appropriate_unit(byte_unit::UnitType::Binary);
        write!(
            f,
            "{} workers ({:?}), {} x {}B buffers ({pool:.1}), numa {}",
            self.number_of_worker_threads,
            self.query_manager_mode,
            self.number_of_buffers_in_global_pool,
            self.buffer_size_bytes,
            if self.numa_awareness { "on" } else { "off" },
        )
    }
}
