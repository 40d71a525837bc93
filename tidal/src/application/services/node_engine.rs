// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Node Engine
//!
//! The single owning facade over every runtime component of one engine
//! node: the global buffer pool, the query manager with its worker pool,
//! the optional network transport, and the metrics service. There are no
//! process-wide singletons; whoever holds the `NodeEngine` holds the
//! engine, and dropping it shuts everything down.
//!
//! ## Query lifecycle
//!
//! ```text
//! register_query(plan, sources)   Registered
//! start_query(id)                 Running
//! stop_query(id, kind)            Stopped | Failed
//! unregister_query(id)            gone, handler storage released
//! ```
//!
//! Redeploying a query under the `enable_query_reconfiguration` flag runs
//! the same path: stop, unregister, register, start. The in-place
//! reconfiguration the flag once gated is deferred and reported as
//! unsupported.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use tidal_domain::{
    EngineError, ExecutionStatus, OriginId, QueryId, StatisticsSnapshot, TerminationKind,
    WorkerCount,
};

use crate::infrastructure::config::engine_config::WorkerConfiguration;
use crate::infrastructure::logging::observability::{log_startup, TimedOperation};
use crate::infrastructure::memory::buffer_manager::BufferManager;
use crate::infrastructure::metrics::service::MetricsService;
use crate::infrastructure::network::network_manager::NetworkManager;
use crate::infrastructure::runtime::executable_plan::{ExecutableQueryPlan, QueryPlanBuilder};
use crate::infrastructure::runtime::query_manager::{
    LoggingStatusListener, QueryManager, QueryManagerSettings,
};
use crate::infrastructure::sources::data_source::DataSource;
use crate::infrastructure::sources::managed_source::ManagedSource;
use crate::infrastructure::sources::source_runner::SourceRunner;

use tidal_domain::NodeLocation;

/// One engine node; owns every runtime component.
pub struct NodeEngine {
    config: WorkerConfiguration,
    buffer_manager: Arc<BufferManager>,
    query_manager: Arc<QueryManager>,
    network: Option<Arc<NetworkManager>>,
    metrics: Arc<MetricsService>,
    stopped: AtomicBool,
}

impl NodeEngine {
    /// Builds and starts the engine from a validated configuration.
    pub fn start(config: WorkerConfiguration) -> Result<Arc<Self>, EngineError> {
        config.validate()?;
        log_startup(&config);

        let buffer_manager = Arc::new(BufferManager::new(
            config.number_of_buffers_in_global_pool,
            config.buffer_size_bytes,
        )?);
        let settings = QueryManagerSettings {
            mode: config.query_manager_mode,
            // Bounded by the worker-count policy even when the raw config
            // asks for something absurd.
            worker_count: WorkerCount::new(config.number_of_worker_threads).count(),
            buffers_per_worker: config.number_of_buffers_per_worker,
            worker_to_core_mapping: config.parsed_core_mapping()?,
            termination_deadline: config.termination_deadline(),
        };
        let query_manager = QueryManager::new(
            settings,
            Arc::clone(&buffer_manager),
            Arc::new(LoggingStatusListener),
        );
        query_manager.start()?;

        let network = match &config.network {
            Some(net) => Some(NetworkManager::new(NodeLocation::new(
                net.listen_host.clone(),
                net.listen_port,
            ))?),
            None => None,
        };
        let metrics = MetricsService::new()?;
        metrics.sample_buffer_pool(&buffer_manager);

        info!("node engine up");
        Ok(Arc::new(Self {
            config,
            buffer_manager,
            query_manager,
            network,
            metrics,
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &WorkerConfiguration {
        &self.config
    }

    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.buffer_manager
    }

    pub fn query_manager(&self) -> &Arc<QueryManager> {
        &self.query_manager
    }

    pub fn network(&self) -> Option<&Arc<NetworkManager>> {
        self.network.as_ref()
    }

    pub fn metrics(&self) -> &Arc<MetricsService> {
        &self.metrics
    }

    /// Fresh plan builder for a query deployed to this node.
    pub fn plan_builder(&self, query_id: QueryId) -> QueryPlanBuilder {
        QueryPlanBuilder::new(query_id)
    }

    /// Wraps a source implementation into a driver runner wired to this
    /// engine, with the configured per-source pool reservation.
    pub fn create_source_runner(
        &self,
        origin: OriginId,
        source: Box<dyn DataSource>,
        plan: &Arc<ExecutableQueryPlan>,
        buffers_to_produce: u64,
    ) -> Result<Arc<SourceRunner>, EngineError> {
        SourceRunner::new(
            origin,
            source,
            Arc::clone(&self.query_manager),
            Arc::clone(plan),
            self.config.number_of_buffers_per_source_local_pool,
            buffers_to_produce,
        )
    }

    pub fn register_query(
        &self,
        plan: Arc<ExecutableQueryPlan>,
        sources: Vec<Arc<dyn ManagedSource>>,
    ) -> Result<(), EngineError> {
        self.query_manager.register_query(plan, sources)
    }

    pub fn start_query(&self, query_id: QueryId) -> Result<(), EngineError> {
        let result = self.query_manager.start_query(query_id);
        self.refresh_running_gauge();
        result
    }

    pub fn stop_query(&self, query_id: QueryId, kind: TerminationKind) -> Result<(), EngineError> {
        let timer = TimedOperation::begin("stop_query");
        let result = self.query_manager.stop_query(query_id, kind);
        self.metrics.observe_stop_latency(timer.elapsed_seconds());
        self.refresh_running_gauge();
        result
    }

    pub fn unregister_query(&self, query_id: QueryId) -> Result<(), EngineError> {
        self.query_manager.unregister_query(query_id)
    }

    /// Redeploys a query with a new plan: graceful stop, unregister,
    /// register, start. This is the implemented path behind
    /// `enable_query_reconfiguration`; in-place reconfiguration of a
    /// running plan is deferred and reported as unsupported.
    pub fn redeploy_query(
        &self,
        query_id: QueryId,
        plan: Arc<ExecutableQueryPlan>,
        sources: Vec<Arc<dyn ManagedSource>>,
    ) -> Result<(), EngineError> {
        if !self.config.enable_query_reconfiguration {
            return Err(EngineError::unsupported(
                "query reconfiguration is disabled; set enable_query_reconfiguration",
            ));
        }
        let new_query_id = plan.query_id();
        self.stop_query(query_id, TerminationKind::Graceful)?;
        self.unregister_query(query_id)?;
        self.register_query(plan, sources)?;
        self.start_query(new_query_id)
    }

    pub fn query_status(&self, query_id: QueryId) -> Option<ExecutionStatus> {
        self.query_manager.query_status(query_id)
    }

    pub fn statistics(&self, query_id: QueryId) -> Option<StatisticsSnapshot> {
        self.query_manager.statistics(query_id)
    }

    pub fn statistics_all(&self) -> Vec<StatisticsSnapshot> {
        self.query_manager.statistics_all()
    }

    /// One collector pass: per-query counters and pool occupancy into the
    /// metrics registry.
    pub fn sample_metrics(&self) {
        for snapshot in self.query_manager.statistics_all() {
            self.metrics.observe_statistics(&snapshot);
        }
        self.metrics.sample_buffer_pool(&self.buffer_manager);
    }

    fn refresh_running_gauge(&self) {
        self.metrics
            .set_queries_running(self.query_manager.running_query_count() as i64);
    }

    /// Stops every query, drains the worker pool, and releases the pools.
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("node engine shutting down");
        self.query_manager.shutdown();
        if let Some(network) = &self.network {
            network.shutdown();
        }
        self.buffer_manager.shutdown();
        self.sample_metrics();
        info!("node engine down");
    }

    /// Process exit code for a terminal engine error.
    pub fn exit_code_for(error: &EngineError) -> i32 {
        match error {
            EngineError::BufferPoolExhausted(_) => 2,
            EngineError::InvalidPlan(_) => 3,
            EngineError::InvalidConfiguration(_) => 4,
            _ => 1,
        }
    }
}

impl Drop for NodeEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for NodeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeEngine")
            .field("config", &self.config)
            .field("networked", &self.network.is_some())
            .finish()
    }
}
