// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Query Manager
//!
//! The query manager owns the worker pool and the lifecycle of every
//! deployed query. It dispatches data tasks to exactly one worker and
//! reconfiguration broadcasts to all of them, tracks per-origin end-of-
//! stream propagation through the plan DAG, and resolves each plan's
//! termination latch when the last terminal target finishes.
//!
//! ## Queue modes
//!
//! - **Dynamic**: one shared MPMC queue; any worker takes the next task.
//!   Broadcast copies are pushed once per worker; the arrival barrier inside
//!   the message guarantees each worker claims exactly one copy.
//! - **Static**: one queue per worker; data tasks are routed by target id,
//!   broadcasts push one copy into every queue.
//!
//! Both modes share the FIFO property the reconfiguration protocol needs: a
//! broadcast posted at time `t` is dispatched after the data tasks already
//! queued at `t` toward the same target.
//!
//! ## End-of-stream propagation
//!
//! A source's termination becomes at most one end-of-stream per origin
//! (duplicates are suppressed engine-wide). Graceful EoS drains: a pipeline
//! terminates when its last predecessor delivered EoS, then cascades to its
//! successors. Hard and failure EoS short-circuit: the first one terminates
//! the pipeline, and in-flight data tasks for the query are dropped at
//! dispatch. When the last sink (or leaf pipeline) finishes, the plan's
//! termination latch resolves and the query transitions to its terminal
//! status.

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use tidal_domain::{
    EngineError, ExecutionStatus, OriginId, QueryId, QueryStatistics, ReconfigurationType,
    StatisticsSnapshot, StreamEvent, TerminationKind, TerminationResult, WorkerThreadId,
};

use crate::infrastructure::config::engine_config::QueryManagerMode;
use crate::infrastructure::memory::buffer_manager::BufferManager;
use crate::infrastructure::memory::fixed_size_pool::FixedSizeBufferPool;
use crate::infrastructure::memory::tuple_buffer::TupleBuffer;
use crate::infrastructure::runtime::executable_plan::{
    ExecutableQueryPlan, SuccessorTarget,
};
use crate::infrastructure::runtime::pipeline_execution_context::{
    PipelineExecutionContext, TaskEmitter, WorkerLocalState,
};
use crate::infrastructure::runtime::reconfiguration::{
    ReconfigurationMessage, ReconfigurationTarget,
};
use crate::infrastructure::runtime::task::Task;
use crate::infrastructure::sources::managed_source::ManagedSource;

/// Observer of query lifecycle events. The engine never swallows a
/// terminal error: every one reaches this listener.
pub trait QueryStatusListener: Send + Sync {
    fn on_status_change(&self, query_id: QueryId, status: ExecutionStatus);

    fn on_terminal_error(&self, query_id: QueryId, message: &str);

    /// In-band stream events: end-of-stream markers, source errors, epochs.
    fn on_stream_event(&self, query_id: QueryId, event: &StreamEvent) {
        let _ = (query_id, event);
    }
}

/// Default listener: structured logs only.
#[derive(Debug, Default)]
pub struct LoggingStatusListener;

impl QueryStatusListener for LoggingStatusListener {
    fn on_status_change(&self, query_id: QueryId, status: ExecutionStatus) {
        info!(%query_id, %status, "query status changed");
    }

    fn on_terminal_error(&self, query_id: QueryId, message: &str) {
        error!(%query_id, message, "query terminated with error");
    }

    fn on_stream_event(&self, query_id: QueryId, event: &StreamEvent) {
        debug!(%query_id, ?event, "stream event");
    }
}

enum QueueModel {
    Dynamic {
        tx: Sender<Task>,
        rx: Receiver<Task>,
    },
    Static {
        senders: Vec<Sender<Task>>,
        receivers: Mutex<Vec<Option<Receiver<Task>>>>,
    },
}

struct QueryEntry {
    plan: Arc<ExecutableQueryPlan>,
    sources: Vec<Arc<dyn ManagedSource>>,
}

/// Construction parameters for the query manager.
pub struct QueryManagerSettings {
    pub mode: QueryManagerMode,
    pub worker_count: usize,
    pub buffers_per_worker: usize,
    pub worker_to_core_mapping: Vec<usize>,
    pub termination_deadline: Duration,
}

impl Default for QueryManagerSettings {
    fn default() -> Self {
        Self {
            mode: QueryManagerMode::Dynamic,
            worker_count: 1,
            buffers_per_worker: 12,
            worker_to_core_mapping: Vec::new(),
            termination_deadline: Duration::from_secs(600),
        }
    }
}

/// The engine's task dispatcher and query lifecycle owner.
pub struct QueryManager {
    mode: QueryManagerMode,
    worker_count: usize,
    buffers_per_worker: usize,
    worker_to_core_mapping: Vec<usize>,
    termination_deadline: Duration,
    buffer_manager: Arc<BufferManager>,
    queues: QueueModel,
    workers: Mutex<Vec<JoinHandle<()>>>,
    queries: RwLock<HashMap<QueryId, QueryEntry>>,
    origin_owner: RwLock<HashMap<OriginId, QueryId>>,
    /// Origins whose end-of-stream already entered the plan; duplicates are
    /// suppressed here, engine-wide.
    eos_sent: Mutex<HashSet<OriginId>>,
    statistics: RwLock<HashMap<QueryId, Arc<QueryStatistics>>>,
    listener: Arc<dyn QueryStatusListener>,
    started: AtomicBool,
    shutting_down: AtomicBool,
}

impl QueryManager {
    pub fn new(
        settings: QueryManagerSettings,
        buffer_manager: Arc<BufferManager>,
        listener: Arc<dyn QueryStatusListener>,
    ) -> Arc<Self> {
        let worker_count = settings.worker_count.max(1);
        let queues = match settings.mode {
            QueryManagerMode::Dynamic => {
                let (tx, rx) = unbounded();
                QueueModel::Dynamic { tx, rx }
            }
            QueryManagerMode::Static => {
                let mut senders = Vec::with_capacity(worker_count);
                let mut receivers = Vec::with_capacity(worker_count);
                for _ in 0..worker_count {
                    let (tx, rx) = unbounded();
                    senders.push(tx);
                    receivers.push(Some(rx));
                }
                QueueModel::Static { senders, receivers: Mutex::new(receivers) }
            }
        };
        Arc::new(Self {
            mode: settings.mode,
            worker_count,
            buffers_per_worker: settings.buffers_per_worker.max(1),
            worker_to_core_mapping: settings.worker_to_core_mapping,
            termination_deadline: settings.termination_deadline,
            buffer_manager,
            queues,
            workers: Mutex::new(Vec::new()),
            queries: RwLock::new(HashMap::new()),
            origin_owner: RwLock::new(HashMap::new()),
            eos_sent: Mutex::new(HashSet::new()),
            statistics: RwLock::new(HashMap::new()),
            listener,
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn mode(&self) -> QueryManagerMode {
        self.mode
    }

    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.buffer_manager
    }

    /// Spawns the worker pool. Must be called exactly once before any query
    /// is started.
    ///
    /// # Errors
    /// `EngineError::BufferPoolExhausted` when per-worker pool reservations
    /// do not fit the global pool, `EngineError::InvalidLifecycle` on a
    /// second call.
    pub fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::invalid_lifecycle("worker pool already started"));
        }
        let mut workers = self.workers.lock();
        for index in 0..self.worker_count {
            let worker_id = WorkerThreadId(index as u32);
            let local_pool = self.buffer_manager.create_fixed_size_pool(self.buffers_per_worker)?;
            let receiver = match &self.queues {
                QueueModel::Dynamic { rx, .. } => rx.clone(),
                QueueModel::Static { receivers, .. } => receivers.lock()[index]
                    .take()
                    .ok_or_else(|| EngineError::internal("static worker queue already claimed"))?,
            };
            let manager = Arc::clone(self);
            let core = self.worker_to_core_mapping.get(index).copied();
            let handle = std::thread::Builder::new()
                .name(format!("tidal-worker-{index}"))
                .spawn(move || {
                    if let Some(core) = core {
                        if tidal_bootstrap::platform::pin_thread_to_core(core) {
                            debug!(worker = index, core, "pinned worker to core");
                        } else {
                            warn!(worker = index, core, "core pinning unavailable");
                        }
                    }
                    worker_loop(manager, worker_id, receiver, local_pool);
                })
                .map_err(|e| EngineError::internal(format!("cannot spawn worker: {e}")))?;
            workers.push(handle);
        }
        info!(workers = self.worker_count, mode = ?self.mode, "worker pool started");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Query lifecycle
    // ------------------------------------------------------------------

    /// Registers a deployed plan with its sources. No tasks are dispatched.
    ///
    /// # Errors
    /// `EngineError::InvalidPlan` for duplicate query ids, duplicate origin
    /// ids (engine-wide), or plans whose origins do not match the supplied
    /// sources.
    pub fn register_query(
        &self,
        plan: Arc<ExecutableQueryPlan>,
        sources: Vec<Arc<dyn ManagedSource>>,
    ) -> Result<(), EngineError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(EngineError::invalid_lifecycle("engine is shutting down"));
        }
        let query_id = plan.query_id();
        let mut queries = self.queries.write();
        if queries.contains_key(&query_id) {
            return Err(EngineError::invalid_plan(format!("query {query_id} already registered")));
        }

        let plan_origins: HashSet<OriginId> = plan.origins().copied().collect();
        let source_origins: HashSet<OriginId> = sources.iter().map(|s| s.origin_id()).collect();
        if plan_origins != source_origins {
            return Err(EngineError::invalid_plan(format!(
                "query {query_id}: plan origins do not match supplied sources"
            )));
        }

        {
            let mut owners = self.origin_owner.write();
            for origin in &plan_origins {
                if owners.contains_key(origin) {
                    return Err(EngineError::invalid_plan(format!(
                        "duplicate {origin}: already owned by another query"
                    )));
                }
            }
            for origin in &plan_origins {
                owners.insert(*origin, query_id);
            }
        }

        self.statistics.write().insert(query_id, Arc::new(QueryStatistics::new(query_id)));
        queries.insert(query_id, QueryEntry { plan, sources });
        drop(queries);
        debug!(%query_id, "query registered");
        self.listener.on_status_change(query_id, ExecutionStatus::Registered);
        Ok(())
    }

    /// Starts a registered query: sets up sinks, then pipelines (consumers
    /// before producers), starts operator handlers, transitions to
    /// `Running`, and finally starts the sources.
    ///
    /// # Errors
    /// Setup failures prevent the transition to `Running` and leave the
    /// query `Failed`.
    pub fn start_query(self: &Arc<Self>, query_id: QueryId) -> Result<(), EngineError> {
        let (plan, sources) = self.entry(query_id)?;
        if plan.status() != ExecutionStatus::Registered {
            return Err(EngineError::invalid_lifecycle(format!(
                "query {query_id} is {} and cannot start",
                plan.status()
            )));
        }

        if let Err(error) = self.setup_plan(&plan) {
            plan.record_error(error.to_string());
            let _ = plan.transition(ExecutionStatus::Failed);
            plan.force_termination(TerminationResult::Failed(error.to_string()));
            self.listener.on_status_change(query_id, ExecutionStatus::Failed);
            self.listener.on_terminal_error(query_id, &error.to_string());
            return Err(error);
        }

        plan.transition(ExecutionStatus::Running)?;
        if let Some(stats) = self.statistics.read().get(&query_id) {
            stats.mark_started(now_millis());
        }
        self.listener.on_status_change(query_id, ExecutionStatus::Running);

        for source in &sources {
            if let Err(error) = source.start() {
                self.notify_source_failure(source.origin_id(), error.to_string());
                return Err(error);
            }
        }
        info!(%query_id, sources = sources.len(), "query started");
        Ok(())
    }

    fn setup_plan(self: &Arc<Self>, plan: &Arc<ExecutableQueryPlan>) -> Result<(), EngineError> {
        // Sinks first, then pipelines consumers-before-producers, so every
        // stage's downstream is ready when it initializes.
        for (sink_id, entry) in plan.sinks() {
            entry.sink().setup().map_err(|e| {
                EngineError::stage_execution(format!("setup of {sink_id} failed: {e}"))
            })?;
        }

        let setup_pool = self.buffer_manager.create_fixed_size_pool(1)?;
        let mut local_state = WorkerLocalState::default();
        for pipeline_id in plan.topological_order().iter().rev() {
            let pipeline = plan.pipeline(*pipeline_id)?;
            let mut ctx = PipelineExecutionContext::new(
                WorkerThreadId(0),
                self.worker_count,
                plan,
                pipeline,
                self.as_ref(),
                &setup_pool,
                &self.buffer_manager,
                &mut local_state,
            );
            pipeline.stage().setup(&mut ctx).map_err(|e| {
                EngineError::stage_execution(format!("setup of {pipeline_id} failed: {e}"))
            })?;
        }
        setup_pool.destroy();

        for handler in plan.operator_handlers() {
            handler.start(self.worker_count)?;
        }
        Ok(())
    }

    /// Stops a query with the given termination kind. Idempotent: stopping
    /// a terminal query returns success immediately.
    ///
    /// # Errors
    /// `EngineError::Timeout` when the plan does not terminate within the
    /// configured deadline; the query then transitions to `Failed`.
    pub fn stop_query(&self, query_id: QueryId, kind: TerminationKind) -> Result<(), EngineError> {
        let (plan, sources) = self.entry(query_id)?;

        if plan.status().is_terminal() {
            debug!(%query_id, "stop on terminal query is a no-op");
            return Ok(());
        }
        if plan.status() == ExecutionStatus::Registered {
            // Never started: nothing to drain, nothing to broadcast.
            let status = plan.transition(kind.terminal_status())?;
            plan.force_termination(match kind {
                TerminationKind::Failure => TerminationResult::Failed("stopped with failure".into()),
                kind => TerminationResult::Completed(kind),
            });
            self.listener.on_status_change(query_id, status);
            return Ok(());
        }

        info!(%query_id, %kind, "stopping query");
        for source in &sources {
            // Non-blocking by contract; drivers notice the flag and wind
            // down on their own.
            let _ = source.stop(kind);
        }
        if kind != TerminationKind::Graceful {
            // Short-circuit: inject the end-of-stream here instead of
            // waiting for the drivers to drain.
            for origin in plan.origins() {
                let _ = self.add_end_of_stream(*origin, kind);
            }
        }

        match plan.termination().wait(self.termination_deadline) {
            Some(result) => {
                self.finalize_query(&plan, &result);
                Ok(())
            }
            None => {
                let message = format!("query {query_id} missed the termination deadline");
                plan.record_error(&message);
                plan.force_termination(TerminationResult::Failed(message.clone()));
                let _ = plan.transition(ExecutionStatus::Failed);
                self.listener.on_status_change(query_id, ExecutionStatus::Failed);
                self.listener.on_terminal_error(query_id, &message);
                Err(EngineError::Timeout(message))
            }
        }
    }

    /// Releases a query's registration and handler storage.
    ///
    /// # Errors
    /// `EngineError::InvalidLifecycle` while the query is running; only
    /// never-started or terminal queries may be unregistered.
    pub fn unregister_query(&self, query_id: QueryId) -> Result<(), EngineError> {
        let mut queries = self.queries.write();
        let status = queries
            .get(&query_id)
            .map(|entry| entry.plan.status())
            .ok_or_else(|| EngineError::QueryNotFound(format!("query {query_id}")))?;
        if !(status.is_terminal() || status == ExecutionStatus::Registered) {
            return Err(EngineError::invalid_lifecycle(format!(
                "cannot unregister query {query_id} in status {status}"
            )));
        }
        if let Some(entry) = queries.remove(&query_id) {
            let mut owners = self.origin_owner.write();
            let mut eos = self.eos_sent.lock();
            for origin in entry.plan.origins() {
                owners.remove(origin);
                eos.remove(origin);
            }
        }
        self.statistics.write().remove(&query_id);
        debug!(%query_id, "query unregistered");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Task dispatch
    // ------------------------------------------------------------------

    /// Enqueues one data task toward `target`.
    pub fn add_work(
        &self,
        plan: &Arc<ExecutableQueryPlan>,
        target: SuccessorTarget,
        buffer: TupleBuffer,
    ) -> Result<(), EngineError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Ok(());
        }
        let task = Task::Data { plan: Arc::clone(plan), target, buffer };
        self.send_task(task, self.route(target))
    }

    /// Broadcasts a reconfiguration message to every worker. With
    /// `blocking`, waits until the last worker ran the post callback; never
    /// call blocking from a worker thread.
    pub fn add_reconfiguration_message(
        &self,
        message: Arc<ReconfigurationMessage>,
        blocking: bool,
    ) -> Result<(), EngineError> {
        if !self.started.load(Ordering::Acquire) {
            return Err(EngineError::invalid_lifecycle("worker pool not started"));
        }
        match &self.queues {
            QueueModel::Dynamic { tx, .. } => {
                for _ in 0..self.worker_count {
                    tx.send(Task::Reconfiguration(Arc::clone(&message)))
                        .map_err(|_| EngineError::internal("task queue closed"))?;
                }
            }
            QueueModel::Static { senders, .. } => {
                for sender in senders {
                    sender
                        .send(Task::Reconfiguration(Arc::clone(&message)))
                        .map_err(|_| EngineError::internal("task queue closed"))?;
                }
            }
        }
        if blocking && !message.wait_done(self.termination_deadline) {
            return Err(EngineError::Timeout(format!(
                "reconfiguration {} for query {} timed out",
                message.reconfiguration_type(),
                message.query_id()
            )));
        }
        Ok(())
    }

    /// Converts one origin's termination into end-of-stream reconfigurations
    /// toward its successors. Returns `false` when the origin's EoS was
    /// already delivered (duplicates are suppressed engine-wide).
    pub fn add_end_of_stream(&self, origin: OriginId, kind: TerminationKind) -> Result<bool, EngineError> {
        {
            let mut sent = self.eos_sent.lock();
            if !sent.insert(origin) {
                debug!(%origin, %kind, "suppressed duplicate end-of-stream");
                return Ok(false);
            }
        }
        let query_id = self
            .origin_owner
            .read()
            .get(&origin)
            .copied()
            .ok_or_else(|| EngineError::QueryNotFound(format!("{origin} owns no query")))?;
        let (plan, _) = self.entry(query_id)?;
        debug!(%origin, %kind, %query_id, "end-of-stream entering plan");
        self.listener
            .on_stream_event(query_id, &StreamEvent::EndOfStream { origin_id: origin, kind });
        for target in plan.source_successors(origin)?.clone() {
            match target {
                SuccessorTarget::Pipeline(id) => {
                    self.send_end_of_stream_to_pipeline(&plan, id, kind)?;
                }
                SuccessorTarget::Sink(id) => self.enqueue_sink_eos(&plan, id, kind)?,
            }
        }
        Ok(true)
    }

    /// A source driver failed; the query fails, other queries continue.
    pub fn notify_source_failure(&self, origin: OriginId, message: String) {
        error!(%origin, message, "source failure");
        let Some(query_id) = self.origin_owner.read().get(&origin).copied() else {
            warn!(%origin, "failure for unknown origin");
            return;
        };
        let Ok((plan, sources)) = self.entry(query_id) else { return };
        plan.record_error(&message);
        self.listener.on_stream_event(
            query_id,
            &StreamEvent::SourceError { origin_id: origin, message: message.clone() },
        );
        self.listener.on_terminal_error(query_id, &message);
        for source in &sources {
            let _ = source.stop(TerminationKind::Failure);
        }
        for origin in plan.origins() {
            let _ = self.add_end_of_stream(*origin, TerminationKind::Failure);
        }
    }

    /// A source driver wound down normally.
    pub fn notify_source_completion(&self, origin: OriginId, kind: TerminationKind) {
        debug!(%origin, %kind, "source completed");
    }

    /// An epoch barrier surfaced on a network source's back-channel.
    pub fn notify_epoch_event(&self, origin: OriginId, epoch: u64) {
        let Some(query_id) = self.origin_owner.read().get(&origin).copied() else {
            return;
        };
        self.listener
            .on_stream_event(query_id, &StreamEvent::Epoch { origin_id: origin, epoch });
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    pub fn statistics(&self, query_id: QueryId) -> Option<StatisticsSnapshot> {
        self.statistics.read().get(&query_id).map(|s| s.snapshot())
    }

    pub fn statistics_all(&self) -> Vec<StatisticsSnapshot> {
        self.statistics.read().values().map(|s| s.snapshot()).collect()
    }

    pub fn query_status(&self, query_id: QueryId) -> Option<ExecutionStatus> {
        self.queries.read().get(&query_id).map(|entry| entry.plan.status())
    }

    pub fn running_query_count(&self) -> usize {
        self.queries
            .read()
            .values()
            .filter(|entry| entry.plan.status() == ExecutionStatus::Running)
            .count()
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Hard-stops every query and winds the worker pool down. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("query manager shutting down");
        let ids: Vec<QueryId> = self.queries.read().keys().copied().collect();
        for query_id in ids {
            if let Err(error) = self.stop_query(query_id, TerminationKind::Hard) {
                warn!(%query_id, %error, "query did not stop cleanly at shutdown");
            }
        }
        match &self.queues {
            QueueModel::Dynamic { tx, .. } => {
                for _ in 0..self.worker_count {
                    let _ = tx.send(Task::Shutdown);
                }
            }
            QueueModel::Static { senders, .. } => {
                for sender in senders {
                    let _ = sender.send(Task::Shutdown);
                }
            }
        }
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        info!("worker pool drained");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn entry(&self, query_id: QueryId) -> Result<(Arc<ExecutableQueryPlan>, Vec<Arc<dyn ManagedSource>>), EngineError> {
        let queries = self.queries.read();
        let entry = queries
            .get(&query_id)
            .ok_or_else(|| EngineError::QueryNotFound(format!("query {query_id}")))?;
        Ok((Arc::clone(&entry.plan), entry.sources.clone()))
    }

    fn route(&self, target: SuccessorTarget) -> usize {
        match target {
            SuccessorTarget::Pipeline(id) => id.raw() as usize % self.worker_count,
            SuccessorTarget::Sink(id) => id.0 as usize % self.worker_count,
        }
    }

    fn send_task(&self, task: Task, static_route: usize) -> Result<(), EngineError> {
        match &self.queues {
            QueueModel::Dynamic { tx, .. } => tx
                .send(task)
                .map_err(|_| EngineError::internal("task queue closed")),
            QueueModel::Static { senders, .. } => senders[static_route]
                .send(task)
                .map_err(|_| EngineError::internal("task queue closed")),
        }
    }

    fn send_end_of_stream_to_pipeline(
        &self,
        plan: &Arc<ExecutableQueryPlan>,
        pipeline_id: tidal_domain::PipelineId,
        kind: TerminationKind,
    ) -> Result<(), EngineError> {
        let pipeline = Arc::clone(plan.pipeline(pipeline_id)?);
        let message = ReconfigurationMessage::new(
            plan.query_id(),
            ReconfigurationType::end_of_stream(kind),
            ReconfigurationTarget::Pipeline(pipeline),
            Arc::clone(plan),
            self.worker_count,
        );
        self.add_reconfiguration_message(message, false)
    }

    /// Queues a sink's end-of-stream behind every buffer already emitted
    /// toward it; a worker performs the actual delivery.
    fn enqueue_sink_eos(
        &self,
        plan: &Arc<ExecutableQueryPlan>,
        sink_id: crate::infrastructure::runtime::executable_plan::SinkId,
        kind: TerminationKind,
    ) -> Result<(), EngineError> {
        let task = Task::SinkTermination { plan: Arc::clone(plan), sink_id, kind };
        self.send_task(task, self.route(SuccessorTarget::Sink(sink_id)))
    }

    fn deliver_sink_eos(&self, plan: &Arc<ExecutableQueryPlan>, sink_id: crate::infrastructure::runtime::executable_plan::SinkId, kind: TerminationKind) {
        let Ok(entry) = plan.sink_entry(sink_id) else {
            error!(%sink_id, "end-of-stream for unknown sink");
            return;
        };
        let should_terminate = match kind {
            TerminationKind::Graceful => entry.predecessor_drained(),
            _ => true,
        };
        if should_terminate && entry.mark_terminated() {
            if let Err(error) = entry.sink().handle_end_of_stream(kind) {
                plan.record_error(error.to_string());
            }
            if let Err(error) = entry.sink().stop() {
                plan.record_error(error.to_string());
            }
            self.finish_terminal(plan, kind);
        }
    }

    fn finish_terminal(&self, plan: &Arc<ExecutableQueryPlan>, kind: TerminationKind) {
        if let Some(result) = plan.terminal_finished(kind) {
            self.finalize_query(plan, &result);
        }
    }

    /// Applies the terminal status and schedules the destroy broadcast.
    /// Runs from whichever thread resolved the latch first; later callers
    /// find the transitions already applied and back off.
    fn finalize_query(&self, plan: &Arc<ExecutableQueryPlan>, result: &TerminationResult) {
        let query_id = plan.query_id();
        let status = match result {
            TerminationResult::Completed(kind) => kind.terminal_status(),
            TerminationResult::Failed(_) => ExecutionStatus::Failed,
        };
        if plan.status() != status {
            match plan.transition(status) {
                Ok(applied) => self.listener.on_status_change(query_id, applied),
                Err(error) => debug!(%query_id, %error, "terminal transition already applied"),
            }
        }
        if let TerminationResult::Failed(message) = result {
            self.listener.on_terminal_error(query_id, message);
        }
        let kind = match result {
            TerminationResult::Completed(kind) => *kind,
            TerminationResult::Failed(_) => TerminationKind::Failure,
        };
        if plan.claim_destroy() {
            for handler in plan.operator_handlers() {
                if let Err(error) = handler.terminate(kind) {
                    warn!(%query_id, %error, "operator handler terminate failed");
                }
            }
            let message = ReconfigurationMessage::new(
                query_id,
                ReconfigurationType::Destroy,
                ReconfigurationTarget::Plan,
                Arc::clone(plan),
                self.worker_count,
            );
            if let Err(error) = self.add_reconfiguration_message(message, false) {
                warn!(%query_id, %error, "destroy broadcast failed");
            }
        }
    }

    fn fail_query_from_worker(&self, plan: &Arc<ExecutableQueryPlan>, message: String) {
        error!(query_id = %plan.query_id(), message, "stage execution failed");
        plan.record_error(&message);
        if let Ok((_, sources)) = self.entry(plan.query_id()) {
            for source in &sources {
                let _ = source.stop(TerminationKind::Failure);
            }
        }
        for origin in plan.origins() {
            let _ = self.add_end_of_stream(*origin, TerminationKind::Failure);
        }
    }

    fn process_data(
        self: &Arc<Self>,
        worker_id: WorkerThreadId,
        plan: &Arc<ExecutableQueryPlan>,
        target: SuccessorTarget,
        buffer: TupleBuffer,
        local_pool: &Arc<FixedSizeBufferPool>,
        local_state: &mut WorkerLocalState,
    ) {
        let stats = self.statistics.read().get(&plan.query_id()).cloned();
        if let Some(stats) = &stats {
            stats.record_task();
        }
        if plan.status() != ExecutionStatus::Running {
            // Hard-stopped or failed mid-flight: the buffer is dropped and
            // recycles through its pool.
            debug!(query_id = %plan.query_id(), "dropping task for non-running query");
            return;
        }
        match target {
            SuccessorTarget::Pipeline(pipeline_id) => {
                let pipeline = match plan.pipeline(pipeline_id) {
                    Ok(pipeline) => Arc::clone(pipeline),
                    Err(error) => {
                        self.fail_query_from_worker(plan, error.to_string());
                        return;
                    }
                };
                if pipeline.is_terminated() {
                    debug!(%pipeline_id, "dropping task for terminated pipeline");
                    return;
                }
                let tuples = buffer.number_of_tuples() as u64;
                let mut ctx = PipelineExecutionContext::new(
                    worker_id,
                    self.worker_count,
                    plan,
                    &pipeline,
                    self.as_ref(),
                    local_pool,
                    &self.buffer_manager,
                    local_state,
                );
                match pipeline.stage().execute(buffer, &mut ctx) {
                    Ok(()) => {
                        if let Some(stats) = &stats {
                            stats.record_buffer(tuples);
                        }
                    }
                    Err(error) => self.fail_query_from_worker(plan, error.to_string()),
                }
            }
            SuccessorTarget::Sink(sink_id) => {
                let tuples = buffer.number_of_tuples() as u64;
                match plan.sink(sink_id).and_then(|sink| sink.write(buffer)) {
                    Ok(()) => {
                        if let Some(stats) = &stats {
                            stats.record_buffer(tuples);
                        }
                    }
                    Err(error) => self.fail_query_from_worker(plan, error.to_string()),
                }
            }
        }
    }

    fn process_reconfiguration(
        self: &Arc<Self>,
        worker_id: WorkerThreadId,
        message: &Arc<ReconfigurationMessage>,
        local_pool: &Arc<FixedSizeBufferPool>,
        local_state: &mut WorkerLocalState,
    ) {
        message.arrive_and_wait();
        let rtype = message.reconfiguration_type();
        match message.target() {
            ReconfigurationTarget::Pipeline(pipeline) => {
                for &index in pipeline.handler_indices() {
                    if let Ok(handler) = message.plan().operator_handler(index) {
                        handler.reconfigure(rtype, worker_id);
                    }
                }
            }
            ReconfigurationTarget::Plan => {
                if rtype == ReconfigurationType::Destroy {
                    local_state.clear_query(message.query_id());
                }
                for handler in message.plan().operator_handlers() {
                    handler.reconfigure(rtype, worker_id);
                }
            }
            ReconfigurationTarget::Custom(custom) => custom.reconfigure(message, worker_id),
        }
        if message.finish_worker() {
            self.post_reconfiguration(worker_id, message, local_pool, local_state);
            message.mark_done();
        }
    }

    /// The once-per-broadcast callback, run by the last worker.
    fn post_reconfiguration(
        self: &Arc<Self>,
        worker_id: WorkerThreadId,
        message: &Arc<ReconfigurationMessage>,
        local_pool: &Arc<FixedSizeBufferPool>,
        local_state: &mut WorkerLocalState,
    ) {
        let plan = message.plan();
        let rtype = message.reconfiguration_type();
        match (rtype.termination_kind(), message.target()) {
            (Some(kind), ReconfigurationTarget::Pipeline(pipeline)) => {
                let should_terminate = match kind {
                    TerminationKind::Graceful => pipeline.predecessor_drained(),
                    _ => true,
                };
                if !(should_terminate && pipeline.mark_terminated()) {
                    return;
                }
                {
                    let mut ctx = PipelineExecutionContext::new(
                        worker_id,
                        self.worker_count,
                        plan,
                        pipeline,
                        self.as_ref(),
                        local_pool,
                        &self.buffer_manager,
                        local_state,
                    );
                    for &index in pipeline.handler_indices() {
                        if let Ok(handler) = plan.operator_handler(index) {
                            if let Err(error) = handler.post_reconfiguration(rtype, &mut ctx) {
                                plan.record_error(format!(
                                    "handler {index} flush on {} failed: {error}",
                                    pipeline.id()
                                ));
                            }
                        }
                    }
                    if pipeline.mark_stopped() {
                        if let Err(error) = pipeline.stage().stop(&mut ctx) {
                            plan.record_error(format!("stop of {} failed: {error}", pipeline.id()));
                        }
                    }
                }
                if pipeline.successors().is_empty() {
                    self.finish_terminal(plan, kind);
                    return;
                }
                for target in pipeline.successors() {
                    match target {
                        SuccessorTarget::Pipeline(next) => {
                            if let Err(error) = self.send_end_of_stream_to_pipeline(plan, *next, kind) {
                                error!(%error, "end-of-stream cascade failed");
                            }
                        }
                        SuccessorTarget::Sink(sink_id) => {
                            if let Err(error) = self.enqueue_sink_eos(plan, *sink_id, kind) {
                                error!(%error, "sink end-of-stream cascade failed");
                            }
                        }
                    }
                }
            }
            (_, ReconfigurationTarget::Custom(custom)) => custom.post_reconfiguration(message),
            _ => {}
        }
    }
}

impl TaskEmitter for QueryManager {
    fn emit(
        &self,
        plan: &Arc<ExecutableQueryPlan>,
        target: SuccessorTarget,
        buffer: TupleBuffer,
    ) -> Result<(), EngineError> {
        self.add_work(plan, target, buffer)
    }
}

impl std::fmt::Debug for QueryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryManager")
            .field("workers", &self.worker_count)
            .field("mode", &self.mode)
            .field("queries", &self.queries.read().len())
            .finish()
    }
}

fn worker_loop(
    manager: Arc<QueryManager>,
    worker_id: WorkerThreadId,
    receiver: Receiver<Task>,
    local_pool: Arc<FixedSizeBufferPool>,
) {
    debug!(%worker_id, "worker online");
    let mut local_state = WorkerLocalState::default();
    while let Ok(task) = receiver.recv() {
        match task {
            Task::Shutdown => break,
            Task::Data { plan, target, buffer } => {
                manager.process_data(worker_id, &plan, target, buffer, &local_pool, &mut local_state);
            }
            Task::Reconfiguration(message) => {
                manager.process_reconfiguration(worker_id, &message, &local_pool, &mut local_state);
            }
            Task::SinkTermination { plan, sink_id, kind } => {
                manager.deliver_sink_eos(&plan, sink_id, kind);
            }
        }
    }
    local_pool.destroy();
    debug!(%worker_id, "worker offline");
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
