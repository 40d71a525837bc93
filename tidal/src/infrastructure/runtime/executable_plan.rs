// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Executable Query Plans
//!
//! The engine-side representation of a compiled query: a DAG of executable
//! pipeline stages with sources at the roots and sinks at the leaves. The
//! compiler that produced the stages is out of scope; the engine consumes
//! stages as opaque objects with three entry points (`setup`, `execute`,
//! `stop`) and drives their lifecycle.
//!
//! ## Structure
//!
//! - `ExecutablePipelineStage`: the compiled function plus lifecycle hooks
//! - `ExecutablePipeline`: a stage with its successors, predecessor
//!   bookkeeping, and handler indices
//! - `DataSink`: terminal consumer; physical sink implementations live
//!   outside the engine, tests and the network layer provide theirs
//! - `OperatorHandler`: long-lived state shared by all workers executing
//!   one operator of one query (window stores, join intervals, caches)
//! - `ExecutableQueryPlan`: the validated DAG plus lifecycle status, the
//!   stable handler vector, and the termination latch `stop_query` waits on
//!
//! Plans are built through `QueryPlanBuilder`, which validates the DAG shape
//! at registration time: dangling successor references, cycles, counts that
//! do not match the declared predecessors, and empty plans are all rejected
//! as `InvalidPlan` before anything runs.

use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tidal_domain::{
    EngineError, ExecutionStatus, OriginId, PipelineId, QueryId, ReconfigurationType,
    TerminationKind, TerminationResult, WorkerThreadId,
};

use crate::infrastructure::memory::tuple_buffer::TupleBuffer;
use crate::infrastructure::runtime::pipeline_execution_context::PipelineExecutionContext;

/// Identifier of a sink within one query plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SinkId(pub u64);

impl Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink({})", self.0)
    }
}

/// Where a pipeline or source hands its output buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuccessorTarget {
    Pipeline(PipelineId),
    Sink(SinkId),
}

impl Display for SuccessorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuccessorTarget::Pipeline(id) => write!(f, "{id}"),
            SuccessorTarget::Sink(id) => write!(f, "{id}"),
        }
    }
}

/// An opaque compiled pipeline stage.
///
/// Stage errors are values, not unwinds: a failing `execute` returns
/// `Err`, the worker converts it into a failure end-of-stream for the
/// owning query, and other queries are unaffected.
pub trait ExecutablePipelineStage: Send + Sync {
    /// One-time initialization before the query runs.
    fn setup(&self, ctx: &mut PipelineExecutionContext<'_>) -> Result<(), EngineError> {
        let _ = ctx;
        Ok(())
    }

    /// Processes one input buffer, emitting output through the context.
    fn execute(&self, buffer: TupleBuffer, ctx: &mut PipelineExecutionContext<'_>) -> Result<(), EngineError>;

    /// One-time teardown; runs exactly once per stage.
    fn stop(&self, ctx: &mut PipelineExecutionContext<'_>) -> Result<(), EngineError> {
        let _ = ctx;
        Ok(())
    }
}

/// Terminal consumer of a plan's output buffers.
pub trait DataSink: Send + Sync {
    fn setup(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn write(&self, buffer: TupleBuffer) -> Result<(), EngineError>;

    /// Exactly one end-of-stream notification per sink per query run.
    fn handle_end_of_stream(&self, kind: TerminationKind) -> Result<(), EngineError> {
        let _ = kind;
        Ok(())
    }

    fn stop(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Long-lived operator state shared across workers within one query.
///
/// Handlers live on the plan's stable handler vector; stages reach them by
/// index through the execution context. Concurrency discipline is the
/// handler's own business (window handlers partition state per worker and
/// merge under a mutex, caches are per-worker).
pub trait OperatorHandler: Send + Sync {
    /// Called once when the query starts, before any task runs.
    fn start(&self, worker_count: usize) -> Result<(), EngineError> {
        let _ = worker_count;
        Ok(())
    }

    /// Reconfiguration hook; invoked once per worker per broadcast. At a
    /// graceful end-of-stream each worker flushes its own state partition
    /// here.
    fn reconfigure(&self, rtype: ReconfigurationType, worker_id: WorkerThreadId) {
        let _ = (rtype, worker_id);
    }

    /// Runs once globally after every worker processed the broadcast; the
    /// context allows final results to be emitted downstream.
    fn post_reconfiguration(
        &self,
        rtype: ReconfigurationType,
        ctx: &mut PipelineExecutionContext<'_>,
    ) -> Result<(), EngineError> {
        let _ = (rtype, ctx);
        Ok(())
    }

    /// Called once when the query terminates.
    fn terminate(&self, kind: TerminationKind) -> Result<(), EngineError> {
        let _ = kind;
        Ok(())
    }

    /// Downcast support for typed access from stages.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// One node of the plan DAG: a stage plus its wiring.
pub struct ExecutablePipeline {
    id: PipelineId,
    stage: Arc<dyn ExecutablePipelineStage>,
    successors: Vec<SuccessorTarget>,
    handler_indices: Vec<usize>,
    /// Incoming edges (sources + pipelines) still to deliver graceful EoS.
    pending_predecessors: AtomicUsize,
    predecessor_count: usize,
    terminated: AtomicBool,
    stopped: AtomicBool,
}

impl ExecutablePipeline {
    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn stage(&self) -> &Arc<dyn ExecutablePipelineStage> {
        &self.stage
    }

    pub fn successors(&self) -> &[SuccessorTarget] {
        &self.successors
    }

    pub fn handler_indices(&self) -> &[usize] {
        &self.handler_indices
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Records one predecessor's graceful end-of-stream; true when all
    /// predecessors have drained and the pipeline may terminate.
    pub(crate) fn predecessor_drained(&self) -> bool {
        let remaining = self.pending_predecessors.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(remaining > 0, "more EoS than predecessors");
        remaining == 1
    }

    /// Marks the pipeline terminated; true on the first call.
    pub(crate) fn mark_terminated(&self) -> bool {
        !self.terminated.swap(true, Ordering::AcqRel)
    }

    /// Marks the stage stopped; true on the first call (stop runs once).
    pub(crate) fn mark_stopped(&self) -> bool {
        !self.stopped.swap(true, Ordering::AcqRel)
    }

    #[cfg(test)]
    pub(crate) fn pending_predecessors(&self) -> usize {
        self.pending_predecessors.load(Ordering::Acquire)
    }

    pub fn predecessor_count(&self) -> usize {
        self.predecessor_count
    }
}

impl fmt::Debug for ExecutablePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutablePipeline")
            .field("id", &self.id)
            .field("successors", &self.successors)
            .field("terminated", &self.terminated.load(Ordering::Relaxed))
            .finish()
    }
}

/// Latch `stop_query` blocks on; resolved exactly once when every terminal
/// target (sink or leaf pipeline) has finished.
pub(crate) struct TerminationLatch {
    result: Mutex<Option<TerminationResult>>,
    resolved: Condvar,
}

impl TerminationLatch {
    fn new() -> Self {
        Self { result: Mutex::new(None), resolved: Condvar::new() }
    }

    pub(crate) fn resolve(&self, result: TerminationResult) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(result);
            self.resolved.notify_all();
        }
    }

    /// Waits for resolution up to `deadline`.
    pub(crate) fn wait(&self, deadline: Duration) -> Option<TerminationResult> {
        let mut slot = self.result.lock();
        if slot.is_some() {
            return slot.clone();
        }
        let _ = self.resolved.wait_for(&mut slot, deadline);
        slot.clone()
    }

    pub(crate) fn peek(&self) -> Option<TerminationResult> {
        self.result.lock().clone()
    }
}

/// A sink with its end-of-stream bookkeeping: a sink fed by several
/// predecessors sees exactly one end-of-stream, after the last of them
/// drained (graceful) or on the first short-circuit (hard/failure).
pub struct SinkEntry {
    sink: Arc<dyn DataSink>,
    pending_predecessors: AtomicUsize,
    terminated: AtomicBool,
}

impl SinkEntry {
    pub fn sink(&self) -> &Arc<dyn DataSink> {
        &self.sink
    }

    /// Records one predecessor's graceful drain; true when all drained.
    pub(crate) fn predecessor_drained(&self) -> bool {
        self.pending_predecessors.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Marks the sink terminated; true on the first call.
    pub(crate) fn mark_terminated(&self) -> bool {
        !self.terminated.swap(true, Ordering::AcqRel)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

/// The validated, runnable plan.
pub struct ExecutableQueryPlan {
    query_id: QueryId,
    pipelines: HashMap<PipelineId, Arc<ExecutablePipeline>>,
    /// Producers before consumers; setup walks it in reverse.
    topological_order: Vec<PipelineId>,
    sinks: HashMap<SinkId, Arc<SinkEntry>>,
    source_successors: HashMap<OriginId, Vec<SuccessorTarget>>,
    handlers: Vec<Arc<dyn OperatorHandler>>,
    status: Mutex<ExecutionStatus>,
    /// Sinks plus leaf pipelines still running.
    pending_terminals: AtomicUsize,
    terminal_count: usize,
    error: Mutex<Option<String>>,
    termination: TerminationLatch,
    destroy_sent: AtomicBool,
}

impl ExecutableQueryPlan {
    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn status(&self) -> ExecutionStatus {
        *self.status.lock()
    }

    /// Validated status transition.
    pub(crate) fn transition(&self, next: ExecutionStatus) -> Result<ExecutionStatus, EngineError> {
        let mut status = self.status.lock();
        *status = status.transition_to(next)?;
        Ok(*status)
    }

    pub fn pipeline(&self, id: PipelineId) -> Result<&Arc<ExecutablePipeline>, EngineError> {
        self.pipelines
            .get(&id)
            .ok_or_else(|| EngineError::invalid_plan(format!("query {}: unknown pipeline {id}", self.query_id)))
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &Arc<ExecutablePipeline>> {
        self.pipelines.values()
    }

    pub fn sink(&self, id: SinkId) -> Result<&Arc<dyn DataSink>, EngineError> {
        self.sink_entry(id).map(|entry| entry.sink())
    }

    pub fn sink_entry(&self, id: SinkId) -> Result<&Arc<SinkEntry>, EngineError> {
        self.sinks
            .get(&id)
            .ok_or_else(|| EngineError::invalid_plan(format!("query {}: unknown {id}", self.query_id)))
    }

    pub fn sinks(&self) -> impl Iterator<Item = (&SinkId, &Arc<SinkEntry>)> {
        self.sinks.iter()
    }

    pub fn origins(&self) -> impl Iterator<Item = &OriginId> {
        self.source_successors.keys()
    }

    pub fn source_successors(&self, origin: OriginId) -> Result<&Vec<SuccessorTarget>, EngineError> {
        self.source_successors
            .get(&origin)
            .ok_or_else(|| EngineError::invalid_plan(format!("query {}: unknown origin {origin}", self.query_id)))
    }

    /// Pipelines in dependency order, producers first.
    pub fn topological_order(&self) -> &[PipelineId] {
        &self.topological_order
    }

    pub fn operator_handler(&self, index: usize) -> Result<&Arc<dyn OperatorHandler>, EngineError> {
        self.handlers.get(index).ok_or_else(|| {
            EngineError::invalid_plan(format!("query {}: no operator handler at index {index}", self.query_id))
        })
    }

    pub fn operator_handlers(&self) -> &[Arc<dyn OperatorHandler>] {
        &self.handlers
    }

    /// Records one terminal target as finished. When the last one reports,
    /// the termination latch resolves and the result is returned so the
    /// caller can finalize the query. A recorded error dominates the
    /// termination kind: a query that saw a stage error ends `Failed` even
    /// if the cascade that reached the terminals was graceful.
    pub(crate) fn terminal_finished(&self, kind: TerminationKind) -> Option<TerminationResult> {
        let remaining = self.pending_terminals.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(remaining > 0, "terminal over-completion");
        if remaining != 1 {
            return None;
        }
        let result = match (kind, self.error.lock().clone()) {
            (_, Some(message)) => TerminationResult::Failed(message),
            (TerminationKind::Failure, None) => TerminationResult::Failed("query failed".to_string()),
            (kind, None) => TerminationResult::Completed(kind),
        };
        self.termination.resolve(result.clone());
        Some(result)
    }

    /// Claims the one-shot destroy broadcast; true for the first caller.
    pub(crate) fn claim_destroy(&self) -> bool {
        !self.destroy_sent.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn record_error(&self, message: impl Into<String>) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(message.into());
        }
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub(crate) fn termination(&self) -> &TerminationLatch {
        &self.termination
    }

    /// Immediate latch resolution for plans torn down before any terminal
    /// could report (hard stop of a never-started query).
    pub(crate) fn force_termination(&self, result: TerminationResult) {
        self.termination.resolve(result);
    }

    pub fn terminal_count(&self) -> usize {
        self.terminal_count
    }
}

impl fmt::Debug for ExecutableQueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableQueryPlan")
            .field("query_id", &self.query_id)
            .field("pipelines", &self.pipelines.len())
            .field("sinks", &self.sinks.len())
            .field("status", &self.status())
            .finish()
    }
}

/// Builder validating a plan's DAG shape at registration time.
pub struct QueryPlanBuilder {
    query_id: QueryId,
    pipelines: Vec<(PipelineId, Arc<dyn ExecutablePipelineStage>, Vec<SuccessorTarget>, Vec<usize>)>,
    sinks: HashMap<SinkId, Arc<dyn DataSink>>,
    source_successors: HashMap<OriginId, Vec<SuccessorTarget>>,
    handlers: Vec<Arc<dyn OperatorHandler>>,
}

impl QueryPlanBuilder {
    pub fn new(query_id: QueryId) -> Self {
        Self {
            query_id,
            pipelines: Vec::new(),
            sinks: HashMap::new(),
            source_successors: HashMap::new(),
            handlers: Vec::new(),
        }
    }

    pub fn add_pipeline(
        mut self,
        id: PipelineId,
        stage: Arc<dyn ExecutablePipelineStage>,
        successors: Vec<SuccessorTarget>,
        handler_indices: Vec<usize>,
    ) -> Self {
        self.pipelines.push((id, stage, successors, handler_indices));
        self
    }

    pub fn add_sink(mut self, id: SinkId, sink: Arc<dyn DataSink>) -> Self {
        self.sinks.insert(id, sink);
        self
    }

    pub fn add_source(mut self, origin: OriginId, successors: Vec<SuccessorTarget>) -> Self {
        self.source_successors.insert(origin, successors);
        self
    }

    /// Registers a handler; stages reference it by the returned index.
    pub fn add_operator_handler(&mut self, handler: Arc<dyn OperatorHandler>) -> usize {
        self.handlers.push(handler);
        self.handlers.len() - 1
    }

    /// Validates and assembles the plan.
    ///
    /// # Errors
    /// `EngineError::InvalidPlan` for: no sources, no terminal targets,
    /// duplicate pipeline ids, dangling pipeline/sink references, handler
    /// indices out of range, or cycles.
    pub fn build(self) -> Result<Arc<ExecutableQueryPlan>, EngineError> {
        let query_id = self.query_id;
        let invalid = |message: String| EngineError::invalid_plan(format!("query {query_id}: {message}"));

        if self.source_successors.is_empty() {
            return Err(invalid("plan has no sources".into()));
        }

        let mut ids = HashSet::new();
        for (id, _, _, _) in &self.pipelines {
            if !ids.insert(*id) {
                return Err(invalid(format!("duplicate pipeline {id}")));
            }
        }

        // Every referenced target must exist; count incoming edges.
        let mut incoming: HashMap<PipelineId, usize> = ids.iter().map(|id| (*id, 0)).collect();
        let mut sink_incoming: HashMap<SinkId, usize> =
            self.sinks.keys().map(|id| (*id, 0)).collect();
        let mut check_target = |target: &SuccessorTarget| -> Result<(), EngineError> {
            match target {
                SuccessorTarget::Pipeline(id) => match incoming.get_mut(id) {
                    Some(count) => {
                        *count += 1;
                        Ok(())
                    }
                    None => Err(invalid(format!("reference to unknown pipeline {id}"))),
                },
                SuccessorTarget::Sink(id) => match sink_incoming.get_mut(id) {
                    Some(count) => {
                        *count += 1;
                        Ok(())
                    }
                    None => Err(invalid(format!("reference to unknown {id}"))),
                },
            }
        };
        for successors in self.source_successors.values() {
            for target in successors {
                check_target(target)?;
            }
        }
        for (_, _, successors, _) in &self.pipelines {
            for target in successors {
                check_target(target)?;
            }
        }

        for (id, count) in &incoming {
            if *count == 0 {
                return Err(invalid(format!("pipeline {id} is unreachable from any source")));
            }
        }
        for (id, count) in &sink_incoming {
            if *count == 0 {
                return Err(invalid(format!("{id} has no predecessors")));
            }
        }

        for (id, _, _, handler_indices) in &self.pipelines {
            for index in handler_indices {
                if *index >= self.handlers.len() {
                    return Err(invalid(format!("pipeline {id} references handler index {index} out of range")));
                }
            }
        }

        // Kahn's algorithm over pipeline-to-pipeline edges: cycle check and
        // topological order in one pass.
        let mut remaining: HashMap<PipelineId, usize> = HashMap::new();
        for (id, _, _, _) in &self.pipelines {
            remaining.insert(*id, 0);
        }
        for (_, _, successors, _) in &self.pipelines {
            for target in successors {
                if let SuccessorTarget::Pipeline(next) = target {
                    *remaining.get_mut(next).expect("validated above") += 1;
                }
            }
        }
        let mut queue: VecDeque<PipelineId> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let successors_of: HashMap<PipelineId, Vec<SuccessorTarget>> = self
            .pipelines
            .iter()
            .map(|(id, _, successors, _)| (*id, successors.clone()))
            .collect();
        let mut topological_order = Vec::with_capacity(self.pipelines.len());
        while let Some(id) = queue.pop_front() {
            topological_order.push(id);
            for target in &successors_of[&id] {
                if let SuccessorTarget::Pipeline(next) = target {
                    let count = remaining.get_mut(next).expect("validated above");
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(*next);
                    }
                }
            }
        }
        if topological_order.len() != self.pipelines.len() {
            return Err(invalid("pipeline graph contains a cycle".into()));
        }

        let leaf_pipelines = self
            .pipelines
            .iter()
            .filter(|(_, _, successors, _)| successors.is_empty())
            .count();
        let terminal_count = self.sinks.len() + leaf_pipelines;
        if terminal_count == 0 {
            return Err(invalid("plan has no sinks or terminal pipelines".into()));
        }

        let sinks: HashMap<SinkId, Arc<SinkEntry>> = self
            .sinks
            .into_iter()
            .map(|(id, sink)| {
                (
                    id,
                    Arc::new(SinkEntry {
                        sink,
                        pending_predecessors: AtomicUsize::new(sink_incoming[&id]),
                        terminated: AtomicBool::new(false),
                    }),
                )
            })
            .collect();

        let pipelines: HashMap<PipelineId, Arc<ExecutablePipeline>> = self
            .pipelines
            .into_iter()
            .map(|(id, stage, successors, handler_indices)| {
                let predecessor_count = incoming[&id].max(1);
                (
                    id,
                    Arc::new(ExecutablePipeline {
                        id,
                        stage,
                        successors,
                        handler_indices,
                        pending_predecessors: AtomicUsize::new(predecessor_count),
                        predecessor_count,
                        terminated: AtomicBool::new(false),
                        stopped: AtomicBool::new(false),
                    }),
                )
            })
            .collect();

        Ok(Arc::new(ExecutableQueryPlan {
            query_id,
            pipelines,
            topological_order,
            sinks,
            source_successors: self.source_successors,
            handlers: self.handlers,
            status: Mutex::new(ExecutionStatus::Registered),
            pending_terminals: AtomicUsize::new(terminal_count),
            terminal_count,
            error: Mutex::new(None),
            termination: TerminationLatch::new(),
            destroy_sent: AtomicBool::new(false),
        }))
    }
}
