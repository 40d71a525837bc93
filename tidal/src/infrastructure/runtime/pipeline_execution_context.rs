// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Execution Context
//!
//! The per-invocation view a compiled stage gets of the engine: buffer
//! allocation from the worker's local pool, output emission toward the
//! pipeline's successors, typed access to the plan's operator handlers, and
//! per-(worker, operator) scratch state.
//!
//! A context is constructed by the worker for every `execute` call and for
//! the `setup`/`stop` lifecycle hooks. It borrows the worker's local state;
//! nothing in it is shared, which is what lets stages run without any
//! locking of their own.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use tidal_domain::{EngineError, PipelineId, QueryId, WorkerThreadId};

use crate::infrastructure::memory::buffer_manager::BufferManager;
use crate::infrastructure::memory::fixed_size_pool::FixedSizeBufferPool;
use crate::infrastructure::memory::tuple_buffer::TupleBuffer;
use crate::infrastructure::runtime::executable_plan::{
    ExecutablePipeline, ExecutableQueryPlan, SuccessorTarget,
};

/// Whether an emitted buffer may continue on the emitting worker.
///
/// `Possible` permits inlining the successor's work into the current task;
/// `Required` forces a task boundary so the buffer is rescheduled through
/// the queue. The engine inlines sink writes under `Possible` and always
/// reschedules pipeline successors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationPolicy {
    Possible,
    Required,
}

/// Sink for emitted buffers; implemented by the query manager.
pub(crate) trait TaskEmitter: Send + Sync {
    fn emit(
        &self,
        plan: &Arc<ExecutableQueryPlan>,
        target: SuccessorTarget,
        buffer: TupleBuffer,
    ) -> Result<(), EngineError>;
}

/// Per-worker scratch storage, keyed by `(query, pipeline, slot)`. Cleared
/// when the owning query is destroyed; a slot belongs to exactly one
/// (worker, operator) pair so there is no sharing to synchronize.
#[derive(Default)]
pub struct WorkerLocalState {
    entries: HashMap<(QueryId, PipelineId, u64), Box<dyn Any + Send>>,
}

impl WorkerLocalState {
    pub fn clear_query(&mut self, query_id: QueryId) {
        self.entries.retain(|(query, _, _), _| *query != query_id);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-invocation stage context.
pub struct PipelineExecutionContext<'a> {
    worker_id: WorkerThreadId,
    worker_count: usize,
    plan: &'a Arc<ExecutableQueryPlan>,
    pipeline: &'a Arc<ExecutablePipeline>,
    emitter: &'a dyn TaskEmitter,
    local_pool: &'a Arc<FixedSizeBufferPool>,
    global_pool: &'a Arc<BufferManager>,
    local_state: &'a mut WorkerLocalState,
}

impl<'a> PipelineExecutionContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        worker_id: WorkerThreadId,
        worker_count: usize,
        plan: &'a Arc<ExecutableQueryPlan>,
        pipeline: &'a Arc<ExecutablePipeline>,
        emitter: &'a dyn TaskEmitter,
        local_pool: &'a Arc<FixedSizeBufferPool>,
        global_pool: &'a Arc<BufferManager>,
        local_state: &'a mut WorkerLocalState,
    ) -> Self {
        Self {
            worker_id,
            worker_count,
            plan,
            pipeline,
            emitter,
            local_pool,
            global_pool,
            local_state,
        }
    }

    /// The worker thread executing this invocation.
    pub fn worker_thread_id(&self) -> WorkerThreadId {
        self.worker_id
    }

    /// Size of the worker pool; handlers partition state by it.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn query_id(&self) -> QueryId {
        self.plan.query_id()
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline.id()
    }

    /// Allocates an output buffer: from this worker's reservation when one
    /// is free, otherwise from the global pool with blocking back-pressure.
    /// The fallback keeps a worker emitting a large burst (an end-of-stream
    /// flush) from starving on buffers only it could recycle.
    pub fn allocate_buffer(&self) -> Result<TupleBuffer, EngineError> {
        if let Some(buffer) = self.local_pool.get_buffer_nonblocking() {
            return Ok(buffer);
        }
        self.global_pool.get_buffer_blocking()
    }

    /// Hands `buffer` to every successor of the current pipeline.
    ///
    /// Under `ContinuationPolicy::Possible` a sink successor is written
    /// inline on this worker; everything else crosses a task boundary
    /// through the query manager.
    pub fn emit_buffer(&mut self, buffer: TupleBuffer, policy: ContinuationPolicy) -> Result<(), EngineError> {
        let successors = self.pipeline.successors();
        for target in successors {
            let output = buffer.clone();
            match (target, policy) {
                (SuccessorTarget::Sink(sink_id), ContinuationPolicy::Possible) => {
                    self.plan.sink(*sink_id)?.write(output)?;
                }
                _ => self.emitter.emit(self.plan, *target, output)?,
            }
        }
        Ok(())
    }

    /// Typed reference to the plan-global operator handler at `index`.
    ///
    /// # Errors
    /// `EngineError::InvalidPlan` for an unknown index, an internal error
    /// when the handler is not of type `T`.
    pub fn operator_handler<T: Send + Sync + 'static>(&self, index: usize) -> Result<Arc<T>, EngineError> {
        let handler = self.plan.operator_handler(index)?;
        Arc::clone(handler).as_any_arc().downcast::<T>().map_err(|_| {
            EngineError::internal(format!(
                "operator handler {index} of query {} has unexpected type",
                self.plan.query_id()
            ))
        })
    }

    /// Stores per-(worker, operator) scratch under `slot`.
    pub fn set_local_state(&mut self, slot: u64, state: Box<dyn Any + Send>) {
        self.local_state
            .entries
            .insert((self.plan.query_id(), self.pipeline.id(), slot), state);
    }

    /// Mutable access to scratch stored under `slot`.
    pub fn local_state(&mut self, slot: u64) -> Option<&mut (dyn Any + Send)> {
        self.local_state
            .entries
            .get_mut(&(self.plan.query_id(), self.pipeline.id(), slot))
            .map(|boxed| boxed.as_mut())
    }

    /// Removes and returns scratch stored under `slot`.
    pub fn take_local_state(&mut self, slot: u64) -> Option<Box<dyn Any + Send>> {
        self.local_state
            .entries
            .remove(&(self.plan.query_id(), self.pipeline.id(), slot))
    }
}
