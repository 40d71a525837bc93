// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Reconfiguration Broadcasts
//!
//! A reconfiguration message is the engine's control task: it is delivered
//! to *every* worker of the pool exactly once, unlike data tasks which go to
//! exactly one worker. The message carries an arrival barrier; workers that
//! pick up a copy wait until all copies are claimed, which both synchronizes
//! the pool and guarantees no worker consumes two copies. The last worker to
//! finish runs the post-reconfiguration callback exactly once, and callers
//! that asked for a blocking broadcast are released.
//!
//! Ordering: copies are pushed through the same queues as data tasks, so a
//! broadcast posted at time `t` is dispatched after all data tasks already
//! enqueued at `t` toward the same target.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tidal_domain::{QueryId, ReconfigurationType, WorkerThreadId};

use crate::infrastructure::runtime::executable_plan::{ExecutablePipeline, ExecutableQueryPlan};

/// Participant in reconfiguration outside the plan DAG (network sources
/// open their event channels through this hook).
pub trait Reconfigurable: Send + Sync {
    /// Invoked once per worker per broadcast.
    fn reconfigure(&self, message: &ReconfigurationMessage, worker_id: WorkerThreadId);

    /// Invoked once globally, by the last worker.
    fn post_reconfiguration(&self, message: &ReconfigurationMessage) {
        let _ = message;
    }
}

/// What a broadcast is aimed at.
#[derive(Clone)]
pub enum ReconfigurationTarget {
    /// One pipeline of the plan (end-of-stream propagation).
    Pipeline(Arc<ExecutablePipeline>),
    /// The whole plan (destroy / worker-state cleanup).
    Plan,
    /// A custom participant (network source initialization and events).
    Custom(Arc<dyn Reconfigurable>),
}

struct ArrivalBarrier {
    expected: usize,
    arrived: Mutex<usize>,
    released: Condvar,
}

impl ArrivalBarrier {
    fn new(expected: usize) -> Self {
        Self { expected, arrived: Mutex::new(0), released: Condvar::new() }
    }

    fn arrive_and_wait(&self) {
        let mut arrived = self.arrived.lock();
        *arrived += 1;
        if *arrived >= self.expected {
            self.released.notify_all();
            return;
        }
        while *arrived < self.expected {
            self.released.wait(&mut arrived);
        }
    }
}

struct DoneLatch {
    done: Mutex<bool>,
    signal: Condvar,
}

impl DoneLatch {
    fn new() -> Self {
        Self { done: Mutex::new(false), signal: Condvar::new() }
    }

    fn mark(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.signal.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock();
        if *done {
            return true;
        }
        let _ = self.signal.wait_for(&mut done, timeout);
        *done
    }
}

/// One broadcast control task.
pub struct ReconfigurationMessage {
    query_id: QueryId,
    rtype: ReconfigurationType,
    target: ReconfigurationTarget,
    plan: Arc<ExecutableQueryPlan>,
    /// Epoch payload for `PropagateEpoch` broadcasts.
    epoch: Option<u64>,
    barrier: ArrivalBarrier,
    remaining_post: AtomicUsize,
    done: DoneLatch,
}

impl ReconfigurationMessage {
    pub fn new(
        query_id: QueryId,
        rtype: ReconfigurationType,
        target: ReconfigurationTarget,
        plan: Arc<ExecutableQueryPlan>,
        worker_count: usize,
    ) -> Arc<Self> {
        Self::build(query_id, rtype, target, plan, worker_count, None)
    }

    pub fn with_epoch(
        query_id: QueryId,
        epoch: u64,
        target: ReconfigurationTarget,
        plan: Arc<ExecutableQueryPlan>,
        worker_count: usize,
    ) -> Arc<Self> {
        Self::build(
            query_id,
            ReconfigurationType::PropagateEpoch,
            target,
            plan,
            worker_count,
            Some(epoch),
        )
    }

    fn build(
        query_id: QueryId,
        rtype: ReconfigurationType,
        target: ReconfigurationTarget,
        plan: Arc<ExecutableQueryPlan>,
        worker_count: usize,
        epoch: Option<u64>,
    ) -> Arc<Self> {
        debug_assert!(worker_count > 0);
        Arc::new(Self {
            query_id,
            rtype,
            target,
            plan,
            epoch,
            barrier: ArrivalBarrier::new(worker_count),
            remaining_post: AtomicUsize::new(worker_count),
            done: DoneLatch::new(),
        })
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn reconfiguration_type(&self) -> ReconfigurationType {
        self.rtype
    }

    pub fn target(&self) -> &ReconfigurationTarget {
        &self.target
    }

    pub fn plan(&self) -> &Arc<ExecutableQueryPlan> {
        &self.plan
    }

    pub fn epoch(&self) -> Option<u64> {
        self.epoch
    }

    /// Barrier point: blocks the worker until every copy is claimed.
    pub(crate) fn arrive_and_wait(&self) {
        self.barrier.arrive_and_wait();
    }

    /// Records this worker's completion; `true` for the last worker, which
    /// then owns the post-reconfiguration callback.
    pub(crate) fn finish_worker(&self) -> bool {
        self.remaining_post.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Releases blocking broadcasters after the post callback ran.
    pub(crate) fn mark_done(&self) {
        self.done.mark();
    }

    /// Blocks until the broadcast fully completed, up to `timeout`.
    pub(crate) fn wait_done(&self, timeout: Duration) -> bool {
        self.done.wait(timeout)
    }
}

impl std::fmt::Debug for ReconfigurationMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconfigurationMessage")
            .field("query", &self.query_id)
            .field("type", &self.rtype)
            .finish()
    }
}
