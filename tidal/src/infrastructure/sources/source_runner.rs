// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Source Runner
//!
//! The state machine that drives one data-source instance on its own
//! thread. The runner owns everything around the source implementation:
//! buffer allocation from a reserved local pool, metadata stamping with
//! dense sequence numbers, emission to every successor target, and the
//! conversion of termination into exactly one in-band end-of-stream event.
//!
//! ## Driver loop
//!
//! ```text
//! open the source
//! while not stopped and below the production bound:
//!     allocate a buffer from the local pool
//!     let the source fill it (bytes, tuple count, watermark)
//!     stamp origin, sequence (dense from 1), chunk 1/last, creation time
//!     hand it to every successor through the query manager
//! emit one end-of-stream of the requested kind; close the source
//! ```
//!
//! ## Failure and cancellation
//!
//! An `open` failure produces a single error notification and no data; the
//! query manager fails the query. Cancellation is cooperative: the stop
//! flag is checked between buffers, and blocking sources wait through the
//! stop token. `stop` itself never blocks; destruction joins the driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, warn};

use tidal_domain::value_objects::sequence::SequenceData;
use tidal_domain::{EngineError, OriginId, SequenceNumber, TerminationKind};

use crate::infrastructure::runtime::executable_plan::{ExecutableQueryPlan, SuccessorTarget};
use crate::infrastructure::runtime::query_manager::QueryManager;
use crate::infrastructure::sources::data_source::DataSource;
use crate::infrastructure::sources::managed_source::{ManagedSource, StopToken};

/// Drives one source instance; one driver thread per runner.
pub struct SourceRunner {
    origin_id: OriginId,
    manager: Arc<QueryManager>,
    plan: Arc<ExecutableQueryPlan>,
    successors: Vec<SuccessorTarget>,
    local_pool_size: usize,
    /// Stop after this many buffers; zero means unbounded.
    buffers_to_produce: u64,
    stop_token: Arc<StopToken>,
    termination_kind: Mutex<TerminationKind>,
    started: AtomicBool,
    source: Mutex<Option<Box<dyn DataSource>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    self_handle: Weak<SourceRunner>,
}

impl SourceRunner {
    pub fn new(
        origin_id: OriginId,
        source: Box<dyn DataSource>,
        manager: Arc<QueryManager>,
        plan: Arc<ExecutableQueryPlan>,
        local_pool_size: usize,
        buffers_to_produce: u64,
    ) -> Result<Arc<Self>, EngineError> {
        let successors = plan.source_successors(origin_id)?.clone();
        Ok(Arc::new_cyclic(|self_handle| Self {
            origin_id,
            manager,
            plan,
            successors,
            local_pool_size: local_pool_size.max(1),
            buffers_to_produce,
            stop_token: StopToken::new(),
            termination_kind: Mutex::new(TerminationKind::Graceful),
            started: AtomicBool::new(false),
            source: Mutex::new(Some(source)),
            driver: Mutex::new(None),
            self_handle: self_handle.clone(),
        }))
    }

    fn driver_routine(self: &Arc<Self>) {
        let origin = self.origin_id;
        let mut source = match self.source.lock().take() {
            Some(source) => source,
            None => {
                warn!(%origin, "driver started without a source implementation");
                return;
            }
        };
        debug!(%origin, kind = %source.kind(), "source driver running");

        let pool = match self
            .manager
            .buffer_manager()
            .create_fixed_size_pool(self.local_pool_size)
        {
            Ok(pool) => pool,
            Err(error) => {
                self.manager.notify_source_failure(origin, error.to_string());
                return;
            }
        };

        if let Err(error) = source.open() {
            // A single error notification, no data, query fails.
            self.manager.notify_source_failure(origin, error.to_string());
            let _ = source.close();
            pool.destroy();
            return;
        }

        let mut sequence = SequenceNumber::INITIAL;
        let mut produced: u64 = 0;
        while !self.stop_token.is_stopped()
            && (self.buffers_to_produce == 0 || produced < self.buffers_to_produce)
        {
            let buffer = match pool.get_buffer_blocking() {
                Ok(buffer) => buffer,
                Err(_) => break, // pool destroyed under us: shutting down
            };
            match source.fill_buffer(&buffer, &self.stop_token) {
                Ok(true) => {
                    buffer.stamp(
                        origin,
                        SequenceData::unchunked(sequence),
                        buffer.watermark(),
                        now_millis(),
                    );
                    sequence = sequence.next();
                    produced += 1;
                    for target in &self.successors {
                        if let Err(error) = self.manager.add_work(&self.plan, *target, buffer.clone()) {
                            warn!(%origin, %error, "emit failed, stopping source");
                            self.stop_token.stop();
                            break;
                        }
                    }
                }
                Ok(false) => {
                    debug!(%origin, produced, "source exhausted");
                    break;
                }
                Err(error) => {
                    self.manager.notify_source_failure(origin, error.to_string());
                    let _ = source.close();
                    pool.destroy();
                    return;
                }
            }
        }

        let kind = *self.termination_kind.lock();
        if let Err(error) = source.close() {
            warn!(%origin, %error, "source close failed");
        }
        match self.manager.add_end_of_stream(origin, kind) {
            Ok(sent) => debug!(%origin, %kind, sent, "source end-of-stream"),
            Err(error) => warn!(%origin, %error, "end-of-stream delivery failed"),
        }
        self.manager.notify_source_completion(origin, kind);
        pool.destroy();
        debug!(%origin, produced, "source driver finished");
    }
}

impl ManagedSource for SourceRunner {
    fn origin_id(&self) -> OriginId {
        self.origin_id
    }

    fn start(&self) -> Result<(), EngineError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::invalid_lifecycle(format!(
                "source {} already started",
                self.origin_id
            )));
        }
        // The driver owns an Arc back to the runner; the handle is parked
        // for the join at destruction.
        let runner = self
            .self_handle
            .upgrade()
            .ok_or_else(|| EngineError::internal("source runner already dropped"))?;
        let handle = std::thread::Builder::new()
            .name(format!("tidal-src-{}", self.origin_id.raw()))
            .spawn(move || runner.driver_routine())
            .map_err(|e| EngineError::internal(format!("cannot spawn source driver: {e}")))?;
        *self.driver.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self, kind: TerminationKind) -> Result<(), EngineError> {
        *self.termination_kind.lock() = kind;
        self.stop_token.stop();
        Ok(())
    }
}

impl Drop for SourceRunner {
    fn drop(&mut self) {
        self.stop_token.stop();
        if let Some(handle) = self.driver.lock().take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl std::fmt::Debug for SourceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRunner")
            .field("origin", &self.origin_id)
            .field("successors", &self.successors.len())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
