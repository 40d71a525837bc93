// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Network Source
//!
//! The consumer side of a partition: buffers produced by a pipeline on
//! another node arrive here and re-enter the local engine as if a local
//! source had produced them. Unlike the thread-driven sources there is no
//! driver routine; the network manager's connection loops push frames in
//! asynchronously and the source converts them to tuple buffers on the
//! spot.
//!
//! ## Lifecycle
//!
//! - `bind()` registers the partition as a consumer and reserves the local
//!   buffer pool the payload copies come from
//! - `start()` broadcasts an `Initialize` reconfiguration; inside it every
//!   worker lazily opens its event back-channel to the upstream sink
//!   location, waiting `wait_time` between `retry_times` bounded attempts.
//!   A peer that never appears within the budget fails the query
//! - incoming end-of-stream control frames become local end-of-stream
//!   events of the matching kind; a dropped upstream connection surfaces
//!   as a failure end-of-stream
//! - `stop(Hard)` short-circuits; graceful termination always arrives
//!   in-band from upstream

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, warn};

use tidal_domain::value_objects::sequence::{ChunkNumber, SequenceData, SequenceNumber};
use tidal_domain::{
    EngineError, NodeLocation, OriginId, Partition, ReconfigurationType, TerminationKind,
    Watermark, WorkerThreadId,
};

use crate::infrastructure::memory::fixed_size_pool::FixedSizeBufferPool;
use crate::infrastructure::network::channel::{ChannelState, NetworkChannel};
use crate::infrastructure::network::network_manager::NetworkManager;
use crate::infrastructure::network::partition_manager::{
    PartitionConsumer, PartitionRegistrationStatus,
};
use crate::infrastructure::network::wire::{ControlTag, Frame};
use crate::infrastructure::runtime::executable_plan::{ExecutableQueryPlan, SuccessorTarget};
use crate::infrastructure::runtime::query_manager::QueryManager;
use crate::infrastructure::runtime::reconfiguration::{
    Reconfigurable, ReconfigurationMessage, ReconfigurationTarget,
};
use crate::infrastructure::sources::managed_source::ManagedSource;

/// Consumer endpoint of one partition.
pub struct NetworkSource {
    partition: Partition,
    origin_id: OriginId,
    tuple_size: usize,
    manager: Arc<QueryManager>,
    plan: Arc<ExecutableQueryPlan>,
    successors: Vec<SuccessorTarget>,
    network: Arc<NetworkManager>,
    /// Upstream node the event back-channels dial.
    sink_location: NodeLocation,
    wait_time: Duration,
    retry_times: usize,
    local_pool_size: usize,
    pool: Mutex<Option<Arc<FixedSizeBufferPool>>>,
    event_channels: Mutex<HashMap<WorkerThreadId, Arc<NetworkChannel>>>,
    running: AtomicBool,
    failure_reported: AtomicBool,
    self_handle: Weak<NetworkSource>,
}

impl NetworkSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        partition: Partition,
        origin_id: OriginId,
        tuple_size: usize,
        manager: Arc<QueryManager>,
        plan: Arc<ExecutableQueryPlan>,
        network: Arc<NetworkManager>,
        sink_location: NodeLocation,
        wait_time: Duration,
        retry_times: usize,
        local_pool_size: usize,
    ) -> Result<Arc<Self>, EngineError> {
        if tuple_size == 0 {
            return Err(EngineError::invalid_config("network source needs a tuple size"));
        }
        let successors = plan.source_successors(origin_id)?.clone();
        Ok(Arc::new_cyclic(|self_handle| Self {
            partition,
            origin_id,
            tuple_size,
            manager,
            plan,
            successors,
            network,
            sink_location,
            wait_time,
            retry_times: retry_times.max(1),
            local_pool_size: local_pool_size.max(1),
            pool: Mutex::new(None),
            event_channels: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            failure_reported: AtomicBool::new(false),
            self_handle: self_handle.clone(),
        }))
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// Registers the partition as a consumer and reserves the local pool.
    pub fn bind(&self) -> Result<(), EngineError> {
        let pool = self
            .manager
            .buffer_manager()
            .create_fixed_size_pool(self.local_pool_size)?;
        *self.pool.lock() = Some(pool);
        let consumer = self
            .self_handle
            .upgrade()
            .ok_or_else(|| EngineError::internal("network source already dropped"))?;
        self.network
            .register_partition_consumer(self.partition, consumer)?;
        debug!(partition = %self.partition, "network source bound");
        Ok(())
    }

    fn report_failure(&self, message: String) {
        if self.failure_reported.swap(true, Ordering::AcqRel) {
            return;
        }
        self.manager.notify_source_failure(self.origin_id, message);
    }

    /// An upstream event arrived; epochs are surfaced to the status
    /// listener and forwarded along this source's back-channels toward the
    /// upstream sink.
    pub fn on_event(&self, epoch: u64) {
        debug!(partition = %self.partition, epoch, "epoch event received");
        self.manager.notify_epoch_event(self.origin_id, epoch);
        let channels = self.event_channels.lock();
        for channel in channels.values() {
            if let Err(error) = channel.send(Frame::epoch(self.partition, epoch)) {
                warn!(partition = %self.partition, %error, "epoch propagation failed");
            }
        }
    }
}

impl PartitionConsumer for NetworkSource {
    fn on_buffer(&self, frame: Frame) -> Result<(), EngineError> {
        if !self.running.load(Ordering::Acquire) {
            debug!(partition = %self.partition, "frame for stopped source dropped");
            return Ok(());
        }
        let pool = self
            .pool
            .lock()
            .clone()
            .ok_or_else(|| EngineError::invalid_lifecycle("network source not bound"))?;
        let buffer = pool.get_buffer_blocking()?;
        if frame.payload.len() > buffer.capacity() {
            return Err(EngineError::BufferAccess(format!(
                "payload of {} bytes exceeds buffer capacity {}",
                frame.payload.len(),
                buffer.capacity()
            )));
        }
        buffer.bytes_mut()[..frame.payload.len()].copy_from_slice(&frame.payload);
        buffer.set_number_of_tuples(frame.payload.len() / self.tuple_size);
        buffer.stamp(
            self.origin_id,
            SequenceData {
                sequence_number: SequenceNumber(frame.sequence_number),
                chunk_number: ChunkNumber(frame.chunk_number),
                is_last_chunk: frame.is_last_chunk,
            },
            Watermark(frame.watermark),
            now_millis(),
        );
        for target in &self.successors {
            self.manager.add_work(&self.plan, *target, buffer.clone())?;
        }
        Ok(())
    }

    fn on_control(&self, tag: ControlTag, frame: &Frame) -> Result<(), EngineError> {
        match tag {
            ControlTag::SoftEos => {
                self.manager.add_end_of_stream(self.origin_id, TerminationKind::Graceful)?;
            }
            ControlTag::HardEos => {
                self.manager.add_end_of_stream(self.origin_id, TerminationKind::Hard)?;
            }
            ControlTag::FailEos => {
                self.report_failure(format!("upstream of {} reported failure", self.partition));
            }
            ControlTag::Epoch => self.on_event(frame.epoch),
            ControlTag::Initialize => {
                debug!(partition = %self.partition, "initialize frame acknowledged");
            }
        }
        Ok(())
    }
}

impl Reconfigurable for NetworkSource {
    fn reconfigure(&self, message: &ReconfigurationMessage, worker_id: WorkerThreadId) {
        if message.reconfiguration_type() != ReconfigurationType::Initialize {
            return;
        }
        // The query might have stopped between start() and this broadcast.
        if self.network.partition_status(self.partition) == PartitionRegistrationStatus::Deleted {
            return;
        }
        if self.event_channels.lock().contains_key(&worker_id) {
            return;
        }
        let channel = self.network.create_event_channel(
            self.sink_location.clone(),
            self.partition,
            self.retry_times,
            self.wait_time,
        );
        // Bounded wait for the dial: the upstream producer must appear
        // within the retry budget or the source reports an error.
        for _ in 0..=self.retry_times {
            match channel.state() {
                ChannelState::Connected | ChannelState::Draining => {
                    self.event_channels.lock().insert(worker_id, channel);
                    debug!(partition = %self.partition, %worker_id, "event channel stored");
                    return;
                }
                ChannelState::Closed => break,
                ChannelState::Connecting => std::thread::sleep(self.wait_time),
            }
        }
        self.report_failure(format!(
            "upstream {} unreachable for partition {}",
            self.sink_location, self.partition
        ));
    }
}

impl ManagedSource for NetworkSource {
    fn origin_id(&self) -> OriginId {
        self.origin_id
    }

    fn start(&self) -> Result<(), EngineError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(EngineError::invalid_lifecycle(format!(
                "network source {} already started",
                self.partition
            )));
        }
        let target = self
            .self_handle
            .upgrade()
            .ok_or_else(|| EngineError::internal("network source already dropped"))?;
        let message = ReconfigurationMessage::new(
            self.plan.query_id(),
            ReconfigurationType::Initialize,
            ReconfigurationTarget::Custom(target),
            Arc::clone(&self.plan),
            self.manager.worker_count(),
        );
        self.manager.add_reconfiguration_message(message, true)?;
        debug!(partition = %self.partition, "network source started");
        Ok(())
    }

    fn stop(&self, kind: TerminationKind) -> Result<(), EngineError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(partition = %self.partition, %kind, "network source stopping");
        if kind != TerminationKind::Graceful {
            // Short-circuit locally; graceful termination arrives in-band.
            let _ = self.manager.add_end_of_stream(self.origin_id, kind);
        }
        let channels: Vec<Arc<NetworkChannel>> =
            self.event_channels.lock().drain().map(|(_, c)| c).collect();
        for channel in channels {
            let _ = channel.close(ControlTag::HardEos);
        }
        self.network.unregister_partition_consumer(self.partition);
        if let Some(pool) = self.pool.lock().take() {
            pool.destroy();
        }
        Ok(())
    }
}

impl std::fmt::Debug for NetworkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkSource")
            .field("partition", &self.partition)
            .field("origin", &self.origin_id)
            .field("running", &self.running.load(Ordering::Relaxed))
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
