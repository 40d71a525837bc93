// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Network Sink
//!
//! The producer side of a partition: terminal buffers of a local pipeline
//! are framed and shipped to the consumer source on the downstream node.
//! The sink opens its channel at setup; writes issued while the dial is in
//! flight ride the channel's bounded pre-connect backlog. End-of-stream
//! closes the channel with the matching control tag. Epoch events arriving
//! on the back-channel are surfaced through the event-listener hook.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use tidal_domain::{EngineError, NodeLocation, Partition, TerminationKind};

use crate::infrastructure::memory::tuple_buffer::TupleBuffer;
use crate::infrastructure::network::channel::NetworkChannel;
use crate::infrastructure::network::network_manager::NetworkManager;
use crate::infrastructure::network::partition_manager::NetworkEventListener;
use crate::infrastructure::network::wire::{ControlTag, Frame};
use crate::infrastructure::runtime::executable_plan::DataSink;

/// Producer endpoint of one partition.
pub struct NetworkSink {
    partition: Partition,
    remote: NodeLocation,
    network: Arc<NetworkManager>,
    tuple_size: usize,
    retry_times: usize,
    wait_time: Duration,
    channel: Mutex<Option<Arc<NetworkChannel>>>,
    /// Epochs observed on the back-channel, for collectors and tests.
    last_epoch: AtomicU64,
    self_handle: Weak<NetworkSink>,
}

impl NetworkSink {
    pub fn new(
        partition: Partition,
        remote: NodeLocation,
        network: Arc<NetworkManager>,
        tuple_size: usize,
        retry_times: usize,
        wait_time: Duration,
    ) -> Result<Arc<Self>, EngineError> {
        if tuple_size == 0 {
            return Err(EngineError::invalid_config("network sink needs a tuple size"));
        }
        Ok(Arc::new_cyclic(|self_handle| Self {
            partition,
            remote,
            network,
            tuple_size,
            retry_times: retry_times.max(1),
            wait_time,
            channel: Mutex::new(None),
            last_epoch: AtomicU64::new(0),
            self_handle: self_handle.clone(),
        }))
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// Last epoch barrier seen on the back-channel.
    pub fn last_epoch(&self) -> u64 {
        self.last_epoch.load(Ordering::Acquire)
    }

    fn channel(&self) -> Result<Arc<NetworkChannel>, EngineError> {
        self.channel
            .lock()
            .clone()
            .ok_or_else(|| EngineError::invalid_lifecycle("network sink not set up"))
    }
}

impl DataSink for NetworkSink {
    fn setup(&self) -> Result<(), EngineError> {
        let mut slot = self.channel.lock();
        if slot.is_some() {
            return Ok(());
        }
        let channel = self.network.create_channel(
            self.remote.clone(),
            self.partition,
            self.retry_times,
            self.wait_time,
        );
        *slot = Some(channel);
        drop(slot);
        let listener = self
            .self_handle
            .upgrade()
            .ok_or_else(|| EngineError::internal("network sink already dropped"))?;
        self.network.register_event_listener(self.partition, listener);
        debug!(partition = %self.partition, remote = %self.remote, "network sink set up");
        Ok(())
    }

    fn write(&self, buffer: TupleBuffer) -> Result<(), EngineError> {
        let metadata = buffer.metadata();
        let sequence = metadata
            .sequence_data
            .ok_or_else(|| EngineError::internal("unsequenced buffer at network sink"))?;
        let valid_prefix = metadata.number_of_tuples * self.tuple_size;
        let payload = {
            let bytes = buffer.bytes();
            if valid_prefix > bytes.len() {
                return Err(EngineError::BufferAccess(format!(
                    "valid prefix {valid_prefix} exceeds buffer of {} bytes",
                    bytes.len()
                )));
            }
            Bytes::copy_from_slice(&bytes[..valid_prefix])
        };
        let frame = Frame::data(
            self.partition,
            sequence.sequence_number.0,
            sequence.chunk_number.0,
            sequence.is_last_chunk,
            metadata.watermark.0,
            payload,
        );
        self.channel()?.send(frame)
    }

    fn handle_end_of_stream(&self, kind: TerminationKind) -> Result<(), EngineError> {
        let tag = match kind {
            TerminationKind::Graceful => ControlTag::SoftEos,
            TerminationKind::Hard => ControlTag::HardEos,
            TerminationKind::Failure => ControlTag::FailEos,
        };
        debug!(partition = %self.partition, %kind, "network sink end-of-stream");
        self.channel()?.close(tag)
    }

    fn stop(&self) -> Result<(), EngineError> {
        self.network.unregister_event_listener(self.partition);
        Ok(())
    }
}

impl NetworkEventListener for NetworkSink {
    fn on_epoch(&self, epoch: u64) {
        let previous = self.last_epoch.swap(epoch, Ordering::AcqRel);
        if epoch < previous {
            warn!(partition = %self.partition, epoch, previous, "epoch went backwards");
        }
        debug!(partition = %self.partition, epoch, "epoch received on back-channel");
    }
}

impl std::fmt::Debug for NetworkSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkSink")
            .field("partition", &self.partition)
            .field("remote", &self.remote)
            .finish()
    }
}
