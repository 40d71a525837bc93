// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Network Manager
//!
//! Owns the node's transport endpoint: the tokio runtime, the TCP accept
//! loop, and the partition registry. Incoming frames are demultiplexed by
//! partition: data and end-of-stream frames go to the registered consumer
//! (a network source), epoch frames go to the registered event listener
//! (a network sink's back-channel). Outgoing connections are produced as
//! `NetworkChannel`s with bounded dial retries.
//!
//! The runtime is private to the network layer; the rest of the engine
//! stays on its own threads and talks to the manager through sync calls.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use tidal_domain::{EngineError, NodeLocation, Partition};

use crate::infrastructure::network::channel::NetworkChannel;
use crate::infrastructure::network::partition_manager::{
    NetworkEventListener, PartitionConsumer, PartitionManager, PartitionRegistrationStatus,
};
use crate::infrastructure::network::wire::{ControlTag, Frame};

/// The node's transport endpoint.
pub struct NetworkManager {
    location: NodeLocation,
    runtime: tokio::runtime::Runtime,
    partitions: Arc<PartitionManager>,
    listener_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl NetworkManager {
    /// Binds the listener on `location` and starts the accept loop.
    ///
    /// # Errors
    /// `EngineError::IoError` when the address cannot be bound.
    pub fn new(location: NodeLocation) -> Result<Arc<Self>, EngineError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tidal-net")
            .enable_io()
            .enable_time()
            .build()
            .map_err(|e| EngineError::IoError(format!("network runtime: {e}")))?;

        let partitions = PartitionManager::new();
        let listener = runtime
            .block_on(TcpListener::bind(location.address()))
            .map_err(|e| EngineError::IoError(format!("bind {}: {e}", location.address())))?;
        let bound_port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(location.port);
        let location = NodeLocation::new(location.host.clone(), bound_port);
        info!(%location, "network manager listening");

        let accept_partitions = Arc::clone(&partitions);
        let listener_task = runtime.spawn(accept_loop(listener, accept_partitions));

        Ok(Arc::new(Self {
            location,
            runtime,
            partitions,
            listener_task: Mutex::new(Some(listener_task)),
        }))
    }

    /// The bound location (with the actual port when 0 was requested).
    pub fn location(&self) -> &NodeLocation {
        &self.location
    }

    pub fn partitions(&self) -> &Arc<PartitionManager> {
        &self.partitions
    }

    /// Registers a consumer for incoming data on `partition`.
    pub fn register_partition_consumer(
        &self,
        partition: Partition,
        consumer: Arc<dyn PartitionConsumer>,
    ) -> Result<(), EngineError> {
        self.partitions.register_consumer(partition, consumer)
    }

    pub fn unregister_partition_consumer(&self, partition: Partition) {
        self.partitions.unregister_consumer(partition);
    }

    pub fn partition_status(&self, partition: Partition) -> PartitionRegistrationStatus {
        self.partitions.consumer_status(partition)
    }

    /// Registers a back-channel event listener (the sink side).
    pub fn register_event_listener(
        &self,
        partition: Partition,
        listener: Arc<dyn NetworkEventListener>,
    ) {
        self.partitions.register_event_listener(partition, listener);
    }

    pub fn unregister_event_listener(&self, partition: Partition) {
        self.partitions.unregister_event_listener(partition);
    }

    /// Opens a data channel toward a remote consumer.
    pub fn create_channel(
        &self,
        location: NodeLocation,
        partition: Partition,
        retry_times: usize,
        wait_time: Duration,
    ) -> Arc<NetworkChannel> {
        NetworkChannel::connect(self.runtime.handle(), location, partition, retry_times, wait_time)
    }

    /// Opens an event back-channel toward the upstream producer; same
    /// mechanics, control frames only.
    pub fn create_event_channel(
        &self,
        location: NodeLocation,
        partition: Partition,
        retry_times: usize,
        wait_time: Duration,
    ) -> Arc<NetworkChannel> {
        self.create_channel(location, partition, retry_times, wait_time)
    }

    /// Stops accepting connections. Outstanding channels drain on their
    /// own; dropping the manager tears the runtime down.
    pub fn shutdown(&self) {
        if let Some(task) = self.listener_task.lock().take() {
            task.abort();
        }
        debug!(location = %self.location, "network manager shut down");
    }
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("location", &self.location)
            .field("consumers", &self.partitions.consumer_count())
            .finish()
    }
}

async fn accept_loop(listener: TcpListener, partitions: Arc<PartitionManager>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "connection accepted");
                let partitions = Arc::clone(&partitions);
                tokio::spawn(connection_loop(stream, partitions));
            }
            Err(error) => {
                error!(%error, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Reads frames off one connection and dispatches them by partition. A
/// connection that ends without delivering end-of-stream for a partition it
/// carried data on is a dropped producer: the consumer is handed a
/// synthetic failure end-of-stream so the query fails instead of hanging.
async fn connection_loop(mut stream: TcpStream, partitions: Arc<PartitionManager>) {
    let mut read_buf = BytesMut::with_capacity(64 * 1024);
    let mut seen: std::collections::HashSet<tidal_domain::Partition> = Default::default();
    let mut terminated: std::collections::HashSet<tidal_domain::Partition> = Default::default();
    loop {
        let frame = loop {
            match Frame::decode(&mut read_buf) {
                Ok(Some(frame)) => break Some(frame),
                Ok(None) => {}
                Err(error) => {
                    warn!(%error, "malformed frame, dropping connection");
                    break None;
                }
            }
            match stream.read_buf(&mut read_buf).await {
                Ok(0) => break None,
                Ok(_) => {}
                Err(error) => {
                    debug!(%error, "connection read failed");
                    break None;
                }
            }
        };
        let Some(frame) = frame else {
            debug!("connection ended");
            break;
        };

        seen.insert(frame.partition);
        if matches!(
            frame.control,
            Some(ControlTag::SoftEos) | Some(ControlTag::HardEos) | Some(ControlTag::FailEos)
        ) {
            terminated.insert(frame.partition);
        }
        dispatch_frame(&partitions, frame);
    }

    for partition in seen.difference(&terminated) {
        if let Some(consumer) = partitions.consumer(*partition) {
            warn!(%partition, "producer connection dropped, failing partition");
            let synthetic = Frame::control(*partition, ControlTag::FailEos);
            if let Err(error) = consumer.on_control(ControlTag::FailEos, &synthetic) {
                warn!(%partition, %error, "failure propagation rejected");
            }
        }
    }
}

fn dispatch_frame(partitions: &Arc<PartitionManager>, frame: Frame) {
    let partition = frame.partition;
    match frame.control {
        // Epochs go to the sink-side listener when one is registered;
        // otherwise they are upstream events for the consumer source.
        Some(ControlTag::Epoch) => {
            if let Some(listener) = partitions.event_listener(partition) {
                listener.on_epoch(frame.epoch);
            } else if let Some(consumer) = partitions.consumer(partition) {
                if let Err(error) = consumer.on_control(ControlTag::Epoch, &frame) {
                    warn!(%partition, %error, "consumer rejected epoch frame");
                }
            } else {
                debug!(%partition, "epoch for unknown partition dropped");
            }
        }
        Some(tag) => match partitions.consumer(partition) {
            Some(consumer) => {
                if let Err(error) = consumer.on_control(tag, &frame) {
                    warn!(%partition, %error, "consumer rejected control frame");
                }
            }
            None => debug!(%partition, ?tag, "control frame for unknown partition dropped"),
        },
        None => match partitions.consumer(partition) {
            Some(consumer) => {
                if let Err(error) = consumer.on_buffer(frame) {
                    warn!(%partition, %error, "consumer rejected data frame");
                }
            }
            None => debug!(%partition, "data frame for unknown partition dropped"),
        },
    }
}
