// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Network Channels
//!
//! The producer side of one partition's wire connection. A channel is
//! created in `Connecting`, while a background task dials the remote node
//! with bounded retries. Frames written during `Connecting` are buffered
//! (bounded); on transition to `Connected` the backlog flushes in order.
//! `close(kind)` moves the channel to `Draining`: writes are still accepted
//! until the final end-of-stream control frame goes out, then the channel
//! is `Closed` and the task exits.
//!
//! The same channel type carries the lazily-created event back-channels:
//! those only ever send control frames (epochs), the state machine is
//! identical.
//!
//! A connection that drops mid-stream moves the channel to `Closed` with
//! the error recorded; the next write surfaces it to the producer, which
//! treats it as a query failure.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tidal_domain::{EngineError, NodeLocation, Partition};

use crate::infrastructure::network::wire::{ControlTag, Frame};

/// Lifecycle of a producer channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Connected,
    Draining,
    Closed,
}

/// Frames buffered while the dial is still in progress.
const CONNECT_BACKLOG_LIMIT: usize = 256;

struct ChannelShared {
    partition: Partition,
    location: NodeLocation,
    state: Mutex<ChannelState>,
    backlog: Mutex<VecDeque<Frame>>,
    error: Mutex<Option<String>>,
    outbound: mpsc::UnboundedSender<Frame>,
}

/// Producer handle onto one partition's connection.
pub struct NetworkChannel {
    shared: Arc<ChannelShared>,
}

impl NetworkChannel {
    /// Opens a channel toward `location`, dialing with `retry_times`
    /// attempts spaced `wait_time` apart on a background task of the given
    /// runtime.
    pub fn connect(
        runtime: &tokio::runtime::Handle,
        location: NodeLocation,
        partition: Partition,
        retry_times: usize,
        wait_time: Duration,
    ) -> Arc<NetworkChannel> {
        let (outbound, inbound) = mpsc::unbounded_channel();
        let shared = Arc::new(ChannelShared {
            partition,
            location: location.clone(),
            state: Mutex::new(ChannelState::Connecting),
            backlog: Mutex::new(VecDeque::new()),
            error: Mutex::new(None),
            outbound,
        });
        runtime.spawn(channel_task(Arc::clone(&shared), inbound, retry_times, wait_time));
        Arc::new(NetworkChannel { shared })
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.lock()
    }

    pub fn partition(&self) -> Partition {
        self.shared.partition
    }

    /// Sends one frame.
    ///
    /// # Errors
    /// - `EngineError::NetworkPartitionUnavailable` when the pre-connect
    ///   backlog overflows (the peer never appeared)
    /// - `EngineError::IoError` once the channel closed or the connection
    ///   dropped
    pub fn send(&self, frame: Frame) -> Result<(), EngineError> {
        let state = *self.shared.state.lock();
        match state {
            ChannelState::Connecting => {
                let mut backlog = self.shared.backlog.lock();
                // Re-check under the backlog lock: the task flushes the
                // backlog before flipping the state.
                if *self.shared.state.lock() == ChannelState::Connecting {
                    if backlog.len() >= CONNECT_BACKLOG_LIMIT {
                        return Err(EngineError::partition_unavailable(format!(
                            "backlog full while connecting to {}",
                            self.shared.location
                        )));
                    }
                    backlog.push_back(frame);
                    return Ok(());
                }
                drop(backlog);
                self.forward(frame)
            }
            ChannelState::Connected | ChannelState::Draining => self.forward(frame),
            ChannelState::Closed => Err(self.closed_error()),
        }
    }

    /// Requests termination: the end-of-stream control frame is queued
    /// behind all accepted writes and the channel drains toward `Closed`.
    pub fn close(&self, tag: ControlTag) -> Result<(), EngineError> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                ChannelState::Closed => return Ok(()),
                ChannelState::Draining => return Ok(()),
                _ => *state = ChannelState::Draining,
            }
        }
        debug!(partition = %self.shared.partition, ?tag, "channel draining");
        self.forward(Frame::control(self.shared.partition, tag))
    }

    pub fn error(&self) -> Option<String> {
        self.shared.error.lock().clone()
    }

    fn forward(&self, frame: Frame) -> Result<(), EngineError> {
        self.shared.outbound.send(frame).map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> EngineError {
        match self.shared.error.lock().clone() {
            Some(message) => EngineError::IoError(format!(
                "channel to {} failed: {message}",
                self.shared.location
            )),
            None => EngineError::IoError(format!("channel to {} closed", self.shared.location)),
        }
    }
}

impl std::fmt::Debug for NetworkChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkChannel")
            .field("partition", &self.shared.partition)
            .field("location", &self.shared.location)
            .field("state", &self.state())
            .finish()
    }
}

/// Background task: dial with retries, flush the backlog, forward frames,
/// close after the end-of-stream frame.
async fn channel_task(
    shared: Arc<ChannelShared>,
    mut inbound: mpsc::UnboundedReceiver<Frame>,
    retry_times: usize,
    wait_time: Duration,
) {
    let address = shared.location.address();
    let mut stream = None;
    for attempt in 0..retry_times.max(1) {
        match TcpStream::connect(&address).await {
            Ok(connected) => {
                stream = Some(connected);
                break;
            }
            Err(error) => {
                debug!(%address, attempt, %error, "channel dial failed");
                tokio::time::sleep(wait_time).await;
            }
        }
    }
    let Some(mut stream) = stream else {
        fail(&shared, format!("peer {address} unreachable after {retry_times} attempts"));
        return;
    };

    // Flush the pre-connect backlog in order, then flip the state so new
    // writes bypass the backlog.
    let mut encode_buf = BytesMut::new();
    loop {
        let frame = {
            let mut backlog = shared.backlog.lock();
            match backlog.pop_front() {
                Some(frame) => frame,
                None => {
                    let mut state = shared.state.lock();
                    // Draining may already have been requested mid-flush.
                    if *state == ChannelState::Connecting {
                        *state = ChannelState::Connected;
                    }
                    break;
                }
            }
        };
        let is_final = is_final_eos(&frame);
        if let Err(error) = write_frame(&mut stream, &mut encode_buf, frame).await {
            fail(&shared, error.to_string());
            return;
        }
        if is_final {
            finish(&shared, stream).await;
            return;
        }
    }
    debug!(partition = %shared.partition, %address, "channel connected");

    while let Some(frame) = inbound.recv().await {
        let is_final = is_final_eos(&frame);
        if let Err(error) = write_frame(&mut stream, &mut encode_buf, frame).await {
            fail(&shared, error.to_string());
            return;
        }
        if is_final {
            finish(&shared, stream).await;
            return;
        }
    }
    // All senders gone without an explicit close.
    finish(&shared, stream).await;
}

fn is_final_eos(frame: &Frame) -> bool {
    matches!(
        frame.control,
        Some(ControlTag::SoftEos) | Some(ControlTag::HardEos) | Some(ControlTag::FailEos)
    )
}

async fn write_frame(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    frame: Frame,
) -> std::io::Result<()> {
    buf.clear();
    frame.encode(buf);
    stream.write_all(buf).await?;
    stream.flush().await
}

fn fail(shared: &Arc<ChannelShared>, message: String) {
    warn!(partition = %shared.partition, message, "channel failed");
    *shared.error.lock() = Some(message);
    *shared.state.lock() = ChannelState::Closed;
}

async fn finish(shared: &Arc<ChannelShared>, mut stream: TcpStream) {
    let _ = stream.shutdown().await;
    *shared.state.lock() = ChannelState::Closed;
    debug!(partition = %shared.partition, "channel closed");
}
