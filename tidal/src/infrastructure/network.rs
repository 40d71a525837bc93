// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Partition-addressed network transport between nodes.

pub mod channel;
pub mod network_manager;
pub mod network_sink;
pub mod network_source;
pub mod partition_manager;
pub mod wire;

pub use channel::{ChannelState, NetworkChannel};
pub use network_manager::NetworkManager;
pub use network_sink::NetworkSink;
pub use network_source::NetworkSource;
pub use partition_manager::{
    NetworkEventListener, PartitionConsumer, PartitionManager, PartitionRegistrationStatus,
};
pub use wire::{ControlTag, Frame};
