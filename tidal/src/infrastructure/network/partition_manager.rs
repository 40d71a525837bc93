// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Partition Manager
//!
//! The registry mapping partitions to their local endpoints: consumers
//! (network sources receiving data frames) and event listeners (network
//! sinks receiving back-channel events). Registration status is tri-state:
//! a partition that was registered and then unregistered reports `Deleted`,
//! which tells a reconnecting peer to give up instead of retrying.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tidal_domain::{EngineError, Partition};

use crate::infrastructure::network::wire::{ControlTag, Frame};

/// Registration state of a partition on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRegistrationStatus {
    Registered,
    NotFound,
    Deleted,
}

/// Receives the data-direction traffic of one partition.
pub trait PartitionConsumer: Send + Sync {
    /// One data frame arrived.
    fn on_buffer(&self, frame: Frame) -> Result<(), EngineError>;

    /// One control frame arrived (end-of-stream flavors, initialize).
    fn on_control(&self, tag: ControlTag, frame: &Frame) -> Result<(), EngineError>;
}

/// Receives back-channel events (epochs) addressed at one partition.
pub trait NetworkEventListener: Send + Sync {
    fn on_epoch(&self, epoch: u64);
}

/// Partition registry; shared by the accept loop and the engine.
#[derive(Default)]
pub struct PartitionManager {
    consumers: RwLock<HashMap<Partition, Arc<dyn PartitionConsumer>>>,
    event_listeners: RwLock<HashMap<Partition, Arc<dyn NetworkEventListener>>>,
    deleted: RwLock<HashSet<Partition>>,
}

impl PartitionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `consumer` for `partition`.
    ///
    /// # Errors
    /// `EngineError::InvalidPlan` when the partition is already taken.
    pub fn register_consumer(
        &self,
        partition: Partition,
        consumer: Arc<dyn PartitionConsumer>,
    ) -> Result<(), EngineError> {
        let mut consumers = self.consumers.write();
        if consumers.contains_key(&partition) {
            return Err(EngineError::invalid_plan(format!(
                "partition {partition} already has a consumer"
            )));
        }
        self.deleted.write().remove(&partition);
        consumers.insert(partition, consumer);
        Ok(())
    }

    /// Unregisters a consumer; the partition reports `Deleted` afterwards.
    pub fn unregister_consumer(&self, partition: Partition) {
        if self.consumers.write().remove(&partition).is_some() {
            self.deleted.write().insert(partition);
        }
    }

    pub fn consumer_status(&self, partition: Partition) -> PartitionRegistrationStatus {
        if self.consumers.read().contains_key(&partition) {
            PartitionRegistrationStatus::Registered
        } else if self.deleted.read().contains(&partition) {
            PartitionRegistrationStatus::Deleted
        } else {
            PartitionRegistrationStatus::NotFound
        }
    }

    pub fn consumer(&self, partition: Partition) -> Option<Arc<dyn PartitionConsumer>> {
        self.consumers.read().get(&partition).cloned()
    }

    pub fn register_event_listener(
        &self,
        partition: Partition,
        listener: Arc<dyn NetworkEventListener>,
    ) {
        self.event_listeners.write().insert(partition, listener);
    }

    pub fn unregister_event_listener(&self, partition: Partition) {
        self.event_listeners.write().remove(&partition);
    }

    pub fn event_listener(&self, partition: Partition) -> Option<Arc<dyn NetworkEventListener>> {
        self.event_listeners.read().get(&partition).cloned()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidal_domain::{OriginId, PipelineId, QueryId};

    struct NullConsumer;
    impl PartitionConsumer for NullConsumer {
        fn on_buffer(&self, _frame: Frame) -> Result<(), EngineError> {
            Ok(())
        }
        fn on_control(&self, _tag: ControlTag, _frame: &Frame) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn partition() -> Partition {
        Partition::new(
            QueryId::new(1).unwrap(),
            PipelineId::new(1).unwrap(),
            OriginId::new(1).unwrap(),
        )
    }

    #[test]
    fn test_registration_lifecycle() {
        let manager = PartitionManager::new();
        let partition = partition();
        assert_eq!(manager.consumer_status(partition), PartitionRegistrationStatus::NotFound);

        manager.register_consumer(partition, Arc::new(NullConsumer)).unwrap();
        assert_eq!(manager.consumer_status(partition), PartitionRegistrationStatus::Registered);
        assert!(manager.consumer(partition).is_some());

        manager.unregister_consumer(partition);
        assert_eq!(manager.consumer_status(partition), PartitionRegistrationStatus::Deleted);
        assert!(manager.consumer(partition).is_none());
    }

    #[test]
    fn test_double_registration_rejected() {
        let manager = PartitionManager::new();
        let partition = partition();
        manager.register_consumer(partition, Arc::new(NullConsumer)).unwrap();
        assert!(manager.register_consumer(partition, Arc::new(NullConsumer)).is_err());
    }

    #[test]
    fn test_reregistration_clears_deleted() {
        let manager = PartitionManager::new();
        let partition = partition();
        manager.register_consumer(partition, Arc::new(NullConsumer)).unwrap();
        manager.unregister_consumer(partition);
        manager.register_consumer(partition, Arc::new(NullConsumer)).unwrap();
        assert_eq!(manager.consumer_status(partition), PartitionRegistrationStatus::Registered);
    }
}
