// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Network Partitions
//!
//! A `Partition` is the addressing unit of inter-node transport: the triple
//! `(query_id, pipeline_id, origin_id)` uniquely names one stream of buffers
//! between a producing pipeline on one node and a consuming pipeline on
//! another. The network layer's partition manager maps partitions to their
//! registered consumers and producers.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::value_objects::identifiers::{OriginId, PipelineId, QueryId};

/// Address of one inter-node stream: `(query, pipeline, origin)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub query_id: QueryId,
    pub pipeline_id: PipelineId,
    pub origin_id: OriginId,
}

impl Partition {
    pub fn new(query_id: QueryId, pipeline_id: PipelineId, origin_id: OriginId) -> Self {
        Self { query_id, pipeline_id, origin_id }
    }
}

impl Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}::{}",
            self.query_id.raw(),
            self.pipeline_id.raw(),
            self.origin_id.raw()
        )
    }
}

/// Location of a peer node's network endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeLocation {
    pub host: String,
    pub port: u16,
}

impl NodeLocation {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Display for NodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_display_is_stable() {
        let partition = Partition::new(
            QueryId::new(3).unwrap(),
            PipelineId::new(5).unwrap(),
            OriginId::new(7).unwrap(),
        );
        assert_eq!(partition.to_string(), "3::5::7");
    }

    #[test]
    fn test_partitions_order_by_components() {
        let a = Partition::new(
            QueryId::new(1).unwrap(),
            PipelineId::new(2).unwrap(),
            OriginId::new(3).unwrap(),
        );
        let b = Partition::new(
            QueryId::new(1).unwrap(),
            PipelineId::new(2).unwrap(),
            OriginId::new(4).unwrap(),
        );
        assert!(a < b);
    }
}
