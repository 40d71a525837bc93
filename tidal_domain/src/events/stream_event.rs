// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # In-Band Stream Events
//!
//! Control information that travels alongside data: end-of-stream markers in
//! their three flavors, source errors, and epoch barriers. Sources convert
//! their own termination into exactly one such event per
//! `(origin, termination kind)`; the query manager turns events into
//! reconfiguration broadcasts toward the affected pipelines.
//!
//! The `ReconfigurationType` tags mirror the control vocabulary of the
//! worker-pool broadcast protocol and of network control frames, so an event
//! crossing a node boundary keeps its meaning.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::entities::query_lifecycle::TerminationKind;
use crate::value_objects::identifiers::OriginId;

/// Type tag of a reconfiguration message broadcast to every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconfigurationType {
    /// Per-worker initialization (e.g. lazily opening event channels).
    Initialize,
    /// Graceful end-of-stream: deliver after draining prior data.
    SoftEndOfStream,
    /// Hard end-of-stream: short-circuit, in-flight data may be dropped.
    HardEndOfStream,
    /// Failure end-of-stream: hard semantics plus a recorded error.
    FailEndOfStream,
    /// Final teardown of per-worker state for a terminated query.
    Destroy,
    /// Epoch barrier propagation along the reverse channel.
    PropagateEpoch,
}

impl ReconfigurationType {
    /// The reconfiguration flavor matching a termination kind.
    pub fn end_of_stream(kind: TerminationKind) -> Self {
        match kind {
            TerminationKind::Graceful => ReconfigurationType::SoftEndOfStream,
            TerminationKind::Hard => ReconfigurationType::HardEndOfStream,
            TerminationKind::Failure => ReconfigurationType::FailEndOfStream,
        }
    }

    /// The termination kind, for end-of-stream tags.
    pub fn termination_kind(&self) -> Option<TerminationKind> {
        match self {
            ReconfigurationType::SoftEndOfStream => Some(TerminationKind::Graceful),
            ReconfigurationType::HardEndOfStream => Some(TerminationKind::Hard),
            ReconfigurationType::FailEndOfStream => Some(TerminationKind::Failure),
            _ => None,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.termination_kind().is_some()
    }
}

impl Display for ReconfigurationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReconfigurationType::Initialize => "Initialize",
            ReconfigurationType::SoftEndOfStream => "SoftEndOfStream",
            ReconfigurationType::HardEndOfStream => "HardEndOfStream",
            ReconfigurationType::FailEndOfStream => "FailEndOfStream",
            ReconfigurationType::Destroy => "Destroy",
            ReconfigurationType::PropagateEpoch => "PropagateEpoch",
        };
        f.write_str(name)
    }
}

/// In-band event emitted by a source or the network layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// The origin terminated; exactly one per `(origin, kind)`.
    EndOfStream {
        origin_id: OriginId,
        kind: TerminationKind,
    },
    /// The origin failed before or while producing; carries the original
    /// error message. Exactly one per failing origin.
    SourceError { origin_id: OriginId, message: String },
    /// An epoch barrier received on the event back-channel.
    Epoch { origin_id: OriginId, epoch: u64 },
}

impl StreamEvent {
    pub fn origin_id(&self) -> OriginId {
        match self {
            StreamEvent::EndOfStream { origin_id, .. }
            | StreamEvent::SourceError { origin_id, .. }
            | StreamEvent::Epoch { origin_id, .. } => *origin_id,
        }
    }
}
