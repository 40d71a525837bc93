// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Worker Tasks
//!
//! The unit of work a worker pulls from its queue. Data tasks carry one
//! buffer toward one target and are consumed by exactly one worker;
//! reconfiguration tasks are broadcast copies, one per worker; the shutdown
//! pill ends a worker's loop.

use std::sync::Arc;

use tidal_domain::TerminationKind;

use crate::infrastructure::memory::tuple_buffer::TupleBuffer;
use crate::infrastructure::runtime::executable_plan::{ExecutableQueryPlan, SinkId, SuccessorTarget};
use crate::infrastructure::runtime::reconfiguration::ReconfigurationMessage;

/// One queued unit of worker work.
pub enum Task {
    /// A buffer headed for a pipeline or sink; consumed by one worker.
    Data {
        plan: Arc<ExecutableQueryPlan>,
        target: SuccessorTarget,
        buffer: TupleBuffer,
    },
    /// One copy of a pool-wide broadcast.
    Reconfiguration(Arc<ReconfigurationMessage>),
    /// End-of-stream for one sink. Queued like a data task so it stays
    /// behind every result buffer emitted before it.
    SinkTermination {
        plan: Arc<ExecutableQueryPlan>,
        sink_id: SinkId,
        kind: TerminationKind,
    },
    /// Ends the receiving worker's loop.
    Shutdown,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Data { plan, target, buffer } => f
                .debug_struct("Data")
                .field("query", &plan.query_id())
                .field("target", target)
                .field("tuples", &buffer.number_of_tuples())
                .finish(),
            Task::Reconfiguration(message) => f
                .debug_struct("Reconfiguration")
                .field("query", &message.query_id())
                .field("type", &message.reconfiguration_type())
                .finish(),
            Task::SinkTermination { plan, sink_id, kind } => f
                .debug_struct("SinkTermination")
                .field("query", &plan.query_id())
                .field("sink", sink_id)
                .field("kind", kind)
                .finish(),
            Task::Shutdown => f.write_str("Shutdown"),
        }
    }
}
