// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Task dispatch, executable plans, and the worker pool.

pub mod executable_plan;
pub mod pipeline_execution_context;
pub mod query_manager;
pub mod reconfiguration;
pub mod task;

pub use executable_plan::{
    DataSink, ExecutablePipeline, ExecutablePipelineStage, ExecutableQueryPlan, OperatorHandler,
    QueryPlanBuilder, SinkId, SuccessorTarget,
};
pub use pipeline_execution_context::{ContinuationPolicy, PipelineExecutionContext};
pub use query_manager::{LoggingStatusListener, QueryManager, QueryManagerSettings, QueryStatusListener};
pub use reconfiguration::{Reconfigurable, ReconfigurationMessage, ReconfigurationTarget};
pub use task::Task;
