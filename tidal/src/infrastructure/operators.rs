// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Operator handlers and their pipeline stages: windowing, interval join,
//! and the prediction cache.

pub mod interval_join;
pub mod prediction_cache;
pub mod window_operator;

pub use interval_join::{
    IntervalJoinBuildStage, IntervalJoinHandler, IntervalJoinProbeStage, JoinPredicate, JoinSide,
};
pub use prediction_cache::PredictionCacheHandler;
pub use window_operator::{WindowBuildStage, WindowOperatorHandler};
