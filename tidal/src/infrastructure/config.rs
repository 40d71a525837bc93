// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Engine configuration.

pub mod engine_config;

pub use engine_config::{NetworkConfiguration, QueryManagerMode, WorkerConfiguration};
