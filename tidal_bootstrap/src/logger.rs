// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Logger Initialization
//!
//! Sets up the global tracing subscriber once, early in `main`. The filter
//! combines the `--log` flag with `RUST_LOG` (the environment wins so that
//! operators can raise verbosity without touching the service definition).

use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global subscriber; later calls are no-ops.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init();
}
