// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Observability Helpers
//!
//! Tracing conventions of the engine: the subscriber itself is initialized
//! by the bootstrap crate; this module contributes the startup banner and
//! a scoped timing guard used around lifecycle operations.

use std::time::Instant;
use tracing::{info, info_span, Span};

use crate::infrastructure::config::engine_config::WorkerConfiguration;

/// Logs the effective configuration once at startup.
pub fn log_startup(config: &WorkerConfiguration) {
    info!(%config, "engine starting");
    if let Some(network) = &config.network {
        info!(
            host = %network.listen_host,
            port = network.listen_port,
            retry_times = network.retry_times,
            "network transport enabled"
        );
    }
    if config.enable_query_reconfiguration {
        info!("query reconfiguration flag set; redeploy runs as stop-then-start");
    }
}

/// Span plus wall-clock guard around one lifecycle operation; logs the
/// duration when dropped.
pub struct TimedOperation {
    span: Span,
    label: &'static str,
    begin: Instant,
}

impl TimedOperation {
    pub fn begin(label: &'static str) -> Self {
        let span = info_span!("engine_op", operation = label);
        Self { span, label, begin: Instant::now() }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Elapsed time so far, for callers that also feed a histogram.
    pub fn elapsed_seconds(&self) -> f64 {
        self.begin.elapsed().as_secs_f64()
    }
}

impl Drop for TimedOperation {
    fn drop(&mut self) {
        let _entered = self.span.enter();
        info!(
            operation = self.label,
            elapsed_ms = self.begin.elapsed().as_millis() as u64,
            "operation finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timed_operation_measures() {
        let op = TimedOperation::begin("unit-test");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(op.elapsed_seconds() >= 0.005);
    }
}
