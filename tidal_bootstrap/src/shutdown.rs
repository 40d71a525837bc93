// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Shutdown Coordination
//!
//! Blocks the serving path until the process receives a termination signal
//! (SIGINT or, on unix, SIGTERM). The engine's own teardown runs after the
//! wait returns; this module only owns the waiting.

use tracing::info;

/// Which signal ended the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
}

/// Blocks the calling thread until a shutdown signal arrives.
///
/// A small current-thread runtime exists only for the signal futures; the
/// engine keeps running on its own threads while this waits.
pub fn wait_for_signal() -> ShutdownReason {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            // Without a signal runtime there is nothing to wait on; treat
            // it as an immediate interrupt so the caller shuts down.
            tracing::error!(%error, "signal runtime unavailable");
            return ShutdownReason::Interrupt;
        }
    };
    let reason = runtime.block_on(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    return ShutdownReason::Interrupt;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => ShutdownReason::Interrupt,
                _ = term.recv() => ShutdownReason::Terminate,
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            ShutdownReason::Interrupt
        }
    });
    info!(?reason, "shutdown signal received");
    reason
}
