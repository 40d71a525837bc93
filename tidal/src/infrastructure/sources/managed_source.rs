// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Managed Sources
//!
//! The lifecycle contract the query manager holds over every source feeding
//! a query, and the cooperative stop token the drivers honor. Two families
//! implement it: the thread-driven `SourceRunner` and the `NetworkSource`,
//! which has no driver thread of its own.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tidal_domain::{EngineError, OriginId, TerminationKind};

/// Lifecycle handle the query manager keeps per source.
///
/// `stop` is non-blocking and idempotent: it requests termination and
/// returns immediately (well under the 100ms budget); the driver notices
/// the flag between buffers and winds down on its own.
pub trait ManagedSource: Send + Sync {
    fn origin_id(&self) -> OriginId;

    fn start(&self) -> Result<(), EngineError>;

    fn stop(&self, kind: TerminationKind) -> Result<(), EngineError>;
}

/// Cooperative cancellation flag with an interruptible wait.
///
/// Sources that would otherwise block indefinitely (queue pops, paced
/// generation) wait through `wait_timeout` so that a stop request unblocks
/// them promptly.
#[derive(Debug, Default)]
pub struct StopToken {
    stopped: AtomicBool,
    lock: Mutex<()>,
    signal: Condvar,
}

impl StopToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Sets the flag and wakes every waiter. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.signal.notify_all();
    }

    /// Sleeps up to `timeout` or until the token is stopped; returns
    /// whether the token is stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        let mut guard = self.lock.lock();
        if !self.is_stopped() {
            let _ = self.signal.wait_for(&mut guard, timeout);
        }
        self.is_stopped()
    }
}
