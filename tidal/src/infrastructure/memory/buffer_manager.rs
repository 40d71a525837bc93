// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Buffer Manager
//!
//! The global pool of fixed-size buffer segments shared by every query on
//! the node. Allocation is pool-based: segments are created once at startup
//! and recycled forever; running out of free segments is back-pressure, not
//! an allocation.
//!
//! ## Acquisition modes
//!
//! - `get_buffer_blocking`: the default everywhere: parks the caller until
//!   a segment frees up, failing only when the manager shuts down
//! - `get_buffer_nonblocking`: a diagnostic probe used by tests and the
//!   pool-pressure metric; production paths prefer blocking back-pressure
//!
//! ## Reserved sub-pools
//!
//! `create_fixed_size_pool(n)` carves `n` segments out of the global free
//! list into a `FixedSizeBufferPool`. Sources and workers draw from their
//! own sub-pool so that one slow consumer cannot starve every producer on
//! the node. Destroying a sub-pool returns its free segments immediately;
//! outstanding buffers return to the global pool when they are dropped.
//!
//! ## Shutdown
//!
//! `shutdown()` wakes every parked caller with `BufferPoolExhausted` and
//! stops handing out segments. Outstanding buffers stay valid: each handle
//! keeps its segment alive, and the final drop releases the memory once the
//! pool is gone.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

use tidal_domain::EngineError;

use crate::infrastructure::memory::fixed_size_pool::FixedSizeBufferPool;
use crate::infrastructure::memory::tuple_buffer::{BufferRecycler, BufferSegment, TupleBuffer};

pub(crate) struct GlobalPoolShared {
    free: Mutex<VecDeque<Arc<BufferSegment>>>,
    available: Condvar,
    shutdown: AtomicBool,
    buffer_size: usize,
    total: usize,
}

impl BufferRecycler for GlobalPoolShared {
    fn recycle(&self, segment: Arc<BufferSegment>) {
        self.free.lock().push_back(segment);
        self.available.notify_one();
    }
}

/// Global buffer pool; one per node engine, shared by all queries.
pub struct BufferManager {
    shared: Arc<GlobalPoolShared>,
}

impl BufferManager {
    /// Pre-allocates `total` segments of `buffer_size` bytes.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidConfiguration` for a zero-sized pool or
    /// zero-sized buffers.
    pub fn new(total: usize, buffer_size: usize) -> Result<Self, EngineError> {
        if total == 0 || buffer_size == 0 {
            return Err(EngineError::invalid_config(format!(
                "buffer pool needs positive dimensions, got {total} x {buffer_size} bytes"
            )));
        }
        let free = (0..total).map(|_| BufferSegment::new(buffer_size)).collect();
        debug!(total, buffer_size, "allocated global buffer pool");
        Ok(Self {
            shared: Arc::new(GlobalPoolShared {
                free: Mutex::new(free),
                available: Condvar::new(),
                shutdown: AtomicBool::new(false),
                buffer_size,
                total,
            }),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    pub fn total_buffers(&self) -> usize {
        self.shared.total
    }

    /// Free segments right now; a sampling metric, racy by nature.
    pub fn available_buffers(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Acquires a buffer, parking the caller while the pool is empty.
    ///
    /// # Errors
    /// Returns `EngineError::BufferPoolExhausted` only on shutdown; while
    /// the manager lives, the call blocks instead of failing.
    pub fn get_buffer_blocking(&self) -> Result<TupleBuffer, EngineError> {
        let mut free = self.shared.free.lock();
        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                return Err(EngineError::buffer_exhausted("buffer manager shut down"));
            }
            if let Some(segment) = free.pop_front() {
                return Ok(segment.acquire(self.recycler()));
            }
            self.shared.available.wait(&mut free);
        }
    }

    /// Acquires a buffer if one is free right now. Diagnostic variant;
    /// the engine's default acquisition is blocking.
    pub fn get_buffer_nonblocking(&self) -> Option<TupleBuffer> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return None;
        }
        let segment = self.shared.free.lock().pop_front()?;
        Some(segment.acquire(self.recycler()))
    }

    /// Reserves `count` segments into a dedicated sub-pool.
    ///
    /// # Errors
    /// Returns `EngineError::BufferPoolExhausted` when fewer than `count`
    /// segments are free; reservations never wait.
    pub fn create_fixed_size_pool(&self, count: usize) -> Result<Arc<FixedSizeBufferPool>, EngineError> {
        let mut free = self.shared.free.lock();
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(EngineError::buffer_exhausted("buffer manager shut down"));
        }
        if free.len() < count {
            return Err(EngineError::buffer_exhausted(format!(
                "cannot reserve {count} buffers, only {} free",
                free.len()
            )));
        }
        let reserved: VecDeque<_> = free.drain(..count).collect();
        Ok(FixedSizeBufferPool::new(reserved, Arc::clone(&self.shared)))
    }

    /// Stops handing out buffers and wakes every parked caller.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.available.notify_all();
        debug!("buffer manager shut down");
    }

    fn recycler(&self) -> Weak<dyn BufferRecycler> {
        Arc::downgrade(&self.shared) as Weak<dyn BufferRecycler>
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("total", &self.shared.total)
            .field("buffer_size", &self.shared.buffer_size)
            .field("available", &self.available_buffers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_buffers_are_fresh_and_sized() {
        let manager = BufferManager::new(4, 128).unwrap();
        let buffer = manager.get_buffer_blocking().unwrap();
        assert_eq!(buffer.capacity(), 128);
        assert_eq!(buffer.number_of_tuples(), 0);
        assert!(buffer.origin_id().is_none());
        assert_eq!(manager.available_buffers(), 3);
    }

    #[test]
    fn test_drop_returns_buffer_to_pool() {
        let manager = BufferManager::new(2, 64).unwrap();
        let buffer = manager.get_buffer_blocking().unwrap();
        assert_eq!(manager.available_buffers(), 1);
        drop(buffer);
        assert_eq!(manager.available_buffers(), 2);
    }

    #[test]
    fn test_nonblocking_returns_none_when_empty() {
        let manager = BufferManager::new(1, 64).unwrap();
        let held = manager.get_buffer_nonblocking().unwrap();
        assert!(manager.get_buffer_nonblocking().is_none());
        drop(held);
        assert!(manager.get_buffer_nonblocking().is_some());
    }

    #[test]
    fn test_blocking_wakes_on_recycle() {
        let manager = Arc::new(BufferManager::new(1, 64).unwrap());
        let held = manager.get_buffer_blocking().unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || manager.get_buffer_blocking())
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        let buffer = waiter.join().unwrap().unwrap();
        assert_eq!(buffer.capacity(), 64);
    }

    #[test]
    fn test_shutdown_fails_blocked_callers() {
        let manager = Arc::new(BufferManager::new(1, 64).unwrap());
        let _held = manager.get_buffer_blocking().unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || manager.get_buffer_blocking())
        };
        std::thread::sleep(Duration::from_millis(50));
        manager.shutdown();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(EngineError::BufferPoolExhausted(_))));
    }

    #[test]
    fn test_shutdown_with_outstanding_buffer_is_safe() {
        let manager = BufferManager::new(2, 64).unwrap();
        let buffer = manager.get_buffer_blocking().unwrap();
        manager.shutdown();
        drop(manager);
        // The region is still valid and the final drop must not panic.
        buffer.bytes_mut()[0] = 1;
        drop(buffer);
    }

    #[test]
    fn test_no_leak_across_acquire_release_cycle() {
        let manager = BufferManager::new(8, 64).unwrap();
        for _ in 0..100 {
            let a = manager.get_buffer_blocking().unwrap();
            let b = a.clone();
            drop(a);
            drop(b);
        }
        assert_eq!(manager.available_buffers(), 8);
    }
}
