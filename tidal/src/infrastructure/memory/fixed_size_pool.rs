// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Fixed-Size Buffer Pools
//!
//! A reserved slice of the global pool, owned by one source or worker.
//! Buffers acquired here return here, so a producer's working set is
//! insulated from pool pressure caused by other queries. On destruction the
//! reservation flows back: free segments immediately, outstanding ones as
//! their handles drop.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tidal_domain::EngineError;

use crate::infrastructure::memory::buffer_manager::GlobalPoolShared;
use crate::infrastructure::memory::tuple_buffer::{BufferRecycler, BufferSegment, TupleBuffer};

/// Reserved per-source / per-worker sub-pool.
pub struct FixedSizeBufferPool {
    free: Mutex<VecDeque<Arc<BufferSegment>>>,
    available: Condvar,
    global: Arc<GlobalPoolShared>,
    destroyed: AtomicBool,
    reserved: usize,
}

impl BufferRecycler for FixedSizeBufferPool {
    fn recycle(&self, segment: Arc<BufferSegment>) {
        if self.destroyed.load(Ordering::Acquire) {
            // The reservation is dissolved; late returns flow to the
            // global pool.
            self.global.recycle(segment);
            return;
        }
        self.free.lock().push_back(segment);
        self.available.notify_one();
    }
}

impl FixedSizeBufferPool {
    pub(crate) fn new(reserved: VecDeque<Arc<BufferSegment>>, global: Arc<GlobalPoolShared>) -> Arc<Self> {
        let count = reserved.len();
        Arc::new(Self {
            free: Mutex::new(reserved),
            available: Condvar::new(),
            global,
            destroyed: AtomicBool::new(false),
            reserved: count,
        })
    }

    /// Number of segments this pool reserved at creation.
    pub fn reserved_buffers(&self) -> usize {
        self.reserved
    }

    pub fn available_buffers(&self) -> usize {
        self.free.lock().len()
    }

    /// Acquires a buffer from the reservation, parking until one frees up.
    ///
    /// # Errors
    /// Returns `EngineError::BufferPoolExhausted` once the pool is
    /// destroyed.
    pub fn get_buffer_blocking(self: &Arc<Self>) -> Result<TupleBuffer, EngineError> {
        let mut free = self.free.lock();
        loop {
            if self.destroyed.load(Ordering::Acquire) {
                return Err(EngineError::buffer_exhausted("fixed-size pool destroyed"));
            }
            if let Some(segment) = free.pop_front() {
                return Ok(segment.acquire(self.recycler()));
            }
            self.available.wait(&mut free);
        }
    }

    /// Acquires a buffer if the reservation has one free right now.
    pub fn get_buffer_nonblocking(self: &Arc<Self>) -> Option<TupleBuffer> {
        if self.destroyed.load(Ordering::Acquire) {
            return None;
        }
        let segment = self.free.lock().pop_front()?;
        Some(segment.acquire(self.recycler()))
    }

    /// Dissolves the reservation: free segments return to the global pool
    /// now, outstanding ones as their last handles drop. Parked callers are
    /// woken with an error. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut free = self.free.lock();
        while let Some(segment) = free.pop_front() {
            self.global.recycle(segment);
        }
        self.available.notify_all();
    }

    fn recycler(self: &Arc<Self>) -> Weak<dyn BufferRecycler> {
        Arc::downgrade(self) as Weak<dyn BufferRecycler>
    }
}

impl Drop for FixedSizeBufferPool {
    fn drop(&mut self) {
        // Segments still parked here must not die with the pool.
        let mut free = self.free.lock();
        while let Some(segment) = free.pop_front() {
            self.global.recycle(segment);
        }
    }
}

impl std::fmt::Debug for FixedSizeBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedSizeBufferPool")
            .field("reserved", &self.reserved)
            .field("available", &self.available_buffers())
            .field("destroyed", &self.destroyed.load(Ordering::Relaxed))
            .finish()
    }
}
