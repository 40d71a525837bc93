// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Tuple Buffers
//!
//! A `TupleBuffer` is a reference-counted handle onto a fixed-size byte
//! region drawn from a pool. Handles are cheap to clone; the region, its
//! metadata block, and its child-buffer list are shared by all clones. When
//! the last handle drops, the region is reset and returned to the pool it
//! was acquired from. The pool never frees a region while it is alive, and a
//! region outlives its pool if handles are still outstanding at shutdown:
//! the handle's `Arc` keeps the underlying segment valid until the last
//! holder drops it, at which point the recycle hook finds the pool gone and
//! simply releases the memory.
//!
//! ## Access discipline
//!
//! The byte region sits behind a read-write lock. The producing stage holds
//! the write guard while filling the buffer; downstream stages take read
//! guards. Pipelines hand buffers over through the task queue, so in
//! practice the lock is uncontended; it exists to keep the sharing safe, not
//! to arbitrate concurrent writers.
//!
//! ## Child buffers
//!
//! Variable-sized payloads live in child buffers attached to the parent.
//! The parent's fixed cell stores the child's index as handed out by
//! `attach_child`. Children are plain `TupleBuffer`s and are released with
//! their parent.

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tidal_domain::value_objects::sequence::SequenceData;
use tidal_domain::{BufferMetadata, EngineError, OriginId, Watermark};

/// Recycling hook a segment returns through when its last handle drops.
pub(crate) trait BufferRecycler: Send + Sync {
    fn recycle(&self, segment: Arc<BufferSegment>);
}

/// One pooled byte region with its shared metadata. Owned by `Arc`; free
/// segments are parked in their pool's free list with a handle count of
/// zero.
pub struct BufferSegment {
    data: RwLock<Box<[u8]>>,
    metadata: Mutex<BufferMetadata>,
    children: Mutex<Vec<TupleBuffer>>,
    /// Live `TupleBuffer` handles onto this segment.
    handles: AtomicUsize,
    /// Where the segment returns on release; set at acquisition time.
    origin_pool: Mutex<Option<Weak<dyn BufferRecycler>>>,
    capacity: usize,
}

impl BufferSegment {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            data: RwLock::new(vec![0u8; capacity].into_boxed_slice()),
            metadata: Mutex::new(BufferMetadata::default()),
            children: Mutex::new(Vec::new()),
            handles: AtomicUsize::new(0),
            origin_pool: Mutex::new(None),
            capacity,
        })
    }

    /// Wraps a free segment into its first handle, wiring the recycler.
    pub(crate) fn acquire(self: Arc<Self>, recycler: Weak<dyn BufferRecycler>) -> TupleBuffer {
        debug_assert_eq!(self.handles.load(Ordering::Relaxed), 0);
        *self.origin_pool.lock() = Some(recycler);
        self.handles.store(1, Ordering::Release);
        TupleBuffer { segment: self }
    }

    /// Clears metadata and child references; called on the release path.
    fn reset(&self) {
        self.metadata.lock().reset();
        self.children.lock().clear();
    }
}

impl std::fmt::Debug for BufferSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferSegment")
            .field("capacity", &self.capacity)
            .field("handles", &self.handles.load(Ordering::Relaxed))
            .finish()
    }
}

/// Reference-counted handle onto a pooled buffer segment.
pub struct TupleBuffer {
    segment: Arc<BufferSegment>,
}

impl TupleBuffer {
    /// Size of the byte region; exactly the pool's configured buffer size.
    pub fn capacity(&self) -> usize {
        self.segment.capacity
    }

    /// Read access to the byte region.
    pub fn bytes(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.segment.data.read()
    }

    /// Write access to the byte region.
    pub fn bytes_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.segment.data.write()
    }

    /// A copy of the metadata block.
    pub fn metadata(&self) -> BufferMetadata {
        *self.segment.metadata.lock()
    }

    /// Stamps the full metadata block, as sources do at emission.
    pub fn stamp(
        &self,
        origin_id: OriginId,
        sequence_data: SequenceData,
        watermark: Watermark,
        creation_ts: u64,
    ) {
        let mut meta = self.segment.metadata.lock();
        meta.origin_id = Some(origin_id);
        meta.sequence_data = Some(sequence_data);
        meta.watermark = watermark;
        meta.creation_ts = creation_ts;
    }

    pub fn number_of_tuples(&self) -> usize {
        self.segment.metadata.lock().number_of_tuples
    }

    pub fn set_number_of_tuples(&self, count: usize) {
        self.segment.metadata.lock().number_of_tuples = count;
    }

    pub fn origin_id(&self) -> Option<OriginId> {
        self.segment.metadata.lock().origin_id
    }

    pub fn watermark(&self) -> Watermark {
        self.segment.metadata.lock().watermark
    }

    pub fn set_watermark(&self, watermark: Watermark) {
        self.segment.metadata.lock().watermark = watermark;
    }

    pub fn sequence_data(&self) -> Option<SequenceData> {
        self.segment.metadata.lock().sequence_data
    }

    /// Attaches a child buffer and returns its index for the parent's
    /// varsized cells.
    pub fn attach_child(&self, child: TupleBuffer) -> u32 {
        let mut children = self.segment.children.lock();
        children.push(child);
        (children.len() - 1) as u32
    }

    /// The child buffer at `index`, as a fresh shared handle.
    ///
    /// # Errors
    /// Returns `EngineError::BufferAccess` for an unknown index.
    pub fn child(&self, index: u32) -> Result<TupleBuffer, EngineError> {
        self.segment
            .children
            .lock()
            .get(index as usize)
            .cloned()
            .ok_or_else(|| EngineError::BufferAccess(format!("no child buffer at index {index}")))
    }

    pub fn child_count(&self) -> usize {
        self.segment.children.lock().len()
    }

    /// Current number of live handles, for leak accounting in tests.
    pub fn handle_count(&self) -> usize {
        self.segment.handles.load(Ordering::Acquire)
    }
}

impl Clone for TupleBuffer {
    fn clone(&self) -> Self {
        self.segment.handles.fetch_add(1, Ordering::AcqRel);
        Self { segment: Arc::clone(&self.segment) }
    }
}

impl Drop for TupleBuffer {
    fn drop(&mut self) {
        if self.segment.handles.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // Last handle: reset and hand the segment back to its pool. A pool
        // that is already gone means the engine shut down with this buffer
        // outstanding; the segment memory is released right here instead.
        self.segment.reset();
        let recycler = self.segment.origin_pool.lock().take();
        if let Some(pool) = recycler.and_then(|weak| weak.upgrade()) {
            pool.recycle(Arc::clone(&self.segment));
        }
    }
}

impl std::fmt::Debug for TupleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let meta = self.metadata();
        f.debug_struct("TupleBuffer")
            .field("capacity", &self.capacity())
            .field("tuples", &meta.number_of_tuples)
            .field("origin", &meta.origin_id)
            .field("sequence", &meta.sequence_data)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use tidal_domain::value_objects::sequence::SequenceNumber;

    /// Test recycler capturing returned segments.
    struct Capture {
        returned: PlMutex<Vec<Arc<BufferSegment>>>,
    }

    impl BufferRecycler for Capture {
        fn recycle(&self, segment: Arc<BufferSegment>) {
            self.returned.lock().push(segment);
        }
    }

    fn capture() -> Arc<Capture> {
        Arc::new(Capture { returned: PlMutex::new(Vec::new()) })
    }

    fn acquire_from(capture: &Arc<Capture>) -> TupleBuffer {
        let recycler: Weak<dyn BufferRecycler> =
            Arc::downgrade(capture) as Weak<dyn BufferRecycler>;
        BufferSegment::new(64).acquire(recycler)
    }

    #[test]
    fn test_clone_shares_region_and_metadata() {
        let pool = capture();
        let buffer = acquire_from(&pool);
        buffer.bytes_mut()[0] = 42;
        buffer.set_number_of_tuples(3);

        let clone = buffer.clone();
        assert_eq!(clone.bytes()[0], 42);
        assert_eq!(clone.number_of_tuples(), 3);
        assert_eq!(buffer.handle_count(), 2);
    }

    #[test]
    fn test_last_drop_recycles_reset_segment() {
        let pool = capture();
        let buffer = acquire_from(&pool);
        buffer.stamp(
            OriginId::new(1).unwrap(),
            SequenceData::unchunked(SequenceNumber(1)),
            Watermark(5),
            123,
        );
        let clone = buffer.clone();
        drop(buffer);
        assert!(pool.returned.lock().is_empty());
        drop(clone);

        let returned = pool.returned.lock();
        assert_eq!(returned.len(), 1);
        // The segment came back with cleared metadata.
        assert!(!returned[0].metadata.lock().is_stamped());
    }

    #[test]
    fn test_segment_survives_dead_pool() {
        let pool = capture();
        let buffer = acquire_from(&pool);
        drop(pool);
        // The pool is gone; dropping the last handle must not panic, and
        // the region stays readable until then.
        buffer.bytes_mut()[1] = 7;
        assert_eq!(buffer.bytes()[1], 7);
        drop(buffer);
    }

    #[test]
    fn test_children_are_released_with_parent() {
        let pool = capture();
        let parent = acquire_from(&pool);
        let child = acquire_from(&pool);
        let index = parent.attach_child(child);
        assert_eq!(index, 0);
        assert_eq!(parent.child_count(), 1);
        assert!(parent.child(0).is_ok());
        assert!(parent.child(1).is_err());
        drop(parent);
        // Parent and child both returned.
        assert_eq!(pool.returned.lock().len(), 2);
    }
}
