// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Pooled tuple buffers and their managers.

pub mod buffer_manager;
pub mod fixed_size_pool;
pub mod tuple_buffer;

pub use buffer_manager::BufferManager;
pub use fixed_size_pool::FixedSizeBufferPool;
pub use tuple_buffer::TupleBuffer;
