// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Events
//!
//! In-band control events and the reconfiguration vocabulary.

pub mod stream_event;

pub use stream_event::{ReconfigurationType, StreamEvent};
