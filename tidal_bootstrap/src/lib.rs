// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Bootstrap Module
//!
//! Entry-point concerns of the engine binary, kept outside the application
//! and infrastructure layers: command-line parsing, logger initialization,
//! signal-driven shutdown, and platform probes (core counting, worker
//! pinning). The engine layers may call into `platform`; everything else
//! here is called only by `main`.
//!
//! ```text
//! main ─▶ cli::parse ─▶ logger::init ─▶ engine … ─▶ shutdown::wait ─▶ exit
//! ```

pub mod cli;
pub mod logger;
pub mod platform;
pub mod shutdown;

pub use cli::{CliArgs, EngineCommand};
pub use shutdown::{wait_for_signal, ShutdownReason};
