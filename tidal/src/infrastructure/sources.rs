// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Source drivers and implementations.

pub mod data_source;
pub mod generator_source;
pub mod ingest_source;
pub mod managed_source;
pub mod source_runner;

pub use data_source::{DataSource, SourceKind};
pub use generator_source::GeneratorSource;
pub use ingest_source::{IngestHandle, IngestSource};
pub use managed_source::{ManagedSource, StopToken};
pub use source_runner::SourceRunner;
