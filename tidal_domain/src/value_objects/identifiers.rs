// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Strongly-Typed Engine Identifiers
//!
//! This module provides the identifier value objects used across the engine:
//! `OriginId`, `QueryId`, `PipelineId`, and `WorkerThreadId`. All of them wrap
//! a dense integer assigned by the coordinator, but each is a distinct type so
//! that one kind of identifier can never be passed where another is expected.
//!
//! ## Overview
//!
//! - **Type-safe identification**: A `QueryId` cannot be confused with a
//!   `PipelineId` at compile time; there are no implicit conversions
//! - **Marker-based implementation**: One generic `Identifier<M>` carries the
//!   integer; zero-sized marker types select the identifier kind
//! - **Wire compatibility**: Identifiers serialize as plain integers so they
//!   round-trip through the network frame format and plan descriptors
//! - **Validation**: Each kind rejects the reserved zero value, which the
//!   wire format uses as "invalid / not set"
//!
//! ## Usage
//!
//! Identifiers are constructed from raw integers at the engine boundary
//! (plan ingestion, frame decoding) and stay typed everywhere else:
//!
//! ```rust,ignore
//! let origin = OriginId::new(1)?;
//! let query = QueryId::new(42)?;
//! assert_ne!(origin.raw(), 0);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::hash::Hash;
use std::marker::PhantomData;

use crate::EngineError;

/// Category contract implemented by each identifier marker type.
///
/// The marker provides the human-readable kind name used in error messages
/// and may tighten validation beyond the shared non-zero rule.
pub trait IdKind {
    /// Short lowercase name of the identifier kind (e.g. `"origin"`).
    fn kind_name() -> &'static str;

    /// Kind-specific validation on top of the shared non-zero rule.
    fn validate(raw: u64) -> Result<(), EngineError> {
        let _ = raw;
        Ok(())
    }
}

/// Generic identifier carrying a dense integer with a kind marker.
///
/// This is an implementation detail of the concrete identifier types below;
/// engine code always names `OriginId`, `QueryId`, `PipelineId`, or
/// `WorkerThreadId` directly.
#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier<M: IdKind> {
    value: u64,
    #[serde(skip)]
    _marker: PhantomData<M>,
}

impl<M: IdKind> Identifier<M> {
    /// Creates a new identifier, rejecting the reserved zero value.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidConfiguration` when `raw` is zero or the
    /// kind-specific validation rejects it.
    pub fn new(raw: u64) -> Result<Self, EngineError> {
        if raw == 0 {
            return Err(EngineError::invalid_config(format!(
                "{} id must be non-zero (zero is reserved for invalid)",
                M::kind_name()
            )));
        }
        M::validate(raw)?;
        Ok(Self { value: raw, _marker: PhantomData })
    }

    /// The raw integer value, for wire encoding and plan descriptors.
    pub fn raw(&self) -> u64 {
        self.value
    }
}

// Manual impls: deriving these would bound them on `M`, but markers are
// zero-sized and never compared.
impl<M: IdKind> Clone for Identifier<M> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<M: IdKind> Copy for Identifier<M> {}
impl<M: IdKind> PartialEq for Identifier<M> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}
impl<M: IdKind> Eq for Identifier<M> {}
impl<M: IdKind> PartialOrd for Identifier<M> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<M: IdKind> Ord for Identifier<M> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}
impl<M: IdKind> Hash for Identifier<M> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}
impl<M: IdKind> Display for Identifier<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", M::kind_name(), self.value)
    }
}

macro_rules! identifier_kind {
    ($(#[$doc:meta])* $name:ident, $marker:ident, $kind:literal) => {
        /// Marker type selecting the identifier kind.
        #[derive(Debug, Clone, Copy)]
        pub struct $marker;

        impl IdKind for $marker {
            fn kind_name() -> &'static str {
                $kind
            }
        }

        $(#[$doc])*
        pub type $name = Identifier<$marker>;
    };
}

identifier_kind!(
    /// Identifier of a logical stream origin.
    ///
    /// Each origin owns its own sequence-number space: buffers stamped with
    /// the same `OriginId` carry dense, monotonically increasing sequence
    /// numbers. Origins are unique per engine; registering two sources with
    /// the same origin is rejected as an invalid plan.
    OriginId,
    OriginMarker,
    "origin"
);

identifier_kind!(
    /// Identifier of a deployed query on this node.
    QueryId,
    QueryMarker,
    "query"
);

identifier_kind!(
    /// Identifier of an executable pipeline within a query plan.
    PipelineId,
    PipelineMarker,
    "pipeline"
);

/// Identifier of a worker thread inside the engine's worker pool.
///
/// Worker thread ids are dense indices starting at zero, assigned when the
/// pool spawns its threads. They index per-worker partitions of operator
/// state (slice stores, paged vectors, slice caches), so unlike the
/// coordinator-assigned identifiers above, zero is a valid value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerThreadId(pub u32);

impl WorkerThreadId {
    /// The dense pool index of this worker.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Display for WorkerThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker({})", self.0)
    }
}
