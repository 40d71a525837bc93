// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Aggregation Functions
//!
//! This module provides the incremental aggregation algebra the windowing
//! engine is built on. Every aggregation is expressed as four operations:
//!
//! - `reset` : produce the empty partial state
//! - `lift`  : fold one input value into a partial state
//! - `combine`: merge two partial states (associative)
//! - `lower` : turn a partial state into the final value
//!
//! The split matters because pre-aggregation runs per worker: each worker
//! lifts records into thread-local partials, partials are combined into the
//! global slice store under a mutex, and windows are lowered once when they
//! trigger. Associativity of `combine` is what makes the result independent
//! of how records were partitioned across workers.
//!
//! Partial states are small value types; a window operator owns one
//! `Vec<AggregateState>` per key with one entry per configured aggregation.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::sync::Arc;

use crate::value_objects::data_type::FieldValue;
use crate::EngineError;

/// Partial aggregate state. The variant must match its owning function;
/// the functions verify this and report a state mismatch as an internal
/// error rather than producing a wrong result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AggregateState {
    Sum(i64),
    Count(u64),
    Min(i64),
    Max(i64),
    Avg { sum: i64, count: u64 },
}

/// Which aggregation a plan descriptor asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    Sum,
    Count,
    Min,
    Max,
    Avg,
}

impl Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregationKind::Sum => "sum",
            AggregationKind::Count => "count",
            AggregationKind::Min => "min",
            AggregationKind::Max => "max",
            AggregationKind::Avg => "avg",
        };
        f.write_str(name)
    }
}

/// The incremental aggregation contract.
pub trait AggregationFunction: Send + Sync {
    /// The empty partial state.
    fn reset(&self) -> AggregateState;

    /// Folds one input value into `state`.
    fn lift(&self, state: &mut AggregateState, value: &FieldValue) -> Result<(), EngineError>;

    /// Merges `other` into `into`. Must be associative and commutative.
    fn combine(&self, into: &mut AggregateState, other: &AggregateState) -> Result<(), EngineError>;

    /// Final value of a partial state.
    fn lower(&self, state: &AggregateState) -> Result<FieldValue, EngineError>;

    fn kind(&self) -> AggregationKind;
}

fn state_mismatch(kind: AggregationKind, state: &AggregateState) -> EngineError {
    EngineError::internal(format!("{kind} aggregation handed foreign state {state:?}"))
}

/// Sum of input values.
#[derive(Debug, Default)]
pub struct SumAggregation;

impl AggregationFunction for SumAggregation {
    fn reset(&self) -> AggregateState {
        AggregateState::Sum(0)
    }

    fn lift(&self, state: &mut AggregateState, value: &FieldValue) -> Result<(), EngineError> {
        match state {
            AggregateState::Sum(acc) => {
                *acc = acc.wrapping_add(value.as_i64()?);
                Ok(())
            }
            other => Err(state_mismatch(self.kind(), other)),
        }
    }

    fn combine(&self, into: &mut AggregateState, other: &AggregateState) -> Result<(), EngineError> {
        match (into, other) {
            (AggregateState::Sum(a), AggregateState::Sum(b)) => {
                *a = a.wrapping_add(*b);
                Ok(())
            }
            (into, other) => Err(state_mismatch(self.kind(), if matches!(into, AggregateState::Sum(_)) { other } else { into })),
        }
    }

    fn lower(&self, state: &AggregateState) -> Result<FieldValue, EngineError> {
        match state {
            AggregateState::Sum(acc) => Ok(FieldValue::Int64(*acc)),
            other => Err(state_mismatch(self.kind(), other)),
        }
    }

    fn kind(&self) -> AggregationKind {
        AggregationKind::Sum
    }
}

/// Count of input values.
#[derive(Debug, Default)]
pub struct CountAggregation;

impl AggregationFunction for CountAggregation {
    fn reset(&self) -> AggregateState {
        AggregateState::Count(0)
    }

    fn lift(&self, state: &mut AggregateState, _value: &FieldValue) -> Result<(), EngineError> {
        match state {
            AggregateState::Count(acc) => {
                *acc += 1;
                Ok(())
            }
            other => Err(state_mismatch(self.kind(), other)),
        }
    }

    fn combine(&self, into: &mut AggregateState, other: &AggregateState) -> Result<(), EngineError> {
        match (into, other) {
            (AggregateState::Count(a), AggregateState::Count(b)) => {
                *a += *b;
                Ok(())
            }
            (into, other) => Err(state_mismatch(self.kind(), if matches!(into, AggregateState::Count(_)) { other } else { into })),
        }
    }

    fn lower(&self, state: &AggregateState) -> Result<FieldValue, EngineError> {
        match state {
            AggregateState::Count(acc) => Ok(FieldValue::UInt64(*acc)),
            other => Err(state_mismatch(self.kind(), other)),
        }
    }

    fn kind(&self) -> AggregationKind {
        AggregationKind::Count
    }
}

/// Minimum of input values.
#[derive(Debug, Default)]
pub struct MinAggregation;

impl AggregationFunction for MinAggregation {
    fn reset(&self) -> AggregateState {
        AggregateState::Min(i64::MAX)
    }

    fn lift(&self, state: &mut AggregateState, value: &FieldValue) -> Result<(), EngineError> {
        match state {
            AggregateState::Min(acc) => {
                *acc = (*acc).min(value.as_i64()?);
                Ok(())
            }
            other => Err(state_mismatch(self.kind(), other)),
        }
    }

    fn combine(&self, into: &mut AggregateState, other: &AggregateState) -> Result<(), EngineError> {
        match (into, other) {
            (AggregateState::Min(a), AggregateState::Min(b)) => {
                *a = (*a).min(*b);
                Ok(())
            }
            (into, other) => Err(state_mismatch(self.kind(), if matches!(into, AggregateState::Min(_)) { other } else { into })),
        }
    }

    fn lower(&self, state: &AggregateState) -> Result<FieldValue, EngineError> {
        match state {
            AggregateState::Min(acc) => Ok(FieldValue::Int64(*acc)),
            other => Err(state_mismatch(self.kind(), other)),
        }
    }

    fn kind(&self) -> AggregationKind {
        AggregationKind::Min
    }
}

/// Maximum of input values.
#[derive(Debug, Default)]
pub struct MaxAggregation;

impl AggregationFunction for MaxAggregation {
    fn reset(&self) -> AggregateState {
        AggregateState::Max(i64::MIN)
    }

    fn lift(&self, state: &mut AggregateState, value: &FieldValue) -> Result<(), EngineError> {
        match state {
            AggregateState::Max(acc) => {
                *acc = (*acc).max(value.as_i64()?);
                Ok(())
            }
            other => Err(state_mismatch(self.kind(), other)),
        }
    }

    fn combine(&self, into: &mut AggregateState, other: &AggregateState) -> Result<(), EngineError> {
        match (into, other) {
            (AggregateState::Max(a), AggregateState::Max(b)) => {
                *a = (*a).max(*b);
                Ok(())
            }
            (into, other) => Err(state_mismatch(self.kind(), if matches!(into, AggregateState::Max(_)) { other } else { into })),
        }
    }

    fn lower(&self, state: &AggregateState) -> Result<FieldValue, EngineError> {
        match state {
            AggregateState::Max(acc) => Ok(FieldValue::Int64(*acc)),
            other => Err(state_mismatch(self.kind(), other)),
        }
    }

    fn kind(&self) -> AggregationKind {
        AggregationKind::Max
    }
}

/// Arithmetic mean, kept as a `(sum, count)` pair until lowering.
#[derive(Debug, Default)]
pub struct AvgAggregation;

impl AggregationFunction for AvgAggregation {
    fn reset(&self) -> AggregateState {
        AggregateState::Avg { sum: 0, count: 0 }
    }

    fn lift(&self, state: &mut AggregateState, value: &FieldValue) -> Result<(), EngineError> {
        match state {
            AggregateState::Avg { sum, count } => {
                *sum = sum.wrapping_add(value.as_i64()?);
                *count += 1;
                Ok(())
            }
            other => Err(state_mismatch(self.kind(), other)),
        }
    }

    fn combine(&self, into: &mut AggregateState, other: &AggregateState) -> Result<(), EngineError> {
        match (into, other) {
            (AggregateState::Avg { sum: a, count: ac }, AggregateState::Avg { sum: b, count: bc }) => {
                *a = a.wrapping_add(*b);
                *ac += *bc;
                Ok(())
            }
            (into, other) => Err(state_mismatch(self.kind(), if matches!(into, AggregateState::Avg { .. }) { other } else { into })),
        }
    }

    fn lower(&self, state: &AggregateState) -> Result<FieldValue, EngineError> {
        match state {
            AggregateState::Avg { count: 0, .. } => Ok(FieldValue::Null),
            AggregateState::Avg { sum, count } => Ok(FieldValue::Float64(*sum as f64 / *count as f64)),
            other => Err(state_mismatch(self.kind(), other)),
        }
    }

    fn kind(&self) -> AggregationKind {
        AggregationKind::Avg
    }
}

/// Resolves a plan descriptor's aggregation kind into its implementation.
pub fn aggregation_for(kind: AggregationKind) -> Arc<dyn AggregationFunction> {
    match kind {
        AggregationKind::Sum => Arc::new(SumAggregation),
        AggregationKind::Count => Arc::new(CountAggregation),
        AggregationKind::Min => Arc::new(MinAggregation),
        AggregationKind::Max => Arc::new(MaxAggregation),
        AggregationKind::Avg => Arc::new(AvgAggregation),
    }
}
