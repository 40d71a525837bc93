// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Engine Error Types
//!
//! This module provides the unified error type for the stream engine. Every
//! fallible operation in the domain and engine layers reports failures through
//! `EngineError`, which keeps error handling uniform from buffer allocation up
//! to query lifecycle management.
//!
//! ## Overview
//!
//! The error system provides:
//!
//! - **Specific variants**: Each variant names one failure mode of the engine
//! - **Actionable messages**: Every variant carries a human-readable context
//!   string assembled at the failure site
//! - **Recoverability classification**: `is_recoverable()` distinguishes
//!   conditions worth retrying (pool pressure, network unavailability) from
//!   terminal ones (invalid plans, watermark regressions)
//! - **Query-fatal classification**: `is_query_fatal()` marks errors that must
//!   terminate the owning query with a failure end-of-stream
//!
//! ## Error Handling Strategy
//!
//! Errors are propagated with `?` through the domain and infrastructure
//! layers. Workers catch stage execution errors at the dispatch boundary and
//! convert them into failure end-of-stream events for the affected query;
//! other queries keep running. No error is silently swallowed: terminal errors
//! are recorded on the query status listener.

use thiserror::Error;

/// Unified error type for the stream engine.
///
/// Each variant represents a specific failure mode. Variants carry a message
/// assembled at the failure site; there is no error code indirection.
///
/// ## Classification
///
/// - Recoverable: `BufferPoolExhausted` (before the retry deadline),
///   `NetworkPartitionUnavailable`, `Timeout`
/// - Query-fatal: `StageExecutionError`, `SourceOpenFailure`,
///   `WatermarkRegression`, and `NetworkPartitionUnavailable` once retries are
///   exhausted
/// - Rejected at the API boundary, harmless to the process: `InvalidPlan`,
///   `InvalidLifecycle`
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Buffer pool exhausted: {0}")]
    BufferPoolExhausted(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Stage execution error: {0}")]
    StageExecutionError(String),

    #[error("Source open failure: {0}")]
    SourceOpenFailure(String),

    #[error("Network partition unavailable: {0}")]
    NetworkPartitionUnavailable(String),

    #[error("Watermark regression: {0}")]
    WatermarkRegression(String),

    #[error("Invalid lifecycle transition: {0}")]
    InvalidLifecycle(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Buffer access error: {0}")]
    BufferAccess(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Query not found: {0}")]
    QueryNotFound(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl EngineError {
    /// Creates a new buffer-pool exhaustion error
    pub fn buffer_exhausted(msg: impl Into<String>) -> Self {
        Self::BufferPoolExhausted(msg.into())
    }

    /// Creates a new invalid-plan error
    pub fn invalid_plan(msg: impl Into<String>) -> Self {
        Self::InvalidPlan(msg.into())
    }

    /// Creates a new stage execution error
    pub fn stage_execution(msg: impl Into<String>) -> Self {
        Self::StageExecutionError(msg.into())
    }

    /// Creates a new source open failure
    pub fn source_open(msg: impl Into<String>) -> Self {
        Self::SourceOpenFailure(msg.into())
    }

    /// Creates a new partition-unavailable error
    pub fn partition_unavailable(msg: impl Into<String>) -> Self {
        Self::NetworkPartitionUnavailable(msg.into())
    }

    /// Creates a new watermark regression error
    pub fn watermark_regression(msg: impl Into<String>) -> Self {
        Self::WatermarkRegression(msg.into())
    }

    /// Creates a new lifecycle violation error
    pub fn invalid_lifecycle(msg: impl Into<String>) -> Self {
        Self::InvalidLifecycle(msg.into())
    }

    /// Creates a new configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Creates a new unsupported-operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Creates a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }

    /// Checks if the error is recoverable by retrying
    ///
    /// Recoverable errors indicate transient pressure: the caller may retry,
    /// back off, or block. Everything else is terminal for its scope.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::BufferPoolExhausted(_)
                | EngineError::NetworkPartitionUnavailable(_)
                | EngineError::Timeout(_)
                | EngineError::IoError(_)
        )
    }

    /// Checks if the error must terminate the owning query
    ///
    /// Query-fatal errors trigger a failure end-of-stream for the query that
    /// produced them; queries sharing the engine are unaffected.
    pub fn is_query_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::StageExecutionError(_)
                | EngineError::SourceOpenFailure(_)
                | EngineError::WatermarkRegression(_)
        )
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::SerializationError(err.to_string())
    }
}
