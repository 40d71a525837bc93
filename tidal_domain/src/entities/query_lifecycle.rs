// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Query Lifecycle
//!
//! Lifecycle types shared by the query manager and the executable plans:
//! the execution status state machine, the termination kinds, and the
//! terminal result of a plan. The state machine is deliberately small and
//! its legal transitions are encoded in one place so that every component
//! (manager, plan, status listener) agrees on what may follow what.
//!
//! ## State machine
//!
//! ```text
//! Registered ──start──▶ Running ──graceful/hard stop──▶ Stopped
//!     │                    │
//!     │                    └──failure──▶ Failed
//!     └──(invalid ops rejected with InvalidLifecycle)
//! ```
//!
//! `Stopped` and `Failed` are terminal; only terminal queries may be
//! unregistered. A `Failed` query can never be started again.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::EngineError;

/// Status of a deployed query on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Registered,
    Running,
    Stopped,
    Failed,
}

impl ExecutionStatus {
    /// Whether the query has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Stopped | ExecutionStatus::Failed)
    }

    /// Validates a transition, returning the new status.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidLifecycle` for transitions the state
    /// machine does not allow. Re-entering the current terminal state is
    /// permitted so that double-stop stays a no-op.
    pub fn transition_to(self, next: ExecutionStatus) -> Result<ExecutionStatus, EngineError> {
        use ExecutionStatus::*;
        let legal = matches!(
            (self, next),
            (Registered, Running)
                | (Registered, Stopped)
                | (Registered, Failed)
                | (Running, Stopped)
                | (Running, Failed)
                | (Stopped, Stopped)
                | (Failed, Failed)
        );
        if legal {
            Ok(next)
        } else {
            Err(EngineError::invalid_lifecycle(format!(
                "illegal query status transition {self} -> {next}"
            )))
        }
    }
}

impl Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionStatus::Registered => "Registered",
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Stopped => "Stopped",
            ExecutionStatus::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// How a query (or a single source) is asked to terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationKind {
    /// Drain: all in-flight data is processed before stages stop.
    Graceful,
    /// Short-circuit: in-flight data may be dropped, stages stop immediately.
    Hard,
    /// Like hard, but records an error and forbids restarting the query.
    Failure,
}

impl TerminationKind {
    /// The status a query ends in when terminated with this kind.
    pub fn terminal_status(&self) -> ExecutionStatus {
        match self {
            TerminationKind::Graceful | TerminationKind::Hard => ExecutionStatus::Stopped,
            TerminationKind::Failure => ExecutionStatus::Failed,
        }
    }
}

impl Display for TerminationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TerminationKind::Graceful => "graceful",
            TerminationKind::Hard => "hard",
            TerminationKind::Failure => "failure",
        };
        f.write_str(name)
    }
}

/// Terminal outcome carried by a plan's termination future.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    Completed(TerminationKind),
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use ExecutionStatus::*;
        assert_eq!(Registered.transition_to(Running).unwrap(), Running);
        assert_eq!(Running.transition_to(Stopped).unwrap(), Stopped);
        assert_eq!(Running.transition_to(Failed).unwrap(), Failed);
        // Stopping a never-started query is legal.
        assert_eq!(Registered.transition_to(Stopped).unwrap(), Stopped);
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        use ExecutionStatus::*;
        // Double-stop is a no-op.
        assert!(Stopped.transition_to(Stopped).is_ok());
        // A failed query never runs again.
        assert!(Failed.transition_to(Running).is_err());
        assert!(Stopped.transition_to(Running).is_err());
    }

    #[test]
    fn test_termination_kind_maps_to_status() {
        assert_eq!(TerminationKind::Graceful.terminal_status(), ExecutionStatus::Stopped);
        assert_eq!(TerminationKind::Hard.terminal_status(), ExecutionStatus::Stopped);
        assert_eq!(TerminationKind::Failure.terminal_status(), ExecutionStatus::Failed);
    }
}
