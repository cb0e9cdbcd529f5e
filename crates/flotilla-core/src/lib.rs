//! Core types and error definitions for the Flotilla control plane.
//!
//! This crate provides the foundational types shared across all Flotilla
//! crates: the unified error taxonomy and the strongly typed identifiers used
//! for agents, tasks and resource reservations.
//!
//! # Main types
//!
//! - [`FlotillaError`]: Unified error enum for all Flotilla subsystems.
//! - [`FlotillaResult`]: Convenience alias for `Result<T, FlotillaError>`.
//! - [`AgentId`]: Identity of a registered worker agent.
//! - [`TaskId`]: Identity of a submitted task.
//! - [`ReservationId`]: Identity of a resource reservation held for a task.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Identifiers ---

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Unique identifier of a worker agent.
    AgentId
);
define_id!(
    /// Unique identifier of a task.
    TaskId
);
define_id!(
    /// Unique identifier of a resource reservation.
    ReservationId
);

// --- Error types ---

/// Top-level error type for the Flotilla control plane.
///
/// The first group of variants is the caller-facing taxonomy; the rest are
/// operational errors raised by lookups, collaborators and I/O.
#[derive(Debug, thiserror::Error)]
pub enum FlotillaError {
    /// A task referenced a dependency that is unknown or can never complete.
    #[error("Invalid dependency: task {task} depends on {dependency} ({reason})")]
    InvalidDependency {
        /// The task being enqueued.
        task: TaskId,
        /// The offending dependency.
        dependency: TaskId,
        /// Why the dependency was rejected.
        reason: String,
    },

    /// The dependency graph of an enqueue would contain a cycle.
    #[error("Dependency cycle detected through task {task}")]
    DependencyCycle {
        /// A task that participates in the cycle.
        task: TaskId,
    },

    /// The queue reached its pending-task limit. Retry with backoff.
    #[error("Queue full: {pending} pending tasks (max {max})")]
    QueueFull {
        /// Current number of pending tasks.
        pending: usize,
        /// Configured maximum.
        max: usize,
    },

    /// An agent does not have enough free capacity for a requirement.
    #[error(
        "Insufficient resources on agent {agent}: {dimension} requested {requested}, available {available}"
    )]
    InsufficientResources {
        /// The agent that was asked to reserve.
        agent: AgentId,
        /// The first resource dimension that did not fit.
        dimension: String,
        /// Amount requested in that dimension.
        requested: u64,
        /// Amount still free in that dimension.
        available: u64,
    },

    /// No eligible agent could take the task; the task stays queued.
    #[error("No capacity available for task {task}")]
    NoCapacity {
        /// The task that could not be placed.
        task: TaskId,
    },

    /// An agent stopped responding or tripped its circuit breaker.
    #[error("Agent {0} is unhealthy")]
    AgentUnhealthy(AgentId),

    /// A checkpoint failed validation; the live state was not touched.
    #[error("Checkpoint integrity violation: {0}")]
    IntegrityViolation(String),

    /// A task failed terminally after exhausting its retries.
    #[error("Task {task} failed after {retries} retries: {reason}")]
    RetriesExhausted {
        /// The failed task.
        task: TaskId,
        /// Number of attempts consumed.
        retries: u32,
        /// The last failure reason.
        reason: String,
    },

    /// No agent with the given ID is registered.
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    /// No task with the given ID is known to the queue.
    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    /// A task with the same ID is already queued.
    #[error("Duplicate task: {0}")]
    DuplicateTask(TaskId),

    /// A lifecycle operation is not valid for the task's current status.
    #[error("Invalid transition for task {task}: cannot {action} while {status}")]
    InvalidTransition {
        /// The task being transitioned.
        task: TaskId,
        /// The attempted operation.
        action: String,
        /// The task's current status.
        status: String,
    },

    /// The task already holds an active reservation.
    #[error("Task {0} already holds a reservation")]
    AlreadyReserved(TaskId),

    /// No load-balancing strategy is registered under the given name.
    #[error("Unknown load-balancing strategy: {0}")]
    UnknownStrategy(String),

    /// The agent executor refused or failed a dispatch.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// The checkpoint store failed.
    #[error("Checkpoint store error: {0}")]
    Store(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlotillaError {
    /// Whether the caller can recover by retrying later.
    ///
    /// Backpressure and capacity errors are transient: the work was not lost
    /// and may succeed once load drops or capacity is added.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FlotillaError::QueueFull { .. }
                | FlotillaError::InsufficientResources { .. }
                | FlotillaError::NoCapacity { .. }
                | FlotillaError::Dispatch(_)
        )
    }
}

/// A convenience `Result` alias using [`FlotillaError`].
pub type FlotillaResult<T> = Result<T, FlotillaError>;
