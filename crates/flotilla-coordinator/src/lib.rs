//! Multi-agent coordination and scheduling engine.
//!
//! Accepts tasks with priorities, resource requirements and dependencies,
//! and places them on a pool of heterogeneous agents. Assignment respects
//! per-agent resource budgets, skips agents whose circuit breaker is open or
//! whose heartbeat has lapsed, and picks among the rest with a pluggable
//! load-balancing strategy. Coordinator state can be checkpointed into an
//! integrity-checked blob and restored from it.
//!
//! # Main types
//!
//! - [`MultiAgentCoordinator`]: Owns the registry, queue, ledger and breakers.
//! - [`TaskQueue`]: Dependency-aware priority queue.
//! - [`ResourceManager`]: Per-agent reservation ledger.
//! - [`CircuitBreaker`]: Per-agent failure isolation.
//! - [`ScalingManager`]: Turns utilization samples into scale intents.
//! - [`CheckpointBlob`]: Sealed snapshot envelope.

/// Load-balancing strategies and their registry.
pub mod balancer;
/// Background assignment, health, scaling, checkpoint and metrics loops.
pub mod background;
/// Checkpoint envelopes and stores.
pub mod checkpoint;
/// Per-agent circuit breaker.
pub mod circuit_breaker;
/// Injectable time source.
pub mod clock;
/// TOML configuration.
pub mod config;
/// The coordinator itself.
pub mod coordinator;
/// Seams to the processes that run tasks and host agents.
pub mod executor;
/// Metrics sinks and lifecycle events.
pub mod monitor;
/// Resource reservation ledger.
pub mod resources;
/// Autoscaling decisions.
pub mod scaling;
/// Priority task queue with dependency resolution.
pub mod task_queue;
/// Shared types (agents, tasks, resource vectors).
pub mod types;

pub use background::BackgroundHandle;
pub use balancer::{Candidate, LoadBalancingStrategy, StrategyRegistry};
pub use checkpoint::{
    CheckpointBlob, CheckpointHandle, CheckpointMetadata, CheckpointStore, CheckpointTrigger,
    CoordinatorSnapshot, FileCheckpointStore, MemoryCheckpointStore,
};
pub use circuit_breaker::{BreakerState, BreakerTransition, CircuitBreaker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CoordinatorConfig;
pub use coordinator::{
    AgentInfo, Assignment, AssignmentOutcome, CoordinatorBuilder, CoordinatorStats, HealthReport,
    MultiAgentCoordinator, ScalingOutcome, TaskDisposition,
};
pub use executor::{AgentExecutor, AgentProvisioner};
pub use flotilla_core::{AgentId, FlotillaError, FlotillaResult, ReservationId, TaskId};
pub use monitor::{CoordinatorEvent, MetricsEvent, MetricsSink, RecordingMetricsSink, TracingMetricsSink};
pub use resources::{Reservation, ResourceManager};
pub use scaling::{ScalingDecision, ScalingManager, ScalingMetrics};
pub use task_queue::{CancelOutcome, FailOutcome, QueueStats, TaskQueue};
pub use types::{Agent, AgentDescriptor, AgentStatus, ResourceVector, Task, TaskOutcome, TaskStatus};
