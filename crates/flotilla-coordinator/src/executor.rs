use crate::types::{AgentDescriptor, Task};
use async_trait::async_trait;
use flotilla_core::{AgentId, FlotillaResult, TaskId};

/// Hands tasks to running agents.
///
/// `dispatch` only delivers the task; results come back later through
/// `MultiAgentCoordinator::report_completion`. An error means the agent never
/// received the task.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn dispatch(&self, agent: AgentId, task: &Task) -> FlotillaResult<()>;

    /// Ask an agent to stop working on a task. Best effort; the agent
    /// confirms by reporting `TaskOutcome::Cancelled`.
    async fn cancel(&self, _agent: AgentId, _task: TaskId) -> FlotillaResult<()> {
        Ok(())
    }
}

/// Starts and stops agent processes on behalf of the scaling loop.
#[async_trait]
pub trait AgentProvisioner: Send + Sync {
    /// Launch up to `count` agents and describe them for registration.
    async fn provision(&self, count: usize) -> FlotillaResult<Vec<AgentDescriptor>>;

    /// Tear down an agent that has been drained and removed.
    async fn decommission(&self, agent: AgentId) -> FlotillaResult<()>;
}
