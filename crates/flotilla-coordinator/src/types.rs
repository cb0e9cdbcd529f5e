use chrono::{DateTime, Utc};
use flotilla_core::{AgentId, ReservationId, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Well-known CPU dimension (millicores).
pub const CPU: &str = "cpu";
/// Well-known memory dimension (MiB).
pub const MEMORY: &str = "memory";

/// Amounts of compute per resource dimension.
///
/// Dimensions are free-form names so custom units (GPUs, licences, API
/// quota) sit next to CPU and memory. A dimension absent from the vector is
/// zero. The map is ordered so serialized snapshots are byte-stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVector(BTreeMap<String, u64>);

impl ResourceVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a CPU + memory vector.
    pub fn cpu_mem(cpu: u64, memory: u64) -> Self {
        Self::new().with(CPU, cpu).with(MEMORY, memory)
    }

    pub fn with(mut self, dimension: impl Into<String>, amount: u64) -> Self {
        self.set(dimension, amount);
        self
    }

    pub fn set(&mut self, dimension: impl Into<String>, amount: u64) {
        self.0.insert(dimension.into(), amount);
    }

    pub fn get(&self, dimension: &str) -> u64 {
        self.0.get(dimension).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| *v == 0)
    }

    pub fn dimensions(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn add(&mut self, other: &ResourceVector) {
        for (dim, amount) in other.dimensions() {
            let entry = self.0.entry(dim.to_string()).or_insert(0);
            *entry = entry.saturating_add(amount);
        }
    }

    pub fn sub(&mut self, other: &ResourceVector) {
        for (dim, amount) in other.dimensions() {
            if let Some(entry) = self.0.get_mut(dim) {
                *entry = entry.saturating_sub(amount);
            }
        }
    }

    /// Returns the first dimension where `self` exceeds `available`, as
    /// `(dimension, requested, available)`.
    pub fn first_shortfall(&self, available: &ResourceVector) -> Option<(String, u64, u64)> {
        self.dimensions()
            .find(|(dim, amount)| *amount > available.get(dim))
            .map(|(dim, amount)| (dim.to_string(), amount, available.get(dim)))
    }

    pub fn fits_within(&self, available: &ResourceVector) -> bool {
        self.first_shortfall(available).is_none()
    }
}

/// Lifecycle status of a registered agent.
///
/// `Registering → Idle ⇄ Busy → (Unhealthy → Draining → Terminated)`.
/// Scale-down moves `Idle`/`Busy` agents straight to `Draining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Registering,
    Idle,
    Busy,
    Unhealthy,
    Draining,
    Terminated,
}

impl AgentStatus {
    /// Whether new tasks may be placed on an agent in this status.
    pub fn accepts_work(self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Busy)
    }

    /// Whether the agent still counts towards fleet capacity.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            AgentStatus::Registering | AgentStatus::Idle | AgentStatus::Busy
        )
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Registering => write!(f, "registering"),
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Unhealthy => write!(f, "unhealthy"),
            AgentStatus::Draining => write!(f, "draining"),
            AgentStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// What an agent declares when it joins the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub capacity: ResourceVector,
    /// Relative share for weighted strategies.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>, capacity: ResourceVector) -> Self {
        Self {
            name: name.into(),
            capabilities: BTreeSet::new(),
            capacity,
            weight: default_weight(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }
}

/// A registered agent as held in the coordinator's registry.
///
/// Liveness (last heartbeat) is not part of this record. It is tracked
/// out-of-band and never checkpointed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub capacity: ResourceVector,
    pub weight: u32,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    /// Tasks currently bound to this agent (assigned, running or cancelling).
    #[serde(default)]
    pub in_flight: BTreeSet<TaskId>,
    /// Moving average of assignment-to-completion latency.
    #[serde(default)]
    pub avg_latency_ms: Option<f64>,
    #[serde(default)]
    pub completed_tasks: u64,
    #[serde(default)]
    pub failed_tasks: u64,
}

const LATENCY_SMOOTHING: f64 = 0.3;

impl Agent {
    pub fn from_descriptor(descriptor: AgentDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            id: AgentId::new(),
            name: descriptor.name,
            capabilities: descriptor.capabilities,
            capacity: descriptor.capacity,
            weight: descriptor.weight.max(1),
            status: AgentStatus::Registering,
            registered_at: now,
            in_flight: BTreeSet::new(),
            avg_latency_ms: None,
            completed_tasks: 0,
            failed_tasks: 0,
        }
    }

    /// Whether this agent offers every capability in `required`.
    pub fn can_serve(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    pub fn record_latency(&mut self, sample_ms: f64) {
        self.avg_latency_ms = Some(match self.avg_latency_ms {
            Some(avg) => avg * (1.0 - LATENCY_SMOOTHING) + sample_ms * LATENCY_SMOOTHING,
            None => sample_ms,
        });
    }

    /// Flip between `Idle` and `Busy` to reflect the in-flight set.
    pub fn refresh_busy(&mut self) {
        match self.status {
            AgentStatus::Idle if !self.in_flight.is_empty() => self.status = AgentStatus::Busy,
            AgentStatus::Busy if self.in_flight.is_empty() => self.status = AgentStatus::Idle,
            _ => {}
        }
    }
}

/// Status of a task in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on at least one dependency.
    Pending,
    /// All dependencies completed; eligible for dispatch.
    Ready,
    /// Claimed by the assignment path, not yet acknowledged by the agent.
    Assigned,
    Running,
    /// Cancel requested while in flight; waiting for the agent to acknowledge.
    Cancelling,
    Completed,
    Failed { reason: String },
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Cancelled
        )
    }

    /// Bound to an agent and holding a reservation.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TaskStatus::Assigned | TaskStatus::Running | TaskStatus::Cancelling
        )
    }

    /// Counts against the queue's pending-task limit.
    pub fn is_waiting(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Ready)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Cancelling => write!(f, "cancelling"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed { .. } => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A unit of work submitted to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    /// Higher runs first.
    pub priority: i32,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub requirement: ResourceVector,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Opaque input handed to the agent executor.
    #[serde(default)]
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub assigned_agent: Option<AgentId>,
    pub reservation: Option<ReservationId>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Insertion order, used as the FIFO tie-break among equal priorities.
    #[serde(default)]
    pub seq: u64,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            priority: 0,
            required_capabilities: BTreeSet::new(),
            requirement: ResourceVector::new(),
            dependencies: Vec::new(),
            payload: serde_json::Value::Null,
            status: TaskStatus::Pending,
            assigned_agent: None,
            reservation: None,
            created_at: Utc::now(),
            assigned_at: None,
            completed_at: None,
            retry_count: 0,
            last_error: None,
            result: None,
            seq: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn with_requirement(mut self, requirement: ResourceVector) -> Self {
        self.requirement = requirement;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn depends_on(mut self, dep: TaskId) -> Self {
        if !self.dependencies.contains(&dep) {
            self.dependencies.push(dep);
        }
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Whether every dependency satisfies `is_completed`.
    pub fn dependencies_satisfied(&self, is_completed: impl Fn(&TaskId) -> bool) -> bool {
        self.dependencies.iter().all(is_completed)
    }
}

/// What an agent reports back for a dispatched task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success { output: serde_json::Value },
    Failure { error: String },
    /// Acknowledges a cancellation request.
    Cancelled,
}

impl TaskOutcome {
    pub fn success(output: serde_json::Value) -> Self {
        TaskOutcome::Success { output }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        TaskOutcome::Failure {
            error: error.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let task = Task::new("Index repository")
            .with_priority(5)
            .with_capability("rust");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 5);
        assert!(task.required_capabilities.contains("rust"));
        assert!(task.dependencies.is_empty());
    }

    #[test]
    fn test_depends_on_deduplicates() {
        let dep = TaskId::new();
        let task = Task::new("B").depends_on(dep).depends_on(dep);
        assert_eq!(task.dependencies, vec![dep]);
    }

    #[test]
    fn test_dependencies_satisfied() {
        let dep = TaskId::new();
        let task = Task::new("Dependent").with_dependencies(vec![dep]);
        assert!(!task.dependencies_satisfied(|_| false));
        assert!(task.dependencies_satisfied(|id| *id == dep));
    }

    #[test]
    fn test_resource_vector_shortfall() {
        let capacity = ResourceVector::cpu_mem(100, 512);
        let small = ResourceVector::cpu_mem(60, 128);
        let big = ResourceVector::cpu_mem(60, 1024);
        assert!(small.fits_within(&capacity));
        assert_eq!(
            big.first_shortfall(&capacity),
            Some((MEMORY.to_string(), 1024, 512))
        );
    }

    #[test]
    fn test_resource_vector_unknown_dimension_is_zero() {
        let capacity = ResourceVector::cpu_mem(100, 512);
        let gpu = ResourceVector::new().with("gpu", 1);
        assert!(!gpu.fits_within(&capacity));
        assert!(ResourceVector::new().with("gpu", 0).fits_within(&capacity));
    }

    #[test]
    fn test_resource_vector_add_sub() {
        let mut v = ResourceVector::cpu_mem(10, 10);
        v.add(&ResourceVector::cpu_mem(5, 0).with("gpu", 1));
        assert_eq!(v.get(CPU), 15);
        assert_eq!(v.get("gpu"), 1);
        v.sub(&ResourceVector::cpu_mem(20, 5));
        assert_eq!(v.get(CPU), 0);
        assert_eq!(v.get(MEMORY), 5);
    }

    #[test]
    fn test_agent_can_serve() {
        let agent = Agent::from_descriptor(
            AgentDescriptor::new("w1", ResourceVector::cpu_mem(100, 100))
                .with_capabilities(["rust", "review"]),
            Utc::now(),
        );
        let mut required = BTreeSet::new();
        assert!(agent.can_serve(&required));
        required.insert("rust".to_string());
        assert!(agent.can_serve(&required));
        required.insert("python".to_string());
        assert!(!agent.can_serve(&required));
    }

    #[test]
    fn test_agent_latency_average() {
        let mut agent = Agent::from_descriptor(
            AgentDescriptor::new("w1", ResourceVector::cpu_mem(1, 1)),
            Utc::now(),
        );
        agent.record_latency(100.0);
        assert_eq!(agent.avg_latency_ms, Some(100.0));
        agent.record_latency(200.0);
        let avg = agent.avg_latency_ms.unwrap();
        assert!(avg > 100.0 && avg < 200.0);
    }

    #[test]
    fn test_agent_refresh_busy() {
        let mut agent = Agent::from_descriptor(
            AgentDescriptor::new("w1", ResourceVector::cpu_mem(1, 1)),
            Utc::now(),
        );
        agent.status = AgentStatus::Idle;
        agent.in_flight.insert(TaskId::new());
        agent.refresh_busy();
        assert_eq!(agent.status, AgentStatus::Busy);
        agent.in_flight.clear();
        agent.refresh_busy();
        assert_eq!(agent.status, AgentStatus::Idle);

        agent.status = AgentStatus::Draining;
        agent.refresh_busy();
        assert_eq!(agent.status, AgentStatus::Draining);
    }

    #[test]
    fn test_task_status_serialization() {
        let status = TaskStatus::Failed {
            reason: "timeout".to_string(),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("timeout"));
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
    }

    #[test]
    fn test_task_outcome_tagged() {
        let json = serde_json::to_value(TaskOutcome::failure("boom")).unwrap();
        assert_eq!(json["outcome"], "failure");
        assert_eq!(json["error"], "boom");
    }

    #[test]
    fn test_agent_status_display() {
        assert_eq!(AgentStatus::Draining.to_string(), "draining");
        assert!(AgentStatus::Busy.accepts_work());
        assert!(!AgentStatus::Draining.accepts_work());
        assert!(!AgentStatus::Unhealthy.is_active());
    }
}
