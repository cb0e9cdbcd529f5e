use crate::balancer::{Candidate, LoadBalancingStrategy, StrategyRegistry};
use crate::checkpoint::{
    CheckpointBlob, CheckpointHandle, CheckpointMetadata, CheckpointStore, CheckpointTrigger,
    CoordinatorSnapshot, MemoryCheckpointStore, SNAPSHOT_FORMAT,
};
use crate::circuit_breaker::{BreakerState, BreakerTransition, CircuitBreaker};
use crate::clock::{Clock, SystemClock};
use crate::config::CoordinatorConfig;
use crate::executor::{AgentExecutor, AgentProvisioner};
use crate::monitor::{queue_depth, CoordinatorEvent, MetricsEvent, MetricsSink, TracingMetricsSink};
use crate::resources::ResourceManager;
use crate::scaling::{ScalingDecision, ScalingManager, ScalingMetrics};
use crate::task_queue::{CancelOutcome, FailOutcome, QueueStats, TaskQueue};
use crate::types::{Agent, AgentDescriptor, AgentStatus, Task, TaskOutcome, TaskStatus};
use chrono::{DateTime, Duration, Utc};
use flotilla_core::{AgentId, FlotillaError, FlotillaResult, ReservationId, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// A task placed on an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub reservation_id: ReservationId,
    pub assigned_at: DateTime<Utc>,
}

/// Result of one [`MultiAgentCoordinator::assign_next`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignmentOutcome {
    Assigned(Assignment),
    /// No task is ready.
    NoWork,
    /// Ready work exists but no eligible agent can take it now. The task, if
    /// named, stays queued.
    NoCapacity { task: Option<TaskId> },
}

impl AssignmentOutcome {
    /// `NoCapacity` as an error, `NoWork` as `None`.
    pub fn into_result(self) -> FlotillaResult<Option<Assignment>> {
        match self {
            AssignmentOutcome::Assigned(a) => Ok(Some(a)),
            AssignmentOutcome::NoWork | AssignmentOutcome::NoCapacity { task: None } => Ok(None),
            AssignmentOutcome::NoCapacity { task: Some(task) } => {
                Err(FlotillaError::NoCapacity { task })
            }
        }
    }
}

/// What happened to a task after its agent reported back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskDisposition {
    Completed { newly_ready: Vec<TaskId> },
    /// Back in the queue for another attempt.
    Retrying { retry_count: u32 },
    /// Terminal failure; `cascaded` dependents failed with it.
    Failed {
        reason: String,
        retries: u32,
        cascaded: Vec<TaskId>,
    },
    Cancelled { cascaded: Vec<TaskId> },
}

/// Outcome of a health sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Agents whose heartbeat expired in this sweep.
    pub unhealthy: Vec<AgentId>,
    /// Agents removed from the registry.
    pub terminated: Vec<AgentId>,
    /// Tasks returned to the queue for another attempt.
    pub requeued: Vec<TaskId>,
    /// Tasks that failed terminally, including cascaded dependents.
    pub failed: Vec<TaskId>,
}

/// A scaling decision and what was done about it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingOutcome {
    pub decision: ScalingDecision,
    pub added: Vec<AgentId>,
    pub draining: Vec<AgentId>,
    pub terminated: Vec<AgentId>,
}

/// Read-only view of one agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentInfo {
    pub agent: Agent,
    pub utilization: f64,
    pub breaker: BreakerState,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Fleet and queue summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorStats {
    pub agents: usize,
    pub agents_by_status: BTreeMap<String, usize>,
    pub queue: QueueStats,
    pub reservations: usize,
    pub system_utilization: f64,
    pub open_breakers: usize,
    pub last_checkpoint_version: u64,
}

#[derive(Debug, Clone, Copy)]
struct Liveness {
    last_seen: Option<DateTime<Utc>>,
    /// When tracking started; the timeout runs from here until a heartbeat arrives.
    since: DateTime<Utc>,
}

impl Liveness {
    fn is_live(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.last_seen.is_some_and(|seen| now - seen <= timeout)
    }

    fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_seen.unwrap_or(self.since) > timeout
    }
}

/// Everything guarded by the coordinator's state lock.
pub(crate) struct CoordinatorState {
    pub(crate) agents: BTreeMap<AgentId, Agent>,
    pub(crate) queue: TaskQueue,
    pub(crate) resources: ResourceManager,
    pub(crate) breakers: BTreeMap<AgentId, CircuitBreaker>,
}

impl CoordinatorState {
    fn new(config: &CoordinatorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            agents: BTreeMap::new(),
            queue: TaskQueue::new(&config.queue).with_clock(clock),
            resources: ResourceManager::new(),
            breakers: BTreeMap::new(),
        }
    }

    fn snapshot(
        &self,
        version: u64,
        created_at: DateTime<Utc>,
        trigger: CheckpointTrigger,
    ) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            format: SNAPSHOT_FORMAT.to_string(),
            version,
            created_at,
            trigger,
            agents: self.agents.values().cloned().collect(),
            tasks: self.queue.snapshot(),
            reservations: self.resources.snapshot(),
            breakers: self.breakers.clone(),
        }
    }

    /// Build a state from a verified snapshot without touching live state.
    fn from_snapshot(
        snapshot: CoordinatorSnapshot,
        config: &CoordinatorConfig,
        clock: Arc<dyn Clock>,
    ) -> FlotillaResult<Self> {
        let violation = |msg: String| FlotillaError::IntegrityViolation(msg);

        let mut agents = BTreeMap::new();
        for agent in snapshot.agents {
            let id = agent.id;
            if agents.insert(id, agent).is_some() {
                return Err(violation(format!("agent {id} appears twice")));
            }
        }

        let queue = TaskQueue::from_snapshot(snapshot.tasks, &config.queue, clock)?;
        let resources = ResourceManager::from_parts(
            agents
                .values()
                .map(|a| (a.id, a.capacity.clone(), a.status == AgentStatus::Terminated)),
            snapshot.reservations,
        )?;

        for reservation in resources.snapshot() {
            if queue.get(reservation.task_id).is_none() {
                return Err(violation(format!(
                    "reservation {} held for unknown task {}",
                    reservation.id, reservation.task_id
                )));
            }
        }

        for id in snapshot.breakers.keys() {
            if !agents.contains_key(id) {
                return Err(violation(format!("breaker for unknown agent {id}")));
            }
        }

        for agent in agents.values() {
            if !snapshot.breakers.contains_key(&agent.id) {
                return Err(violation(format!("agent {} has no breaker state", agent.id)));
            }
            for task_id in &agent.in_flight {
                let Some(task) = queue.get(*task_id) else {
                    return Err(violation(format!(
                        "agent {} holds unknown task {task_id}",
                        agent.id
                    )));
                };
                if !task.status.is_in_flight() || task.assigned_agent != Some(agent.id) {
                    return Err(violation(format!(
                        "agent {} lists task {task_id} which is {} elsewhere",
                        agent.id, task.status
                    )));
                }
            }
        }

        for task in queue.all_tasks() {
            if !task.status.is_in_flight() {
                if resources.reservation_for_task(task.id).is_some() {
                    return Err(violation(format!(
                        "{} task {} still holds a reservation",
                        task.status, task.id
                    )));
                }
                continue;
            }
            let Some(agent_id) = task.assigned_agent else {
                return Err(violation(format!("in-flight task {} has no agent", task.id)));
            };
            let listed = agents
                .get(&agent_id)
                .is_some_and(|a| a.in_flight.contains(&task.id));
            if !listed {
                return Err(violation(format!(
                    "task {} is not listed by its agent {agent_id}",
                    task.id
                )));
            }
            match resources.reservation_for_task(task.id) {
                Some(r) if r.agent_id == agent_id && task.reservation == Some(r.id) => {}
                _ => {
                    return Err(violation(format!(
                        "reservation of task {} disagrees with its assignment",
                        task.id
                    )))
                }
            }
        }

        Ok(Self {
            agents,
            queue,
            resources,
            breakers: snapshot.breakers,
        })
    }
}

/// Builder for [`MultiAgentCoordinator`].
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    executor: Arc<dyn AgentExecutor>,
    provisioner: Option<Arc<dyn AgentProvisioner>>,
    store: Option<Arc<dyn CheckpointStore>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    clock: Option<Arc<dyn Clock>>,
    strategies: Option<StrategyRegistry>,
}

impl CoordinatorBuilder {
    pub fn with_provisioner(mut self, provisioner: Arc<dyn AgentProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use a custom strategy registry instead of the built-in one.
    pub fn with_strategies(mut self, registry: StrategyRegistry) -> Self {
        self.strategies = Some(registry);
        self
    }

    pub fn build(self) -> FlotillaResult<MultiAgentCoordinator> {
        self.config.validate()?;
        let strategy = self
            .strategies
            .unwrap_or_default()
            .get(&self.config.strategy)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        info!(strategy = strategy.name(), "Coordinator configured");
        Ok(MultiAgentCoordinator {
            state: Mutex::new(CoordinatorState::new(&self.config, Arc::clone(&clock))),
            heartbeats: parking_lot::RwLock::new(HashMap::new()),
            scaling: Mutex::new(ScalingManager::new(self.config.scaling.clone())),
            strategy,
            executor: self.executor,
            provisioner: self.provisioner,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new())),
            metrics: self.metrics.unwrap_or_else(|| Arc::new(TracingMetricsSink)),
            clock,
            events,
            last_checkpoint: Mutex::new(0),
            pending_checkpoint: parking_lot::Mutex::new(None),
            checkpoint_requested: Notify::new(),
            work_available: Notify::new(),
            completions_since_checkpoint: AtomicU64::new(0),
            config: self.config,
        })
    }
}

/// The coordination and scheduling engine.
///
/// Owns the agent registry, task queue, resource ledger and per-agent
/// circuit breakers behind one async lock, so every assignment decision sees
/// a consistent view. Heartbeats live behind a separate lock and never wait
/// on an assignment in progress. Calls to the executor, provisioner and
/// checkpoint store are made with the state lock released.
pub struct MultiAgentCoordinator {
    config: CoordinatorConfig,
    state: Mutex<CoordinatorState>,
    heartbeats: parking_lot::RwLock<HashMap<AgentId, Liveness>>,
    scaling: Mutex<ScalingManager>,
    strategy: Arc<dyn LoadBalancingStrategy>,
    executor: Arc<dyn AgentExecutor>,
    provisioner: Option<Arc<dyn AgentProvisioner>>,
    store: Arc<dyn CheckpointStore>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<CoordinatorEvent>,
    /// Serializes checkpoint writes and restores; holds the last version.
    last_checkpoint: Mutex<u64>,
    pending_checkpoint: parking_lot::Mutex<Option<CheckpointTrigger>>,
    pub(crate) checkpoint_requested: Notify,
    pub(crate) work_available: Notify,
    completions_since_checkpoint: AtomicU64,
}

impl MultiAgentCoordinator {
    pub fn builder(
        config: CoordinatorConfig,
        executor: Arc<dyn AgentExecutor>,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            executor,
            provisioner: None,
            store: None,
            metrics: None,
            clock: None,
            strategies: None,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    fn heartbeat_timeout(&self) -> Duration {
        Duration::seconds(self.config.health.heartbeat_timeout_secs as i64)
    }

    fn publish(&self, event: CoordinatorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_breaker(&self, agent_id: AgentId, transition: BreakerTransition) {
        self.metrics.record(MetricsEvent::BreakerTransition {
            agent_id,
            transition,
        });
        self.publish(CoordinatorEvent::BreakerTransition {
            agent_id,
            transition,
        });
    }

    fn set_status(&self, agent: &mut Agent, to: AgentStatus) {
        if agent.status == to {
            return;
        }
        let from = agent.status;
        agent.status = to;
        debug!(agent_id = %agent.id, %from, %to, "Agent status changed");
        self.publish(CoordinatorEvent::AgentStatusChanged {
            agent_id: agent.id,
            from,
            to,
        });
    }

    // --- Registry & liveness ---

    /// Add an agent to the pool. Registration counts as its first heartbeat.
    pub async fn register_agent(&self, descriptor: AgentDescriptor) -> FlotillaResult<AgentId> {
        if descriptor.name.trim().is_empty() {
            return Err(FlotillaError::Config("agent name must not be empty".into()));
        }
        let now = self.clock.now();
        let mut agent = Agent::from_descriptor(descriptor, now);
        let id = agent.id;
        let name = agent.name.clone();
        {
            let mut state = self.state.lock().await;
            state.resources.register_agent(id, agent.capacity.clone());
            state
                .breakers
                .insert(id, CircuitBreaker::new(&self.config.breaker, now));
            self.heartbeats.write().insert(
                id,
                Liveness {
                    last_seen: Some(now),
                    since: now,
                },
            );
            self.set_status(&mut agent, AgentStatus::Idle);
            state.agents.insert(id, agent);
        }
        info!(agent_id = %id, name = %name, "Agent registered");
        self.publish(CoordinatorEvent::AgentRegistered { agent_id: id, name });
        self.work_available.notify_one();
        Ok(id)
    }

    /// Record that an agent is alive.
    pub fn heartbeat(&self, agent: AgentId) -> FlotillaResult<()> {
        let now = self.clock.now();
        let mut heartbeats = self.heartbeats.write();
        let entry = heartbeats
            .get_mut(&agent)
            .ok_or(FlotillaError::UnknownAgent(agent))?;
        let was_live = entry.is_live(now, self.heartbeat_timeout());
        entry.last_seen = Some(now);
        drop(heartbeats);
        if !was_live {
            self.work_available.notify_one();
        }
        Ok(())
    }

    pub fn last_heartbeat(&self, agent: AgentId) -> Option<DateTime<Utc>> {
        self.heartbeats.read().get(&agent).and_then(|l| l.last_seen)
    }

    // --- Submission ---

    pub async fn submit(&self, task: Task) -> FlotillaResult<TaskId> {
        let ids = self.submit_all(vec![task]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| FlotillaError::Config("empty submission".into()))
    }

    /// Submit several tasks atomically; they may depend on each other.
    pub async fn submit_all(&self, tasks: Vec<Task>) -> FlotillaResult<Vec<TaskId>> {
        let ids = self.state.lock().await.queue.enqueue_batch(tasks)?;
        for id in &ids {
            self.publish(CoordinatorEvent::TaskSubmitted { task_id: *id });
        }
        self.work_available.notify_one();
        Ok(ids)
    }

    // --- Assignment ---

    /// Place the best ready task on an eligible agent and dispatch it.
    ///
    /// Never blocks waiting for capacity: if no agent qualifies the task stays
    /// queued and `NoCapacity` is returned.
    ///
    /// Ready tasks that fit no eligible agent right now are skipped in favour
    /// of lower-priority tasks that do fit. There is no aging, so a large task
    /// can wait for as long as smaller ones keep its agents partly reserved.
    /// `NoCapacity` names the highest-priority ready task whenever nothing is
    /// placed.
    pub async fn assign_next(&self) -> FlotillaResult<AssignmentOutcome> {
        let now = self.clock.now();
        let timeout = self.heartbeat_timeout();

        let (assignment, task) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            for (id, breaker) in &mut state.breakers {
                if let Some(t) = breaker.poll(now) {
                    self.publish_breaker(*id, t);
                }
            }

            if state.queue.ready_count() == 0 {
                return Ok(AssignmentOutcome::NoWork);
            }
            let blocked = state.queue.peek_ready().map(|t| t.id);

            let eligible: Vec<AgentId> = {
                let heartbeats = self.heartbeats.read();
                let ids = state
                    .agents
                    .values()
                    .filter(|a| a.status.accepts_work())
                    .filter(|a| heartbeats.get(&a.id).is_some_and(|l| l.is_live(now, timeout)))
                    .filter(|a| state.breakers.get(&a.id).is_some_and(|b| b.can_attempt(now)))
                    .map(|a| a.id)
                    .collect();
                ids
            };
            if eligible.is_empty() {
                return Ok(AssignmentOutcome::NoCapacity { task: blocked });
            }

            let agents = &state.agents;
            let resources = &state.resources;
            let can_take = |agent_id: &AgentId, task: &Task| {
                agents
                    .get(agent_id)
                    .is_some_and(|a| a.can_serve(&task.required_capabilities))
                    && resources.fits(*agent_id, &task.requirement)
            };
            let Some(task) = state
                .queue
                .dequeue(|t| eligible.iter().any(|id| can_take(id, t)))
            else {
                return Ok(AssignmentOutcome::NoCapacity { task: blocked });
            };

            let mut candidates: Vec<Candidate> = eligible
                .iter()
                .filter(|id| can_take(*id, &task))
                .filter_map(|id| agents.get(id))
                .map(|a| Candidate {
                    agent_id: a.id,
                    name: a.name.clone(),
                    capabilities: a.capabilities.clone(),
                    utilization: resources.utilization(a.id),
                    in_flight: a.in_flight.len(),
                    weight: a.weight,
                    avg_latency_ms: a.avg_latency_ms,
                })
                .collect();

            let placed = loop {
                if candidates.is_empty() {
                    break None;
                }
                let choice = self
                    .strategy
                    .select(&candidates, &task)
                    .filter(|id| candidates.iter().any(|c| c.agent_id == *id));
                let Some(agent_id) = choice else {
                    break None;
                };
                candidates.retain(|c| c.agent_id != agent_id);

                let permitted = state
                    .breakers
                    .get_mut(&agent_id)
                    .is_some_and(|b| b.try_acquire(now));
                if !permitted {
                    continue;
                }
                match state
                    .resources
                    .try_reserve(agent_id, task.id, &task.requirement, now)
                {
                    Ok(reservation) => break Some((agent_id, reservation)),
                    Err(e) => {
                        debug!(agent_id = %agent_id, task_id = %task.id, error = %e, "Reservation refused");
                        if let Some(b) = state.breakers.get_mut(&agent_id) {
                            b.release_trial();
                        }
                    }
                }
            };

            let Some((agent_id, reservation_id)) = placed else {
                state.queue.requeue(task.id)?;
                return Ok(AssignmentOutcome::NoCapacity {
                    task: Some(task.id),
                });
            };

            state.queue.bind(task.id, agent_id, reservation_id, now)?;
            if let Some(agent) = state.agents.get_mut(&agent_id) {
                agent.in_flight.insert(task.id);
                agent.refresh_busy();
            }
            let assignment = Assignment {
                task_id: task.id,
                agent_id,
                reservation_id,
                assigned_at: now,
            };
            (assignment, task)
        };

        info!(task_id = %assignment.task_id, agent_id = %assignment.agent_id, task = %task.name, "Task assigned");
        self.publish(CoordinatorEvent::TaskAssigned {
            task_id: assignment.task_id,
            agent_id: assignment.agent_id,
        });

        match self.executor.dispatch(assignment.agent_id, &task).await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                let still_ours = state
                    .queue
                    .get(assignment.task_id)
                    .is_some_and(|t| t.assigned_agent == Some(assignment.agent_id));
                if still_ours {
                    state.queue.mark_running(assignment.task_id)?;
                }
                Ok(AssignmentOutcome::Assigned(assignment))
            }
            Err(e) => {
                warn!(task_id = %assignment.task_id, agent_id = %assignment.agent_id, error = %e, "Dispatch failed, requeueing");
                self.undo_dispatch(&assignment).await?;
                Err(FlotillaError::Dispatch(format!(
                    "agent {} refused task {}: {e}",
                    assignment.agent_id, assignment.task_id
                )))
            }
        }
    }

    /// Roll back an assignment the executor never delivered.
    async fn undo_dispatch(&self, assignment: &Assignment) -> FlotillaResult<()> {
        let now = self.clock.now();
        let mut report = HealthReport::default();
        let tripped = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let still_ours = state.queue.get(assignment.task_id).is_some_and(|t| {
                t.status.is_in_flight() && t.assigned_agent == Some(assignment.agent_id)
            });
            if still_ours {
                state.resources.release_task(assignment.task_id);
                if let Some(agent) = state.agents.get_mut(&assignment.agent_id) {
                    agent.in_flight.remove(&assignment.task_id);
                    agent.refresh_busy();
                }
                if state.queue.requeue(assignment.task_id)? == TaskStatus::Cancelled {
                    self.publish(CoordinatorEvent::TaskCancelled {
                        task_id: assignment.task_id,
                    });
                }
            }
            self.record_agent_failure(state, assignment.agent_id, now, &mut report)
        };
        if tripped {
            self.request_checkpoint(CheckpointTrigger::ErrorRecovery);
        }
        self.work_available.notify_one();
        Ok(())
    }

    /// Feed a failure into an agent's breaker. On a trip, every task the agent
    /// holds is released and returned to the queue with its retry count
    /// incremented. Returns whether the breaker tripped.
    fn record_agent_failure(
        &self,
        state: &mut CoordinatorState,
        agent_id: AgentId,
        now: DateTime<Utc>,
        report: &mut HealthReport,
    ) -> bool {
        let Some(transition) = state
            .breakers
            .get_mut(&agent_id)
            .and_then(|b| b.record_failure(now))
        else {
            return false;
        };
        self.publish_breaker(agent_id, transition);
        if transition.to != BreakerState::Open {
            return false;
        }
        warn!(agent_id = %agent_id, "Circuit opened, evicting in-flight tasks");
        self.evict(
            state,
            agent_id,
            &format!("agent {agent_id} circuit opened"),
            report,
        );
        true
    }

    /// Release everything an agent holds and send its tasks back through the
    /// failure path.
    fn evict(
        &self,
        state: &mut CoordinatorState,
        agent_id: AgentId,
        reason: &str,
        report: &mut HealthReport,
    ) {
        let in_flight: Vec<TaskId> = match state.agents.get_mut(&agent_id) {
            Some(agent) => {
                let tasks = std::mem::take(&mut agent.in_flight).into_iter().collect();
                agent.refresh_busy();
                tasks
            }
            None => Vec::new(),
        };
        state.resources.release_agent(agent_id);
        for task_id in in_flight {
            let cancelling = state
                .queue
                .get(task_id)
                .is_some_and(|t| t.status == TaskStatus::Cancelling);
            if cancelling {
                if let Ok(cascaded) = state.queue.acknowledge_cancel(task_id) {
                    self.publish(CoordinatorEvent::TaskCancelled { task_id });
                    self.publish_cascade(&cascaded, &mut report.failed);
                }
                continue;
            }
            match state.queue.fail(task_id, reason) {
                Ok(outcome) => self.publish_fail_outcome(task_id, reason, &outcome, report),
                Err(e) => warn!(task_id = %task_id, error = %e, "Could not requeue evicted task"),
            }
        }
    }

    fn publish_fail_outcome(
        &self,
        task_id: TaskId,
        reason: &str,
        outcome: &FailOutcome,
        report: &mut HealthReport,
    ) {
        match outcome {
            FailOutcome::Retrying { retry_count } => {
                report.requeued.push(task_id);
                self.publish(CoordinatorEvent::TaskRetrying {
                    task_id,
                    retry_count: *retry_count,
                    reason: reason.to_string(),
                });
            }
            FailOutcome::Exhausted { cascaded, .. } => {
                report.failed.push(task_id);
                self.publish(CoordinatorEvent::TaskFailed {
                    task_id,
                    reason: reason.to_string(),
                });
                self.publish_cascade(cascaded, &mut report.failed);
            }
            FailOutcome::Cancelled { cascaded } => {
                self.publish(CoordinatorEvent::TaskCancelled { task_id });
                self.publish_cascade(cascaded, &mut report.failed);
            }
        }
    }

    fn publish_cascade(&self, cascaded: &[TaskId], failed: &mut Vec<TaskId>) {
        for id in cascaded {
            failed.push(*id);
            self.publish(CoordinatorEvent::TaskFailed {
                task_id: *id,
                reason: "dependency did not complete".into(),
            });
        }
    }

    /// Hand back a task that was claimed but never delivered. No retry is consumed.
    pub async fn requeue(&self, task_id: TaskId) -> FlotillaResult<TaskStatus> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let agent_id = state
            .queue
            .get(task_id)
            .ok_or(FlotillaError::UnknownTask(task_id))?
            .assigned_agent;
        let status = state.queue.requeue(task_id)?;
        state.resources.release_task(task_id);
        if let Some(agent) = agent_id.and_then(|id| state.agents.get_mut(&id)) {
            agent.in_flight.remove(&task_id);
            agent.refresh_busy();
        }
        drop(guard);
        self.work_available.notify_one();
        Ok(status)
    }

    // --- Completion ---

    /// Apply an agent's report for a dispatched task.
    ///
    /// Only the agent currently holding the task may report on it. A late
    /// report from an agent the task was taken away from is rejected with
    /// `InvalidTransition` and changes nothing.
    pub async fn report_completion(
        &self,
        agent_id: AgentId,
        task_id: TaskId,
        outcome: TaskOutcome,
    ) -> FlotillaResult<TaskDisposition> {
        let now = self.clock.now();
        let mut report = HealthReport::default();
        let mut checkpoint_after = None;
        let mut retired = Vec::new();

        let disposition = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let task = state
                .queue
                .get(task_id)
                .ok_or(FlotillaError::UnknownTask(task_id))?;
            if !task.status.is_in_flight() {
                return Err(FlotillaError::InvalidTransition {
                    task: task_id,
                    action: "report completion for".into(),
                    status: task.status.to_string(),
                });
            }
            if task.assigned_agent != Some(agent_id) {
                warn!(task_id = %task_id, agent_id = %agent_id, holder = ?task.assigned_agent, "Ignoring report from agent that no longer holds the task");
                return Err(FlotillaError::InvalidTransition {
                    task: task_id,
                    action: format!("accept a report from agent {agent_id} for"),
                    status: task.status.to_string(),
                });
            }
            let agent_id = task.assigned_agent;
            let assigned_at = task.assigned_at;

            state.resources.release_task(task_id);
            if let Some(agent) = agent_id.and_then(|id| state.agents.get_mut(&id)) {
                agent.in_flight.remove(&task_id);
            }

            let disposition = match outcome {
                TaskOutcome::Success { output } => {
                    let newly_ready = state.queue.complete(task_id, output)?;
                    if let Some(agent) = agent_id.and_then(|id| state.agents.get_mut(&id)) {
                        agent.completed_tasks += 1;
                        if let Some(at) = assigned_at {
                            agent.record_latency((now - at).num_milliseconds().max(0) as f64);
                        }
                    }
                    if let Some(id) = agent_id {
                        if let Some(t) = state
                            .breakers
                            .get_mut(&id)
                            .and_then(|b| b.record_success(now))
                        {
                            self.publish_breaker(id, t);
                        }
                    }
                    info!(task_id = %task_id, "Task completed");
                    self.publish(CoordinatorEvent::TaskCompleted { task_id, agent_id });

                    let completed = self
                        .completions_since_checkpoint
                        .fetch_add(1, Ordering::SeqCst)
                        + 1;
                    let every = self.config.checkpoint.every_n_completions;
                    if every > 0 && completed >= every {
                        checkpoint_after = Some(CheckpointTrigger::TaskCount);
                    }
                    TaskDisposition::Completed { newly_ready }
                }
                TaskOutcome::Failure { error } => {
                    if let Some(agent) = agent_id.and_then(|id| state.agents.get_mut(&id)) {
                        agent.failed_tasks += 1;
                    }
                    let fail = state.queue.fail(task_id, error.clone())?;
                    self.publish_fail_outcome(task_id, &error, &fail, &mut report);
                    if let Some(id) = agent_id {
                        if self.record_agent_failure(state, id, now, &mut report) {
                            checkpoint_after = Some(CheckpointTrigger::ErrorRecovery);
                        }
                    }
                    match fail {
                        FailOutcome::Retrying { retry_count } => {
                            TaskDisposition::Retrying { retry_count }
                        }
                        FailOutcome::Exhausted {
                            retry_count,
                            cascaded,
                        } => TaskDisposition::Failed {
                            reason: error,
                            retries: retry_count,
                            cascaded,
                        },
                        FailOutcome::Cancelled { cascaded } => {
                            TaskDisposition::Cancelled { cascaded }
                        }
                    }
                }
                TaskOutcome::Cancelled => {
                    let cascaded = state.queue.acknowledge_cancel(task_id)?;
                    if let Some(b) = agent_id.and_then(|id| state.breakers.get_mut(&id)) {
                        b.release_trial();
                    }
                    self.publish(CoordinatorEvent::TaskCancelled { task_id });
                    self.publish_cascade(&cascaded, &mut report.failed);
                    TaskDisposition::Cancelled { cascaded }
                }
            };

            if let Some(id) = agent_id {
                if let Some(agent) = state.agents.get_mut(&id) {
                    agent.refresh_busy();
                }
                if self.finish_if_drained(state, id) {
                    retired.push(id);
                }
            }
            disposition
        };

        if let Some(trigger) = checkpoint_after {
            self.request_checkpoint(trigger);
        }
        self.decommission(&retired).await;
        self.work_available.notify_one();
        Ok(disposition)
    }

    /// Shorthand for reporting a failed attempt.
    pub async fn report_failure(
        &self,
        agent_id: AgentId,
        task_id: TaskId,
        error: impl Into<String>,
    ) -> FlotillaResult<TaskDisposition> {
        self.report_completion(agent_id, task_id, TaskOutcome::failure(error))
            .await
    }

    /// Cancel a task. In-flight tasks are asked to stop and finish
    /// cancelling when the agent acknowledges.
    pub async fn cancel_task(&self, task_id: TaskId) -> FlotillaResult<CancelOutcome> {
        let outcome = self.state.lock().await.queue.cancel(task_id)?;
        match &outcome {
            CancelOutcome::Cancelled { cascaded } => {
                self.publish(CoordinatorEvent::TaskCancelled { task_id });
                self.publish_cascade(cascaded, &mut Vec::new());
            }
            CancelOutcome::Cancelling { agent: Some(agent) } => {
                if let Err(e) = self.executor.cancel(*agent, task_id).await {
                    warn!(task_id = %task_id, agent_id = %agent, error = %e, "Cancel request not delivered");
                }
            }
            CancelOutcome::Cancelling { agent: None } => {}
        }
        Ok(outcome)
    }

    /// Retire an agent that is draining and has nothing left in flight.
    fn finish_if_drained(&self, state: &mut CoordinatorState, agent_id: AgentId) -> bool {
        let drained = state
            .agents
            .get(&agent_id)
            .is_some_and(|a| a.status == AgentStatus::Draining && a.in_flight.is_empty());
        if drained {
            self.remove_agent(state, agent_id);
        }
        drained
    }

    fn remove_agent(&self, state: &mut CoordinatorState, agent_id: AgentId) {
        if let Some(mut agent) = state.agents.remove(&agent_id) {
            self.set_status(&mut agent, AgentStatus::Terminated);
        }
        state.resources.remove_agent(agent_id);
        state.breakers.remove(&agent_id);
        self.heartbeats.write().remove(&agent_id);
        info!(agent_id = %agent_id, "Agent terminated and removed");
        self.publish(CoordinatorEvent::AgentRemoved { agent_id });
    }

    async fn decommission(&self, agents: &[AgentId]) {
        let Some(provisioner) = &self.provisioner else {
            return;
        };
        for agent in agents {
            if let Err(e) = provisioner.decommission(*agent).await {
                warn!(agent_id = %agent, error = %e, "Decommission failed");
            }
        }
    }

    // --- Health ---

    /// Declare silent agents unhealthy, evict their work and retire them.
    pub async fn sweep_health(&self) -> FlotillaResult<HealthReport> {
        let now = self.clock.now();
        let timeout = self.heartbeat_timeout();
        let expired: Vec<AgentId> = self
            .heartbeats
            .read()
            .iter()
            .filter(|(_, l)| l.is_expired(now, timeout))
            .map(|(id, _)| *id)
            .collect();

        let mut report = HealthReport::default();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            for (id, breaker) in &mut state.breakers {
                if let Some(t) = breaker.poll(now) {
                    self.publish_breaker(*id, t);
                }
            }

            for agent_id in expired {
                let Some(agent) = state.agents.get_mut(&agent_id) else {
                    continue;
                };
                warn!(agent_id = %agent_id, "Heartbeat timed out");
                self.set_status(agent, AgentStatus::Unhealthy);
                state.resources.mark_terminated(agent_id);
                report.unhealthy.push(agent_id);
                self.evict(
                    state,
                    agent_id,
                    &format!("agent {agent_id} stopped heartbeating"),
                    &mut report,
                );
                if let Some(agent) = state.agents.get_mut(&agent_id) {
                    self.set_status(agent, AgentStatus::Draining);
                }
            }

            let drained: Vec<AgentId> = state
                .agents
                .values()
                .filter(|a| a.status == AgentStatus::Draining && a.in_flight.is_empty())
                .map(|a| a.id)
                .collect();
            for agent_id in drained {
                self.remove_agent(state, agent_id);
                report.terminated.push(agent_id);
            }
        }

        if !report.unhealthy.is_empty() {
            self.request_checkpoint(CheckpointTrigger::ErrorRecovery);
            self.work_available.notify_one();
        }
        self.decommission(&report.terminated).await;
        Ok(report)
    }

    // --- Scaling ---

    /// Sample the fleet and apply a scaling decision if one is due.
    pub async fn evaluate_scaling(&self) -> FlotillaResult<Option<ScalingOutcome>> {
        let metrics = {
            let state = self.state.lock().await;
            ScalingMetrics {
                observed_at: self.clock.now(),
                system_utilization: state.resources.system_utilization(),
                ready_tasks: state.queue.ready_count(),
                active_agents: state.agents.values().filter(|a| a.status.is_active()).count(),
            }
        };
        let decision = self.scaling.lock().await.evaluate(&metrics);
        match decision {
            Some(decision) => Ok(Some(self.apply_scaling(decision).await?)),
            None => Ok(None),
        }
    }

    /// Carry out a scaling decision: provision agents to grow, drain the
    /// least busy agents to shrink.
    pub async fn apply_scaling(&self, decision: ScalingDecision) -> FlotillaResult<ScalingOutcome> {
        self.metrics.record(MetricsEvent::ScalingDecision {
            decision: decision.clone(),
        });
        self.publish(CoordinatorEvent::ScalingDecision {
            decision: decision.clone(),
        });

        let mut outcome = ScalingOutcome {
            decision: decision.clone(),
            added: Vec::new(),
            draining: Vec::new(),
            terminated: Vec::new(),
        };

        if decision.delta > 0 {
            let Some(provisioner) = &self.provisioner else {
                warn!(delta = decision.delta, "Scale-up requested but no provisioner is configured");
                return Ok(outcome);
            };
            let descriptors = provisioner.provision(decision.delta as usize).await?;
            for descriptor in descriptors {
                outcome.added.push(self.register_agent(descriptor).await?);
            }
        } else if decision.delta < 0 {
            let count = decision.delta.unsigned_abs() as usize;
            {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                let mut victims: Vec<(usize, f64, AgentId)> = state
                    .agents
                    .values()
                    .filter(|a| a.status.accepts_work())
                    .map(|a| (a.in_flight.len(), state.resources.utilization(a.id), a.id))
                    .collect();
                victims.sort_by(|a, b| {
                    a.0.cmp(&b.0)
                        .then(a.1.total_cmp(&b.1))
                        .then(a.2.cmp(&b.2))
                });
                for (_, _, agent_id) in victims.into_iter().take(count) {
                    if let Some(agent) = state.agents.get_mut(&agent_id) {
                        self.set_status(agent, AgentStatus::Draining);
                    }
                    outcome.draining.push(agent_id);
                    if self.finish_if_drained(state, agent_id) {
                        outcome.terminated.push(agent_id);
                    }
                }
            }
            self.decommission(&outcome.terminated).await;
        }
        Ok(outcome)
    }

    // --- Checkpointing ---

    /// Ask the background checkpoint loop to write a checkpoint soon.
    /// Requests made before the loop runs are coalesced.
    pub fn request_checkpoint(&self, trigger: CheckpointTrigger) {
        let mut pending = self.pending_checkpoint.lock();
        if pending.is_none() {
            *pending = Some(trigger);
        }
        drop(pending);
        self.checkpoint_requested.notify_one();
    }

    pub(crate) fn take_checkpoint_request(&self) -> Option<CheckpointTrigger> {
        self.pending_checkpoint.lock().take()
    }

    /// Build a snapshot of the current state without persisting it.
    pub async fn snapshot(&self) -> CoordinatorSnapshot {
        let version = *self.last_checkpoint.lock().await;
        let state = self.state.lock().await;
        state.snapshot(version, self.clock.now(), CheckpointTrigger::Manual)
    }

    /// Write a checkpoint now.
    ///
    /// The new version is above both the last one this coordinator wrote or
    /// restored and every version already in the store, so restoring an old
    /// checkpoint never leads to a version being reused. The snapshot is taken
    /// under the state lock; sealing and storage happen after it is released.
    pub async fn checkpoint(&self, trigger: CheckpointTrigger) -> FlotillaResult<CheckpointHandle> {
        let mut last = self.last_checkpoint.lock().await;
        let stored = self
            .store
            .list()
            .await?
            .iter()
            .map(|h| h.version)
            .max()
            .unwrap_or(0);
        let version = (*last).max(stored) + 1;
        let now = self.clock.now();
        let snapshot = self.state.lock().await.snapshot(version, now, trigger);

        let bytes = CheckpointBlob::seal(&snapshot)?.to_bytes()?;
        let meta = CheckpointMetadata {
            version,
            timestamp: now,
            trigger,
        };
        let handle = self.store.save(&bytes, &meta).await?;
        *last = version;
        self.completions_since_checkpoint.store(0, Ordering::SeqCst);

        info!(version, trigger = %trigger, tasks = snapshot.tasks.len(), agents = snapshot.agents.len(), "Checkpoint saved");
        self.metrics.record(MetricsEvent::CheckpointWritten {
            version,
            trigger,
            bytes: bytes.len(),
        });
        self.publish(CoordinatorEvent::CheckpointWritten {
            version,
            trigger,
            at: now,
        });
        Ok(handle)
    }

    /// Replace the live state with a checkpoint blob.
    ///
    /// The blob is verified and a complete new state is built before anything
    /// live is touched; on any error the running state is unchanged. Restored
    /// agents must heartbeat again before they receive work.
    pub async fn restore(&self, blob: &[u8]) -> FlotillaResult<u64> {
        let snapshot = CheckpointBlob::from_bytes(blob)?.open()?;
        let version = snapshot.version;
        let restored = CoordinatorState::from_snapshot(snapshot, &self.config, Arc::clone(&self.clock))?;

        let now = self.clock.now();
        let mut last = self.last_checkpoint.lock().await;
        {
            let mut state = self.state.lock().await;
            let mut heartbeats = self.heartbeats.write();
            heartbeats.clear();
            for id in restored.agents.keys() {
                heartbeats.insert(
                    *id,
                    Liveness {
                        last_seen: None,
                        since: now,
                    },
                );
            }
            *state = restored;
        }
        *last = (*last).max(version);
        drop(last);
        self.completions_since_checkpoint.store(0, Ordering::SeqCst);
        *self.pending_checkpoint.lock() = None;

        info!(version, "Coordinator state restored from checkpoint");
        self.publish(CoordinatorEvent::Restored { version });
        Ok(version)
    }

    /// Restore from the newest checkpoint in the store, if there is one.
    pub async fn restore_latest(&self) -> FlotillaResult<Option<u64>> {
        match self.store.load_latest().await? {
            Some(blob) => Ok(Some(self.restore(&blob).await?)),
            None => Ok(None),
        }
    }

    /// Restore a specific stored version.
    pub async fn restore_version(&self, version: u64) -> FlotillaResult<u64> {
        let blob = self
            .store
            .load(version)
            .await?
            .ok_or_else(|| FlotillaError::Store(format!("no checkpoint with version {version}")))?;
        self.restore(&blob).await
    }

    pub async fn last_checkpoint_version(&self) -> u64 {
        *self.last_checkpoint.lock().await
    }

    // --- Queries ---

    pub async fn task(&self, task_id: TaskId) -> Option<Task> {
        self.state.lock().await.queue.get(task_id).cloned()
    }

    /// The result of a finished task. Terminal failures surface as
    /// `RetriesExhausted`; unfinished tasks yield `None`.
    pub async fn task_result(&self, task_id: TaskId) -> FlotillaResult<Option<serde_json::Value>> {
        let state = self.state.lock().await;
        let task = state
            .queue
            .get(task_id)
            .ok_or(FlotillaError::UnknownTask(task_id))?;
        match &task.status {
            TaskStatus::Completed => Ok(task.result.clone()),
            TaskStatus::Failed { reason } => Err(FlotillaError::RetriesExhausted {
                task: task_id,
                retries: task.retry_count,
                reason: reason.clone(),
            }),
            TaskStatus::Cancelled => Err(FlotillaError::InvalidTransition {
                task: task_id,
                action: "read the result of".into(),
                status: task.status.to_string(),
            }),
            _ => Ok(None),
        }
    }

    pub async fn agent_info(&self, agent_id: AgentId) -> Option<AgentInfo> {
        let state = self.state.lock().await;
        let agent = state.agents.get(&agent_id)?;
        Some(self.info_for(&state, agent))
    }

    pub async fn agents(&self) -> Vec<AgentInfo> {
        let state = self.state.lock().await;
        state
            .agents
            .values()
            .map(|a| self.info_for(&state, a))
            .collect()
    }

    fn info_for(&self, state: &CoordinatorState, agent: &Agent) -> AgentInfo {
        AgentInfo {
            agent: agent.clone(),
            utilization: state.resources.utilization(agent.id),
            breaker: state
                .breakers
                .get(&agent.id)
                .map_or(BreakerState::Closed, CircuitBreaker::state),
            last_heartbeat: self.last_heartbeat(agent.id),
        }
    }

    pub async fn stats(&self) -> CoordinatorStats {
        let last_checkpoint_version = *self.last_checkpoint.lock().await;
        let state = self.state.lock().await;
        let mut agents_by_status = BTreeMap::new();
        for agent in state.agents.values() {
            *agents_by_status.entry(agent.status.to_string()).or_insert(0) += 1;
        }
        CoordinatorStats {
            agents: state.agents.len(),
            agents_by_status,
            queue: state.queue.stats(),
            reservations: state.resources.reservation_count(),
            system_utilization: state.resources.system_utilization(),
            open_breakers: state
                .breakers
                .values()
                .filter(|b| b.state() != BreakerState::Closed)
                .count(),
            last_checkpoint_version,
        }
    }

    /// Push queue depth and utilization gauges to the metrics sink.
    pub async fn emit_metrics(&self) {
        let state = self.state.lock().await;
        self.metrics.record(queue_depth(&state.queue.stats()));
        for agent in state.agents.values() {
            self.metrics.record(MetricsEvent::AgentUtilization {
                agent_id: agent.id,
                percent: state.resources.utilization(agent.id),
                in_flight: agent.in_flight.len(),
            });
        }
        self.metrics.record(MetricsEvent::SystemUtilization {
            percent: state.resources.system_utilization(),
            active_agents: state.agents.values().filter(|a| a.status.is_active()).count(),
        });
    }

    /// Drop terminal tasks finished more than `older_than` ago.
    pub async fn prune_terminal(&self, older_than: Duration) -> usize {
        let cutoff = self.clock.now() - older_than;
        let pruned = self.state.lock().await.queue.prune_terminal(cutoff);
        if pruned > 0 {
            debug!(pruned, "Pruned terminal tasks");
        }
        pruned
    }

    /// Tasks currently held by an agent.
    pub async fn in_flight(&self, agent_id: AgentId) -> BTreeSet<TaskId> {
        self.state
            .lock()
            .await
            .agents
            .get(&agent_id)
            .map(|a| a.in_flight.clone())
            .unwrap_or_default()
    }
}
