use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::types::{Task, TaskStatus};
use chrono::{DateTime, Utc};
use flotilla_core::{AgentId, FlotillaError, FlotillaResult, ReservationId, TaskId};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Ordering key of the ready index: priority descending, then FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey(Reverse<i32>, u64, TaskId);

impl ReadyKey {
    fn of(task: &Task) -> Self {
        ReadyKey(Reverse(task.priority), task.seq, task.id)
    }
}

/// Result of reporting a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// The task went back to the queue.
    Retrying { retry_count: u32 },
    /// The task is terminally `Failed`; `cascaded` lists dependents failed with it.
    Exhausted {
        retry_count: u32,
        cascaded: Vec<TaskId>,
    },
    /// A cancel was pending, so the failure finalised the cancellation.
    Cancelled { cascaded: Vec<TaskId> },
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task had not been dispatched and is now `Cancelled`.
    Cancelled { cascaded: Vec<TaskId> },
    /// The task is in flight on `agent`; the agent must acknowledge.
    Cancelling { agent: Option<AgentId> },
}

/// Counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub ready: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

/// A task queue with dependency resolution and priority ordering.
///
/// Tasks become `Ready` only when every dependency is `Completed`. Among ready
/// tasks, higher priority wins and equal priorities are served FIFO.
/// Lifecycle timestamps come from the queue's clock.
pub struct TaskQueue {
    tasks: HashMap<TaskId, Task>,
    ready: BTreeSet<ReadyKey>,
    dependents: HashMap<TaskId, Vec<TaskId>>,
    next_seq: u64,
    max_pending: usize,
    max_retries: u32,
    clock: Arc<dyn Clock>,
}

impl TaskQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self::with_limits(config.max_pending, config.max_retries)
    }

    pub fn with_limits(max_pending: usize, max_retries: u32) -> Self {
        Self {
            tasks: HashMap::new(),
            ready: BTreeSet::new(),
            dependents: HashMap::new(),
            next_seq: 0,
            max_pending,
            max_retries,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp submissions and transitions with `clock` instead of system time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Add a task to the queue.
    pub fn enqueue(&mut self, task: Task) -> FlotillaResult<TaskId> {
        let id = task.id;
        self.enqueue_batch(vec![task])?;
        Ok(id)
    }

    /// Add several tasks atomically. Tasks may depend on each other.
    ///
    /// The whole batch is rejected if the queue would overflow, if any
    /// dependency is unknown or already failed, or if the combined graph
    /// contains a cycle.
    pub fn enqueue_batch(&mut self, tasks: Vec<Task>) -> FlotillaResult<Vec<TaskId>> {
        let pending = self.pending_count();
        if pending + tasks.len() > self.max_pending {
            return Err(FlotillaError::QueueFull {
                pending,
                max: self.max_pending,
            });
        }

        let mut batch: HashMap<TaskId, &Task> = HashMap::with_capacity(tasks.len());
        for task in &tasks {
            if self.tasks.contains_key(&task.id) || batch.insert(task.id, task).is_some() {
                return Err(FlotillaError::DuplicateTask(task.id));
            }
        }

        for task in &tasks {
            for dep in &task.dependencies {
                if batch.contains_key(dep) {
                    continue;
                }
                match self.tasks.get(dep).map(|t| &t.status) {
                    None => {
                        return Err(FlotillaError::InvalidDependency {
                            task: task.id,
                            dependency: *dep,
                            reason: "unknown task".into(),
                        })
                    }
                    Some(TaskStatus::Failed { .. }) | Some(TaskStatus::Cancelled) => {
                        return Err(FlotillaError::InvalidDependency {
                            task: task.id,
                            dependency: *dep,
                            reason: "dependency can no longer complete".into(),
                        })
                    }
                    Some(_) => {}
                }
            }
        }

        // Existing tasks never depend on new ones, so a cycle must lie
        // entirely within the batch.
        let mut visited = HashMap::new();
        for task in &tasks {
            if let Some(culprit) = batch_cycle(task.id, &batch, &mut visited) {
                return Err(FlotillaError::DependencyCycle { task: culprit });
            }
        }

        let now = self.clock.now();
        let mut ids = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            task.created_at = now;
            task.seq = self.next_seq;
            self.next_seq += 1;
            task.status = TaskStatus::Pending;
            task.assigned_agent = None;
            task.reservation = None;
            task.assigned_at = None;
            task.completed_at = None;
            for dep in &task.dependencies {
                self.dependents.entry(*dep).or_default().push(task.id);
            }
            ids.push(task.id);
            self.tasks.insert(task.id, task);
        }
        for id in &ids {
            self.refresh_readiness(*id);
        }
        debug!(count = ids.len(), "Enqueued tasks");
        Ok(ids)
    }

    /// Claim the best ready task accepted by `filter`, moving it to `Assigned`.
    ///
    /// The caller owns the claim: if it cannot dispatch the task it must hand
    /// it back with [`TaskQueue::requeue`].
    pub fn dequeue(&mut self, filter: impl Fn(&Task) -> bool) -> Option<Task> {
        let key = self
            .ready
            .iter()
            .find(|key| self.tasks.get(&key.2).is_some_and(&filter))
            .copied()?;
        self.ready.remove(&key);
        let now = self.clock.now();
        let task = self.tasks.get_mut(&key.2)?;
        task.status = TaskStatus::Assigned;
        task.assigned_at = Some(now);
        Some(task.clone())
    }

    /// Peek at the best ready task without claiming it.
    pub fn peek_ready(&self) -> Option<&Task> {
        self.ready.iter().next().and_then(|key| self.tasks.get(&key.2))
    }

    /// Record which agent and reservation hold an assigned task.
    pub fn bind(
        &mut self,
        id: TaskId,
        agent: AgentId,
        reservation: ReservationId,
        at: DateTime<Utc>,
    ) -> FlotillaResult<()> {
        let task = self.task_mut(id)?;
        if task.status != TaskStatus::Assigned {
            return Err(invalid(task, "bind"));
        }
        task.assigned_agent = Some(agent);
        task.reservation = Some(reservation);
        task.assigned_at = Some(at);
        Ok(())
    }

    /// Return a claimed task that could not be dispatched.
    ///
    /// No retry is consumed. A task cancelled while claimed becomes `Cancelled`.
    pub fn requeue(&mut self, id: TaskId) -> FlotillaResult<TaskStatus> {
        let task = self.task_mut(id)?;
        match task.status {
            TaskStatus::Assigned => {
                task.assigned_agent = None;
                task.reservation = None;
                task.assigned_at = None;
                task.status = TaskStatus::Pending;
                self.refresh_readiness(id);
            }
            TaskStatus::Cancelling => {
                self.finish_cancel(id);
            }
            _ => return Err(invalid(task, "requeue")),
        }
        Ok(self.tasks.get(&id).map_or(TaskStatus::Cancelled, |t| t.status.clone()))
    }

    /// Acknowledge that the agent accepted the task.
    ///
    /// Returns `false` when the task is no longer `Assigned` (completed early,
    /// cancelled, or reclaimed).
    pub fn mark_running(&mut self, id: TaskId) -> FlotillaResult<bool> {
        let task = self.task_mut(id)?;
        if task.status == TaskStatus::Assigned {
            task.status = TaskStatus::Running;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Mark a task as completed. Returns the dependents that became ready.
    pub fn complete(
        &mut self,
        id: TaskId,
        result: serde_json::Value,
    ) -> FlotillaResult<Vec<TaskId>> {
        let now = self.clock.now();
        let task = self.task_mut(id)?;
        if !task.status.is_in_flight() {
            return Err(invalid(task, "complete"));
        }
        task.status = TaskStatus::Completed;
        task.completed_at = Some(now);
        task.reservation = None;
        task.result = Some(result);

        let mut newly_ready = Vec::new();
        for dependent in self.dependents.get(&id).cloned().unwrap_or_default() {
            if self.refresh_readiness(dependent) {
                newly_ready.push(dependent);
            }
        }
        Ok(newly_ready)
    }

    /// Record a failed attempt.
    ///
    /// The retry count is incremented; while it stays below the configured
    /// maximum the task goes back to the queue, otherwise it fails terminally
    /// together with everything that depends on it.
    pub fn fail(&mut self, id: TaskId, reason: impl Into<String>) -> FlotillaResult<FailOutcome> {
        let reason = reason.into();
        let max_retries = self.max_retries;
        let now = self.clock.now();
        let task = self.task_mut(id)?;
        if !task.status.is_in_flight() {
            return Err(invalid(task, "fail"));
        }
        task.last_error = Some(reason.clone());
        if task.status == TaskStatus::Cancelling {
            let cascaded = self.finish_cancel(id);
            return Ok(FailOutcome::Cancelled { cascaded });
        }

        task.retry_count += 1;
        task.assigned_agent = None;
        task.reservation = None;
        task.assigned_at = None;
        let retry_count = task.retry_count;

        if retry_count < max_retries {
            task.status = TaskStatus::Pending;
            self.refresh_readiness(id);
            debug!(task_id = %id, retry_count, "Task requeued for retry");
            Ok(FailOutcome::Retrying { retry_count })
        } else {
            task.status = TaskStatus::Failed {
                reason: reason.clone(),
            };
            task.completed_at = Some(now);
            warn!(task_id = %id, retry_count, reason = %reason, "Task failed, retries exhausted");
            let cascaded = self.cascade_failure(id);
            Ok(FailOutcome::Exhausted {
                retry_count,
                cascaded,
            })
        }
    }

    /// Cancel a task.
    ///
    /// Waiting tasks are cancelled at once. In-flight tasks move to
    /// `Cancelling` and stay bound to their agent until it acknowledges.
    pub fn cancel(&mut self, id: TaskId) -> FlotillaResult<CancelOutcome> {
        let task = self.task_mut(id)?;
        match task.status {
            TaskStatus::Pending | TaskStatus::Ready => {
                let cascaded = self.finish_cancel(id);
                Ok(CancelOutcome::Cancelled { cascaded })
            }
            TaskStatus::Assigned | TaskStatus::Running | TaskStatus::Cancelling => {
                task.status = TaskStatus::Cancelling;
                Ok(CancelOutcome::Cancelling {
                    agent: task.assigned_agent,
                })
            }
            _ => Err(invalid(task, "cancel")),
        }
    }

    /// Finalise cancellation of an in-flight task once its agent has stopped.
    pub fn acknowledge_cancel(&mut self, id: TaskId) -> FlotillaResult<Vec<TaskId>> {
        let task = self.task_mut(id)?;
        if !task.status.is_in_flight() {
            return Err(invalid(task, "acknowledge cancel of"));
        }
        Ok(self.finish_cancel(id))
    }

    fn finish_cancel(&mut self, id: TaskId) -> Vec<TaskId> {
        let now = self.clock.now();
        if let Some(task) = self.tasks.get_mut(&id) {
            self.ready.remove(&ReadyKey::of(task));
            task.status = TaskStatus::Cancelled;
            task.reservation = None;
            task.completed_at = Some(now);
        }
        self.cascade_failure(id)
    }

    /// Fail every waiting task that transitively depends on `root`.
    fn cascade_failure(&mut self, root: TaskId) -> Vec<TaskId> {
        let now = self.clock.now();
        let mut failed = Vec::new();
        let mut frontier: VecDeque<TaskId> = VecDeque::from([root]);
        while let Some(current) = frontier.pop_front() {
            for dependent in self.dependents.get(&current).cloned().unwrap_or_default() {
                let Some(task) = self.tasks.get_mut(&dependent) else {
                    continue;
                };
                if !task.status.is_waiting() {
                    continue;
                }
                self.ready.remove(&ReadyKey::of(task));
                task.status = TaskStatus::Failed {
                    reason: format!("dependency {current} did not complete"),
                };
                task.completed_at = Some(now);
                failed.push(dependent);
                frontier.push_back(dependent);
            }
        }
        if !failed.is_empty() {
            warn!(root = %root, count = failed.len(), "Failed dependents of unfinished task");
        }
        failed
    }

    /// Move a waiting task between `Pending` and `Ready` according to its
    /// dependencies. Returns `true` if it became ready.
    fn refresh_readiness(&mut self, id: TaskId) -> bool {
        let Some(task) = self.tasks.get(&id) else {
            return false;
        };
        if !task.status.is_waiting() {
            return false;
        }
        let satisfied = task.dependencies_satisfied(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|d| d.status == TaskStatus::Completed)
        });
        let was_ready = task.status == TaskStatus::Ready;
        let key = ReadyKey::of(task);
        if let Some(task) = self.tasks.get_mut(&id) {
            if satisfied {
                task.status = TaskStatus::Ready;
                self.ready.insert(key);
            } else {
                task.status = TaskStatus::Pending;
                self.ready.remove(&key);
            }
        }
        satisfied && !was_ready
    }

    fn task_mut(&mut self, id: TaskId) -> FlotillaResult<&mut Task> {
        self.tasks.get_mut(&id).ok_or(FlotillaError::UnknownTask(id))
    }

    /// Get a task by ID.
    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// List all tasks in submission order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// Ready tasks in dispatch order.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        self.ready
            .iter()
            .filter_map(|key| self.tasks.get(&key.2))
            .collect()
    }

    /// Tasks waiting for dispatch or dependencies (the backpressure measure).
    pub fn pending_count(&self) -> usize {
        self.tasks.values().filter(|t| t.status.is_waiting()).count()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status.is_in_flight())
            .count()
    }

    /// Total number of tasks.
    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Check if all tasks are in a terminal state.
    pub fn is_done(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total: self.tasks.len(),
            ..QueueStats::default()
        };
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Ready => stats.ready += 1,
                TaskStatus::Assigned | TaskStatus::Running | TaskStatus::Cancelling => {
                    stats.in_flight += 1;
                }
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed { .. } => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Drop terminal tasks finished before `before` that no live task depends on.
    pub fn prune_terminal(&mut self, before: DateTime<Utc>) -> usize {
        let still_needed: HashSet<TaskId> = self
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .flat_map(|t| t.dependencies.iter().copied())
            .collect();
        let doomed: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| {
                t.status.is_terminal()
                    && t.completed_at.is_some_and(|at| at < before)
                    && !still_needed.contains(&t.id)
            })
            .map(|t| t.id)
            .collect();
        for id in &doomed {
            self.tasks.remove(id);
            self.dependents.remove(id);
        }
        for children in self.dependents.values_mut() {
            children.retain(|c| !doomed.contains(c));
        }
        doomed.len()
    }

    /// Check for cycles in the dependency graph.
    /// Returns true if a cycle is detected.
    pub fn has_cycle(&self) -> bool {
        let mut visited = HashMap::new();
        for &id in self.tasks.keys() {
            if self.dfs_cycle(id, &mut visited) {
                return true;
            }
        }
        false
    }

    fn dfs_cycle(&self, id: TaskId, visited: &mut HashMap<TaskId, u8>) -> bool {
        match visited.get(&id) {
            Some(1) => return true,  // back edge = cycle
            Some(2) => return false, // already processed
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(task) = self.tasks.get(&id) {
            for dep in &task.dependencies {
                if self.dfs_cycle(*dep, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }

    /// All tasks in submission order, for checkpointing.
    pub fn snapshot(&self) -> Vec<Task> {
        self.all_tasks().into_iter().cloned().collect()
    }

    /// Rebuild a queue from checkpointed tasks.
    ///
    /// Statuses are taken as recorded, except that waiting tasks are
    /// re-derived from their dependencies.
    pub fn from_snapshot(
        tasks: Vec<Task>,
        config: &QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> FlotillaResult<Self> {
        let mut queue = Self::new(config).with_clock(clock);
        for task in tasks {
            queue.next_seq = queue.next_seq.max(task.seq + 1);
            if queue.tasks.insert(task.id, task).is_some() {
                return Err(FlotillaError::IntegrityViolation(
                    "duplicate task in snapshot".into(),
                ));
            }
        }
        let edges: Vec<(TaskId, TaskId)> = queue
            .tasks
            .values()
            .flat_map(|t| t.dependencies.iter().map(move |d| (*d, t.id)))
            .collect();
        for (dep, dependent) in edges {
            if !queue.tasks.contains_key(&dep) {
                return Err(FlotillaError::IntegrityViolation(format!(
                    "task {dependent} depends on missing task {dep}"
                )));
            }
            queue.dependents.entry(dep).or_default().push(dependent);
        }
        for children in queue.dependents.values_mut() {
            children.sort();
        }
        if queue.has_cycle() {
            return Err(FlotillaError::IntegrityViolation(
                "dependency cycle in snapshot".into(),
            ));
        }
        let waiting: Vec<TaskId> = queue
            .tasks
            .values()
            .filter(|t| t.status.is_waiting())
            .map(|t| t.id)
            .collect();
        for id in waiting {
            queue.refresh_readiness(id);
        }
        Ok(queue)
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}

fn invalid(task: &Task, action: &str) -> FlotillaError {
    FlotillaError::InvalidTransition {
        task: task.id,
        action: action.to_string(),
        status: task.status.to_string(),
    }
}

/// Depth-first search restricted to the batch being enqueued.
/// Returns a task on the cycle if one exists.
fn batch_cycle(
    id: TaskId,
    batch: &HashMap<TaskId, &Task>,
    visited: &mut HashMap<TaskId, u8>,
) -> Option<TaskId> {
    match visited.get(&id) {
        Some(1) => return Some(id),
        Some(_) => return None,
        None => {}
    }
    let task = batch.get(&id)?;
    visited.insert(id, 1);
    for dep in &task.dependencies {
        if let Some(culprit) = batch_cycle(*dep, batch, visited) {
            return Some(culprit);
        }
    }
    visited.insert(id, 2);
    None
}
