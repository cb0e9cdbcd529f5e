//! End-to-end coordination tests.
//!
//! Drives a `MultiAgentCoordinator` through mock executors and provisioners
//! with a manual clock. Checks: dispatch order, resource accounting, breaker
//! isolation, health eviction, scaling, cancellation, and checkpoint
//! round-trips through both stores.

use async_trait::async_trait;
use flotilla_coordinator::*;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Mock collaborators
// ---------------------------------------------------------------------------

/// Accepts every dispatch and remembers it.
#[derive(Default)]
struct RecordingExecutor {
    dispatched: Mutex<Vec<(AgentId, TaskId, String)>>,
    cancelled: Mutex<Vec<(AgentId, TaskId)>>,
}

impl RecordingExecutor {
    fn names(&self) -> Vec<String> {
        self.dispatched.lock().iter().map(|(_, _, n)| n.clone()).collect()
    }
}

#[async_trait]
impl AgentExecutor for RecordingExecutor {
    async fn dispatch(&self, agent: AgentId, task: &Task) -> FlotillaResult<()> {
        self.dispatched.lock().push((agent, task.id, task.name.clone()));
        Ok(())
    }

    async fn cancel(&self, agent: AgentId, task: TaskId) -> FlotillaResult<()> {
        self.cancelled.lock().push((agent, task));
        Ok(())
    }
}

/// Hands out numbered agents and records decommissions.
#[derive(Default)]
struct MockProvisioner {
    launched: Mutex<usize>,
    decommissioned: Mutex<Vec<AgentId>>,
}

#[async_trait]
impl AgentProvisioner for MockProvisioner {
    async fn provision(&self, count: usize) -> FlotillaResult<Vec<AgentDescriptor>> {
        let mut launched = self.launched.lock();
        let descriptors = (0..count)
            .map(|i| {
                AgentDescriptor::new(
                    format!("auto-{}", *launched + i),
                    ResourceVector::cpu_mem(100, 1024),
                )
            })
            .collect();
        *launched += count;
        Ok(descriptors)
    }

    async fn decommission(&self, agent: AgentId) -> FlotillaResult<()> {
        self.decommissioned.lock().push(agent);
        Ok(())
    }
}

struct Harness {
    coord: Arc<MultiAgentCoordinator>,
    executor: Arc<RecordingExecutor>,
    provisioner: Arc<MockProvisioner>,
    store: Arc<MemoryCheckpointStore>,
    clock: Arc<ManualClock>,
}

fn harness_with(config: CoordinatorConfig) -> Harness {
    let executor = Arc::new(RecordingExecutor::default());
    let provisioner = Arc::new(MockProvisioner::default());
    let store = Arc::new(MemoryCheckpointStore::new());
    let clock = Arc::new(ManualClock::default());
    let coord = MultiAgentCoordinator::builder(config, executor.clone())
        .with_provisioner(provisioner.clone())
        .with_store(store.clone())
        .with_clock(clock.clone())
        .with_metrics(Arc::new(RecordingMetricsSink::new()))
        .build()
        .expect("valid config");
    Harness {
        coord: Arc::new(coord),
        executor,
        provisioner,
        store,
        clock,
    }
}

fn harness() -> Harness {
    harness_with(CoordinatorConfig::default())
}

fn worker(name: &str, cpu: u64) -> AgentDescriptor {
    AgentDescriptor::new(name, ResourceVector::cpu_mem(cpu, 4096))
}

async fn assign(coord: &MultiAgentCoordinator) -> Assignment {
    match coord.assign_next().await.unwrap() {
        AssignmentOutcome::Assigned(a) => a,
        other => panic!("expected an assignment, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Ordering and resources
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_priority_and_dependency_order() {
    let h = harness();
    h.coord.register_agent(worker("solo", 100)).await.unwrap();

    let a = Task::new("A").with_priority(5);
    let b = Task::new("B").with_priority(1).depends_on(a.id);
    let c = Task::new("C").with_priority(10);
    h.coord.submit_all(vec![a, b, c]).await.unwrap();

    let first = assign(&h.coord).await;
    h.coord
        .report_completion(first.agent_id, first.task_id, TaskOutcome::success(json!("c")))
        .await
        .unwrap();

    let second = assign(&h.coord).await;
    // B is still waiting on A.
    assert_eq!(h.coord.assign_next().await.unwrap(), AssignmentOutcome::NoWork);
    let disposition = h
        .coord
        .report_completion(second.agent_id, second.task_id, TaskOutcome::success(json!("a")))
        .await
        .unwrap();
    assert!(matches!(disposition, TaskDisposition::Completed { ref newly_ready } if newly_ready.len() == 1));

    assign(&h.coord).await;
    assert_eq!(h.executor.names(), vec!["C", "A", "B"]);
}

#[tokio::test]
async fn test_second_sixty_unit_reservation_is_refused() {
    let mut resources = ResourceManager::new();
    let agent = AgentId::new();
    resources.register_agent(agent, ResourceVector::new().with("units", 100));
    let sixty = ResourceVector::new().with("units", 60);
    let now = chrono::Utc::now();

    resources.try_reserve(agent, TaskId::new(), &sixty, now).unwrap();
    let err = resources
        .try_reserve(agent, TaskId::new(), &sixty, now)
        .unwrap_err();
    assert!(matches!(
        err,
        FlotillaError::InsufficientResources {
            requested: 60,
            available: 40,
            ..
        }
    ));
}

#[tokio::test]
async fn test_task_waits_when_capacity_is_reserved() {
    let h = harness();
    let agent = h.coord.register_agent(worker("w", 100)).await.unwrap();
    let big = || Task::new("big").with_requirement(ResourceVector::cpu_mem(60, 1));
    h.coord.submit(big()).await.unwrap();
    let second = h.coord.submit(big()).await.unwrap();

    let first = assign(&h.coord).await;
    assert_eq!(
        h.coord.assign_next().await.unwrap(),
        AssignmentOutcome::NoCapacity {
            task: Some(second)
        }
    );
    assert_eq!(h.coord.task(second).await.unwrap().status, TaskStatus::Ready);

    h.coord
        .report_completion(first.agent_id, first.task_id, TaskOutcome::success(json!(null)))
        .await
        .unwrap();
    let next = assign(&h.coord).await;
    assert_eq!((next.task_id, next.agent_id), (second, agent));
}

#[tokio::test]
async fn test_smaller_task_skips_ahead_of_one_that_does_not_fit() {
    let h = harness();
    h.coord.register_agent(worker("w", 100)).await.unwrap();
    let filler = h
        .coord
        .submit(Task::new("filler").with_priority(9).with_requirement(ResourceVector::cpu_mem(50, 1)))
        .await
        .unwrap();
    assert_eq!(assign(&h.coord).await.task_id, filler);

    let big = h
        .coord
        .submit(Task::new("big").with_priority(5).with_requirement(ResourceVector::cpu_mem(80, 1)))
        .await
        .unwrap();
    let small = h
        .coord
        .submit(Task::new("small").with_priority(1).with_requirement(ResourceVector::cpu_mem(20, 1)))
        .await
        .unwrap();

    assert_eq!(assign(&h.coord).await.task_id, small);
    assert_eq!(
        h.coord.assign_next().await.unwrap(),
        AssignmentOutcome::NoCapacity { task: Some(big) }
    );
    assert_eq!(h.coord.task(big).await.unwrap().status, TaskStatus::Ready);
}

#[tokio::test]
async fn test_capability_mismatch_leaves_task_queued() {
    let h = harness();
    h.coord
        .register_agent(worker("plain", 100).with_capability("review"))
        .await
        .unwrap();
    let task = h
        .coord
        .submit(Task::new("build").with_capability("rust"))
        .await
        .unwrap();
    let outcome = h.coord.assign_next().await.unwrap();
    assert_eq!(outcome, AssignmentOutcome::NoCapacity { task: Some(task) });
    assert!(matches!(
        outcome.into_result().unwrap_err(),
        FlotillaError::NoCapacity { .. }
    ));
}

#[tokio::test]
async fn test_cycle_rejected_at_submission() {
    let h = harness();
    let mut a = Task::new("a");
    let b = Task::new("b").depends_on(a.id);
    a.dependencies.push(b.id);
    let err = h.coord.submit_all(vec![a, b]).await.unwrap_err();
    assert!(matches!(err, FlotillaError::DependencyCycle { .. }));
    assert_eq!(h.coord.stats().await.queue.total, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_assignment_never_double_books() {
    let h = harness();
    let mut agents = Vec::new();
    for i in 0..4 {
        agents.push(h.coord.register_agent(worker(&format!("w{i}"), 100)).await.unwrap());
    }
    let tasks: Vec<Task> = (0..40)
        .map(|i| Task::new(format!("t{i}")).with_requirement(ResourceVector::cpu_mem(30, 1)))
        .collect();
    h.coord.submit_all(tasks).await.unwrap();

    let mut workers = Vec::new();
    for _ in 0..8 {
        let coord = Arc::clone(&h.coord);
        workers.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            for _ in 0..10 {
                if let Ok(AssignmentOutcome::Assigned(a)) = coord.assign_next().await {
                    mine.push(a);
                }
            }
            mine
        }));
    }
    let mut all = Vec::new();
    for w in workers {
        all.extend(w.await.unwrap());
    }

    // Three 30-unit tasks fit in 100 units, four agents.
    assert_eq!(all.len(), 12);
    let unique: HashSet<TaskId> = all.iter().map(|a| a.task_id).collect();
    assert_eq!(unique.len(), all.len());
    let mut per_agent: BTreeMap<AgentId, u64> = BTreeMap::new();
    for a in &all {
        *per_agent.entry(a.agent_id).or_default() += 30;
    }
    assert!(per_agent.values().all(|cpu| *cpu <= 100));
    for agent in agents {
        assert!(h.coord.agent_info(agent).await.unwrap().utilization <= 100.0);
    }
    assert_eq!(h.coord.stats().await.reservations, 12);
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_breaker_opens_then_allows_one_trial() {
    let mut config = CoordinatorConfig::default();
    config.breaker.failure_threshold = 2;
    config.breaker.cooldown_secs = 60;
    let h = harness_with(config);
    let agent = h.coord.register_agent(worker("flaky", 100)).await.unwrap();
    let t1 = h.coord.submit(Task::new("t1")).await.unwrap();

    for attempt in 1..=2 {
        assign(&h.coord).await;
        let disposition = h.coord.report_failure(agent, t1, "boom").await.unwrap();
        assert_eq!(disposition, TaskDisposition::Retrying { retry_count: attempt });
    }
    assert_eq!(h.coord.agent_info(agent).await.unwrap().breaker, BreakerState::Open);
    // A breaker trip does not change lifecycle status.
    assert_eq!(
        h.coord.agent_info(agent).await.unwrap().agent.status,
        AgentStatus::Idle
    );
    assert_eq!(
        h.coord.assign_next().await.unwrap(),
        AssignmentOutcome::NoCapacity { task: Some(t1) }
    );

    h.clock.advance_secs(59);
    h.coord.heartbeat(agent).unwrap();
    assert!(matches!(
        h.coord.assign_next().await.unwrap(),
        AssignmentOutcome::NoCapacity { .. }
    ));

    h.clock.advance_secs(1);
    let trial = assign(&h.coord).await;
    assert_eq!(h.coord.agent_info(agent).await.unwrap().breaker, BreakerState::HalfOpen);

    let t2 = h.coord.submit(Task::new("t2")).await.unwrap();
    assert_eq!(
        h.coord.assign_next().await.unwrap(),
        AssignmentOutcome::NoCapacity { task: Some(t2) }
    );

    h.coord
        .report_completion(agent, trial.task_id, TaskOutcome::success(json!(1)))
        .await
        .unwrap();
    assert_eq!(h.coord.agent_info(agent).await.unwrap().breaker, BreakerState::Closed);
    assert_eq!(assign(&h.coord).await.task_id, t2);
}

#[tokio::test]
async fn test_exhausted_retries_cascade_to_dependents() {
    let mut config = CoordinatorConfig::default();
    config.queue.max_retries = 1;
    let h = harness_with(config);
    let agent = h.coord.register_agent(worker("w", 100)).await.unwrap();
    let parent = Task::new("parent");
    let child = Task::new("child").depends_on(parent.id);
    let (parent_id, child_id) = (parent.id, child.id);
    h.coord.submit_all(vec![parent, child]).await.unwrap();

    assign(&h.coord).await;
    let disposition = h.coord.report_failure(agent, parent_id, "bad input").await.unwrap();
    assert_eq!(
        disposition,
        TaskDisposition::Failed {
            reason: "bad input".into(),
            retries: 1,
            cascaded: vec![child_id],
        }
    );
    assert!(matches!(
        h.coord.task(child_id).await.unwrap().status,
        TaskStatus::Failed { .. }
    ));
    assert!(matches!(
        h.coord.task_result(parent_id).await.unwrap_err(),
        FlotillaError::RetriesExhausted { .. }
    ));
    assert_eq!(h.coord.assign_next().await.unwrap(), AssignmentOutcome::NoWork);
}

#[tokio::test]
async fn test_heartbeat_timeout_requeues_and_retires_agent() {
    let h = harness();
    let silent = h.coord.register_agent(worker("silent", 100)).await.unwrap();
    let task = h.coord.submit(Task::new("work")).await.unwrap();
    assign(&h.coord).await;

    h.clock.advance_secs(31);
    let report = h.coord.sweep_health().await.unwrap();
    assert_eq!(report.unhealthy, vec![silent]);
    assert_eq!(report.requeued, vec![task]);
    assert_eq!(report.terminated, vec![silent]);
    assert!(h.coord.agent_info(silent).await.is_none());
    assert_eq!(*h.provisioner.decommissioned.lock(), vec![silent]);

    let t = h.coord.task(task).await.unwrap();
    assert_eq!(t.status, TaskStatus::Ready);
    assert_eq!(t.retry_count, 1);
    assert_eq!(h.coord.stats().await.reservations, 0);

    let fresh = h.coord.register_agent(worker("fresh", 100)).await.unwrap();
    assert_eq!(assign(&h.coord).await.agent_id, fresh);
    assert!(matches!(
        h.coord.heartbeat(silent).unwrap_err(),
        FlotillaError::UnknownAgent(_)
    ));
}

#[tokio::test]
async fn test_late_report_from_evicted_agent_is_ignored() {
    let h = harness();
    let evicted = h.coord.register_agent(worker("evicted", 100)).await.unwrap();
    let task = h
        .coord
        .submit(Task::new("work").with_requirement(ResourceVector::cpu_mem(60, 1)))
        .await
        .unwrap();
    assign(&h.coord).await;

    h.clock.advance_secs(31);
    let replacement = h.coord.register_agent(worker("replacement", 100)).await.unwrap();
    assert_eq!(h.coord.sweep_health().await.unwrap().unhealthy, vec![evicted]);
    let second = assign(&h.coord).await;
    assert_eq!((second.task_id, second.agent_id), (task, replacement));

    // The evicted agent was never stopped and reports afterwards.
    for outcome in [TaskOutcome::failure("lost"), TaskOutcome::success(json!("late"))] {
        let err = h.coord.report_completion(evicted, task, outcome).await.unwrap_err();
        assert!(matches!(err, FlotillaError::InvalidTransition { .. }));
    }

    let t = h.coord.task(task).await.unwrap();
    assert_eq!(t.status, TaskStatus::Running);
    assert_eq!(t.assigned_agent, Some(replacement));
    assert_eq!(t.retry_count, 1);
    assert_eq!(h.coord.in_flight(replacement).await.len(), 1);
    assert_eq!(h.coord.agent_info(replacement).await.unwrap().utilization, 60.0);
    assert_eq!(h.coord.agent_info(replacement).await.unwrap().breaker, BreakerState::Closed);

    h.coord
        .report_completion(replacement, task, TaskOutcome::success(json!("done")))
        .await
        .unwrap();
    assert_eq!(h.coord.task_result(task).await.unwrap(), Some(json!("done")));
}

#[tokio::test]
async fn test_heartbeats_keep_agent_alive() {
    let h = harness();
    let agent = h.coord.register_agent(worker("chatty", 100)).await.unwrap();
    for _ in 0..5 {
        h.clock.advance_secs(20);
        h.coord.heartbeat(agent).unwrap();
        assert!(h.coord.sweep_health().await.unwrap().unhealthy.is_empty());
    }
}

#[tokio::test]
async fn test_cancel_pending_and_running_tasks() {
    let h = harness();
    let agent = h.coord.register_agent(worker("w", 100)).await.unwrap();
    let running = h.coord.submit(Task::new("running").with_priority(9)).await.unwrap();
    let waiting = h.coord.submit(Task::new("waiting")).await.unwrap();
    assign(&h.coord).await;

    assert_eq!(
        h.coord.cancel_task(waiting).await.unwrap(),
        CancelOutcome::Cancelled { cascaded: vec![] }
    );
    assert_eq!(
        h.coord.cancel_task(running).await.unwrap(),
        CancelOutcome::Cancelling { agent: Some(agent) }
    );
    assert_eq!(*h.executor.cancelled.lock(), vec![(agent, running)]);
    assert_eq!(h.coord.in_flight(agent).await.len(), 1);

    let disposition = h
        .coord
        .report_completion(agent, running, TaskOutcome::Cancelled)
        .await
        .unwrap();
    assert_eq!(disposition, TaskDisposition::Cancelled { cascaded: vec![] });
    assert!(h.coord.in_flight(agent).await.is_empty());
    assert_eq!(h.coord.stats().await.queue.cancelled, 2);
}

// ---------------------------------------------------------------------------
// Scaling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_scale_down_drains_idle_agent_then_holds() {
    let h = harness();
    for i in 0..3 {
        h.coord.register_agent(worker(&format!("w{i}"), 100)).await.unwrap();
    }
    assert!(h.coord.evaluate_scaling().await.unwrap().is_none());

    h.clock.advance_secs(60);
    let outcome = h.coord.evaluate_scaling().await.unwrap().unwrap();
    assert_eq!(outcome.decision.delta, -1);
    assert_eq!(outcome.draining.len(), 1);
    assert_eq!(outcome.terminated, outcome.draining);
    assert_eq!(h.coord.agents().await.len(), 2);
    assert_eq!(*h.provisioner.decommissioned.lock(), outcome.terminated);

    assert!(h.coord.evaluate_scaling().await.unwrap().is_none());
}

#[tokio::test]
async fn test_busy_agent_drains_before_termination() {
    let h = harness();
    let busy = h.coord.register_agent(worker("busy", 100)).await.unwrap();
    h.coord.submit(Task::new("long")).await.unwrap();
    let a = assign(&h.coord).await;

    let decision = ScalingDecision {
        delta: -1,
        reason: "test".into(),
        metrics: ScalingMetrics {
            observed_at: h.coord.now(),
            system_utilization: 0.0,
            ready_tasks: 0,
            active_agents: 1,
        },
        issued_at: h.coord.now(),
        cooldown_until: h.coord.now(),
    };
    let outcome = h.coord.apply_scaling(decision).await.unwrap();
    assert_eq!(outcome.draining, vec![busy]);
    assert!(outcome.terminated.is_empty());
    assert_eq!(
        h.coord.agent_info(busy).await.unwrap().agent.status,
        AgentStatus::Draining
    );

    // Draining agents take no new work.
    h.coord.submit(Task::new("next")).await.unwrap();
    assert!(matches!(
        h.coord.assign_next().await.unwrap(),
        AssignmentOutcome::NoCapacity { .. }
    ));

    h.coord
        .report_completion(a.agent_id, a.task_id, TaskOutcome::success(json!(null)))
        .await
        .unwrap();
    assert!(h.coord.agent_info(busy).await.is_none());
    assert_eq!(*h.provisioner.decommissioned.lock(), vec![busy]);
}

#[tokio::test]
async fn test_below_minimum_provisions_agents() {
    let mut config = CoordinatorConfig::default();
    config.scaling.min_agents = 2;
    let h = harness_with(config);
    let outcome = h.coord.evaluate_scaling().await.unwrap().unwrap();
    assert_eq!(outcome.decision.delta, 2);
    assert_eq!(outcome.added.len(), 2);
    assert_eq!(h.coord.agents().await.len(), 2);
}

// ---------------------------------------------------------------------------
// Checkpoint and restore
// ---------------------------------------------------------------------------

/// Builds a coordinator with agents, a completed, a running and a waiting task.
async fn populated() -> (Harness, AgentId, TaskId, TaskId) {
    let h = harness();
    let agent = h
        .coord
        .register_agent(worker("w", 100).with_capability("rust").with_weight(3))
        .await
        .unwrap();
    h.coord.register_agent(worker("spare", 50)).await.unwrap();

    let done = Task::new("done").with_priority(5);
    let running = Task::new("running")
        .with_priority(4)
        .with_requirement(ResourceVector::cpu_mem(40, 10))
        .with_payload(json!({"path": "src/lib.rs"}));
    let waiting = Task::new("waiting").depends_on(running.id);
    let (done_id, running_id, waiting_id) = (done.id, running.id, waiting.id);
    h.coord.submit_all(vec![done, running, waiting]).await.unwrap();

    let first = assign(&h.coord).await;
    assert_eq!(first.task_id, done_id);
    h.clock.advance_secs(1);
    h.coord
        .report_completion(first.agent_id, done_id, TaskOutcome::success(json!({"lines": 10})))
        .await
        .unwrap();
    let second = assign(&h.coord).await;
    assert_eq!(second.task_id, running_id);
    (h, agent, running_id, waiting_id)
}

fn same_state(a: &CoordinatorSnapshot, b: &CoordinatorSnapshot) {
    assert_eq!(a.agents, b.agents);
    assert_eq!(a.tasks, b.tasks);
    assert_eq!(a.reservations, b.reservations);
    assert_eq!(a.breakers, b.breakers);
}

#[tokio::test]
async fn test_checkpoint_restore_round_trip_on_fresh_instance() {
    let (source, agent, running, waiting) = populated().await;
    let handle = source.coord.checkpoint(CheckpointTrigger::Manual).await.unwrap();
    assert_eq!(handle.version, 1);
    let before = source.coord.snapshot().await;

    let target = harness();
    let blob = source.store.load_latest().await.unwrap().unwrap();
    assert_eq!(target.coord.restore(&blob).await.unwrap(), 1);
    let after = target.coord.snapshot().await;
    same_state(&before, &after);

    // Liveness is not restored.
    assert!(target.coord.last_heartbeat(agent).is_none());
    let holder = target.coord.task(running).await.unwrap().assigned_agent.unwrap();
    target
        .coord
        .report_completion(holder, running, TaskOutcome::success(json!(2)))
        .await
        .unwrap();
    assert_eq!(
        target.coord.assign_next().await.unwrap(),
        AssignmentOutcome::NoCapacity {
            task: Some(waiting)
        }
    );
    target.coord.heartbeat(agent).unwrap();
    assert_eq!(assign(&target.coord).await.agent_id, agent);

    // Version numbering continues past the restored checkpoint.
    let next = target.coord.checkpoint(CheckpointTrigger::Manual).await.unwrap();
    assert_eq!(next.version, 2);
}

#[tokio::test]
async fn test_checkpoint_after_restoring_old_version_does_not_reuse_versions() {
    let (source, _, _, _) = populated().await;
    for expected in 1..=3 {
        let handle = source.coord.checkpoint(CheckpointTrigger::Manual).await.unwrap();
        assert_eq!(handle.version, expected);
    }

    let executor = Arc::new(RecordingExecutor::default());
    let recovered = MultiAgentCoordinator::builder(CoordinatorConfig::default(), executor)
        .with_store(source.store.clone())
        .build()
        .unwrap();
    assert_eq!(recovered.restore_version(1).await.unwrap(), 1);
    let next = recovered.checkpoint(CheckpointTrigger::Manual).await.unwrap();
    assert_eq!(next.version, 4);

    // The original holder of v1..v3 rolls back too and keeps counting upward.
    let old = source.store.load(2).await.unwrap().unwrap();
    source.coord.restore(&old).await.unwrap();
    let rolled_back = source.coord.checkpoint(CheckpointTrigger::Manual).await.unwrap();
    assert_eq!(rolled_back.version, 5);

    let versions: Vec<u64> = source
        .store
        .list()
        .await
        .unwrap()
        .iter()
        .map(|h| h.version)
        .collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    let latest = source.store.load_latest().await.unwrap().unwrap();
    assert_eq!(CheckpointBlob::from_bytes(&latest).unwrap().open().unwrap().version, 5);
}

#[tokio::test]
async fn test_restored_agents_time_out_without_heartbeat() {
    let (source, agent, running, _) = populated().await;
    source.coord.checkpoint(CheckpointTrigger::Manual).await.unwrap();
    let blob = source.store.load(1).await.unwrap().unwrap();

    let target = harness();
    target.coord.restore(&blob).await.unwrap();
    target.clock.advance_secs(31);
    let report = target.coord.sweep_health().await.unwrap();
    assert_eq!(report.unhealthy.len(), 2);
    assert!(report.unhealthy.contains(&agent));
    assert_eq!(report.requeued, vec![running]);
}

#[tokio::test]
async fn test_corrupted_blob_rejected_and_state_untouched() {
    let (source, _, _, _) = populated().await;
    source.coord.checkpoint(CheckpointTrigger::PreRiskOperation).await.unwrap();
    assert!(source.store.tamper(1, |bytes| {
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
    }));

    let target = harness();
    target.coord.register_agent(worker("live", 100)).await.unwrap();
    target.coord.submit(Task::new("live task")).await.unwrap();
    let before = target.coord.snapshot().await;

    let blob = source.store.load_latest().await.unwrap().unwrap();
    let err = target.coord.restore(&blob).await.unwrap_err();
    assert!(matches!(err, FlotillaError::IntegrityViolation(_)));
    same_state(&before, &target.coord.snapshot().await);
    assert_eq!(target.coord.last_checkpoint_version().await, 0);
}

#[tokio::test]
async fn test_inconsistent_snapshot_rejected() {
    let (source, agent, _, _) = populated().await;
    let mut snapshot = source.coord.snapshot().await;
    // Drop the agent's breaker so the registry no longer matches.
    snapshot.breakers.remove(&agent);
    let blob = CheckpointBlob::seal(&snapshot).unwrap().to_bytes().unwrap();

    let target = harness();
    let err = target.coord.restore(&blob).await.unwrap_err();
    assert!(matches!(err, FlotillaError::IntegrityViolation(_)));
    assert_eq!(target.coord.stats().await.agents, 0);
}

#[tokio::test]
async fn test_completion_count_requests_checkpoint() {
    let mut config = CoordinatorConfig::default();
    config.checkpoint.every_n_completions = 2;
    let h = harness_with(config);
    let agent = h.coord.register_agent(worker("w", 100)).await.unwrap();
    let handle = h.coord.spawn_background();
    let mut events = h.coord.subscribe();

    for i in 0..2 {
        let id = h.coord.submit(Task::new(format!("t{i}"))).await.unwrap();
        let mut assigned = false;
        for _ in 0..100 {
            if h.coord.task(id).await.unwrap().status == TaskStatus::Running {
                assigned = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(assigned);
        h.coord
            .report_completion(agent, id, TaskOutcome::success(json!(i)))
            .await
            .unwrap();
    }

    let mut trigger = None;
    for _ in 0..100 {
        match tokio::time::timeout(std::time::Duration::from_millis(50), events.recv()).await {
            Ok(Ok(CoordinatorEvent::CheckpointWritten { trigger: t, .. })) => {
                trigger = Some(t);
                break;
            }
            Ok(Ok(_)) | Err(_) => {}
            Ok(Err(_)) => break,
        }
    }
    assert_eq!(trigger, Some(CheckpointTrigger::TaskCount));
    handle.shutdown().await;
    assert_eq!(h.store.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_task_timestamps_and_pruning_follow_injected_clock() {
    let h = harness();
    let start = chrono::DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    h.clock.set(start);
    let agent = h.coord.register_agent(worker("w", 100)).await.unwrap();
    let task = h.coord.submit(Task::new("old")).await.unwrap();
    assert_eq!(h.coord.task(task).await.unwrap().created_at, start);

    assign(&h.coord).await;
    h.clock.advance_secs(2);
    h.coord
        .report_completion(agent, task, TaskOutcome::success(json!(null)))
        .await
        .unwrap();
    let done = h.coord.task(task).await.unwrap();
    assert_eq!(done.assigned_at, Some(start));
    assert_eq!(done.completed_at, Some(start + chrono::Duration::seconds(2)));

    assert_eq!(h.coord.prune_terminal(chrono::Duration::hours(1)).await, 0);
    h.clock.advance(chrono::Duration::days(1));
    assert_eq!(h.coord.prune_terminal(chrono::Duration::hours(1)).await, 1);
    assert!(h.coord.task(task).await.is_none());
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (source, agent, _, _) = populated().await;
    let executor = Arc::new(RecordingExecutor::default());
    let store = Arc::new(FileCheckpointStore::new(dir.path(), 5).await.unwrap());
    let writer = MultiAgentCoordinator::builder(CoordinatorConfig::default(), executor.clone())
        .with_store(store)
        .build()
        .unwrap();
    let blob = {
        source.coord.checkpoint(CheckpointTrigger::Manual).await.unwrap();
        source.store.load_latest().await.unwrap().unwrap()
    };
    writer.restore(&blob).await.unwrap();
    writer.checkpoint(CheckpointTrigger::Shutdown).await.unwrap();

    let reader = MultiAgentCoordinator::builder(CoordinatorConfig::default(), executor)
        .with_store(Arc::new(FileCheckpointStore::open_existing(dir.path())))
        .build()
        .unwrap();
    assert_eq!(reader.restore_latest().await.unwrap(), Some(2));
    assert!(reader.agent_info(agent).await.is_some());
    assert_eq!(reader.stats().await.queue.completed, 1);
}
