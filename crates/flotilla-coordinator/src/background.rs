//! Background loops that keep a coordinator moving without a caller.
//!
//! Each loop is its own tokio task and stops when the shared watch channel
//! flips to `true`. The checkpoint loop writes one final `Shutdown`
//! checkpoint on the way out.

use crate::checkpoint::CheckpointTrigger;
use crate::coordinator::{AssignmentOutcome, MultiAgentCoordinator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Consecutive dispatch errors after which one assignment pass gives up.
const MAX_PASS_ERRORS: usize = 3;

/// Running background loops of one coordinator.
pub struct BackgroundHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BackgroundHandle {
    /// Number of loops started.
    pub fn loop_count(&self) -> usize {
        self.tasks.len()
    }

    /// Signal every loop to stop and wait for them, including the final
    /// checkpoint.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background loop panicked");
            }
        }
        info!("Background loops stopped");
    }
}

fn ticker(period: Duration) -> Interval {
    // The first tick is one period out, not immediate.
    let mut tick = tokio::time::interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}

async fn maybe_tick(tick: &mut Option<Interval>) {
    match tick {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl MultiAgentCoordinator {
    /// Start the assignment, health, scaling, checkpoint and metrics loops.
    pub fn spawn_background(self: &Arc<Self>) -> BackgroundHandle {
        let (shutdown, _) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(assignment_loop(Arc::clone(self), shutdown.subscribe())),
            tokio::spawn(health_loop(Arc::clone(self), shutdown.subscribe())),
            tokio::spawn(scaling_loop(Arc::clone(self), shutdown.subscribe())),
            tokio::spawn(checkpoint_loop(Arc::clone(self), shutdown.subscribe())),
            tokio::spawn(metrics_loop(Arc::clone(self), shutdown.subscribe())),
        ];
        info!(loops = tasks.len(), "Background loops started");
        BackgroundHandle { shutdown, tasks }
    }

    /// Assign ready tasks until the queue is empty or no agent can take more.
    pub async fn drain_assignments(&self) -> usize {
        let mut assigned = 0;
        let mut errors = 0;
        loop {
            match self.assign_next().await {
                Ok(AssignmentOutcome::Assigned(_)) => {
                    assigned += 1;
                    errors = 0;
                }
                Ok(AssignmentOutcome::NoWork | AssignmentOutcome::NoCapacity { .. }) => break,
                Err(e) => {
                    errors += 1;
                    debug!(error = %e, "Assignment attempt failed");
                    if errors >= MAX_PASS_ERRORS {
                        break;
                    }
                }
            }
        }
        assigned
    }
}

async fn assignment_loop(coord: Arc<MultiAgentCoordinator>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_millis(coord.config().runtime.assignment_interval_ms.max(1));
    let mut tick = ticker(period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = coord.work_available.notified() => {}
            _ = tick.tick() => {}
        }
        let assigned = coord.drain_assignments().await;
        if assigned > 0 {
            debug!(assigned, "Assignment pass finished");
        }
    }
}

async fn health_loop(coord: Arc<MultiAgentCoordinator>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_millis(coord.config().health.sweep_interval_ms.max(1));
    let mut tick = ticker(period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                match coord.sweep_health().await {
                    Ok(report) if !report.unhealthy.is_empty() => info!(
                        unhealthy = report.unhealthy.len(),
                        requeued = report.requeued.len(),
                        failed = report.failed.len(),
                        "Health sweep evicted agents"
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Health sweep failed"),
                }
            }
        }
    }
}

async fn scaling_loop(coord: Arc<MultiAgentCoordinator>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(coord.config().scaling.evaluation_interval_secs.max(1));
    let mut tick = ticker(period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                if let Err(e) = coord.evaluate_scaling().await {
                    warn!(error = %e, "Scaling evaluation failed");
                }
            }
        }
    }
}

async fn checkpoint_loop(coord: Arc<MultiAgentCoordinator>, mut shutdown: watch::Receiver<bool>) {
    let secs = coord.config().checkpoint.interval_secs;
    let mut tick = (secs > 0).then(|| ticker(Duration::from_secs(secs)));
    loop {
        let trigger = tokio::select! {
            _ = shutdown.changed() => break,
            _ = coord.checkpoint_requested.notified() => match coord.take_checkpoint_request() {
                Some(trigger) => trigger,
                None => continue,
            },
            _ = maybe_tick(&mut tick) => CheckpointTrigger::Interval,
        };
        if let Err(e) = coord.checkpoint(trigger).await {
            error!(trigger = %trigger, error = %e, "Checkpoint failed");
        }
    }
    if let Err(e) = coord.checkpoint(CheckpointTrigger::Shutdown).await {
        error!(error = %e, "Final checkpoint failed");
    }
}

async fn metrics_loop(coord: Arc<MultiAgentCoordinator>, mut shutdown: watch::Receiver<bool>) {
    let secs = coord.config().runtime.metrics_interval_secs;
    let mut tick = (secs > 0).then(|| ticker(Duration::from_secs(secs)));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = maybe_tick(&mut tick) => coord.emit_metrics().await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
    use crate::config::CoordinatorConfig;
    use crate::executor::AgentExecutor;
    use crate::types::{AgentDescriptor, ResourceVector, Task, TaskStatus};
    use async_trait::async_trait;
    use flotilla_core::{AgentId, FlotillaResult};

    struct Accept;

    #[async_trait]
    impl AgentExecutor for Accept {
        async fn dispatch(&self, _agent: AgentId, _task: &Task) -> FlotillaResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_loops_assign_and_checkpoint_on_shutdown() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut config = CoordinatorConfig::default();
        config.runtime.assignment_interval_ms = 10;
        let coord = Arc::new(
            MultiAgentCoordinator::builder(config, Arc::new(Accept))
                .with_store(store.clone())
                .build()
                .unwrap(),
        );
        let handle = coord.spawn_background();
        assert_eq!(handle.loop_count(), 5);

        coord
            .register_agent(AgentDescriptor::new("w", ResourceVector::cpu_mem(10, 10)))
            .await
            .unwrap();
        let task = coord.submit(Task::new("t")).await.unwrap();

        let mut running = false;
        for _ in 0..100 {
            if coord.task(task).await.unwrap().status == TaskStatus::Running {
                running = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(running);

        handle.shutdown().await;
        let stored = store.list().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(coord.last_checkpoint_version().await, 1);
    }

    #[tokio::test]
    async fn test_drain_assignments_stops_without_agents() {
        let coord = MultiAgentCoordinator::builder(CoordinatorConfig::default(), Arc::new(Accept))
            .build()
            .unwrap();
        coord.submit(Task::new("a")).await.unwrap();
        assert_eq!(coord.drain_assignments().await, 0);
    }
}
