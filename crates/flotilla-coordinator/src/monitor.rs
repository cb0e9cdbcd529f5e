use crate::checkpoint::CheckpointTrigger;
use crate::circuit_breaker::BreakerTransition;
use crate::scaling::ScalingDecision;
use crate::task_queue::QueueStats;
use crate::types::AgentStatus;
use chrono::{DateTime, Utc};
use flotilla_core::{AgentId, TaskId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// A metric sample handed to a [`MetricsSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum MetricsEvent {
    QueueDepth {
        pending: usize,
        ready: usize,
        in_flight: usize,
    },
    AgentUtilization {
        agent_id: AgentId,
        percent: f64,
        in_flight: usize,
    },
    SystemUtilization {
        percent: f64,
        active_agents: usize,
    },
    BreakerTransition {
        agent_id: AgentId,
        transition: BreakerTransition,
    },
    ScalingDecision {
        decision: ScalingDecision,
    },
    CheckpointWritten {
        version: u64,
        trigger: CheckpointTrigger,
        bytes: usize,
    },
}

/// Destination for operational metrics. Format and transport belong to the
/// implementation.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricsEvent);
}

/// Emits every metric as a structured tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record(&self, event: MetricsEvent) {
        match event {
            MetricsEvent::QueueDepth {
                pending,
                ready,
                in_flight,
            } => info!(target: "flotilla::metrics", pending, ready, in_flight, "queue_depth"),
            MetricsEvent::AgentUtilization {
                agent_id,
                percent,
                in_flight,
            } => info!(
                target: "flotilla::metrics",
                agent_id = %agent_id,
                percent,
                in_flight,
                "agent_utilization"
            ),
            MetricsEvent::SystemUtilization {
                percent,
                active_agents,
            } => info!(target: "flotilla::metrics", percent, active_agents, "system_utilization"),
            MetricsEvent::BreakerTransition {
                agent_id,
                transition,
            } => info!(
                target: "flotilla::metrics",
                agent_id = %agent_id,
                from = %transition.from,
                to = %transition.to,
                "breaker_transition"
            ),
            MetricsEvent::ScalingDecision { decision } => info!(
                target: "flotilla::metrics",
                delta = decision.delta,
                reason = %decision.reason,
                "scaling_decision"
            ),
            MetricsEvent::CheckpointWritten {
                version,
                trigger,
                bytes,
            } => info!(
                target: "flotilla::metrics",
                version,
                trigger = %trigger,
                bytes,
                "checkpoint_written"
            ),
        }
    }
}

/// Keeps every metric in memory.
#[derive(Debug, Default)]
pub struct RecordingMetricsSink {
    events: Mutex<Vec<MetricsEvent>>,
}

impl RecordingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricsEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Breaker transitions recorded so far, in order.
    pub fn breaker_transitions(&self) -> Vec<(AgentId, BreakerTransition)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                MetricsEvent::BreakerTransition {
                    agent_id,
                    transition,
                } => Some((*agent_id, *transition)),
                _ => None,
            })
            .collect()
    }

    /// Latest value of each gauge plus counts of discrete events (for a dashboard).
    pub fn to_json(&self) -> serde_json::Value {
        let events = self.events.lock();
        let mut queue = serde_json::Value::Null;
        let mut system = serde_json::Value::Null;
        let mut agents: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        let mut breaker_transitions = 0usize;
        let mut scaling_decisions = 0usize;
        let mut last_checkpoint = serde_json::Value::Null;
        for event in events.iter() {
            match event {
                MetricsEvent::QueueDepth {
                    pending,
                    ready,
                    in_flight,
                } => {
                    queue = serde_json::json!({
                        "pending": pending,
                        "ready": ready,
                        "in_flight": in_flight,
                    });
                }
                MetricsEvent::AgentUtilization {
                    agent_id,
                    percent,
                    in_flight,
                } => {
                    agents.insert(
                        agent_id.to_string(),
                        serde_json::json!({ "percent": percent, "in_flight": in_flight }),
                    );
                }
                MetricsEvent::SystemUtilization {
                    percent,
                    active_agents,
                } => {
                    system = serde_json::json!({
                        "percent": percent,
                        "active_agents": active_agents,
                    });
                }
                MetricsEvent::BreakerTransition { .. } => breaker_transitions += 1,
                MetricsEvent::ScalingDecision { .. } => scaling_decisions += 1,
                MetricsEvent::CheckpointWritten {
                    version, trigger, ..
                } => {
                    last_checkpoint = serde_json::json!({ "version": version, "trigger": trigger });
                }
            }
        }
        serde_json::json!({
            "queue": queue,
            "system": system,
            "agents": agents,
            "breaker_transitions": breaker_transitions,
            "scaling_decisions": scaling_decisions,
            "last_checkpoint": last_checkpoint,
        })
    }
}

impl MetricsSink for RecordingMetricsSink {
    fn record(&self, event: MetricsEvent) {
        self.events.lock().push(event);
    }
}

/// Queue gauges derived from [`QueueStats`].
pub fn queue_depth(stats: &QueueStats) -> MetricsEvent {
    MetricsEvent::QueueDepth {
        pending: stats.pending,
        ready: stats.ready,
        in_flight: stats.in_flight,
    }
}

/// Lifecycle notifications published on the coordinator's broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    AgentRegistered {
        agent_id: AgentId,
        name: String,
    },
    AgentStatusChanged {
        agent_id: AgentId,
        from: AgentStatus,
        to: AgentStatus,
    },
    AgentRemoved {
        agent_id: AgentId,
    },
    TaskSubmitted {
        task_id: TaskId,
    },
    TaskAssigned {
        task_id: TaskId,
        agent_id: AgentId,
    },
    TaskCompleted {
        task_id: TaskId,
        agent_id: Option<AgentId>,
    },
    TaskRetrying {
        task_id: TaskId,
        retry_count: u32,
        reason: String,
    },
    TaskFailed {
        task_id: TaskId,
        reason: String,
    },
    TaskCancelled {
        task_id: TaskId,
    },
    BreakerTransition {
        agent_id: AgentId,
        transition: BreakerTransition,
    },
    ScalingDecision {
        decision: ScalingDecision,
    },
    CheckpointWritten {
        version: u64,
        trigger: CheckpointTrigger,
        at: DateTime<Utc>,
    },
    Restored {
        version: u64,
    },
}
