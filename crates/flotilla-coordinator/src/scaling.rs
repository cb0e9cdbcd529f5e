use crate::config::ScalingConfig;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Inputs to one scaling evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalingMetrics {
    pub observed_at: DateTime<Utc>,
    /// Fleet utilization in percent.
    pub system_utilization: f64,
    pub ready_tasks: usize,
    /// Agents that count towards capacity (registering, idle or busy).
    pub active_agents: usize,
}

/// A scale intent. Positive `delta` adds agents, negative removes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub delta: i32,
    pub reason: String,
    pub metrics: ScalingMetrics,
    pub issued_at: DateTime<Utc>,
    /// No further decision in the same direction before this instant.
    pub cooldown_until: DateTime<Utc>,
}

/// Turns utilization samples into scale intents.
///
/// A condition must hold for the whole observation window before it counts,
/// and each direction has its own cool-down. The manager never touches the
/// agent registry; the coordinator applies the decisions it returns.
pub struct ScalingManager {
    config: ScalingConfig,
    hot_since: Option<DateTime<Utc>>,
    cold_since: Option<DateTime<Utc>>,
    last_scale_up: Option<DateTime<Utc>>,
    last_scale_down: Option<DateTime<Utc>>,
    last_decision: Option<ScalingDecision>,
}

impl ScalingManager {
    pub fn new(config: ScalingConfig) -> Self {
        Self {
            config,
            hot_since: None,
            cold_since: None,
            last_scale_up: None,
            last_scale_down: None,
            last_decision: None,
        }
    }

    pub fn config(&self) -> &ScalingConfig {
        &self.config
    }

    pub fn last_decision(&self) -> Option<&ScalingDecision> {
        self.last_decision.as_ref()
    }

    /// Evaluate one sample. `None` means no action.
    pub fn evaluate(&mut self, metrics: &ScalingMetrics) -> Option<ScalingDecision> {
        let now = metrics.observed_at;
        let cfg = &self.config;
        let window = Duration::seconds(cfg.observation_window_secs as i64);
        let up_cooldown = Duration::seconds(cfg.scale_up_cooldown_secs as i64);
        let down_cooldown = Duration::seconds(cfg.scale_down_cooldown_secs as i64);

        let backlog_per_agent = if metrics.active_agents == 0 {
            if metrics.ready_tasks > 0 {
                f64::INFINITY
            } else {
                0.0
            }
        } else {
            metrics.ready_tasks as f64 / metrics.active_agents as f64
        };
        let hot = metrics.system_utilization > cfg.high_watermark
            || backlog_per_agent > cfg.backlog_per_agent;
        let cold = metrics.system_utilization < cfg.low_watermark && metrics.ready_tasks == 0;

        self.hot_since = if hot { self.hot_since.or(Some(now)) } else { None };
        self.cold_since = if cold { self.cold_since.or(Some(now)) } else { None };

        let up_ready = self.last_scale_up.map_or(true, |at| now - at >= up_cooldown);

        // The floor is restored without waiting for a window.
        if metrics.active_agents < cfg.min_agents {
            if !up_ready {
                return None;
            }
            let delta = (cfg.min_agents - metrics.active_agents) as i32;
            return Some(self.issue_up(delta, "below minimum fleet size".into(), metrics));
        }

        let sustained = |since: Option<DateTime<Utc>>| since.is_some_and(|s| now - s >= window);

        if sustained(self.hot_since) && up_ready {
            let room = cfg.max_agents.saturating_sub(metrics.active_agents);
            let delta = cfg.step.min(room);
            if delta == 0 {
                return None;
            }
            let reason = if metrics.system_utilization > cfg.high_watermark {
                format!(
                    "utilization {:.1}% above {:.1}% for {}s",
                    metrics.system_utilization, cfg.high_watermark, cfg.observation_window_secs
                )
            } else {
                format!(
                    "{} ready tasks across {} agents for {}s",
                    metrics.ready_tasks, metrics.active_agents, cfg.observation_window_secs
                )
            };
            return Some(self.issue_up(delta as i32, reason, metrics));
        }

        // Scale-down also waits out the scale-up cool-down so it never
        // reverses a fresh burst.
        let down_ready = self
            .last_scale_down
            .map_or(true, |at| now - at >= down_cooldown)
            && self.last_scale_up.map_or(true, |at| now - at >= down_cooldown);

        if sustained(self.cold_since) && down_ready {
            let room = metrics.active_agents.saturating_sub(cfg.min_agents);
            let delta = cfg.step.min(room);
            if delta == 0 {
                return None;
            }
            let reason = format!(
                "utilization {:.1}% below {:.1}% for {}s",
                metrics.system_utilization, cfg.low_watermark, cfg.observation_window_secs
            );
            let decision = ScalingDecision {
                delta: -(delta as i32),
                reason,
                metrics: *metrics,
                issued_at: now,
                cooldown_until: now + down_cooldown,
            };
            self.last_scale_down = Some(now);
            return Some(self.record(decision));
        }

        None
    }

    fn issue_up(&mut self, delta: i32, reason: String, metrics: &ScalingMetrics) -> ScalingDecision {
        let now = metrics.observed_at;
        let decision = ScalingDecision {
            delta,
            reason,
            metrics: *metrics,
            issued_at: now,
            cooldown_until: now + Duration::seconds(self.config.scale_up_cooldown_secs as i64),
        };
        self.last_scale_up = Some(now);
        self.record(decision)
    }

    fn record(&mut self, decision: ScalingDecision) -> ScalingDecision {
        info!(
            delta = decision.delta,
            reason = %decision.reason,
            "Scaling decision issued"
        );
        self.last_decision = Some(decision.clone());
        decision
    }
}
