use flotilla_core::{FlotillaError, FlotillaResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level coordinator configuration, usually read from `flotilla.toml`.
///
/// Every field has a default so an empty document is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Name of the load-balancing strategy (see [`crate::balancer::StrategyRegistry`]).
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            queue: QueueConfig::default(),
            health: HealthConfig::default(),
            breaker: BreakerConfig::default(),
            scaling: ScalingConfig::default(),
            checkpoint: CheckpointConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Enqueues are rejected with `QueueFull` once this many tasks wait.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// A failed task is retried while its failure count stays below this value.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Agents silent for longer than this are declared unhealthy.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time spent `Open` before a `HalfOpen` trial is allowed.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Cool-down growth factor for each re-trip without a successful close.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            max_cooldown_secs: default_max_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// System utilization (percent) above which the fleet is considered hot.
    #[serde(default = "default_high_watermark")]
    pub high_watermark: f64,
    /// System utilization (percent) below which the fleet is considered cold.
    #[serde(default = "default_low_watermark")]
    pub low_watermark: f64,
    /// How long a condition must hold before it triggers a decision.
    #[serde(default = "default_observation_window_secs")]
    pub observation_window_secs: u64,
    #[serde(default = "default_scale_up_cooldown_secs")]
    pub scale_up_cooldown_secs: u64,
    #[serde(default = "default_scale_down_cooldown_secs")]
    pub scale_down_cooldown_secs: u64,
    #[serde(default = "default_min_agents")]
    pub min_agents: usize,
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    /// Agents added or removed per decision.
    #[serde(default = "default_step")]
    pub step: usize,
    /// Ready tasks per active agent above which the fleet counts as hot.
    #[serde(default = "default_backlog_per_agent")]
    pub backlog_per_agent: f64,
    #[serde(default = "default_evaluation_interval_secs")]
    pub evaluation_interval_secs: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
            observation_window_secs: default_observation_window_secs(),
            scale_up_cooldown_secs: default_scale_up_cooldown_secs(),
            scale_down_cooldown_secs: default_scale_down_cooldown_secs(),
            min_agents: default_min_agents(),
            max_agents: default_max_agents(),
            step: default_step(),
            backlog_per_agent: default_backlog_per_agent(),
            evaluation_interval_secs: default_evaluation_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Write a checkpoint after this many task completions (0 disables).
    #[serde(default = "default_every_n_completions")]
    pub every_n_completions: u64,
    /// Write a checkpoint at this interval (0 disables).
    #[serde(default = "default_checkpoint_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_checkpoint_dir")]
    pub directory: PathBuf,
    /// Number of checkpoint blobs retained on disk (0 keeps all).
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            every_n_completions: default_every_n_completions(),
            interval_secs: default_checkpoint_interval_secs(),
            directory: default_checkpoint_dir(),
            keep_last: default_keep_last(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Fallback poll interval of the assignment loop.
    #[serde(default = "default_assignment_interval_ms")]
    pub assignment_interval_ms: u64,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            assignment_interval_ms: default_assignment_interval_ms(),
            metrics_interval_secs: default_metrics_interval_secs(),
        }
    }
}

fn default_strategy() -> String {
    "least_loaded".to_string()
}
fn default_max_pending() -> usize {
    10_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_heartbeat_timeout_secs() -> u64 {
    30
}
fn default_sweep_interval_ms() -> u64 {
    1_000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_secs() -> u64 {
    60
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_cooldown_secs() -> u64 {
    900
}
fn default_high_watermark() -> f64 {
    80.0
}
fn default_low_watermark() -> f64 {
    20.0
}
fn default_observation_window_secs() -> u64 {
    60
}
fn default_scale_up_cooldown_secs() -> u64 {
    120
}
fn default_scale_down_cooldown_secs() -> u64 {
    300
}
fn default_min_agents() -> usize {
    1
}
fn default_max_agents() -> usize {
    32
}
fn default_step() -> usize {
    1
}
fn default_backlog_per_agent() -> f64 {
    4.0
}
fn default_evaluation_interval_secs() -> u64 {
    10
}
fn default_every_n_completions() -> u64 {
    50
}
fn default_checkpoint_interval_secs() -> u64 {
    300
}
fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("./data/checkpoints")
}
fn default_keep_last() -> usize {
    10
}
fn default_assignment_interval_ms() -> u64 {
    250
}
fn default_metrics_interval_secs() -> u64 {
    15
}

impl CoordinatorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> FlotillaResult<Self> {
        let config: CoordinatorConfig = toml::from_str(source)
            .map_err(|e| FlotillaError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> FlotillaResult<Self> {
        let path = path.as_ref();
        let source = tokio::fs::read_to_string(path).await.map_err(|e| {
            FlotillaError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    /// Reject internally inconsistent settings.
    pub fn validate(&self) -> FlotillaResult<()> {
        if self.strategy.trim().is_empty() {
            return Err(FlotillaError::Config("strategy must not be empty".into()));
        }
        if self.queue.max_pending == 0 {
            return Err(FlotillaError::Config(
                "queue.max_pending must be at least 1".into(),
            ));
        }
        if self.health.heartbeat_timeout_secs == 0 {
            return Err(FlotillaError::Config(
                "health.heartbeat_timeout_secs must be at least 1".into(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(FlotillaError::Config(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.breaker.backoff_multiplier < 1.0 {
            return Err(FlotillaError::Config(
                "breaker.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if self.breaker.max_cooldown_secs < self.breaker.cooldown_secs {
            return Err(FlotillaError::Config(
                "breaker.max_cooldown_secs must be >= breaker.cooldown_secs".into(),
            ));
        }
        let s = &self.scaling;
        if !(0.0..=100.0).contains(&s.low_watermark) || !(0.0..=100.0).contains(&s.high_watermark)
        {
            return Err(FlotillaError::Config(
                "scaling watermarks must be percentages in 0..=100".into(),
            ));
        }
        if s.low_watermark >= s.high_watermark {
            return Err(FlotillaError::Config(format!(
                "scaling.low_watermark ({}) must be below scaling.high_watermark ({})",
                s.low_watermark, s.high_watermark
            )));
        }
        if s.min_agents > s.max_agents {
            return Err(FlotillaError::Config(format!(
                "scaling.min_agents ({}) exceeds scaling.max_agents ({})",
                s.min_agents, s.max_agents
            )));
        }
        if s.step == 0 {
            return Err(FlotillaError::Config(
                "scaling.step must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
