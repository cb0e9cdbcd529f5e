//! Command implementations. Each returns the text to print.

use anyhow::Context;
use chrono::{DateTime, Utc};
use flotilla_coordinator::{
    BreakerState, CheckpointBlob, CheckpointStore, CoordinatorConfig, FileCheckpointStore,
    StrategyRegistry,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{debug, info};

/// Validate a configuration file and describe the effective settings.
pub async fn config_check(path: &Path) -> anyhow::Result<String> {
    let config = CoordinatorConfig::load(path)
        .await
        .with_context(|| format!("invalid configuration in '{}'", path.display()))?;
    let registry = StrategyRegistry::with_defaults();
    registry.get(&config.strategy).with_context(|| {
        format!(
            "available strategies: {}",
            registry.names().join(", ")
        )
    })?;
    info!(path = %path.display(), "Configuration is valid");

    let mut out = String::new();
    writeln!(out, "{}: ok", path.display())?;
    writeln!(out, "  strategy:          {}", config.strategy)?;
    writeln!(
        out,
        "  queue:             max_pending={} max_retries={}",
        config.queue.max_pending, config.queue.max_retries
    )?;
    writeln!(
        out,
        "  heartbeat timeout: {}s",
        config.health.heartbeat_timeout_secs
    )?;
    writeln!(
        out,
        "  breaker:           threshold={} cooldown={}s (x{}, max {}s)",
        config.breaker.failure_threshold,
        config.breaker.cooldown_secs,
        config.breaker.backoff_multiplier,
        config.breaker.max_cooldown_secs
    )?;
    writeln!(
        out,
        "  scaling:           {}..{} agents, watermarks {}%/{}%",
        config.scaling.min_agents,
        config.scaling.max_agents,
        config.scaling.low_watermark,
        config.scaling.high_watermark
    )?;
    write!(
        out,
        "  checkpoints:       {} (every {} completions, every {}s, keep {})",
        config.checkpoint.directory.display(),
        config.checkpoint.every_n_completions,
        config.checkpoint.interval_secs,
        config.checkpoint.keep_last
    )?;
    Ok(out)
}

/// List the checkpoints stored in a directory, oldest first.
pub async fn checkpoint_list(dir: &Path, json: bool) -> anyhow::Result<String> {
    let store = FileCheckpointStore::open_existing(dir);
    let handles = store
        .list()
        .await
        .with_context(|| format!("failed to list checkpoints in '{}'", dir.display()))?;
    debug!(count = handles.len(), "Listed checkpoints");

    if json {
        return Ok(serde_json::to_string_pretty(&handles)?);
    }
    if handles.is_empty() {
        return Ok(format!("No checkpoints in {}", dir.display()));
    }
    let mut out = String::new();
    for handle in &handles {
        writeln!(
            out,
            "{:>8}  {}  {}",
            handle.version,
            handle.timestamp.to_rfc3339(),
            handle.location
        )?;
    }
    write!(out, "Total: {} checkpoint(s)", handles.len())?;
    Ok(out)
}

/// What a verified checkpoint contains.
#[derive(Debug, Serialize)]
pub struct CheckpointSummary {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub trigger: String,
    pub agents: BTreeMap<String, usize>,
    pub tasks: BTreeMap<String, usize>,
    pub reservations: usize,
    pub open_breakers: usize,
}

/// Verify a checkpoint blob and summarize it.
pub fn summarize(bytes: &[u8]) -> anyhow::Result<CheckpointSummary> {
    let snapshot = CheckpointBlob::from_bytes(bytes)?.open()?;
    let mut agents = BTreeMap::new();
    for agent in &snapshot.agents {
        *agents.entry(agent.status.to_string()).or_insert(0) += 1;
    }
    let mut tasks = BTreeMap::new();
    for task in &snapshot.tasks {
        *tasks.entry(task.status.to_string()).or_insert(0) += 1;
    }
    Ok(CheckpointSummary {
        version: snapshot.version,
        created_at: snapshot.created_at,
        trigger: snapshot.trigger.to_string(),
        agents,
        tasks,
        reservations: snapshot.reservations.len(),
        open_breakers: snapshot
            .breakers
            .values()
            .filter(|b| b.state() != BreakerState::Closed)
            .count(),
    })
}

/// Verify a checkpoint file and print what it holds.
pub async fn checkpoint_inspect(path: &Path, json: bool) -> anyhow::Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    let summary =
        summarize(&bytes).with_context(|| format!("'{}' failed verification", path.display()))?;

    if json {
        return Ok(serde_json::to_string_pretty(&summary)?);
    }
    let counts = |m: &BTreeMap<String, usize>| {
        if m.is_empty() {
            "none".to_string()
        } else {
            m.iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(" ")
        }
    };
    let mut out = String::new();
    writeln!(out, "{}: integrity ok", path.display())?;
    writeln!(out, "  version:       {}", summary.version)?;
    writeln!(out, "  created:       {}", summary.created_at.to_rfc3339())?;
    writeln!(out, "  trigger:       {}", summary.trigger)?;
    writeln!(out, "  agents:        {}", counts(&summary.agents))?;
    writeln!(out, "  tasks:         {}", counts(&summary.tasks))?;
    writeln!(out, "  reservations:  {}", summary.reservations)?;
    write!(out, "  open breakers: {}", summary.open_breakers)?;
    Ok(out)
}
