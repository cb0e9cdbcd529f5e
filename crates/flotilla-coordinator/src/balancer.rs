//! Pluggable load-balancing strategies.
//!
//! The coordinator hands a strategy the agents that already passed every
//! hard filter (status, liveness, breaker, capability, capacity) and the
//! strategy only decides which of them gets the task. Strategies are looked
//! up by name in a [`StrategyRegistry`], so a deployment switches policy
//! through configuration alone.

use crate::types::Task;
use flotilla_core::{AgentId, FlotillaError, FlotillaResult};
use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// An eligible agent as seen by a strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub agent_id: AgentId,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    /// Peak reserved share of capacity, in percent.
    pub utilization: f64,
    pub in_flight: usize,
    pub weight: u32,
    pub avg_latency_ms: Option<f64>,
}

/// Chooses one agent among eligible candidates.
pub trait LoadBalancingStrategy: Send + Sync {
    /// Name used to select the strategy from configuration.
    fn name(&self) -> &'static str;

    /// Pick an agent for `task`. `candidates` is never empty when called by
    /// the coordinator; returning `None` leaves the task unassigned.
    fn select(&self, candidates: &[Candidate], task: &Task) -> Option<AgentId>;
}

fn by_load(a: &Candidate, b: &Candidate) -> Ordering {
    a.utilization
        .total_cmp(&b.utilization)
        .then(a.in_flight.cmp(&b.in_flight))
        .then(a.agent_id.cmp(&b.agent_id))
}

/// Cycles through agents in id order.
#[derive(Default)]
pub struct RoundRobin {
    last: Mutex<Option<AgentId>>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, candidates: &[Candidate], _task: &Task) -> Option<AgentId> {
        let mut last = self.last.lock();
        let mut ids: Vec<AgentId> = candidates.iter().map(|c| c.agent_id).collect();
        ids.sort();
        let next = match *last {
            Some(prev) => ids
                .iter()
                .copied()
                .find(|id| *id > prev)
                .or_else(|| ids.first().copied()),
            None => ids.first().copied(),
        }?;
        *last = Some(next);
        Some(next)
    }
}

/// Lowest utilization first, then fewest in-flight tasks.
#[derive(Default)]
pub struct LeastLoaded;

impl LoadBalancingStrategy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least_loaded"
    }

    fn select(&self, candidates: &[Candidate], _task: &Task) -> Option<AgentId> {
        candidates.iter().min_by(|a, b| by_load(a, b)).map(|c| c.agent_id)
    }
}

/// Random choice weighted by agent weight and remaining headroom.
pub struct WeightedRandom {
    rng: Mutex<StdRng>,
}

impl WeightedRandom {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic sequence, for tests and reproducible simulations.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for WeightedRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingStrategy for WeightedRandom {
    fn name(&self) -> &'static str {
        "weighted_random"
    }

    fn select(&self, candidates: &[Candidate], task: &Task) -> Option<AgentId> {
        let weights: Vec<f64> = candidates
            .iter()
            .map(|c| {
                let headroom = (100.0 - c.utilization).max(1.0) / 100.0;
                f64::from(c.weight.max(1)) * headroom
            })
            .collect();
        match WeightedIndex::new(&weights) {
            Ok(dist) => {
                let idx = dist.sample(&mut *self.rng.lock());
                candidates.get(idx).map(|c| c.agent_id)
            }
            Err(_) => LeastLoaded.select(candidates, task),
        }
    }
}

/// Prefer the most specialised agent: the one offering the fewest
/// capabilities beyond what the task needs.
#[derive(Default)]
pub struct CapabilityAffinity;

impl LoadBalancingStrategy for CapabilityAffinity {
    fn name(&self) -> &'static str {
        "capability_affinity"
    }

    fn select(&self, candidates: &[Candidate], task: &Task) -> Option<AgentId> {
        let surplus = |c: &Candidate| {
            c.capabilities
                .iter()
                .filter(|cap| !task.required_capabilities.contains(*cap))
                .count()
        };
        candidates
            .iter()
            .min_by(|a, b| surplus(a).cmp(&surplus(b)).then_with(|| by_load(a, b)))
            .map(|c| c.agent_id)
    }
}

/// Lowest observed latency. Agents without samples are tried first so they
/// get measured.
#[derive(Default)]
pub struct LatencyBased;

impl LoadBalancingStrategy for LatencyBased {
    fn name(&self) -> &'static str {
        "latency_based"
    }

    fn select(&self, candidates: &[Candidate], _task: &Task) -> Option<AgentId> {
        candidates
            .iter()
            .min_by(|a, b| {
                let la = a.avg_latency_ms.unwrap_or(0.0);
                let lb = b.avg_latency_ms.unwrap_or(0.0);
                la.total_cmp(&lb).then_with(|| by_load(a, b))
            })
            .map(|c| c.agent_id)
    }
}

/// Strategies available by name.
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn LoadBalancingStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Registry holding the five built-in strategies.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RoundRobin::new()));
        registry.register(Arc::new(LeastLoaded));
        registry.register(Arc::new(WeightedRandom::new()));
        registry.register(Arc::new(CapabilityAffinity));
        registry.register(Arc::new(LatencyBased));
        registry
    }

    /// Add or replace a strategy under its own name.
    pub fn register(&mut self, strategy: Arc<dyn LoadBalancingStrategy>) {
        self.strategies
            .insert(strategy.name().to_string(), strategy);
    }

    pub fn get(&self, name: &str) -> FlotillaResult<Arc<dyn LoadBalancingStrategy>> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| FlotillaError::UnknownStrategy(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
