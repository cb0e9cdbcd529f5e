//! Per-agent circuit breaker.
//!
//! `Closed` lets every dispatch through. Reaching the consecutive-failure
//! threshold trips the breaker `Open`, refusing all dispatch until the
//! cool-down elapses. The breaker then moves to `HalfOpen` and grants exactly
//! one trial: success closes it, failure re-opens it with a longer cool-down.

use crate::config::BreakerConfig;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation
    Closed,
    /// Threshold exceeded, dispatch refused
    Open,
    /// Cool-down elapsed, one trial permitted
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// A state change, reported so callers can emit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerTransition {
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: DateTime<Utc>,
}

/// Breaker for one agent. Time is always supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    state: BreakerState,
    failure_threshold: u32,
    base_cooldown_secs: u64,
    backoff_multiplier: f64,
    max_cooldown_secs: u64,
    consecutive_failures: u32,
    last_transition: DateTime<Utc>,
    open_until: Option<DateTime<Utc>>,
    /// Re-trips from `HalfOpen` since the breaker last closed.
    reopen_streak: u32,
    trial_in_flight: bool,
    total_trips: u64,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig, now: DateTime<Utc>) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_threshold: config.failure_threshold.max(1),
            base_cooldown_secs: config.cooldown_secs,
            backoff_multiplier: config.backoff_multiplier.max(1.0),
            max_cooldown_secs: config.max_cooldown_secs.max(config.cooldown_secs),
            consecutive_failures: 0,
            last_transition: now,
            open_until: None,
            reopen_streak: 0,
            trial_in_flight: false,
            total_trips: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_transition(&self) -> DateTime<Utc> {
        self.last_transition
    }

    pub fn open_until(&self) -> Option<DateTime<Utc>> {
        self.open_until
    }

    pub fn total_trips(&self) -> u64 {
        self.total_trips
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Whether a dispatch could be attempted at `now`, without consuming the
    /// half-open trial.
    pub fn can_attempt(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => self.open_until.is_some_and(|until| now >= until),
            BreakerState::HalfOpen => !self.trial_in_flight,
        }
    }

    /// Move `Open` to `HalfOpen` once the cool-down has elapsed.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<BreakerTransition> {
        if self.state != BreakerState::Open {
            return None;
        }
        let until = self.open_until?;
        if now < until {
            return None;
        }
        self.trial_in_flight = false;
        self.open_until = None;
        info!("Circuit breaker half-open, allowing one trial");
        Some(self.transition(BreakerState::HalfOpen, now))
    }

    /// Claim permission to dispatch. In `HalfOpen` only the first caller wins.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        let _ = self.poll(now);
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Hand back an unused half-open trial (the dispatch never happened).
    pub fn release_trial(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.trial_in_flight = false;
        }
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) -> Option<BreakerTransition> {
        self.consecutive_failures = 0;
        match self.state {
            BreakerState::HalfOpen => {
                self.trial_in_flight = false;
                self.reopen_streak = 0;
                info!("Circuit breaker closed after successful trial");
                Some(self.transition(BreakerState::Closed, now))
            }
            _ => None,
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) -> Option<BreakerTransition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            BreakerState::Closed if self.consecutive_failures >= self.failure_threshold => {
                self.reopen_streak = 0;
                warn!(
                    failures = self.consecutive_failures,
                    "Circuit breaker tripped"
                );
                Some(self.trip(now))
            }
            BreakerState::HalfOpen => {
                self.trial_in_flight = false;
                self.reopen_streak = self.reopen_streak.saturating_add(1);
                warn!(streak = self.reopen_streak, "Half-open trial failed, re-opening");
                Some(self.trip(now))
            }
            _ => None,
        }
    }

    /// Force the breaker closed.
    pub fn reset(&mut self, now: DateTime<Utc>) -> Option<BreakerTransition> {
        self.consecutive_failures = 0;
        self.reopen_streak = 0;
        self.trial_in_flight = false;
        self.open_until = None;
        if self.state == BreakerState::Closed {
            None
        } else {
            Some(self.transition(BreakerState::Closed, now))
        }
    }

    /// Cool-down for the current re-open streak: base × multiplier^streak, capped.
    pub fn current_cooldown(&self) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(self.reopen_streak.min(i32::MAX as u32) as i32);
        let secs = (self.base_cooldown_secs as f64 * factor).min(self.max_cooldown_secs as f64);
        Duration::milliseconds((secs * 1000.0) as i64)
    }

    fn trip(&mut self, now: DateTime<Utc>) -> BreakerTransition {
        self.total_trips += 1;
        self.open_until = Some(now + self.current_cooldown());
        self.transition(BreakerState::Open, now)
    }

    fn transition(&mut self, to: BreakerState, at: DateTime<Utc>) -> BreakerTransition {
        let from = self.state;
        self.state = to;
        self.last_transition = at;
        BreakerTransition { from, to, at }
    }
}
