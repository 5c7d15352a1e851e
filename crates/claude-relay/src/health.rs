//! Per-entity circuit breaker driving provider admission.
//!
//! Entities are addressed by name; the router tracks providers and, when
//! `health.per_key` is set, the proxy additionally tracks pool keys. Each
//! entity runs the closed / open / half_open machine: failures accumulate
//! while closed, the breaker opens at the threshold, and after the cool-down
//! a bounded number of probes decide between closing again and reopening.

use std::fmt;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::HealthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct EntityHealth {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    open_until: Option<Instant>,
    probes_remaining: u32,
}

impl Default for EntityHealth {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            open_until: None,
            probes_remaining: 0,
        }
    }
}

#[derive(Debug)]
pub struct HealthTracker {
    failure_threshold: u32,
    open_duration: Duration,
    half_open_probes: u32,
    entities: DashMap<String, EntityHealth>,
}

impl HealthTracker {
    /// The knobs are clamped to their documented floors regardless of what
    /// the config carried.
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            open_duration: config.open_duration().max(Duration::from_millis(1)),
            half_open_probes: config.half_open_probes.max(1),
            entities: DashMap::new(),
        }
    }

    /// Time-aware view of an entity's state, without admitting anything.
    pub fn state(&self, name: &str) -> CircuitState {
        self.state_at(name, Instant::now())
    }

    fn state_at(&self, name: &str, now: Instant) -> CircuitState {
        match self.entities.get(name) {
            None => CircuitState::Closed,
            Some(entity) => match entity.state {
                CircuitState::Open if entity.open_until.is_some_and(|until| now >= until) => {
                    CircuitState::HalfOpen
                }
                state => state,
            },
        }
    }

    /// Whether a route-selector should consider the entity at all. Probes
    /// are not consumed here; `try_admit` does that at dispatch time.
    pub fn is_available(&self, name: &str) -> bool {
        self.is_available_at(name, Instant::now())
    }

    fn is_available_at(&self, name: &str, now: Instant) -> bool {
        match self.entities.get(name) {
            None => true,
            Some(entity) => match entity.state {
                CircuitState::Closed => true,
                CircuitState::Open => entity.open_until.is_some_and(|until| now >= until),
                CircuitState::HalfOpen => entity.probes_remaining > 0,
            },
        }
    }

    /// Admit one request to the entity. Under `half_open` this consumes a
    /// probe; the dashmap shard lock makes admissions linearizable, so at
    /// most `half_open_probes` pass until the next transition.
    pub fn try_admit(&self, name: &str) -> bool {
        self.try_admit_at(name, Instant::now())
    }

    fn try_admit_at(&self, name: &str, now: Instant) -> bool {
        let mut entity = self.entities.entry(name.to_string()).or_default();
        match entity.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if entity.open_until.is_some_and(|until| now >= until) {
                    entity.state = CircuitState::HalfOpen;
                    entity.probes_remaining = self.half_open_probes;
                    entity.probes_remaining -= 1;
                    tracing::info!(entity = name, "circuit half-open, probing");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if entity.probes_remaining > 0 {
                    entity.probes_remaining -= 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, name: &str) {
        let mut entity = self.entities.entry(name.to_string()).or_default();
        match entity.state {
            CircuitState::Closed => {
                entity.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                tracing::info!(entity = name, "circuit closed after successful probe");
                *entity = EntityHealth::default();
            }
            // A success that lands after the breaker reopened does not
            // change the verdict of the probe that failed.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, name: &str) {
        self.record_failure_at(name, Instant::now());
    }

    fn record_failure_at(&self, name: &str, now: Instant) {
        let mut entity = self.entities.entry(name.to_string()).or_default();
        entity.last_failure = Some(now);
        match entity.state {
            CircuitState::Closed => {
                entity.consecutive_failures += 1;
                if entity.consecutive_failures >= self.failure_threshold {
                    entity.state = CircuitState::Open;
                    entity.open_until = Some(now + self.open_duration);
                    entity.probes_remaining = 0;
                    tracing::warn!(
                        entity = name,
                        failures = entity.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                entity.state = CircuitState::Open;
                entity.open_until = Some(now + self.open_duration);
                entity.probes_remaining = 0;
                tracing::warn!(entity = name, "probe failed, circuit reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// Consecutive failures recorded while closed; diagnostic only.
    pub fn failure_count(&self, name: &str) -> u32 {
        self.entities
            .get(name)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }

    /// Per-entity states for the diagnostics endpoint.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let now = Instant::now();
        self.entities
            .iter()
            .map(|entry| (entry.key().clone(), self.state_at(entry.key(), now)))
            .collect()
    }
}
