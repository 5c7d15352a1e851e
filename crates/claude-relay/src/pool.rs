//! Rate-limit-aware API key pool.
//!
//! Each provider with multiple keys gets a pool; selection filters out
//! keys over any of their per-minute limits, prefers the highest priority
//! class, and applies the configured strategy within that class. Limits
//! are evaluated against a continuous one-minute sliding window, never
//! bucketed resets.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use crate::config::{KeyConfig, PoolStrategy, ProviderConfig};
use crate::error::{Error, Result};

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Limits {
    rpm: u32,
    input_tpm: u64,
    output_tpm: u64,
}

#[derive(Debug, Clone, Copy)]
struct UsageEntry {
    at: Instant,
    input_tokens: u64,
    output_tokens: u64,
}

/// Current window totals for one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowUsage {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug)]
pub struct PooledKey {
    /// Position in the provider's key list; stable for the life of a
    /// config snapshot and safe to log, unlike the secret.
    pub index: usize,
    pub secret: String,
    pub priority: u8,
    pub weight: u32,
    limits: Limits,
    /// Lifetime request counter, monotonic.
    requests: AtomicU64,
    window: Mutex<VecDeque<UsageEntry>>,
}

impl PooledKey {
    fn from_config(index: usize, config: &KeyConfig) -> Self {
        Self {
            index,
            secret: config.secret.clone(),
            priority: config.priority,
            weight: config.weight,
            limits: Limits {
                rpm: config.rpm,
                input_tpm: config.effective_input_tpm(),
                output_tpm: config.effective_output_tpm(),
            },
            requests: AtomicU64::new(0),
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Record observed usage for one completed response.
    pub fn record(&self, input_tokens: u64, output_tokens: u64) {
        self.record_at(Instant::now(), input_tokens, output_tokens);
    }

    fn record_at(&self, at: Instant, input_tokens: u64, output_tokens: u64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.window.lock().push_back(UsageEntry {
            at,
            input_tokens,
            output_tokens,
        });
    }

    pub fn total_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn window_usage(&self) -> WindowUsage {
        self.usage_at(Instant::now())
    }

    fn usage_at(&self, now: Instant) -> WindowUsage {
        let mut window = self.window.lock();
        while let Some(front) = window.front() {
            if now.duration_since(front.at) >= WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        let mut usage = WindowUsage::default();
        for entry in window.iter() {
            usage.requests += 1;
            usage.input_tokens += entry.input_tokens;
            usage.output_tokens += entry.output_tokens;
        }
        usage
    }

    /// A zero limit means unbounded.
    fn within_limits(&self, now: Instant) -> bool {
        let usage = self.usage_at(now);
        if self.limits.rpm > 0 && usage.requests >= u64::from(self.limits.rpm) {
            return false;
        }
        if self.limits.input_tpm > 0 && usage.input_tokens >= self.limits.input_tpm {
            return false;
        }
        if self.limits.output_tpm > 0 && usage.output_tokens >= self.limits.output_tpm {
            return false;
        }
        true
    }
}

#[derive(Debug)]
pub struct KeyPool {
    keys: Vec<Arc<PooledKey>>,
    strategy: PoolStrategy,
    cursor: AtomicUsize,
}

impl KeyPool {
    pub fn from_config(config: &ProviderConfig) -> Option<Self> {
        if config.keys.is_empty() {
            return None;
        }
        Some(Self {
            keys: config
                .keys
                .iter()
                .enumerate()
                .map(|(idx, k)| Arc::new(PooledKey::from_config(idx, k)))
                .collect(),
            strategy: config.pool.strategy,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[Arc<PooledKey>] {
        &self.keys
    }

    /// Pick a key for the next request, or fail fast with a rate-limit
    /// error when every key is saturated.
    pub fn select(&self) -> Result<Arc<PooledKey>> {
        self.select_at(Instant::now())
    }

    fn select_at(&self, now: Instant) -> Result<Arc<PooledKey>> {
        let available: Vec<&Arc<PooledKey>> = self
            .keys
            .iter()
            .filter(|key| key.within_limits(now))
            .collect();
        if available.is_empty() {
            return Err(Error::RateLimited(format!(
                "all {} pool keys are over their per-minute limits",
                self.keys.len()
            )));
        }

        let top_priority = available.iter().map(|k| k.priority).max().unwrap_or(0);
        let class: Vec<&Arc<PooledKey>> = available
            .into_iter()
            .filter(|k| k.priority == top_priority)
            .collect();

        let chosen = match self.strategy {
            PoolStrategy::LeastLoaded => class
                .iter()
                .enumerate()
                .min_by_key(|(idx, key)| {
                    (key.usage_at(now).requests, std::cmp::Reverse(key.weight), *idx)
                })
                .map(|(_, key)| *key)
                .expect("non-empty class"),
            PoolStrategy::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % class.len();
                class[idx]
            }
            PoolStrategy::Random => {
                let idx = rand::thread_rng().gen_range(0..class.len());
                class[idx]
            }
            PoolStrategy::Weighted => {
                let weights: Vec<u64> = class.iter().map(|k| u64::from(k.weight.max(1))).collect();
                class[weighted_index(&weights)]
            }
        };
        Ok(Arc::clone(chosen))
    }
}

/// Draw an index with probability proportional to its weight.
fn weighted_index(weights: &[u64]) -> usize {
    let total: u64 = weights.iter().sum();
    let mut draw = rand::thread_rng().gen_range(0..total);
    for (idx, weight) in weights.iter().enumerate() {
        if draw < *weight {
            return idx;
        }
        draw -= weight;
    }
    weights.len() - 1
}
