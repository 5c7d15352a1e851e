//! Provider selection and transparent failover.
//!
//! The router is handed the configured providers with health flags already
//! applied and produces a candidate order per the configured strategy.
//! `select_with_retry` walks that order, moving to the next candidate only
//! when the previous attempt failed with a failover trigger, under an
//! overall wall-clock budget.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::{ProviderKind, RouteStrategy, RoutingConfig};
use crate::error::{Error, Result};

/// Router input: one row per configured provider, health flag included.
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub name: String,
    pub kind: ProviderKind,
    pub weight: u32,
    pub healthy: bool,
}

pub struct Router {
    strategy: RouteStrategy,
    default_provider: Option<String>,
    model_routes: HashMap<String, String>,
    failover_timeout: Duration,
    cursor: AtomicUsize,
    outstanding: DashMap<String, Arc<AtomicIsize>>,
}

impl Router {
    pub fn from_config(config: &RoutingConfig) -> Self {
        Self {
            strategy: config.strategy,
            default_provider: config.default_provider.clone(),
            model_routes: config.model_routes.clone(),
            failover_timeout: config.failover_timeout(),
            cursor: AtomicUsize::new(0),
            outstanding: DashMap::new(),
        }
    }

    pub fn strategy(&self) -> RouteStrategy {
        self.strategy
    }

    /// Candidate providers in attempt order for one request.
    pub fn candidate_order(
        &self,
        providers: &[ProviderInfo],
        model: Option<&str>,
    ) -> Result<Vec<ProviderInfo>> {
        if providers.is_empty() {
            return Err(Error::NoProviders);
        }
        let healthy: Vec<ProviderInfo> = providers.iter().filter(|p| p.healthy).cloned().collect();
        if healthy.is_empty() {
            return Err(Error::AllProvidersUnhealthy);
        }

        match self.strategy {
            RouteStrategy::Failover => Ok(healthy),
            RouteStrategy::RoundRobin => {
                let start = self.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
                let mut order = Vec::with_capacity(healthy.len());
                order.extend_from_slice(&healthy[start..]);
                order.extend_from_slice(&healthy[..start]);
                Ok(order)
            }
            RouteStrategy::WeightedRoundRobin | RouteStrategy::WeightedFailover => {
                Ok(weighted_permutation(healthy))
            }
            RouteStrategy::Shuffle => {
                let mut order = healthy;
                order.shuffle(&mut rand::thread_rng());
                Ok(order)
            }
            RouteStrategy::LeastLoaded => {
                let mut order = healthy;
                order.sort_by(|a, b| {
                    let load_a = self.outstanding_count(&a.name);
                    let load_b = self.outstanding_count(&b.name);
                    load_a
                        .cmp(&load_b)
                        .then(b.weight.cmp(&a.weight))
                        .then(a.name.cmp(&b.name))
                });
                Ok(order)
            }
            RouteStrategy::ModelBased => {
                let target = model
                    .and_then(|m| self.model_routes.get(m))
                    .or(self.default_provider.as_ref())
                    .ok_or_else(|| {
                        Error::InvalidRequest(
                            "no provider route for model and no default_provider".into(),
                        )
                    })?;
                if !providers.iter().any(|p| &p.name == target) {
                    return Err(Error::UnknownProvider(target.clone()));
                }
                let chosen = healthy
                    .into_iter()
                    .find(|p| &p.name == target)
                    .ok_or(Error::AllProvidersUnhealthy)?;
                Ok(vec![chosen])
            }
        }
    }

    /// Try candidates in order until one attempt returns without error.
    ///
    /// `attempt` runs at most once per candidate. A failover-trigger error
    /// moves on to the next candidate; anything else is returned as-is.
    /// The whole walk is bounded by the configured failover timeout.
    pub async fn select_with_retry<T, F, Fut>(
        &self,
        providers: &[ProviderInfo],
        model: Option<&str>,
        mut attempt: F,
    ) -> Result<(ProviderInfo, T)>
    where
        F: FnMut(ProviderInfo) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let order = self.candidate_order(providers, model)?;

        let walk = async {
            let total = order.len();
            let mut last_err = None;
            for (idx, provider) in order.into_iter().enumerate() {
                let _guard = self.attempt_guard(&provider.name);
                match attempt(provider.clone()).await {
                    Ok(value) => return Ok((provider, value)),
                    Err(err) => {
                        if err.is_failover_trigger() && idx + 1 < total {
                            tracing::debug!(
                                provider = %provider.name,
                                error = %err,
                                "attempt failed with failover trigger, trying next provider"
                            );
                            last_err = Some(err);
                            continue;
                        }
                        return Err(err);
                    }
                }
            }
            Err(last_err.unwrap_or(Error::AllProvidersUnhealthy))
        };

        tokio::time::timeout(self.failover_timeout, walk)
            .await
            .map_err(|_| Error::Timeout)?
    }

    fn outstanding_count(&self, name: &str) -> isize {
        self.outstanding
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn attempt_guard(&self, name: &str) -> AttemptGuard {
        let counter = self
            .outstanding
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicIsize::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::Relaxed);
        AttemptGuard { counter }
    }
}

struct AttemptGuard {
    counter: Arc<AtomicIsize>,
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Permutation by repeated weighted draws without replacement, so the
/// probability of landing in position 0 is `max(w, 1) / Σ max(w, 1)`.
fn weighted_permutation(mut pool: Vec<ProviderInfo>) -> Vec<ProviderInfo> {
    let mut rng = rand::thread_rng();
    let mut order = Vec::with_capacity(pool.len());
    while !pool.is_empty() {
        let total: u64 = pool.iter().map(|p| u64::from(p.weight.max(1))).sum();
        let mut draw = rng.gen_range(0..total);
        let mut chosen = pool.len() - 1;
        for (idx, provider) in pool.iter().enumerate() {
            let weight = u64::from(provider.weight.max(1));
            if draw < weight {
                chosen = idx;
                break;
            }
            draw -= weight;
        }
        order.push(pool.remove(chosen));
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn info(name: &str, weight: u32, healthy: bool) -> ProviderInfo {
        ProviderInfo {
            name: name.into(),
            kind: ProviderKind::Anthropic,
            weight,
            healthy,
        }
    }

    fn router(strategy: RouteStrategy) -> Router {
        Router::from_config(&RoutingConfig {
            strategy,
            default_provider: None,
            model_routes: HashMap::new(),
            failover_timeout_ms: 5_000,
        })
    }

    fn trigger_error(provider: &str) -> Error {
        Error::Provider {
            provider: provider.into(),
            source: anyhow::anyhow!("HTTP 503"),
            retry_after: None,
            http: Some(crate::error::UpstreamHttpError::new(
                503,
                http::HeaderMap::new(),
                String::new(),
            )),
        }
    }

    #[test]
    fn empty_provider_set_is_an_error() {
        let router = router(RouteStrategy::Failover);
        assert!(matches!(
            router.candidate_order(&[], None),
            Err(Error::NoProviders)
        ));
    }

    #[test]
    fn all_unhealthy_is_an_error() {
        let router = router(RouteStrategy::Failover);
        let providers = [info("a", 1, false), info("b", 1, false)];
        assert!(matches!(
            router.candidate_order(&providers, None),
            Err(Error::AllProvidersUnhealthy)
        ));
    }

    #[test]
    fn failover_keeps_config_order_and_skips_unhealthy() {
        let router = router(RouteStrategy::Failover);
        let providers = [info("a", 1, false), info("b", 1, true), info("c", 1, true)];
        let order = router.candidate_order(&providers, None).unwrap();
        let names: Vec<&str> = order.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["b", "c"]);
    }

    #[test]
    fn round_robin_advances_across_requests() {
        let router = router(RouteStrategy::RoundRobin);
        let providers = [info("a", 1, true), info("b", 1, true), info("c", 1, true)];
        let firsts: Vec<String> = (0..3)
            .map(|_| router.candidate_order(&providers, None).unwrap()[0].name.clone())
            .collect();
        assert_eq!(firsts, ["a", "b", "c"]);
    }

    #[test]
    fn shuffle_returns_a_full_permutation() {
        let router = router(RouteStrategy::Shuffle);
        let providers = [info("a", 1, true), info("b", 1, true), info("c", 1, true)];
        let order = router.candidate_order(&providers, None).unwrap();
        let mut names: Vec<&str> = order.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn weighted_position_zero_tracks_weights() {
        let router = router(RouteStrategy::WeightedFailover);
        let providers = [info("heavy", 9, true), info("light", 1, true)];
        let mut heavy_first = 0;
        for _ in 0..400 {
            if router.candidate_order(&providers, None).unwrap()[0].name == "heavy" {
                heavy_first += 1;
            }
        }
        // Expect ~90%; leave generous slack for the RNG.
        assert!(heavy_first > 300, "heavy led only {heavy_first}/400 draws");
    }

    #[test]
    fn least_loaded_breaks_ties_by_weight_then_name() {
        let router = router(RouteStrategy::LeastLoaded);
        let providers = [info("b", 1, true), info("a", 1, true), info("heavy", 5, true)];
        let order = router.candidate_order(&providers, None).unwrap();
        let names: Vec<&str> = order.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["heavy", "a", "b"]);
    }

    #[test]
    fn model_based_routes_by_mapping_with_default_fallback() {
        let mut model_routes = HashMap::new();
        model_routes.insert("claude-opus-4-6".to_string(), "primary".to_string());
        let router = Router::from_config(&RoutingConfig {
            strategy: RouteStrategy::ModelBased,
            default_provider: Some("fallback".into()),
            model_routes,
            failover_timeout_ms: 5_000,
        });
        let providers = [info("primary", 1, true), info("fallback", 1, true)];

        let mapped = router
            .candidate_order(&providers, Some("claude-opus-4-6"))
            .unwrap();
        assert_eq!(mapped[0].name, "primary");
        assert_eq!(mapped.len(), 1);

        let unmapped = router
            .candidate_order(&providers, Some("claude-haiku-4-5"))
            .unwrap();
        assert_eq!(unmapped[0].name, "fallback");
    }

    #[tokio::test]
    async fn retry_moves_past_trigger_errors() {
        let router = router(RouteStrategy::Failover);
        let providers = [info("a", 1, true), info("b", 1, true)];
        let (provider, value) = router
            .select_with_retry(&providers, None, |p| async move {
                if p.name == "a" {
                    Err(trigger_error("a"))
                } else {
                    Ok(200u16)
                }
            })
            .await
            .unwrap();
        assert_eq!(provider.name, "b");
        assert_eq!(value, 200);
    }

    #[tokio::test]
    async fn non_trigger_errors_stop_the_walk() {
        let router = router(RouteStrategy::Failover);
        let providers = [info("a", 1, true), info("b", 1, true)];
        let attempts = AtomicU32::new(0);
        let err = router
            .select_with_retry(&providers, None, |_p| {
                attempts.fetch_add(1, Ordering::Relaxed);
                async { Err::<u16, _>(Error::InvalidRequest("bad body".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn each_candidate_is_attempted_at_most_once() {
        let router = router(RouteStrategy::Failover);
        let providers = [info("a", 1, true), info("b", 1, true), info("c", 1, true)];
        let attempts = AtomicU32::new(0);
        let err = router
            .select_with_retry(&providers, None, |p| {
                attempts.fetch_add(1, Ordering::Relaxed);
                async move { Err::<u16, _>(trigger_error(&p.name)) }
            })
            .await
            .unwrap_err();
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
        assert!(matches!(err, Error::Provider { .. }));
    }

    #[tokio::test]
    async fn walk_is_bounded_by_failover_timeout() {
        let router = Router::from_config(&RoutingConfig {
            strategy: RouteStrategy::Failover,
            default_provider: None,
            model_routes: HashMap::new(),
            failover_timeout_ms: 20,
        });
        let providers = [info("slow", 1, true)];
        let err = router
            .select_with_retry(&providers, None, |_p| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(200u16)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }
}
