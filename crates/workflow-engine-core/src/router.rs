// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Smart model router: selects the healthiest available model for
//! a tier, recording outcomes back into per-model stats with adaptive
//! cooldowns.

use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::model_stats::ModelStats;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Capability tier; higher tiers get access to more capable (and
/// typically slower/costlier) models. Tier 0 is reserved for
/// deterministic, non-LLM steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModelTier(pub u8);

impl ModelTier {
    pub const TIER0: ModelTier = ModelTier(0);
}

/// Ordered list of models to try for a tier, most-preferred first.
#[derive(Debug, Clone, Default)]
pub struct FallbackChain {
    pub models: Vec<String>,
}

impl FallbackChain {
    pub fn new(models: Vec<String>) -> Self {
        Self { models }
    }
}

const BASE_FAILURE_COOLDOWN_SECS: u64 = 30;
const BASE_RATE_LIMIT_COOLDOWN_SECS: u64 = 120;
const BASE_TIMEOUT_COOLDOWN_SECS: u64 = 60;
const MAX_COOLDOWN_SECS: u64 = 600;

fn base_cooldown_for(kind: &ErrorKind) -> Duration {
    match kind {
        ErrorKind::RateLimit => Duration::from_secs(BASE_RATE_LIMIT_COOLDOWN_SECS),
        ErrorKind::Timeout | ErrorKind::TimeoutError => Duration::from_secs(BASE_TIMEOUT_COOLDOWN_SECS),
        _ => Duration::from_secs(BASE_FAILURE_COOLDOWN_SECS),
    }
}

/// Exponential backoff over the base cooldown, `1.5^min(n,5)`, capped at
/// ten minutes.
fn adaptive_cooldown(kind: &ErrorKind, consecutive_failures: u32) -> Duration {
    let base = base_cooldown_for(kind).as_secs_f64();
    let exponent = consecutive_failures.min(5) as f64;
    let scaled = base * 1.5_f64.powf(exponent);
    Duration::from_secs_f64(scaled.min(MAX_COOLDOWN_SECS as f64))
}

/// Routes requests to models within a tier, tracking health and
/// enforcing circuit breakers / cooldowns so a degraded model is
/// automatically skipped until it recovers.
pub struct SmartRouter {
    chains: RwLock<BTreeMap<u8, FallbackChain>>,
    stats: RwLock<BTreeMap<String, ModelStats>>,
}

impl Default for SmartRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl SmartRouter {
    pub fn new() -> Self {
        Self {
            chains: RwLock::new(BTreeMap::new()),
            stats: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn register_chain(&self, tier: ModelTier, chain: FallbackChain) {
        for model in &chain.models {
            self.stats.write().entry(model.clone()).or_insert_with(|| ModelStats::new(model.clone()));
        }
        self.chains.write().insert(tier.0, chain);
    }

    fn ensure_stats(&self, model: &str) {
        self.stats
            .write()
            .entry(model.to_string())
            .or_insert_with(|| ModelStats::new(model.to_string()));
    }

    /// Picks the best available model for `tier`: circuit must be closed
    /// or half-open, and not presently cooling down, ranked by health
    /// score descending, ties broken by chain order.
    pub fn get_model_for_tier(&self, tier: ModelTier) -> Result<String> {
        let chains = self.chains.read();
        let chain = chains.get(&tier.0).ok_or_else(|| OrchestratorError::AllModelsFailed {
            tier: tier.0,
            tried: Vec::new(),
        })?;

        let stats = self.stats.read();
        let mut best: Option<(String, f64, usize)> = None;
        for (idx, model) in chain.models.iter().enumerate() {
            let available = stats
                .get(model)
                .map(|s| s.is_circuit_available() && !s.is_in_cooldown())
                .unwrap_or(true);
            if !available {
                continue;
            }
            let score = stats.get(model).map(|s| s.health_score()).unwrap_or(1.0);
            match &best {
                Some((_, best_score, _)) if *best_score >= score => {}
                _ => best = Some((model.clone(), score, idx)),
            }
        }

        best.map(|(model, _, _)| model).ok_or_else(|| OrchestratorError::AllModelsFailed {
            tier: tier.0,
            tried: chain.models.clone(),
        })
    }

    /// Same selection as [`Self::get_model_for_tier`], skipping anything in
    /// `excluded` — used by the LLM Step Factory's provider-fallback loop
    /// to avoid retrying a model already tried this turn.
    pub fn get_model_for_tier_excluding(
        &self,
        tier: ModelTier,
        excluded: &std::collections::HashSet<String>,
    ) -> Result<String> {
        let chains = self.chains.read();
        let chain = chains.get(&tier.0).ok_or_else(|| OrchestratorError::AllModelsFailed {
            tier: tier.0,
            tried: Vec::new(),
        })?;

        let stats = self.stats.read();
        let mut best: Option<(String, f64)> = None;
        for model in &chain.models {
            if excluded.contains(model) {
                continue;
            }
            let available = stats
                .get(model)
                .map(|s| s.is_circuit_available() && !s.is_in_cooldown())
                .unwrap_or(true);
            if !available {
                continue;
            }
            let score = stats.get(model).map(|s| s.health_score()).unwrap_or(1.0);
            match &best {
                Some((_, best_score)) if *best_score >= score => {}
                _ => best = Some((model.clone(), score)),
            }
        }

        best.map(|(model, _)| model).ok_or_else(|| OrchestratorError::AllModelsFailed {
            tier: tier.0,
            tried: excluded.iter().cloned().collect(),
        })
    }

    pub fn record_success(&self, model: &str, latency_ms: f64, _tokens_used: Option<u64>) {
        self.ensure_stats(model);
        let mut stats = self.stats.write();
        if let Some(s) = stats.get_mut(model) {
            s.record_success(latency_ms);
        }
        debug!(model, latency_ms, "router: recorded success");
    }

    pub fn record_failure(&self, model: &str, kind: ErrorKind) {
        self.ensure_stats(model);
        let mut stats = self.stats.write();
        if let Some(s) = stats.get_mut(model) {
            let cooldown = adaptive_cooldown(&kind, s.consecutive_failures + 1);
            s.record_failure(cooldown);
        }
        warn!(model, ?kind, "router: recorded failure");
    }

    pub fn record_timeout(&self, model: &str) {
        self.record_failure(model, ErrorKind::Timeout);
    }

    /// `retry_after_seconds`, when given by the provider, overrides the
    /// adaptive cooldown computation.
    pub fn record_rate_limit(&self, model: &str, retry_after_seconds: Option<u64>) {
        self.ensure_stats(model);
        let mut stats = self.stats.write();
        if let Some(s) = stats.get_mut(model) {
            let cooldown = match retry_after_seconds {
                Some(secs) => Duration::from_secs(secs),
                None => adaptive_cooldown(&ErrorKind::RateLimit, s.consecutive_failures + 1),
            };
            s.record_failure(cooldown);
        }
        warn!(model, ?retry_after_seconds, "router: recorded rate limit");
    }

    /// Diagnostic probe: would this model currently be selected, without
    /// recording anything. Carried from the Python router as a read-only
    /// health check.
    pub fn predict_availability(&self, model: &str) -> bool {
        self.stats
            .read()
            .get(model)
            .map(|s| s.is_circuit_available() && !s.is_in_cooldown())
            .unwrap_or(true)
    }

    pub fn stats_snapshot(&self) -> BTreeMap<String, ModelStats> {
        self.stats.read().clone()
    }

    /// Restores persisted stats, recomputing monotonic cooldown and circuit
    /// recovery deadlines from their wall-clock remainders.
    pub fn restore_stats(&self, mut restored: BTreeMap<String, ModelStats>) {
        for stat in restored.values_mut() {
            stat.rehydrate_cooldown();
            stat.rehydrate_circuit_timer();
        }
        *self.stats.write() = restored;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_only_registered_model() {
        let router = SmartRouter::new();
        router.register_chain(ModelTier(1), FallbackChain::new(vec!["a".to_string()]));
        assert_eq!(router.get_model_for_tier(ModelTier(1)).unwrap(), "a");
    }

    #[test]
    fn falls_back_past_a_circuit_broken_model() {
        let router = SmartRouter::new();
        router.register_chain(
            ModelTier(1),
            FallbackChain::new(vec!["a".to_string(), "b".to_string()]),
        );
        for _ in 0..10 {
            router.record_failure("a", ErrorKind::Transient);
        }
        assert_eq!(router.get_model_for_tier(ModelTier(1)).unwrap(), "b");
    }

    #[test]
    fn all_models_failed_when_nothing_available() {
        let router = SmartRouter::new();
        router.register_chain(ModelTier(1), FallbackChain::new(vec!["a".to_string()]));
        for _ in 0..10 {
            router.record_failure("a", ErrorKind::Transient);
        }
        let err = router.get_model_for_tier(ModelTier(1)).unwrap_err();
        assert!(matches!(err, OrchestratorError::AllModelsFailed { .. }));
    }

    #[test]
    fn excluding_a_model_skips_it_even_if_healthy() {
        let router = SmartRouter::new();
        router.register_chain(
            ModelTier(1),
            FallbackChain::new(vec!["a".to_string(), "b".to_string()]),
        );
        let mut excluded = std::collections::HashSet::new();
        excluded.insert("a".to_string());
        assert_eq!(router.get_model_for_tier_excluding(ModelTier(1), &excluded).unwrap(), "b");
    }

    #[test]
    fn rate_limit_override_sets_explicit_cooldown() {
        let router = SmartRouter::new();
        router.register_chain(ModelTier(1), FallbackChain::new(vec!["a".to_string()]));
        router.record_rate_limit("a", Some(5));
        let stats = router.stats_snapshot();
        assert!(stats["a"].is_in_cooldown());
    }
}
