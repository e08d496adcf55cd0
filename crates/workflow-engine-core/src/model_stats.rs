// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-model health tracking for the smart router: EMA latency,
//! bounded latency reservoir, sliding success/failure window, and a
//! circuit breaker with adaptive cooldowns.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const LATENCY_RESERVOIR_CAP: usize = 1000;
const RECENT_WINDOW_CAP: usize = 50;
const EMA_ALPHA: f64 = 0.2;
const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
const CIRCUIT_RECOVERY_SECS: u64 = 60;
const CIRCUIT_HALF_OPEN_QUOTA: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Running health signal for a single model identifier. Timing fields
/// that gate scheduling decisions (cooldowns, circuit recovery) are kept
/// as `Instant`s and are not serialized; only the wall-clock shadow is
/// persisted, and on restore the monotonic deadline is recomputed from
/// the wall-clock remainder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStats {
    pub model: String,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub ema_latency_ms: f64,
    #[serde(skip)]
    latencies: VecDeque<f64>,
    #[serde(skip)]
    recent_results: VecDeque<bool>,
    pub circuit_state: CircuitState,
    pub half_open_successes: u32,
    #[serde(skip)]
    cooldown_until: Option<Instant>,
    pub cooldown_until_wall_secs_remaining: Option<f64>,
    pub last_success_wall: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip)]
    last_success_at: Option<Instant>,
    /// Independent circuit-breaker recovery timer, set whenever the circuit
    /// transitions to `Open`. Gates `is_circuit_available`'s `Open` arm;
    /// unrelated to the adaptive per-error-kind `cooldown_until`.
    #[serde(skip)]
    circuit_opened_at: Option<Instant>,
    pub circuit_opened_wall: Option<chrono::DateTime<chrono::Utc>>,
}

impl ModelStats {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            consecutive_failures: 0,
            ema_latency_ms: 0.0,
            latencies: VecDeque::new(),
            recent_results: VecDeque::new(),
            circuit_state: CircuitState::Closed,
            half_open_successes: 0,
            cooldown_until: None,
            cooldown_until_wall_secs_remaining: None,
            last_success_wall: None,
            last_success_at: None,
            circuit_opened_at: None,
            circuit_opened_wall: None,
        }
    }

    fn open_circuit(&mut self) {
        self.circuit_state = CircuitState::Open;
        self.circuit_opened_at = Some(Instant::now());
        self.circuit_opened_wall = Some(chrono::Utc::now());
    }

    pub fn record_success(&mut self, latency_ms: f64) {
        self.total_requests += 1;
        self.total_successes += 1;
        self.consecutive_failures = 0;
        self.record_latency(latency_ms);
        self.push_recent(true);
        self.last_success_wall = Some(chrono::Utc::now());
        self.last_success_at = Some(Instant::now());

        match self.circuit_state {
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= CIRCUIT_HALF_OPEN_QUOTA {
                    self.circuit_state = CircuitState::Closed;
                    self.half_open_successes = 0;
                }
            }
            CircuitState::Open => {
                self.circuit_state = CircuitState::HalfOpen;
                self.half_open_successes = 1;
            }
            CircuitState::Closed => {}
        }
    }

    pub fn record_failure(&mut self, cooldown: Duration) {
        self.total_requests += 1;
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.push_recent(false);
        self.set_cooldown(cooldown);

        if self.circuit_state == CircuitState::HalfOpen {
            self.half_open_successes = 0;
            self.open_circuit();
        } else if self.consecutive_failures >= CIRCUIT_FAILURE_THRESHOLD {
            self.open_circuit();
        }
    }

    fn record_latency(&mut self, latency_ms: f64) {
        if self.total_successes + self.total_failures <= 1 {
            self.ema_latency_ms = latency_ms;
        } else {
            self.ema_latency_ms = EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * self.ema_latency_ms;
        }
        self.latencies.push_back(latency_ms);
        if self.latencies.len() > LATENCY_RESERVOIR_CAP {
            self.latencies.pop_front();
        }
    }

    fn push_recent(&mut self, success: bool) {
        self.recent_results.push_back(success);
        if self.recent_results.len() > RECENT_WINDOW_CAP {
            self.recent_results.pop_front();
        }
    }

    pub fn set_cooldown(&mut self, duration: Duration) {
        self.cooldown_until = Some(Instant::now() + duration);
        self.cooldown_until_wall_secs_remaining = Some(duration.as_secs_f64());
    }

    pub fn is_in_cooldown(&self) -> bool {
        self.cooldown_until.map(|t| Instant::now() < t).unwrap_or(false)
    }

    pub fn cooldown_remaining(&self) -> Duration {
        match self.cooldown_until {
            Some(t) => t.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Recomputes a monotonic deadline from the persisted wall-clock
    /// remainder after deserialization; the remainder may already have
    /// elapsed, which clears the cooldown.
    pub fn rehydrate_cooldown(&mut self) {
        if let Some(remaining) = self.cooldown_until_wall_secs_remaining {
            if remaining > 0.0 {
                self.cooldown_until = Some(Instant::now() + Duration::from_secs_f64(remaining));
                return;
            }
        }
        self.cooldown_until = None;
    }

    /// Recomputes the monotonic circuit-open deadline from the persisted
    /// wall-clock timestamp after deserialization.
    pub fn rehydrate_circuit_timer(&mut self) {
        match self.circuit_opened_wall {
            Some(opened) => {
                let elapsed = (chrono::Utc::now() - opened)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                self.circuit_opened_at = Instant::now().checked_sub(elapsed);
            }
            None => self.circuit_opened_at = None,
        }
    }

    /// Per invariant I9: the first call is allowed strictly after
    /// `recovery_timeout` has elapsed since the circuit opened, independent
    /// of the adaptive per-error-kind cooldown.
    pub fn is_circuit_available(&self) -> bool {
        match self.circuit_state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => self
                .circuit_opened_at
                .map(|t| t.elapsed() >= Duration::from_secs(default_recovery_secs()))
                .unwrap_or(false),
        }
    }

    pub fn recent_success_rate(&self) -> f64 {
        if self.recent_results.is_empty() {
            return 1.0;
        }
        let successes = self.recent_results.iter().filter(|r| **r).count();
        successes as f64 / self.recent_results.len() as f64
    }

    pub fn percentiles(&self) -> LatencyPercentiles {
        if self.latencies.is_empty() {
            return LatencyPercentiles::default();
        }
        let mut sorted: Vec<f64> = self.latencies.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let pick = |q: f64| -> f64 {
            let idx = ((sorted.len() as f64 - 1.0) * q).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };
        LatencyPercentiles {
            p50: pick(0.50),
            p75: pick(0.75),
            p90: pick(0.90),
            p95: pick(0.95),
            p99: pick(0.99),
        }
    }

    pub fn age_of_last_success_secs(&self) -> f64 {
        match self.last_success_at {
            Some(t) => t.elapsed().as_secs_f64(),
            None => f64::MAX,
        }
    }

    /// Health-weighted score: recent success rate (0.6), latency
    /// headroom (0.2), and freshness of the last success (0.2).
    pub fn health_score(&self) -> f64 {
        let success_term = 0.6 * self.recent_success_rate();
        let latency_term = 0.2 * (1.0 - self.ema_latency_ms / 10_000.0).max(0.0);
        let freshness_term = 0.2 * (1.0 - self.age_of_last_success_secs() / 3600.0).max(0.0);
        success_term + latency_term + freshness_term
    }
}

pub fn default_recovery_secs() -> u64 {
    CIRCUIT_RECOVERY_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_opens_after_failure_threshold() {
        let mut stats = ModelStats::new("gpt");
        for _ in 0..CIRCUIT_FAILURE_THRESHOLD {
            stats.record_failure(Duration::from_secs(1));
        }
        assert_eq!(stats.circuit_state, CircuitState::Open);
        assert!(!stats.is_circuit_available());
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut stats = ModelStats::new("gpt");
        stats.record_failure(Duration::from_secs(1));
        stats.record_failure(Duration::from_secs(1));
        stats.record_success(100.0);
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[test]
    fn half_open_closes_after_quota_successes() {
        let mut stats = ModelStats::new("gpt");
        stats.circuit_state = CircuitState::Open;
        stats.cooldown_until = None;
        stats.circuit_opened_at = None;
        stats.record_success(50.0);
        assert_eq!(stats.circuit_state, CircuitState::HalfOpen);
        stats.record_success(50.0);
        assert_eq!(stats.circuit_state, CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_circuit() {
        let mut stats = ModelStats::new("gpt");
        stats.circuit_state = CircuitState::HalfOpen;
        stats.record_failure(Duration::from_secs(5));
        assert_eq!(stats.circuit_state, CircuitState::Open);
    }

    #[test]
    fn circuit_available_only_strictly_after_recovery_timeout() {
        let mut stats = ModelStats::new("gpt");
        for _ in 0..CIRCUIT_FAILURE_THRESHOLD {
            stats.record_failure(Duration::from_secs(600));
        }
        assert_eq!(stats.circuit_state, CircuitState::Open);
        assert!(!stats.is_circuit_available());

        // Adaptive cooldown still wide open, but the circuit timer is what gates now.
        assert!(stats.is_in_cooldown());
        stats.circuit_opened_at = Some(Instant::now() - Duration::from_secs(CIRCUIT_RECOVERY_SECS + 1));
        assert!(stats.is_circuit_available());
    }

    #[test]
    fn circuit_timer_rehydrates_from_wall_clock_remainder() {
        let mut stats = ModelStats::new("gpt");
        stats.record_failure(Duration::from_secs(1));
        stats.record_failure(Duration::from_secs(1));
        stats.record_failure(Duration::from_secs(1));
        stats.record_failure(Duration::from_secs(1));
        stats.record_failure(Duration::from_secs(1));
        assert_eq!(stats.circuit_state, CircuitState::Open);

        // Simulate a long time having passed in wall-clock terms while persisted.
        stats.circuit_opened_wall = Some(chrono::Utc::now() - chrono::Duration::seconds(120));
        stats.circuit_opened_at = None;
        stats.rehydrate_circuit_timer();
        assert!(stats.is_circuit_available());
    }

    #[test]
    fn health_score_is_bounded() {
        let mut stats = ModelStats::new("gpt");
        stats.record_success(10.0);
        let score = stats.health_score();
        assert!(score > 0.0 && score <= 1.0);
    }

    #[test]
    fn latency_reservoir_is_bounded() {
        let mut stats = ModelStats::new("gpt");
        for i in 0..(LATENCY_RESERVOIR_CAP + 100) {
            stats.record_latency(i as f64);
        }
        assert_eq!(stats.latencies.len(), LATENCY_RESERVOIR_CAP);
    }
}
