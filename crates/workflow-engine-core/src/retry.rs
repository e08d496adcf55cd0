// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry policy: backoff strategy, jitter, and error-kind based eligibility.

use crate::error::ErrorKind;
use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    None,
    Fixed,
    Linear,
    Exponential,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Fixed
    }
}

/// Per-step retry configuration, attached to `StepDefinition`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default)]
    pub retry_on: HashSet<String>,
    #[serde(default)]
    pub no_retry_on: HashSet<String>,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_jitter() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            strategy: BackoffStrategy::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            retry_on: HashSet::new(),
            no_retry_on: HashSet::new(),
        }
    }
}

impl RetryConfig {
    /// Whether `attempt` (1-indexed re-attempt count) is still within budget.
    pub fn attempts_remaining(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// `no_retry_on` is checked before `retry_on`; an empty `retry_on` means
    /// "all kinds not explicitly excluded are retryable by default".
    pub fn should_retry(&self, kind: &ErrorKind) -> bool {
        let kind_str = kind.to_string();
        if self.no_retry_on.contains(&kind_str) {
            return false;
        }
        if !self.retry_on.is_empty() {
            return self.retry_on.contains(&kind_str);
        }
        kind.is_retryable_by_default()
    }

    /// Base delay before jitter, per the backoff strategy. `attempt` is 1-indexed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64;
        let raw_ms = match self.strategy {
            BackoffStrategy::None => 0.0,
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * attempt as f64,
            BackoffStrategy::Exponential => base * 2f64.powi(attempt as i32 - 1),
        };
        let capped = raw_ms.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Applies uniform jitter in `[-jitter*delay, +jitter*delay]`, clamped to >= 0.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let base_ms = base.as_millis() as f64;
        let spread = base_ms * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let jittered = (base_ms + offset).max(0.0);
        Duration::from_millis(jittered as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_each_attempt() {
        let cfg = RetryConfig {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 100,
            max_delay_ms: 100_000,
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(cfg.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(cfg.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(cfg.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn delay_is_capped_at_max_delay() {
        let cfg = RetryConfig {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1000,
            max_delay_ms: 2500,
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(cfg.delay_for_attempt(5), Duration::from_millis(2500));
    }

    #[test]
    fn no_retry_on_takes_priority_over_retry_on() {
        let mut cfg = RetryConfig::default();
        cfg.retry_on.insert("Transient".to_string());
        cfg.no_retry_on.insert("Transient".to_string());
        assert!(!cfg.should_retry(&ErrorKind::Transient));
    }

    #[test]
    fn empty_retry_on_falls_back_to_default_retryability() {
        let cfg = RetryConfig::default();
        assert!(cfg.should_retry(&ErrorKind::Transient));
        assert!(!cfg.should_retry(&ErrorKind::ValidationError));
    }

    #[test]
    fn max_retries_zero_allows_a_single_attempt() {
        let cfg = RetryConfig {
            max_retries: 0,
            ..Default::default()
        };
        assert!(!cfg.attempts_remaining(1));
    }
}
