// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provider rate-limit tracking: dual token buckets per provider,
//! response-header parsing, and cooldown resolution.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// A lazily-refilled token bucket. `capacity` tokens refill linearly
/// over one minute.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let refill_rate = self.capacity / 60.0;
        self.tokens = (self.tokens + elapsed * refill_rate).min(self.capacity);
        self.last_refill = Instant::now();
    }

    fn try_consume(&mut self, amount: f64) -> bool {
        self.refill();
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

struct ProviderBuckets {
    rpm: TokenBucket,
    tpm: TokenBucket,
}

/// Tracks per-provider request-per-minute and token-per-minute budgets,
/// and resolves provider-reported retry hints into concrete cooldowns.
pub struct RateLimitTracker {
    buckets: Mutex<BTreeMap<String, ProviderBuckets>>,
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn configure_provider(&self, provider: &str, rpm: f64, tpm: f64) {
        self.buckets.lock().insert(
            provider.to_string(),
            ProviderBuckets {
                rpm: TokenBucket::new(rpm),
                tpm: TokenBucket::new(tpm),
            },
        );
    }

    /// Consumes one request slot and `estimated_tokens` token budget. The
    /// rpm bucket is consumed first and is not refunded if the tpm bucket
    /// then rejects the request; see DESIGN.md.
    pub fn can_request(&self, provider: &str, estimated_tokens: f64) -> bool {
        let mut buckets = self.buckets.lock();
        match buckets.get_mut(provider) {
            Some(b) => b.rpm.try_consume(1.0) && b.tpm.try_consume(estimated_tokens),
            None => true,
        }
    }

    /// Parses an OpenAI-style duration string: `"6s"`, `"1m30s"`,
    /// `"500ms"`.
    pub fn parse_duration_string(s: &str) -> Option<Duration> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        if let Some(ms) = s.strip_suffix("ms") {
            return ms.parse::<f64>().ok().map(|v| Duration::from_secs_f64(v / 1000.0));
        }
        let mut total = 0.0_f64;
        let mut buf = String::new();
        for ch in s.chars() {
            if ch.is_ascii_digit() || ch == '.' {
                buf.push(ch);
            } else {
                let value: f64 = buf.parse().ok()?;
                buf.clear();
                match ch {
                    'm' => total += value * 60.0,
                    's' => total += value,
                    'h' => total += value * 3600.0,
                    _ => return None,
                }
            }
        }
        if !buf.is_empty() {
            return None;
        }
        Some(Duration::from_secs_f64(total))
    }

    /// Retry-After is sanity-bounded to `(0, 3600]` seconds.
    pub fn parse_retry_after(value: &str) -> Option<Duration> {
        let secs: f64 = value.trim().parse().ok()?;
        if secs > 0.0 && secs <= 3600.0 {
            Some(Duration::from_secs_f64(secs))
        } else {
            None
        }
    }

    /// Parses whichever rate-limit headers a provider actually sent.
    /// OpenAI-style headers use duration strings; Anthropic-style
    /// headers are plain seconds.
    pub fn parse_provider_headers(headers: &BTreeMap<String, String>) -> Option<Duration> {
        if let Some(v) = headers.get("retry-after") {
            if let Some(d) = Self::parse_retry_after(v) {
                return Some(d);
            }
        }
        for key in ["x-ratelimit-reset-requests", "x-ratelimit-reset-tokens"] {
            if let Some(v) = headers.get(key) {
                if let Some(d) = Self::parse_duration_string(v) {
                    return Some(d);
                }
            }
        }
        if let Some(v) = headers.get("anthropic-ratelimit-requests-reset") {
            if let Some(d) = Self::parse_retry_after(v) {
                return Some(d);
            }
        }
        None
    }

    /// Priority chain: an explicit `Retry-After` wins, then a
    /// provider-specific header, then a jittered default.
    pub fn get_cooldown_seconds(
        retry_after: Option<Duration>,
        headers: Option<&BTreeMap<String, String>>,
        default_secs: f64,
    ) -> Duration {
        if let Some(d) = retry_after {
            return d;
        }
        if let Some(h) = headers {
            if let Some(d) = Self::parse_provider_headers(h) {
                return d;
            }
        }
        let jitter = rand::thread_rng().gen_range(0.10..=0.25);
        Duration::from_secs_f64(default_secs * (1.0 + jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_openai_style_duration_strings() {
        assert_eq!(RateLimitTracker::parse_duration_string("6s"), Some(Duration::from_secs(6)));
        assert_eq!(
            RateLimitTracker::parse_duration_string("1m30s"),
            Some(Duration::from_secs(90))
        );
        assert_eq!(
            RateLimitTracker::parse_duration_string("500ms"),
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn retry_after_rejects_out_of_bounds_values() {
        assert!(RateLimitTracker::parse_retry_after("0").is_none());
        assert!(RateLimitTracker::parse_retry_after("3601").is_none());
        assert!(RateLimitTracker::parse_retry_after("30").is_some());
    }

    #[test]
    fn cooldown_priority_prefers_explicit_retry_after() {
        let d = RateLimitTracker::get_cooldown_seconds(Some(Duration::from_secs(42)), None, 10.0);
        assert_eq!(d, Duration::from_secs(42));
    }

    #[test]
    fn cooldown_falls_back_to_jittered_default() {
        let d = RateLimitTracker::get_cooldown_seconds(None, None, 10.0);
        assert!(d.as_secs_f64() >= 11.0 && d.as_secs_f64() <= 12.5);
    }

    #[test]
    fn token_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(60.0);
        assert!(bucket.try_consume(60.0));
        assert!(!bucket.try_consume(1.0));
    }

    #[test]
    fn rpm_consumed_even_if_tpm_then_rejects() {
        let tracker = RateLimitTracker::new();
        tracker.configure_provider("openai", 1.0, 1.0);
        assert!(!tracker.can_request("openai", 100.0));
        assert!(!tracker.can_request("openai", 0.0));
    }
}
