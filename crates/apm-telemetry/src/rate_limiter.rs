// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Token-bucket admission control.
//!
//! The same [`Limiter`] backs two decisions:
//! - the global profiling gate ([`ReloadableLimiter`]), deciding whether a
//!   request gets a call tree at all;
//! - the per-category reporting gate ([`RateLimiterRegistry`]), deciding
//!   whether a finished document may enter the reporter queue.
//!
//! Both follow one policy: a non-positive rate denies everything and
//! [`RateLimit::Unbounded`] admits everything without touching a bucket.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimit {
    /// Unmetered pass-through.
    Unbounded,
    /// Denies every request.
    Disabled,
    PerSecond { rate: f64, capacity: f64 },
}

impl RateLimit {
    /// Bucket holding one second worth of tokens, and at least one.
    #[must_use]
    pub fn per_second(rate: f64) -> Self {
        Self::with_capacity(rate, rate.max(1.0))
    }

    #[must_use]
    pub fn with_capacity(rate: f64, capacity: f64) -> Self {
        if rate.is_nan() || rate <= 0.0 {
            RateLimit::Disabled
        } else if rate.is_infinite() {
            RateLimit::Unbounded
        } else {
            RateLimit::PerSecond {
                rate,
                capacity: capacity.max(0.0),
            }
        }
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimit::Unbounded => write!(f, "unbounded"),
            RateLimit::Disabled => write!(f, "disabled"),
            RateLimit::PerSecond { rate, capacity } => {
                write!(f, "{rate}/s (burst {capacity})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid rate limit '{0}': expected a number or 'unbounded'")]
pub struct ParseRateLimitError(pub String);

impl FromStr for RateLimit {
    type Err = ParseRateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "unbounded" | "unlimited" | "inf" | "infinity" => Ok(RateLimit::Unbounded),
            value => value
                .parse::<f64>()
                .ok()
                .filter(|rate| !rate.is_nan())
                .map(RateLimit::per_second)
                .ok_or_else(|| ParseRateLimitError(trimmed.to_string())),
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Duration,
}

/// Lazily refilled token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate_per_second: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Creates a full bucket.
    #[must_use]
    pub fn new(capacity: f64, refill_rate_per_second: f64, clock: Arc<dyn Clock>) -> Self {
        let last_refill = clock.now();
        TokenBucket {
            capacity,
            refill_rate_per_second,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill,
            }),
            clock,
        }
    }

    /// Refills for the time elapsed since the last call, then takes `cost`
    /// tokens if that leaves the bucket non-negative.
    pub fn try_acquire(&self, cost: f64) -> bool {
        if cost.is_nan() || cost < 0.0 {
            return false;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state);
        if state.tokens - cost >= 0.0 {
            state.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Current token count after a refill.
    #[must_use]
    pub fn tokens(&self) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state);
        state.tokens
    }

    /// Refilled to capacity, i.e. indistinguishable from a fresh bucket.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.tokens() >= self.capacity
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_sub(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate_per_second).min(self.capacity);
        state.last_refill = now;
    }
}

#[derive(Debug)]
pub enum Limiter {
    Unbounded,
    Disabled,
    Bucket(TokenBucket),
}

impl Limiter {
    #[must_use]
    pub fn new(limit: RateLimit, clock: Arc<dyn Clock>) -> Self {
        match limit {
            RateLimit::Unbounded => Limiter::Unbounded,
            RateLimit::Disabled => Limiter::Disabled,
            RateLimit::PerSecond { rate, capacity } => {
                Limiter::Bucket(TokenBucket::new(capacity, rate, clock))
            }
        }
    }

    pub fn try_acquire(&self, cost: f64) -> bool {
        match self {
            Limiter::Unbounded => true,
            Limiter::Disabled => false,
            Limiter::Bucket(bucket) => bucket.try_acquire(cost),
        }
    }
}

/// Single limiter that can be swapped at runtime. Used as the global
/// profiling gate.
#[derive(Debug)]
pub struct ReloadableLimiter {
    clock: Arc<dyn Clock>,
    current: ArcSwap<Limiter>,
}

impl ReloadableLimiter {
    #[must_use]
    pub fn new(limit: RateLimit, clock: Arc<dyn Clock>) -> Self {
        let current = ArcSwap::from_pointee(Limiter::new(limit, Arc::clone(&clock)));
        ReloadableLimiter { clock, current }
    }

    pub fn try_acquire(&self, cost: f64) -> bool {
        self.current.load().try_acquire(cost)
    }

    /// Installs a fresh limiter; the old bucket's state is not carried over.
    pub fn replace(&self, limit: RateLimit) {
        self.current
            .store(Arc::new(Limiter::new(limit, Arc::clone(&self.clock))));
    }
}

/// Buckets tracked by a [`RateLimiterRegistry`] unless configured otherwise.
pub const DEFAULT_MAX_TRACKED_CATEGORIES: usize = 10_000;

/// Independent token buckets keyed by category (request name, document
/// type...).
///
/// Only metered categories get a bucket, created on first use from the
/// category's override or the default limit. `Unbounded` and `Disabled`
/// categories are answered from the policy alone. At most `max_tracked`
/// buckets are kept: when full, buckets that have refilled to capacity are
/// evicted first, since a fresh bucket starts full anyway. Categories never
/// share a lock.
#[derive(Debug)]
pub struct RateLimiterRegistry {
    clock: Arc<dyn Clock>,
    default_limit: ArcSwap<RateLimit>,
    overrides: DashMap<String, RateLimit>,
    buckets: DashMap<String, Arc<TokenBucket>>,
    max_tracked: usize,
}

impl RateLimiterRegistry {
    #[must_use]
    pub fn new(default_limit: RateLimit, clock: Arc<dyn Clock>) -> Self {
        RateLimiterRegistry {
            clock,
            default_limit: ArcSwap::from_pointee(default_limit),
            overrides: DashMap::new(),
            buckets: DashMap::new(),
            max_tracked: DEFAULT_MAX_TRACKED_CATEGORIES,
        }
    }

    #[must_use]
    pub fn with_max_tracked(mut self, max_tracked: usize) -> Self {
        self.max_tracked = max_tracked.max(1);
        self
    }

    #[must_use]
    pub fn with_overrides<I>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (String, RateLimit)>,
    {
        self.overrides = overrides.into_iter().collect();
        self
    }

    pub fn try_acquire(&self, category: &str, cost: f64) -> bool {
        match self.limit_for(category) {
            RateLimit::Unbounded => true,
            RateLimit::Disabled => false,
            RateLimit::PerSecond { rate, capacity } => {
                self.bucket(category, rate, capacity).try_acquire(cost)
            }
        }
    }

    /// Number of categories currently holding a bucket.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }

    /// The limit currently applied to `category`.
    #[must_use]
    pub fn limit_for(&self, category: &str) -> RateLimit {
        self.overrides
            .get(category)
            .map_or_else(|| **self.default_limit.load(), |limit| *limit)
    }

    /// Overrides one category. Its bucket restarts full.
    pub fn set_limit(&self, category: &str, limit: RateLimit) {
        self.overrides.insert(category.to_string(), limit);
        self.buckets.remove(category);
    }

    /// Changes the default. Buckets of categories without an override restart.
    pub fn set_default(&self, limit: RateLimit) {
        self.default_limit.store(Arc::new(limit));
        self.buckets
            .retain(|category, _| self.overrides.contains_key(category));
    }

    fn bucket(&self, category: &str, rate: f64, capacity: f64) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(category) {
            return Arc::clone(bucket.value());
        }
        if self.buckets.len() >= self.max_tracked {
            self.evict();
        }
        let entry = self
            .buckets
            .entry(category.to_string())
            .or_insert_with(|| {
                Arc::new(TokenBucket::new(capacity, rate, Arc::clone(&self.clock)))
            });
        Arc::clone(entry.value())
    }

    /// Drops full buckets; if that is not enough, every bucket without an
    /// override. Dropped categories restart with a full bucket.
    fn evict(&self) {
        self.buckets.retain(|_, bucket| !bucket.is_full());
        if self.buckets.len() >= self.max_tracked {
            self.buckets
                .retain(|category, _| self.overrides.contains_key(category));
        }
        debug!(
            "LIMITER | Evicted idle buckets, {} categories still tracked",
            self.buckets.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use duplicate::duplicate_item;

    fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new())
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let clock = manual_clock();
        let bucket = TokenBucket::new(10.0, 2.0, clock.clone());
        for _ in 0..10 {
            assert!(bucket.try_acquire(1.0));
        }
        assert!(!bucket.try_acquire(1.0));

        clock.advance(Duration::from_secs(3));
        assert!((bucket.tokens() - 6.0).abs() < 1e-9);

        clock.advance(Duration::from_secs(60));
        assert!((bucket.tokens() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_acquire_never_goes_negative() {
        let clock = manual_clock();
        let bucket = TokenBucket::new(1.0, 1.0, clock.clone());
        assert!(!bucket.try_acquire(1.5));
        assert!((bucket.tokens() - 1.0).abs() < 1e-9);
        assert!(bucket.try_acquire(1.0));
        assert!(!bucket.try_acquire(0.5));

        clock.advance(Duration::from_millis(500));
        assert!(bucket.try_acquire(0.5));
        assert!(bucket.tokens() >= 0.0);
    }

    #[test]
    fn test_invalid_cost_is_denied() {
        let bucket = TokenBucket::new(5.0, 1.0, manual_clock());
        assert!(!bucket.try_acquire(f64::NAN));
        assert!(!bucket.try_acquire(-1.0));
        assert!(bucket.try_acquire(0.0));
    }

    #[test]
    fn test_disabled_always_denies() {
        let clock = manual_clock();
        for limit in [RateLimit::per_second(0.0), RateLimit::per_second(-3.0)] {
            assert_eq!(limit, RateLimit::Disabled);
            let limiter = Limiter::new(limit, clock.clone());
            assert!(!limiter.try_acquire(1.0));
            assert!(!limiter.try_acquire(0.0));
        }
    }

    #[test]
    fn test_unbounded_always_admits() {
        let limiter = Limiter::new(RateLimit::Unbounded, manual_clock());
        assert!((0..100_000).all(|_| limiter.try_acquire(1.0)));
        assert!(matches!(
            Limiter::new(RateLimit::per_second(f64::INFINITY), manual_clock()),
            Limiter::Unbounded
        ));
    }

    #[test]
    fn test_fractional_rate_still_admits_one() {
        let clock = manual_clock();
        let limiter = Limiter::new(RateLimit::per_second(0.5), clock.clone());
        assert!(limiter.try_acquire(1.0));
        assert!(!limiter.try_acquire(1.0));
        clock.advance(Duration::from_secs(2));
        assert!(limiter.try_acquire(1.0));
    }

    #[duplicate_item(
        test_name                   input           expected;
        [test_parse_unbounded]      ["unbounded"]   [RateLimit::Unbounded];
        [test_parse_unlimited]      [" Unlimited "] [RateLimit::Unbounded];
        [test_parse_inf]            ["inf"]         [RateLimit::Unbounded];
        [test_parse_zero]           ["0"]           [RateLimit::Disabled];
        [test_parse_negative]       ["-1"]          [RateLimit::Disabled];
        [test_parse_rate]           ["20"]          [RateLimit::PerSecond { rate: 20.0, capacity: 20.0 }];
        [test_parse_fraction]       ["0.25"]        [RateLimit::PerSecond { rate: 0.25, capacity: 1.0 }];
    )]
    #[test]
    fn test_name() {
        assert_eq!(input.parse::<RateLimit>(), Ok(expected));
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!("fast".parse::<RateLimit>().is_err());
        assert!("NaN".parse::<RateLimit>().is_err());
        assert!("".parse::<RateLimit>().is_err());
    }

    #[test]
    fn test_concurrent_acquire_never_oversubscribes() {
        let bucket = Arc::new(TokenBucket::new(1_000.0, 0.0, manual_clock()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                std::thread::spawn(move || (0..200).filter(|_| bucket.try_acquire(1.0)).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 1_000);
    }

    #[test]
    fn test_registry_categories_are_independent() {
        let clock = manual_clock();
        let registry = RateLimiterRegistry::new(RateLimit::per_second(1.0), clock.clone())
            .with_overrides([("checkout".to_string(), RateLimit::per_second(3.0))]);

        assert!(registry.try_acquire("search", 1.0));
        assert!(!registry.try_acquire("search", 1.0));
        for _ in 0..3 {
            assert!(registry.try_acquire("checkout", 1.0));
        }
        assert!(!registry.try_acquire("checkout", 1.0));
        assert!(registry.try_acquire("login", 1.0));
    }

    #[test]
    fn test_registry_set_limit_installs_fresh_bucket() {
        let registry = RateLimiterRegistry::new(RateLimit::per_second(1.0), manual_clock());
        assert!(registry.try_acquire("search", 1.0));
        assert!(!registry.try_acquire("search", 1.0));

        registry.set_limit("search", RateLimit::per_second(2.0));
        assert!(registry.try_acquire("search", 1.0));
        assert!(registry.try_acquire("search", 1.0));
        assert!(!registry.try_acquire("search", 1.0));

        registry.set_limit("search", RateLimit::Disabled);
        assert!(!registry.try_acquire("search", 1.0));
        assert_eq!(registry.limit_for("search"), RateLimit::Disabled);
    }

    #[test]
    fn test_registry_set_default_keeps_overrides() {
        let registry = RateLimiterRegistry::new(RateLimit::Disabled, manual_clock())
            .with_overrides([("kept".to_string(), RateLimit::per_second(1.0))]);
        assert!(!registry.try_acquire("other", 1.0));
        assert!(registry.try_acquire("kept", 1.0));

        registry.set_default(RateLimit::Unbounded);
        assert!(registry.try_acquire("other", 1.0));
        assert!(!registry.try_acquire("kept", 1.0));
    }

    #[test]
    fn test_registry_policies_without_bucket_are_not_tracked() {
        let registry = RateLimiterRegistry::new(RateLimit::Unbounded, manual_clock())
            .with_overrides([("blocked".to_string(), RateLimit::Disabled)]);
        for n in 0..1_000 {
            assert!(registry.try_acquire(&format!("GET /items/{n}"), 1.0));
        }
        assert!(!registry.try_acquire("blocked", 1.0));
        assert_eq!(registry.tracked(), 0);
    }

    #[test]
    fn test_registry_tracked_categories_stay_bounded() {
        let clock = manual_clock();
        let registry = RateLimiterRegistry::new(RateLimit::per_second(1.0), clock.clone())
            .with_overrides([("checkout".to_string(), RateLimit::per_second(1.0))])
            .with_max_tracked(8);

        assert!(registry.try_acquire("checkout", 1.0));
        for n in 0..1_000 {
            assert!(registry.try_acquire(&format!("GET /items/{n}"), 1.0));
            assert!(registry.tracked() <= 8);
        }
        assert!(!registry.try_acquire("GET /items/999", 1.0));
        assert!(!registry.try_acquire("checkout", 1.0));
        assert!(registry.try_acquire("GET /items/0", 1.0));
    }

    #[test]
    fn test_registry_evicts_full_buckets_first() {
        let clock = manual_clock();
        let registry =
            RateLimiterRegistry::new(RateLimit::per_second(1.0), clock.clone()).with_max_tracked(2);

        assert!(registry.try_acquire("a", 1.0));
        clock.advance(Duration::from_secs(5));
        assert!(registry.try_acquire("b", 1.0));
        assert!(registry.try_acquire("c", 1.0));
        assert_eq!(registry.tracked(), 2);

        assert!(!registry.try_acquire("b", 1.0));
        assert!(!registry.try_acquire("c", 1.0));
    }

    #[test]
    fn test_reloadable_limiter_replace() {
        let limiter = ReloadableLimiter::new(RateLimit::Disabled, manual_clock());
        assert!(!limiter.try_acquire(1.0));
        limiter.replace(RateLimit::Unbounded);
        assert!(limiter.try_acquire(1.0));
        limiter.replace(RateLimit::per_second(1.0));
        assert!(limiter.try_acquire(1.0));
        assert!(!limiter.try_acquire(1.0));
    }
}
