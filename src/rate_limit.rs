//! Token-bucket rate limiting.
//!
//! [`RateLimiter`] is the collaborator contract; [`TokenBucketLimiter`] keeps
//! one bucket per key in memory. Arithmetic is integer-only: a bucket gains
//! `floor(elapsed_ms * tokens_per_second / 1000)` tokens, capped at
//! `capacity`. Buckets that have refilled completely are indistinguishable
//! from fresh ones and are pruned. [`RateLimit`] applies a limiter to the
//! middleware chain.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{
    config::ConfigError,
    context::MessageContext,
    envelope::unix_millis,
    error::WsError,
    middleware::{Middleware, Next},
};

/// Bucket shape shared by every key of a limiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    capacity: u64,
    tokens_per_second: u64,
}

impl RateLimitPolicy {
    /// Build a policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroLimit`] if either value is zero.
    pub fn new(capacity: u64, tokens_per_second: u64) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::ZeroLimit("capacity"));
        }
        if tokens_per_second == 0 {
            return Err(ConfigError::ZeroLimit("tokensPerSecond"));
        }
        Ok(Self {
            capacity,
            tokens_per_second,
        })
    }

    #[must_use]
    pub fn capacity(&self) -> u64 { self.capacity }

    #[must_use]
    pub fn tokens_per_second(&self) -> u64 { self.tokens_per_second }

    /// Milliseconds an empty bucket needs to fill up.
    #[must_use]
    pub fn refill_ms(&self) -> u64 {
        self.capacity
            .saturating_mul(1000)
            .div_ceil(self.tokens_per_second)
    }
}

/// Outcome of a [`RateLimiter::consume`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    /// Wait before the cost can be met. `None` when allowed, or when the cost
    /// exceeds the bucket capacity and can never be met.
    pub retry_after_ms: Option<u64>,
}

/// Rate limiter contract.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Try to take `cost` tokens from the bucket for `key`.
    async fn consume(&self, key: &str, cost: u64) -> RateLimitDecision;

    /// Policy applied to every key.
    fn policy(&self) -> RateLimitPolicy;

    /// Release any resources held by the limiter.
    async fn dispose(&self) {}
}

/// Millisecond clock used by [`TokenBucketLimiter`].
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: u64,
    last_refill_ms: u64,
}

impl Bucket {
    fn refill(&mut self, policy: RateLimitPolicy, now_ms: u64) {
        // A clock that moved backwards accrues nothing.
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        let earned = elapsed.saturating_mul(policy.tokens_per_second) / 1000;
        if earned == 0 {
            return;
        }
        self.tokens = self.tokens.saturating_add(earned).min(policy.capacity);
        self.last_refill_ms = if self.tokens == policy.capacity {
            now_ms
        } else {
            // Keep the fractional remainder for the next call.
            self.last_refill_ms + earned * 1000 / policy.tokens_per_second
        };
    }

    fn is_full_at(self, policy: RateLimitPolicy, now_ms: u64) -> bool {
        let mut probe = self;
        probe.refill(policy, now_ms);
        probe.tokens >= policy.capacity
    }
}

/// In-memory token bucket keyed by string.
pub struct TokenBucketLimiter {
    policy: RateLimitPolicy,
    buckets: DashMap<String, Bucket>,
    clock: Clock,
    last_prune_ms: AtomicU64,
}

impl TokenBucketLimiter {
    /// Limiter reading the system clock.
    #[must_use]
    pub fn new(policy: RateLimitPolicy) -> Self { Self::with_clock(policy, Arc::new(unix_millis)) }

    /// Limiter reading time from `clock`.
    #[must_use]
    pub fn with_clock(policy: RateLimitPolicy, clock: Clock) -> Self {
        let last_prune_ms = AtomicU64::new(clock());
        Self {
            policy,
            buckets: DashMap::new(),
            clock,
            last_prune_ms,
        }
    }

    /// Synchronous core of [`RateLimiter::consume`].
    ///
    /// Runs [`TokenBucketLimiter::prune`] at most once per refill period.
    pub fn try_consume(&self, key: &str, cost: u64) -> RateLimitDecision {
        let now = (self.clock)();
        let policy = self.policy;
        let last = self.last_prune_ms.load(Ordering::Acquire);
        if now.saturating_sub(last) >= policy.refill_ms()
            && self
                .last_prune_ms
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.prune(now);
        }
        let mut bucket = self.buckets.entry(key.to_owned()).or_insert(Bucket {
            tokens: policy.capacity,
            last_refill_ms: now,
        });
        bucket.refill(policy, now);

        if cost > policy.capacity {
            return RateLimitDecision {
                allowed: false,
                remaining: bucket.tokens,
                retry_after_ms: None,
            };
        }
        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            return RateLimitDecision {
                allowed: true,
                remaining: bucket.tokens,
                retry_after_ms: None,
            };
        }

        let deficit = cost - bucket.tokens;
        let full_wait = (deficit * 1000).div_ceil(policy.tokens_per_second);
        let accrued = now.saturating_sub(bucket.last_refill_ms);
        RateLimitDecision {
            allowed: false,
            remaining: bucket.tokens,
            retry_after_ms: Some(full_wait.saturating_sub(accrued).max(1)),
        }
    }

    /// Drop every bucket that is back at full capacity by `now_ms`.
    /// Returns how many were removed.
    pub fn prune(&self, now_ms: u64) -> usize {
        let policy = self.policy;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| !bucket.is_full_at(policy, now_ms));
        before.saturating_sub(self.buckets.len())
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn tracked_keys(&self) -> usize { self.buckets.len() }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn consume(&self, key: &str, cost: u64) -> RateLimitDecision { self.try_consume(key, cost) }

    fn policy(&self) -> RateLimitPolicy { self.policy }

    async fn dispose(&self) { self.buckets.clear(); }
}

type KeyFn = Arc<dyn Fn(&MessageContext) -> String + Send + Sync>;
type CostFn = Arc<dyn Fn(&MessageContext) -> u64 + Send + Sync>;

/// Middleware rejecting messages once their key runs out of tokens.
///
/// The default key is `"<clientId>:<type>"` and the default cost is one.
pub struct RateLimit {
    limiter: Arc<dyn RateLimiter>,
    key: KeyFn,
    cost: CostFn,
}

impl RateLimit {
    #[must_use]
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            limiter,
            key: Arc::new(|ctx: &MessageContext| {
                format!("{}:{}", ctx.client_id(), ctx.message_type())
            }),
            cost: Arc::new(|_: &MessageContext| 1),
        }
    }

    /// Derive the bucket key from the message context.
    #[must_use]
    pub fn key_by<F>(mut self, key: F) -> Self
    where
        F: Fn(&MessageContext) -> String + Send + Sync + 'static,
    {
        self.key = Arc::new(key);
        self
    }

    /// Derive the token cost from the message context.
    #[must_use]
    pub fn cost_by<F>(mut self, cost: F) -> Self
    where
        F: Fn(&MessageContext) -> u64 + Send + Sync + 'static,
    {
        self.cost = Arc::new(cost);
        self
    }
}

#[async_trait]
impl Middleware for RateLimit {
    async fn call(&self, ctx: MessageContext, next: Next<'_>) -> Result<(), WsError> {
        let key = (self.key)(&ctx);
        let decision = self.limiter.consume(&key, (self.cost)(&ctx)).await;
        if decision.allowed {
            return next.run(ctx).await;
        }
        let err = WsError::resource_exhausted("rate limit exceeded")
            .with_detail("remaining", decision.remaining);
        Err(match decision.retry_after_ms {
            Some(ms) => err.with_retry_after_ms(i64::try_from(ms).unwrap_or(i64::MAX)),
            None => err.with_retryable(false),
        })
    }
}
