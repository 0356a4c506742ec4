use std::sync::Arc;

use crate::{
    clock::{Clock, SystemClock},
    config::{BackendConfig, FailurePolicy, LimiterConfig, RateLimitConfig},
    error::{LimiterError, LimiterResult},
    metrics::LimiterMetrics,
    ratelimit::{
        BucketRequest,
        BucketStore,
        engine::Decision,
        in_memory::InMemoryBucketStore,
        redis_backend::RedisBucketStore,
        reporter::RateLimitSignals,
    },
};

// `error` is only set for a fail-closed outage or a malformed request.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitOutcome {
    pub decision: Decision,
    pub limit: f64,
    pub error: Option<LimiterError>,
}

impl RateLimitOutcome {
    pub fn allowed(&self) -> bool {
        self.decision.allowed
    }

    pub fn signals(&self) -> RateLimitSignals {
        RateLimitSignals::from_decision(&self.decision, self.limit)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    config: Arc<LimiterConfig>,
    clock: Arc<dyn Clock>,
    metrics: Arc<LimiterMetrics>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn BucketStore>, config: LimiterConfig) -> LimiterResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config: Arc::new(config),
            clock: Arc::new(SystemClock),
            metrics: Arc::new(LimiterMetrics::new()),
        })
    }

    pub async fn from_config(config: LimiterConfig) -> LimiterResult<Self> {
        config.validate()?;
        let store: Arc<dyn BucketStore> = match &config.backend {
            BackendConfig::InMemory => Arc::new(InMemoryBucketStore::new()),
            BackendConfig::Redis { url } => Arc::new(RedisBucketStore::new(url.clone()).await?),
        };
        tracing::info!(
            store = store.name(),
            capacity = config.policy.capacity,
            refill_rate = config.policy.refill_rate,
            policy = config.failure_policy.as_str(),
            "rate limiter ready"
        );
        Self::new(store, config)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<LimiterMetrics> {
        self.metrics.clone()
    }

    pub async fn allow(&self, key: &str, cost: f64) -> RateLimitOutcome {
        let store_key = self.default_store_key(key);
        self.evaluate(self.config.policy, &store_key, cost).await
    }

    pub async fn allow_one(&self, key: &str) -> RateLimitOutcome {
        self.allow(key, self.config.default_cost).await
    }

    pub async fn allow_with(
        &self,
        policy: &RateLimitConfig,
        key: &str,
        cost: f64,
    ) -> RateLimitOutcome {
        let store_key = self.default_store_key(key);
        if let Err(err) = policy.validate() {
            return self.reject(policy.capacity, &store_key, err);
        }
        self.evaluate(*policy, &store_key, cost).await
    }

    pub async fn allow_class(&self, class: &str, key: &str, cost: f64) -> RateLimitOutcome {
        let store_key = self.class_store_key(class, key);
        let Some(policy) = self.config.class(class).copied() else {
            return self.reject(0.0, &store_key, LimiterError::UnknownClass(class.to_string()));
        };
        self.evaluate(policy, &store_key, cost).await
    }

    // Default and class buckets live under different tags, and the class name is
    // length-prefixed, so no caller key can land in another identity's bucket.
    fn default_store_key(&self, key: &str) -> String {
        format!("{}:d:{}", self.config.key_prefix, key)
    }

    fn class_store_key(&self, class: &str, key: &str) -> String {
        format!("{}:c:{}:{}:{}", self.config.key_prefix, class.len(), class, key)
    }

    async fn evaluate(&self, policy: RateLimitConfig, store_key: &str, cost: f64) -> RateLimitOutcome {
        if !cost.is_finite() || cost < 0.0 {
            return self.reject(
                policy.capacity,
                store_key,
                LimiterError::Configuration(format!("cost must be a finite value >= 0, got {cost}")),
            );
        }

        let request = BucketRequest {
            key: store_key,
            config: &policy,
            now_ms: self.clock.now_ms(),
            cost,
            ttl: policy.effective_ttl(self.config.state_ttl),
        };

        let applied = match tokio::time::timeout(self.config.store_timeout, self.store.apply(request))
            .await
        {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };

        match applied {
            Ok(applied) => {
                if applied.recovered {
                    self.metrics.state_recovered();
                    tracing::warn!(
                        key = %store_key,
                        store = self.store.name(),
                        "bucket state was unreadable; treated as a full bucket"
                    );
                }

                let decision = Decision::from_tokens(applied.allowed, applied.tokens, cost, &policy);
                if decision.allowed {
                    self.metrics.allowed();
                } else {
                    self.metrics.denied();
                    tracing::debug!(
                        key = %store_key,
                        cost,
                        remaining = decision.remaining,
                        retry_after = decision.retry_after,
                        "request rate limited"
                    );
                }

                RateLimitOutcome {
                    decision,
                    limit: policy.capacity,
                    error: None,
                }
            }
            Err(err) => self.on_store_failure(policy.capacity, store_key, err),
        }
    }

    fn on_store_failure(&self, limit: f64, key: &str, err: LimiterError) -> RateLimitOutcome {
        match self.config.failure_policy {
            FailurePolicy::Open => {
                self.metrics.fail_open();
                tracing::warn!(
                    key = %key,
                    store = self.store.name(),
                    error = %err,
                    "bucket store failed; allowing request because fail-open is enabled"
                );
                RateLimitOutcome {
                    decision: Decision::fail_open(),
                    limit,
                    error: None,
                }
            }
            FailurePolicy::Closed => {
                self.metrics.fail_closed();
                tracing::warn!(
                    key = %key,
                    store = self.store.name(),
                    error = %err,
                    "bucket store failed; denying request because fail-closed is enabled"
                );
                RateLimitOutcome {
                    decision: Decision::fail_closed(),
                    limit,
                    error: Some(err),
                }
            }
        }
    }

    fn reject(&self, limit: f64, key: &str, err: LimiterError) -> RateLimitOutcome {
        tracing::warn!(key = %key, error = %err, "rejecting malformed rate limit request");
        self.metrics.denied();
        RateLimitOutcome {
            decision: Decision::rejected(),
            limit,
            error: Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        clock::ManualClock,
        ratelimit::{BucketOutcome, DecisionReason},
    };

    struct DownStore;

    #[async_trait]
    impl BucketStore for DownStore {
        fn name(&self) -> &'static str {
            "down"
        }

        async fn apply(&self, _request: BucketRequest<'_>) -> LimiterResult<BucketOutcome> {
            Err(LimiterError::StoreUnavailable("connection refused".to_string()))
        }
    }

    struct StalledStore;

    #[async_trait]
    impl BucketStore for StalledStore {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn apply(&self, _request: BucketRequest<'_>) -> LimiterResult<BucketOutcome> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(BucketOutcome {
                allowed: true,
                tokens: 0.0,
                recovered: false,
            })
        }
    }

    fn limiter_at(capacity: f64, refill_rate: f64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let limiter = RateLimiter::new(
            Arc::new(InMemoryBucketStore::new()),
            LimiterConfig::new(RateLimitConfig::new(capacity, refill_rate)),
        )
        .unwrap()
        .with_clock(clock.clone());
        (limiter, clock)
    }

    fn config_with(policy: FailurePolicy) -> LimiterConfig {
        let mut config = LimiterConfig::new(RateLimitConfig::new(10.0, 1.0));
        config.failure_policy = policy;
        config
    }

    #[tokio::test]
    async fn burst_of_ten_then_retry_after_one_second() {
        let (limiter, _) = limiter_at(10.0, 1.0);

        for expected in (0..10).rev() {
            let outcome = limiter.allow("user-1", 1.0).await;
            assert!(outcome.allowed());
            assert_eq!(outcome.decision.remaining, f64::from(expected));
        }

        let denied = limiter.allow("user-1", 1.0).await;
        assert!(!denied.allowed());
        assert_eq!(denied.decision.reason, DecisionReason::RateLimited);
        assert_eq!(denied.decision.retry_after, 1.0);
        assert!(denied.error.is_none());
    }

    #[tokio::test]
    async fn idle_time_refills_the_bucket() {
        let (limiter, clock) = limiter_at(10.0, 1.0);
        for _ in 0..11 {
            limiter.allow("user-1", 1.0).await;
        }

        clock.advance_ms(5_000);
        let outcome = limiter.allow("user-1", 1.0).await;
        assert!(outcome.allowed());
        assert_eq!(outcome.decision.remaining, 4.0);
    }

    #[tokio::test]
    async fn hundred_millis_is_not_a_full_token() {
        let (limiter, clock) = limiter_at(5.0, 5.0);
        for _ in 0..5 {
            assert!(limiter.allow("user-1", 1.0).await.allowed());
        }

        clock.advance_ms(100);
        assert!(!limiter.allow("user-1", 1.0).await.allowed());
    }

    #[tokio::test]
    async fn oversize_cost_is_unreachable() {
        let (limiter, clock) = limiter_at(5.0, 1.0);
        for _ in 0..3 {
            let outcome = limiter.allow("user-1", 10.0).await;
            assert!(!outcome.allowed());
            assert!(outcome.decision.retry_after.is_infinite());
            assert_eq!(outcome.signals().retry_after_secs, None);
            clock.advance_ms(60_000);
        }
    }

    #[tokio::test]
    async fn invalid_cost_is_rejected_without_touching_the_bucket() {
        let (limiter, _) = limiter_at(1.0, 0.0);

        for cost in [-1.0, f64::NAN, f64::INFINITY] {
            let outcome = limiter.allow("user-1", cost).await;
            assert!(!outcome.allowed());
            assert_eq!(outcome.decision.reason, DecisionReason::Rejected);
            assert!(matches!(outcome.error, Some(LimiterError::Configuration(_))));
        }

        assert!(limiter.allow("user-1", 1.0).await.allowed());
    }

    #[tokio::test]
    async fn classes_use_their_own_policy_and_buckets() {
        let mut config = LimiterConfig::new(RateLimitConfig::new(1.0, 0.0));
        config
            .classes
            .insert("pro".to_string(), RateLimitConfig::new(3.0, 0.0));
        let limiter = RateLimiter::new(Arc::new(InMemoryBucketStore::new()), config).unwrap();

        assert!(limiter.allow_one("tenant").await.allowed());
        assert!(!limiter.allow_one("tenant").await.allowed());

        for _ in 0..3 {
            assert!(limiter.allow_class("pro", "tenant", 1.0).await.allowed());
        }
        let denied = limiter.allow_class("pro", "tenant", 1.0).await;
        assert!(!denied.allowed());
        assert_eq!(denied.limit, 3.0);

        let unknown = limiter.allow_class("enterprise", "tenant", 1.0).await;
        assert!(!unknown.allowed());
        assert_eq!(
            unknown.error,
            Some(LimiterError::UnknownClass("enterprise".to_string()))
        );
    }

    #[tokio::test]
    async fn keys_with_colons_never_reach_a_class_bucket() {
        let mut config = LimiterConfig::new(RateLimitConfig::new(100.0, 0.0));
        config
            .classes
            .insert("pro".to_string(), RateLimitConfig::new(1.0, 0.0));
        config
            .classes
            .insert("pro:x".to_string(), RateLimitConfig::new(1.0, 0.0));
        let store = Arc::new(InMemoryBucketStore::new());
        let limiter = RateLimiter::new(store.clone(), config).unwrap();

        assert!(limiter.allow_class("pro", "tenant", 1.0).await.allowed());
        assert!(!limiter.allow_class("pro", "tenant", 1.0).await.allowed());

        let default = limiter.allow("pro:tenant", 1.0).await;
        assert!(default.allowed());
        assert_eq!(default.decision.remaining, 99.0);

        assert!(limiter.allow_class("pro", "x:tenant", 1.0).await.allowed());
        assert!(limiter.allow_class("pro:x", "tenant", 1.0).await.allowed());
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn call_time_policy_is_validated() {
        let (limiter, _) = limiter_at(10.0, 1.0);

        let outcome = limiter
            .allow_with(&RateLimitConfig::new(2.0, 1.0), "user-1", 2.0)
            .await;
        assert!(outcome.allowed());
        assert_eq!(outcome.limit, 2.0);

        let broken = limiter
            .allow_with(&RateLimitConfig::new(-2.0, 1.0), "user-1", 1.0)
            .await;
        assert!(!broken.allowed());
        assert!(matches!(broken.error, Some(LimiterError::Configuration(_))));
    }

    #[tokio::test]
    async fn fail_open_allows_silently() {
        let limiter = RateLimiter::new(Arc::new(DownStore), config_with(FailurePolicy::Open)).unwrap();

        let outcome = limiter.allow("user-1", 1.0).await;
        assert!(outcome.allowed());
        assert_eq!(outcome.decision.reason, DecisionReason::FailOpen);
        assert!(outcome.error.is_none());
        assert_eq!(limiter.metrics().snapshot().fail_open, 1);
    }

    #[tokio::test]
    async fn fail_closed_denies_with_distinct_reason() {
        let limiter =
            RateLimiter::new(Arc::new(DownStore), config_with(FailurePolicy::Closed)).unwrap();

        let outcome = limiter.allow("user-1", 1.0).await;
        assert!(!outcome.allowed());
        assert_eq!(outcome.decision.reason, DecisionReason::FailClosed);
        assert!(matches!(outcome.error, Some(LimiterError::StoreUnavailable(_))));
        assert_eq!(outcome.signals().reason_code(), "limiter_unavailable");
        assert_eq!(limiter.metrics().snapshot().fail_closed, 1);
    }

    #[tokio::test]
    async fn slow_store_counts_as_unavailable() {
        let mut config = config_with(FailurePolicy::Closed);
        config.store_timeout = Duration::from_millis(20);
        let limiter = RateLimiter::new(Arc::new(StalledStore), config).unwrap();

        let outcome = limiter.allow("user-1", 1.0).await;
        assert!(!outcome.allowed());
        assert_eq!(
            outcome.error,
            Some(LimiterError::StoreUnavailable(
                "store operation timed out".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn unreadable_state_is_counted_and_reset() {
        let store = Arc::new(InMemoryBucketStore::new());
        store
            .insert_raw(
                "ratelimit:d:user-1",
                &[("tokens", "4"), ("ts", "0"), ("v", "99")],
                i64::MAX,
            )
            .await;
        let clock = Arc::new(ManualClock::new(1_000));
        let limiter = RateLimiter::new(
            store,
            LimiterConfig::new(RateLimitConfig::new(10.0, 1.0)),
        )
        .unwrap()
        .with_clock(clock);

        let outcome = limiter.allow("user-1", 1.0).await;
        assert!(outcome.allowed());
        assert_eq!(outcome.decision.remaining, 9.0);
        assert_eq!(limiter.metrics().snapshot().state_recoveries, 1);
    }

    #[test]
    fn rejects_invalid_config_up_front() {
        let config = LimiterConfig::new(RateLimitConfig::new(0.0, 1.0));
        assert!(matches!(
            RateLimiter::new(Arc::new(InMemoryBucketStore::new()), config),
            Err(LimiterError::Configuration(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_a_single_token() {
        for n in [2usize, 16, 128] {
            let (limiter, _) = limiter_at(1.0, 0.0);
            let key = format!("race-{n}");

            let handles = (0..n)
                .map(|_| {
                    let limiter = limiter.clone();
                    let key = key.clone();
                    tokio::spawn(async move { limiter.allow(&key, 1.0).await.allowed() })
                })
                .collect::<Vec<_>>();

            let mut allowed = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    allowed += 1;
                }
            }
            assert_eq!(allowed, 1, "exactly one of {n} callers should win");
        }
    }
}
