pub mod codec;
pub mod engine;
pub mod in_memory;
pub mod limiter;
pub mod redis_backend;
pub mod reporter;

use std::time::Duration;

use async_trait::async_trait;

use crate::{config::RateLimitConfig, error::LimiterResult};

pub use engine::{BucketState, Decision, DecisionReason};
pub use limiter::{RateLimitOutcome, RateLimiter};
pub use reporter::RateLimitSignals;

#[derive(Debug, Clone, Copy)]
pub struct BucketRequest<'a> {
    pub key: &'a str,
    pub config: &'a RateLimitConfig,
    pub now_ms: i64,
    pub cost: f64,
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    pub allowed: bool,
    pub tokens: f64,
    // stored state was unreadable and the bucket was reset to full
    pub recovered: bool,
}

/// A shared store that runs the whole read, compute, write sequence for one
/// key as a single indivisible step. Implementations must never split it into
/// separate read and write round trips.
#[async_trait]
pub trait BucketStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, request: BucketRequest<'_>) -> LimiterResult<BucketOutcome>;
}
