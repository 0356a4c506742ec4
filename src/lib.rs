pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod ratelimit;
pub mod telemetry;

pub use config::{BackendConfig, FailurePolicy, LimiterConfig, RateLimitConfig};
pub use error::{LimiterError, LimiterResult};
pub use ratelimit::{
    Decision,
    DecisionReason,
    RateLimitOutcome,
    RateLimitSignals,
    RateLimiter,
};
