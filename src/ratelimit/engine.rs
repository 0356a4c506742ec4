use serde::Serialize;

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_ms: i64,
}

impl BucketState {
    pub fn full(config: &RateLimitConfig, now_ms: i64) -> Self {
        Self {
            tokens: config.capacity,
            last_refill_ms: now_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    Allowed,
    RateLimited,
    FailOpen,
    FailClosed,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: f64,
    // +inf when waiting can never help.
    pub retry_after: f64,
    pub reason: DecisionReason,
}

impl Decision {
    pub fn from_tokens(allowed: bool, tokens: f64, cost: f64, config: &RateLimitConfig) -> Self {
        if allowed {
            Self {
                allowed,
                remaining: tokens,
                retry_after: 0.0,
                reason: DecisionReason::Allowed,
            }
        } else {
            Self {
                allowed,
                remaining: tokens,
                retry_after: retry_after(tokens, cost, config),
                reason: DecisionReason::RateLimited,
            }
        }
    }

    pub fn fail_open() -> Self {
        Self {
            allowed: true,
            remaining: 0.0,
            retry_after: 0.0,
            reason: DecisionReason::FailOpen,
        }
    }

    pub fn fail_closed() -> Self {
        Self {
            allowed: false,
            remaining: 0.0,
            retry_after: 0.0,
            reason: DecisionReason::FailClosed,
        }
    }

    pub fn rejected() -> Self {
        Self {
            allowed: false,
            remaining: 0.0,
            retry_after: f64::INFINITY,
            reason: DecisionReason::Rejected,
        }
    }
}

pub fn retry_after(tokens: f64, cost: f64, config: &RateLimitConfig) -> f64 {
    if config.capacity <= 0.0 || cost > config.capacity {
        return f64::INFINITY;
    }
    let missing = cost - tokens;
    if missing <= 0.0 {
        return 0.0;
    }
    if config.refill_rate <= 0.0 {
        return f64::INFINITY;
    }
    (missing / config.refill_rate).max(0.0)
}

/// The refill clock advances to `now_ms` even on denial, so idle time spent
/// being denied is never credited twice. A zero-capacity bucket denies
/// everything, including zero-cost requests.
pub fn compute(
    state: Option<BucketState>,
    config: &RateLimitConfig,
    now_ms: i64,
    cost: f64,
) -> (BucketState, Decision) {
    let state = state.unwrap_or_else(|| BucketState::full(config, now_ms));

    let delta_secs = now_ms.saturating_sub(state.last_refill_ms).max(0) as f64 / 1000.0;
    let refilled = (state.tokens + delta_secs * config.refill_rate)
        .min(config.capacity)
        .max(0.0);

    let allowed = config.capacity > 0.0 && refilled >= cost;
    let tokens = if allowed { refilled - cost } else { refilled };

    let next = BucketState {
        tokens,
        last_refill_ms: now_ms,
    };
    (next, Decision::from_tokens(allowed, tokens, cost, config))
}
