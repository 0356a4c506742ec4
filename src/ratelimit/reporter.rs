use http::{HeaderMap, HeaderName, HeaderValue, header};
use serde::Serialize;

use crate::ratelimit::engine::{Decision, DecisionReason};

pub const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitSignals {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    // None when waiting cannot help
    pub retry_after_secs: Option<u64>,
    pub reason: DecisionReason,
}

#[derive(Debug, Serialize)]
pub struct RejectionBody<'a> {
    pub error: &'a str,
    pub message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl RateLimitSignals {
    pub fn from_decision(decision: &Decision, limit: f64) -> Self {
        let limit = if limit.is_finite() { limit.max(0.0).floor() } else { 0.0 };
        let remaining = if decision.remaining.is_finite() {
            decision.remaining.max(0.0).floor().min(limit)
        } else {
            0.0
        };

        let retry_after_secs = if decision.allowed {
            Some(0)
        } else if decision.retry_after.is_finite() {
            // Shave float noise so 1.0000000000000002 still reads as 1.
            Some((decision.retry_after - 1e-9).ceil().max(1.0) as u64)
        } else {
            None
        };

        Self {
            allowed: decision.allowed,
            limit: limit as u64,
            remaining: remaining as u64,
            retry_after_secs,
            reason: decision.reason,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self.reason {
            DecisionReason::Allowed => "allowed",
            DecisionReason::RateLimited => "rate_limited",
            DecisionReason::FailOpen => "unenforced",
            DecisionReason::FailClosed => "limiter_unavailable",
            DecisionReason::Rejected => "invalid_request",
        }
    }

    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(LIMIT_HEADER, HeaderValue::from(self.limit));
        headers.insert(REMAINING_HEADER, HeaderValue::from(self.remaining));

        if !self.allowed {
            if let Some(secs) = self.retry_after_secs {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
            }
        }
        headers
    }

    pub fn rejection_body(&self) -> Option<RejectionBody<'static>> {
        let message = match self.reason {
            DecisionReason::Allowed | DecisionReason::FailOpen => return None,
            DecisionReason::RateLimited => "Rate limit exceeded",
            DecisionReason::FailClosed => "Rate limiter unavailable",
            DecisionReason::Rejected => "Rate limit request was malformed",
        };
        Some(RejectionBody {
            error: self.reason_code(),
            message,
            retry_after_secs: self.retry_after_secs,
        })
    }

    pub fn rejection_json(&self) -> Option<String> {
        self.rejection_body()
            .and_then(|body| serde_json::to_string(&body).ok())
    }
}
