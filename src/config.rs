use anyhow::{Context, Result, anyhow};
use std::{
    collections::BTreeMap,
    env,
    str::FromStr,
    time::Duration,
};

use crate::{
    error::{LimiterError, LimiterResult},
    telemetry::LogFormat,
};

pub const MAX_STATE_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    // tokens per second
    pub refill_rate: f64,
    pub capacity: f64,
}

impl RateLimitConfig {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            refill_rate,
            capacity,
        }
    }

    pub fn validate(&self) -> LimiterResult<()> {
        if !self.capacity.is_finite() || self.capacity <= 0.0 {
            return Err(LimiterError::Configuration(format!(
                "capacity must be a finite value > 0, got {}",
                self.capacity
            )));
        }
        if !self.refill_rate.is_finite() || self.refill_rate < 0.0 {
            return Err(LimiterError::Configuration(format!(
                "refill rate must be a finite value >= 0, got {}",
                self.refill_rate
            )));
        }
        if self.refill_rate > 0.0 && self.capacity / self.refill_rate > MAX_STATE_TTL.as_secs_f64() {
            return Err(LimiterError::Configuration(format!(
                "a full refill takes {}s, longer than the {}s state TTL limit",
                self.capacity / self.refill_rate,
                MAX_STATE_TTL.as_secs()
            )));
        }
        Ok(())
    }

    pub fn validate_cost(&self, cost: f64) -> LimiterResult<()> {
        if !cost.is_finite() || cost < 0.0 {
            return Err(LimiterError::Configuration(format!(
                "cost must be a finite value >= 0, got {cost}"
            )));
        }
        if cost > self.capacity {
            return Err(LimiterError::Configuration(format!(
                "cost {cost} exceeds bucket capacity {}",
                self.capacity
            )));
        }
        Ok(())
    }

    /// Idle keys must outlive a full refill, otherwise expiry would hand out
    /// a fresh bucket early. Never exceeds [`MAX_STATE_TTL`].
    pub fn effective_ttl(&self, configured: Duration) -> Duration {
        let configured = configured.min(MAX_STATE_TTL);
        if self.refill_rate <= 0.0 {
            return configured;
        }
        let full_refill_secs = (self.capacity / self.refill_rate)
            .ceil()
            .min(MAX_STATE_TTL.as_secs_f64());
        let full_refill = Duration::from_secs(full_refill_secs as u64);
        configured
            .max(full_refill)
            .max(Duration::from_secs(1))
            .min(MAX_STATE_TTL)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    #[default]
    Open,
    Closed,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" | "fail_open" => Ok(Self::Open),
            "closed" | "fail_closed" => Ok(Self::Closed),
            other => Err(format!("unsupported failure policy: {other}")),
        }
    }
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    InMemory,
    Redis { url: String },
}

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub policy: RateLimitConfig,
    pub default_cost: f64,
    pub failure_policy: FailurePolicy,
    pub backend: BackendConfig,
    pub key_prefix: String,
    pub state_ttl: Duration,
    pub store_timeout: Duration,
    pub classes: BTreeMap<String, RateLimitConfig>,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl LimiterConfig {
    pub fn new(policy: RateLimitConfig) -> Self {
        Self {
            policy,
            default_cost: 1.0,
            failure_policy: FailurePolicy::Open,
            backend: BackendConfig::InMemory,
            key_prefix: "ratelimit".to_string(),
            state_ttl: Duration::from_secs(60),
            store_timeout: Duration::from_millis(100),
            classes: BTreeMap::new(),
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let policy = RateLimitConfig {
            capacity: parse_var(&lookup, "RATE_LIMIT_CAPACITY", 200.0f64)?,
            refill_rate: parse_var(&lookup, "RATE_LIMIT_REFILL_TPS", 100.0f64)?,
        };

        let failure_policy = lookup("RATE_LIMIT_FAILURE_POLICY")
            .map(|raw| raw.parse::<FailurePolicy>().map_err(|e| anyhow!(e)))
            .transpose()?
            .unwrap_or_default();

        let backend = match lookup("RATE_LIMIT_BACKEND")
            .unwrap_or_else(|| "memory".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" | "in_memory" => BackendConfig::InMemory,
            "redis" => BackendConfig::Redis {
                url: lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            },
            other => return Err(anyhow!("unsupported RATE_LIMIT_BACKEND: {other}")),
        };

        let classes = match lookup("RATE_LIMIT_CLASSES") {
            Some(raw) => parse_classes(&raw)?,
            None => BTreeMap::new(),
        };

        let log_format = lookup("LOG_FORMAT")
            .map(|raw| raw.parse::<LogFormat>().map_err(|e| anyhow!(e)))
            .transpose()?
            .unwrap_or_default();

        let config = Self {
            policy,
            default_cost: parse_var(&lookup, "RATE_LIMIT_DEFAULT_COST", 1.0f64)?,
            failure_policy,
            backend,
            key_prefix: lookup("RATE_LIMIT_KEY_PREFIX").unwrap_or_else(|| "ratelimit".to_string()),
            state_ttl: Duration::from_secs(parse_var(
                &lookup,
                "RATE_LIMIT_STATE_TTL_SECONDS",
                60u64,
            )?),
            store_timeout: Duration::from_millis(parse_var(
                &lookup,
                "RATE_LIMIT_STORE_TIMEOUT_MS",
                100u64,
            )?),
            classes,
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_format,
        };

        config.validate().context("rate limiter configuration rejected")?;
        Ok(config)
    }

    pub fn validate(&self) -> LimiterResult<()> {
        self.policy.validate()?;
        self.policy.validate_cost(self.default_cost)?;

        for (name, class) in &self.classes {
            class
                .validate()
                .and_then(|_| class.validate_cost(self.default_cost))
                .map_err(|e| LimiterError::Configuration(format!("class {name}: {e}")))?;
        }

        if self.state_ttl.is_zero() {
            return Err(LimiterError::Configuration(
                "state TTL must be at least one second".to_string(),
            ));
        }
        if self.state_ttl > MAX_STATE_TTL {
            return Err(LimiterError::Configuration(format!(
                "state TTL must not exceed {}s",
                MAX_STATE_TTL.as_secs()
            )));
        }
        if self.store_timeout.is_zero() {
            return Err(LimiterError::Configuration(
                "store timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn class(&self, name: &str) -> Option<&RateLimitConfig> {
        self.classes.get(name)
    }
}

fn parse_classes(raw: &str) -> Result<BTreeMap<String, RateLimitConfig>> {
    let mut out = BTreeMap::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let (name, rhs) = chunk
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid rate limit class entry: {chunk}"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("rate limit class has no name: {chunk}"));
        }

        let (capacity, refill) = rhs
            .split_once('/')
            .ok_or_else(|| anyhow!("class {name} must be written as capacity/refill"))?;
        let capacity = capacity
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid capacity for class {name}"))?;
        let refill_rate = refill
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid refill rate for class {name}"))?;

        out.insert(name.to_string(), RateLimitConfig::new(capacity, refill_rate));
    }
    Ok(out)
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("invalid {key}={raw}: {e}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = LimiterConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(cfg.policy, RateLimitConfig::new(200.0, 100.0));
        assert_eq!(cfg.failure_policy, FailurePolicy::Open);
        assert_eq!(cfg.backend, BackendConfig::InMemory);
        assert_eq!(cfg.key_prefix, "ratelimit");
        assert_eq!(cfg.state_ttl, Duration::from_secs(60));
        assert_eq!(cfg.store_timeout, Duration::from_millis(100));
        assert!(cfg.classes.is_empty());
    }

    #[test]
    fn reads_redis_backend_and_classes() {
        let cfg = LimiterConfig::from_lookup(lookup_from(&[
            ("RATE_LIMIT_BACKEND", "redis"),
            ("REDIS_URL", "redis://cache:6379"),
            ("RATE_LIMIT_FAILURE_POLICY", "closed"),
            ("RATE_LIMIT_CLASSES", "free=10/1, pro=100/50"),
        ]))
        .unwrap();

        assert_eq!(
            cfg.backend,
            BackendConfig::Redis {
                url: "redis://cache:6379".to_string()
            }
        );
        assert_eq!(cfg.failure_policy, FailurePolicy::Closed);
        assert_eq!(cfg.class("free"), Some(&RateLimitConfig::new(10.0, 1.0)));
        assert_eq!(cfg.class("pro"), Some(&RateLimitConfig::new(100.0, 50.0)));
    }

    #[test]
    fn malformed_values_fail_instead_of_defaulting() {
        assert!(
            LimiterConfig::from_lookup(lookup_from(&[("RATE_LIMIT_CAPACITY", "lots")])).is_err()
        );
        assert!(
            LimiterConfig::from_lookup(lookup_from(&[("RATE_LIMIT_FAILURE_POLICY", "maybe")]))
                .is_err()
        );
        assert!(LimiterConfig::from_lookup(lookup_from(&[("RATE_LIMIT_CLASSES", "free")])).is_err());
    }

    #[test]
    fn rejects_invalid_policies() {
        assert!(RateLimitConfig::new(0.0, 1.0).validate().is_err());
        assert!(RateLimitConfig::new(5.0, -1.0).validate().is_err());
        assert!(RateLimitConfig::new(f64::INFINITY, 1.0).validate().is_err());
        assert!(RateLimitConfig::new(5.0, 0.0).validate().is_ok());

        let err = LimiterConfig::from_lookup(lookup_from(&[
            ("RATE_LIMIT_CAPACITY", "5"),
            ("RATE_LIMIT_DEFAULT_COST", "10"),
        ]))
        .unwrap_err();
        assert!(format!("{err:#}").contains("exceeds bucket capacity"));
    }

    #[test]
    fn class_cost_is_checked_against_class_capacity() {
        let mut cfg = LimiterConfig::new(RateLimitConfig::new(10.0, 1.0));
        cfg.default_cost = 3.0;
        cfg.classes
            .insert("tiny".to_string(), RateLimitConfig::new(2.0, 1.0));

        assert!(matches!(cfg.validate(), Err(LimiterError::Configuration(msg)) if msg.contains("tiny")));
    }

    #[test]
    fn ttl_is_bounded_for_extreme_ratios() {
        let glacial = RateLimitConfig::new(1e6, 1e-12);
        assert!(matches!(glacial.validate(), Err(LimiterError::Configuration(_))));
        assert_eq!(glacial.effective_ttl(Duration::from_secs(60)), MAX_STATE_TTL);
        assert_eq!(
            RateLimitConfig::new(10.0, 0.0).effective_ttl(Duration::from_secs(u64::MAX)),
            MAX_STATE_TTL
        );

        let mut cfg = LimiterConfig::new(RateLimitConfig::new(10.0, 1.0));
        cfg.state_ttl = MAX_STATE_TTL + Duration::from_secs(1);
        assert!(cfg.validate().is_err());

        let ttl_ms = i64::try_from(MAX_STATE_TTL.as_millis()).unwrap();
        assert!(ttl_ms < i64::MAX / 1_000);
    }

    #[test]
    fn ttl_covers_full_refill() {
        let slow = RateLimitConfig::new(600.0, 1.0);
        assert_eq!(
            slow.effective_ttl(Duration::from_secs(60)),
            Duration::from_secs(600)
        );

        let fast = RateLimitConfig::new(10.0, 100.0);
        assert_eq!(
            fast.effective_ttl(Duration::from_secs(60)),
            Duration::from_secs(60)
        );

        let frozen = RateLimitConfig::new(10.0, 0.0);
        assert_eq!(
            frozen.effective_ttl(Duration::from_secs(60)),
            Duration::from_secs(60)
        );
    }
}
