use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::{
    error::LimiterResult,
    ratelimit::{BucketOutcome, BucketRequest, BucketStore, codec, engine},
};

const SWEEP_EVERY: u64 = 1024;

pub struct InMemoryBucketStore {
    state: DashMap<String, Arc<Mutex<StoredBucket>>>,
    ops: AtomicU64,
}

#[derive(Debug, Default)]
struct StoredBucket {
    fields: HashMap<String, String>,
    expires_at_ms: i64,
}

impl StoredBucket {
    fn is_live(&self, now_ms: i64) -> bool {
        !self.fields.is_empty() && now_ms < self.expires_at_ms
    }
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self {
            state: DashMap::new(),
            ops: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    // Entries held by a caller are kept until a later pass.
    pub fn purge_expired(&self, now_ms: i64) {
        self.state.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(bucket) => bucket.is_live(now_ms),
                Err(_) => true,
            }
        });
    }

    fn slot_for(&self, key: &str) -> Arc<Mutex<StoredBucket>> {
        if let Some(slot) = self.state.get(key) {
            return Arc::clone(slot.value());
        }
        self.state
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(StoredBucket::default())))
            .clone()
    }

    #[cfg(test)]
    pub(crate) async fn insert_raw(&self, key: &str, fields: &[(&str, &str)], expires_at_ms: i64) {
        let slot = self.slot_for(key);
        let mut slot = slot.lock().await;
        slot.fields = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        slot.expires_at_ms = expires_at_ms;
    }
}

impl Default for InMemoryBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn apply(&self, request: BucketRequest<'_>) -> LimiterResult<BucketOutcome> {
        let outcome = {
            let slot = self.slot_for(request.key);
            let mut bucket = slot.lock().await;

            let stored = if bucket.is_live(request.now_ms) {
                codec::decode(&bucket.fields)
            } else {
                Ok(None)
            };

            let (previous, recovered) = match stored {
                Ok(previous) => (previous, false),
                Err(err) => {
                    tracing::warn!(
                        key = %request.key,
                        error = %err,
                        "discarding unreadable bucket state"
                    );
                    (None, true)
                }
            };

            let (next, decision) =
                engine::compute(previous, request.config, request.now_ms, request.cost);

            bucket.fields = codec::encode(&next)
                .into_iter()
                .map(|(field, value)| (field.to_string(), value))
                .collect();
            let ttl_ms = i64::try_from(request.ttl.as_millis()).unwrap_or(i64::MAX);
            bucket.expires_at_ms = request.now_ms.saturating_add(ttl_ms);

            BucketOutcome {
                allowed: decision.allowed,
                tokens: next.tokens,
                recovered,
            }
        };

        if self.ops.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.purge_expired(request.now_ms);
        }

        Ok(outcome)
    }
}
