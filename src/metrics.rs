use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct LimiterMetrics {
    allowed_total: AtomicU64,
    denied_total: AtomicU64,
    fail_open_total: AtomicU64,
    fail_closed_total: AtomicU64,
    store_errors_total: AtomicU64,
    state_recoveries_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub allowed: u64,
    pub denied: u64,
    pub fail_open: u64,
    pub fail_closed: u64,
    pub store_errors: u64,
    pub state_recoveries: u64,
}

impl LimiterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allowed(&self) {
        self.allowed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn denied(&self) {
        self.denied_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fail_open(&self) {
        self.store_errors_total.fetch_add(1, Ordering::Relaxed);
        self.fail_open_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fail_closed(&self) {
        self.store_errors_total.fetch_add(1, Ordering::Relaxed);
        self.fail_closed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn state_recovered(&self) {
        self.state_recoveries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allowed: self.allowed_total.load(Ordering::Relaxed),
            denied: self.denied_total.load(Ordering::Relaxed),
            fail_open: self.fail_open_total.load(Ordering::Relaxed),
            fail_closed: self.fail_closed_total.load(Ordering::Relaxed),
            store_errors: self.store_errors_total.load(Ordering::Relaxed),
            state_recoveries: self.state_recoveries_total.load(Ordering::Relaxed),
        }
    }

    pub fn render_prometheus(&self) -> String {
        let snap = self.snapshot();
        format!(
            concat!(
                "# TYPE ratelimit_allowed_total counter\n",
                "ratelimit_allowed_total {}\n",
                "# TYPE ratelimit_denied_total counter\n",
                "ratelimit_denied_total {}\n",
                "# TYPE ratelimit_fail_open_total counter\n",
                "ratelimit_fail_open_total {}\n",
                "# TYPE ratelimit_fail_closed_total counter\n",
                "ratelimit_fail_closed_total {}\n",
                "# TYPE ratelimit_store_errors_total counter\n",
                "ratelimit_store_errors_total {}\n",
                "# TYPE ratelimit_state_recoveries_total counter\n",
                "ratelimit_state_recoveries_total {}\n"
            ),
            snap.allowed,
            snap.denied,
            snap.fail_open,
            snap.fail_closed,
            snap.store_errors,
            snap.state_recoveries,
        )
    }
}
