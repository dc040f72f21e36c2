//! Metrics collection for engine health

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Counter/gauge collector shared across the engine
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<RwLock<MetricsInner>>,
}

struct MetricsInner {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MetricsInner {
                counters: HashMap::new(),
                gauges: HashMap::new(),
                start_time: Instant::now(),
            })),
        }
    }

    /// Increment a counter
    pub async fn increment(&self, name: &str, value: u64) {
        let mut inner = self.inner.write().await;
        let counter = inner.counters.entry(name.to_string()).or_insert(0);
        *counter += value;
    }

    /// Set a gauge value
    pub async fn gauge(&self, name: &str, value: f64) {
        let mut inner = self.inner.write().await;
        inner.gauges.insert(name.to_string(), value);
    }

    /// Get all metrics as a serializable snapshot
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read().await;
        MetricsSnapshot {
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
            uptime_secs: inner.start_time.elapsed().as_secs(),
        }
    }

    /// Get specific counter
    pub async fn get_counter(&self, name: &str) -> u64 {
        let inner = self.inner.read().await;
        inner.counters.get(name).copied().unwrap_or(0)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable metrics snapshot
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub uptime_secs: u64,
}

/// Counter names used by the engine
pub mod names {
    pub const ORDERS_ADMITTED: &str = "orders_admitted";
    pub const ORDERS_REJECTED_IDEMPOTENCY: &str = "orders_rejected_idempotency";
    pub const ORDERS_REJECTED_FEE_COVERAGE: &str = "orders_rejected_fee_coverage";
    pub const ORDERS_REJECTED_LIMITER: &str = "orders_rejected_limiter";
    pub const ORDERS_REJECTED_BREAKER: &str = "orders_rejected_breaker";
    pub const ORDERS_FAILED_EXCHANGE: &str = "orders_failed_exchange";
    pub const BREAKER_TRIPS: &str = "breaker_trips";
    pub const ALLOCATOR_RUNS: &str = "allocator_runs";
    pub const ALLOCATOR_SKIPS: &str = "allocator_skips";
}
