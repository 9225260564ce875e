//! Concurrent health probes with per-service timeouts, a 30s result cache,
//! and a worst-of classification across checked services.

use crate::pool::Pool;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Mutex;

const CACHE_TTL: Duration = Duration::from_secs(30);
const KV_THRESHOLD_MS: u128 = 1000;
const OBJECT_STORE_THRESHOLD_MS: u128 = 2000;
const CLUSTER_THRESHOLD_MS: u128 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unknown,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Worst wins, in the order unhealthy > degraded > unknown > healthy.
    fn worst(self, other: HealthStatus) -> HealthStatus {
        std::cmp::max(self, other)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResult {
    pub service: String,
    pub status: HealthStatus,
    pub response_time_ms: u128,
    pub details: Option<String>,
    pub error: Option<String>,
    #[serde(serialize_with = "crate::timestamp::as_epoch_secs")]
    pub ts: SystemTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall_status: HealthStatus,
    pub services: HashMap<String, HealthResult>,
}

/// A pluggable probe target: anything that can attempt a round trip and
/// report success/failure. The kv and object-store probes are external
/// collaborators in production; this trait lets the health subsystem stay
/// agnostic of their concrete client.
#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self) -> Result<Option<String>, String>;
}

struct CachedResult {
    result: HealthResult,
    cached_at: Instant,
}

pub struct HealthProbes {
    kv: Option<Arc<dyn Probe>>,
    object_store: Option<Arc<dyn Probe>>,
    pool: Option<Arc<Pool>>,
    cache: Mutex<HashMap<String, CachedResult>>,
}

impl HealthProbes {
    pub fn new(kv: Option<Arc<dyn Probe>>, object_store: Option<Arc<dyn Probe>>, pool: Option<Arc<Pool>>) -> Self {
        Self { kv, object_store, pool, cache: Mutex::new(HashMap::new()) }
    }

    pub async fn check_all(&self, use_cache: bool) -> HealthReport {
        let mut services = HashMap::new();

        let (kv_res, store_res, pool_res) = tokio::join!(
            self.check_cached("kv", use_cache, self.check_kv()),
            self.check_cached("object-store", use_cache, self.check_object_store()),
            self.check_cached("pool", use_cache, self.check_pool()),
        );

        services.insert("kv".to_string(), kv_res);
        services.insert("object-store".to_string(), store_res);
        services.insert("pool".to_string(), pool_res);

        let overall = services.values().fold(HealthStatus::Healthy, |acc, r| acc.worst(r.status));

        HealthReport { overall_status: overall, services }
    }

    async fn check_cached(&self, name: &str, use_cache: bool, fut: impl std::future::Future<Output = HealthResult>) -> HealthResult {
        if use_cache {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(name) {
                if cached.cached_at.elapsed() < CACHE_TTL {
                    return cached.result.clone();
                }
            }
        }
        let result = fut.await;
        let mut cache = self.cache.lock().await;
        cache.insert(name.to_string(), CachedResult { result: result.clone(), cached_at: Instant::now() });
        result
    }

    async fn check_kv(&self) -> HealthResult {
        self.run_probe("kv", self.kv.clone(), KV_THRESHOLD_MS).await
    }

    async fn check_object_store(&self) -> HealthResult {
        self.run_probe("object-store", self.object_store.clone(), OBJECT_STORE_THRESHOLD_MS).await
    }

    async fn run_probe(&self, name: &str, probe: Option<Arc<dyn Probe>>, threshold_ms: u128) -> HealthResult {
        let Some(probe) = probe else {
            return HealthResult {
                service: name.to_string(),
                status: HealthStatus::Unknown,
                response_time_ms: 0,
                details: None,
                error: None,
                ts: SystemTime::now(),
            };
        };

        let started = Instant::now();
        let outcome = probe.check().await;
        let elapsed_ms = started.elapsed().as_millis();

        match outcome {
            Ok(details) => HealthResult {
                service: name.to_string(),
                status: if elapsed_ms > threshold_ms { HealthStatus::Degraded } else { HealthStatus::Healthy },
                response_time_ms: elapsed_ms,
                details,
                error: None,
                ts: SystemTime::now(),
            },
            Err(error) => HealthResult {
                service: name.to_string(),
                status: HealthStatus::Unhealthy,
                response_time_ms: elapsed_ms,
                details: None,
                error: Some(error),
                ts: SystemTime::now(),
            },
        }
    }

    async fn check_pool(&self) -> HealthResult {
        let Some(pool) = &self.pool else {
            return HealthResult {
                service: "pool".to_string(),
                status: HealthStatus::Unknown,
                response_time_ms: 0,
                details: None,
                error: None,
                ts: SystemTime::now(),
            };
        };

        let started = Instant::now();
        let stats = pool.stats_all().await;
        let elapsed_ms = started.elapsed().as_millis();

        let (available, in_use): (usize, usize) =
            stats.values().fold((0, 0), |(a, u), s| (a + s.available, u + (s.target_size.saturating_sub(s.available))));

        let status = if available == 0 && in_use == 0 {
            HealthStatus::Degraded
        } else if elapsed_ms > CLUSTER_THRESHOLD_MS {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthResult {
            service: "pool".to_string(),
            status,
            response_time_ms: elapsed_ms,
            details: Some(format!("available={available} in_use={in_use}")),
            error: None,
            ts: SystemTime::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_orders_unhealthy_over_degraded_over_unknown_over_healthy() {
        assert_eq!(HealthStatus::Healthy.worst(HealthStatus::Degraded), HealthStatus::Degraded);
        assert_eq!(HealthStatus::Degraded.worst(HealthStatus::Unhealthy), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::Unknown.worst(HealthStatus::Healthy), HealthStatus::Unknown);
        assert_eq!(HealthStatus::Unhealthy.worst(HealthStatus::Unknown), HealthStatus::Unhealthy);
    }

    struct FailingProbe;
    #[async_trait::async_trait]
    impl Probe for FailingProbe {
        async fn check(&self) -> Result<Option<String>, String> {
            Err("connection refused".to_string())
        }
    }

    #[tokio::test]
    async fn failing_probe_yields_unhealthy() {
        let probes = HealthProbes::new(Some(Arc::new(FailingProbe)), None, None);
        let report = probes.check_all(false).await;
        assert_eq!(report.services["kv"].status, HealthStatus::Unhealthy);
        assert_eq!(report.overall_status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn unconfigured_services_report_unknown() {
        let probes = HealthProbes::new(None, None, None);
        let report = probes.check_all(false).await;
        assert_eq!(report.services["kv"].status, HealthStatus::Unknown);
        assert_eq!(report.services["object-store"].status, HealthStatus::Unknown);
    }
}
