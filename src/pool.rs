//! Per-language sandbox reservoir: warmup, acquire (hit/miss), refill,
//! fresh-pod-per-execution release, and EWMA acquire-time tracking.

use crate::error::CoreResult;
use crate::runtime::SandboxHandle;
use crate::sandbox_manager::SandboxManager;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::info;

/// Smoothing factor for the acquire-time EWMA.
const EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub language: String,
    pub available: usize,
    pub creating: usize,
    pub target_size: usize,
    pub total_acquisitions: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub created: u64,
    pub destroyed: u64,
    pub avg_acquire_ms: f64,
}

pub enum PoolOrigin {
    Hit,
    Miss,
}

struct Bucket {
    language: String,
    target_size: usize,
    warmup_on_startup: bool,
    available: VecDeque<SandboxHandle>,
    creating: usize,
    total_acquisitions: u64,
    pool_hits: u64,
    pool_misses: u64,
    created: u64,
    destroyed: u64,
    avg_acquire_ms: f64,
}

impl Bucket {
    fn new(language: &str, target_size: usize, warmup_on_startup: bool) -> Self {
        Self {
            language: language.to_string(),
            target_size,
            warmup_on_startup,
            available: VecDeque::new(),
            creating: 0,
            total_acquisitions: 0,
            pool_hits: 0,
            pool_misses: 0,
            created: 0,
            destroyed: 0,
            avg_acquire_ms: 0.0,
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            language: self.language.clone(),
            available: self.available.len(),
            creating: self.creating,
            target_size: self.target_size,
            total_acquisitions: self.total_acquisitions,
            pool_hits: self.pool_hits,
            pool_misses: self.pool_misses,
            created: self.created,
            destroyed: self.destroyed,
            avg_acquire_ms: self.avg_acquire_ms,
        }
    }

    fn record_acquire(&mut self, elapsed: Duration, hit: bool) {
        self.total_acquisitions += 1;
        if hit {
            self.pool_hits += 1;
        } else {
            self.pool_misses += 1;
        }
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.avg_acquire_ms = if self.total_acquisitions == 1 {
            ms
        } else {
            EWMA_ALPHA * ms + (1.0 - EWMA_ALPHA) * self.avg_acquire_ms
        };
    }
}

/// Per-language buckets plus shared access to the sandbox manager used to
/// create and destroy members.
pub struct Pool {
    manager: Arc<SandboxManager>,
    buckets: HashMap<String, Mutex<Bucket>>,
    refill_generation: AtomicU64,
}

impl Pool {
    pub fn new(manager: Arc<SandboxManager>, target_sizes: &HashMap<String, usize>, warmup_on_startup: bool) -> Self {
        let buckets = target_sizes
            .iter()
            .map(|(lang, size)| (lang.clone(), Mutex::new(Bucket::new(lang, *size, warmup_on_startup))))
            .collect();
        Self { manager, buckets, refill_generation: AtomicU64::new(0) }
    }

    /// Creates sandboxes up to `target_size` for every configured language
    /// with `warmup_on_startup` set, bounded by an inner concurrency cap so
    /// a large fleet of languages doesn't spawn unbounded parallel creates.
    pub async fn warmup_all(self: &Arc<Self>) {
        let languages: Vec<String> = self.buckets.keys().cloned().collect();
        for language in languages {
            self.warmup(&language).await;
        }
    }

    pub async fn warmup(self: &Arc<Self>, language: &str) {
        let Some(bucket_lock) = self.buckets.get(language) else { return };
        let (target, warmup_on_startup, session_seed) = {
            let bucket = bucket_lock.lock().await;
            (bucket.target_size, bucket.warmup_on_startup, format!("warmup-{language}"))
        };
        if !warmup_on_startup || target == 0 {
            return;
        }

        const INNER_CONCURRENCY: usize = 8;
        let mut remaining = target;
        while remaining > 0 {
            let batch = remaining.min(INNER_CONCURRENCY);
            {
                let mut bucket = bucket_lock.lock().await;
                bucket.creating += batch;
            }

            let mut handles = Vec::with_capacity(batch);
            for i in 0..batch {
                let manager = self.manager.clone();
                let language = language.to_string();
                let session_id = format!("{session_seed}-{i}");
                handles.push(tokio::spawn(async move { manager.create_for_session(&language, &session_id, false).await }));
            }
            for h in handles {
                let mut bucket = bucket_lock.lock().await;
                bucket.creating -= 1;
                match h.await {
                    Ok(Ok(handle)) => {
                        bucket.available.push_back(handle);
                        bucket.created += 1;
                    }
                    _ => {
                        bucket.destroyed += 1;
                    }
                }
            }
            remaining -= batch;
        }

        info!(language, target, "pool warmed up");
    }

    pub async fn acquire(self: &Arc<Self>, language: &str, session_id: &str) -> CoreResult<(SandboxHandle, PoolOrigin)> {
        let started = Instant::now();

        if let Some(bucket_lock) = self.buckets.get(language) {
            let popped = {
                let mut bucket = bucket_lock.lock().await;
                bucket.available.pop_front()
            };
            if let Some(handle) = popped {
                // A pooled sandbox still carries the warmup/refill session-id
                // it was created under; rebind it to the real caller before
                // handing it out so labels like cleanup_by_session stay accurate.
                let mut rebind = HashMap::new();
                rebind.insert("session-id".to_string(), session_id.to_string());
                let handle = self.manager.runtime().relabel(&handle, rebind).await.unwrap_or(handle);

                let mut bucket = bucket_lock.lock().await;
                bucket.record_acquire(started.elapsed(), true);
                drop(bucket);
                self.trigger_refill(language);
                return Ok((handle, PoolOrigin::Hit));
            }
        }

        let handle = self.manager.create_for_session(language, session_id, false).await?;

        if let Some(bucket_lock) = self.buckets.get(language) {
            let mut bucket = bucket_lock.lock().await;
            bucket.created += 1;
            bucket.record_acquire(started.elapsed(), false);
        }

        Ok((handle, PoolOrigin::Miss))
    }

    /// Never returns the sandbox to the pool; always enqueues it for
    /// destruction and triggers a refill of the bucket it came from. Uses
    /// the manager's bounded destruction queue rather than awaiting the
    /// removal inline, so a slow teardown never blocks the next acquire.
    pub async fn release(self: &Arc<Self>, language: &str, handle: SandboxHandle) {
        self.manager.enqueue_destroy(handle).await;
        if let Some(bucket_lock) = self.buckets.get(language) {
            let mut bucket = bucket_lock.lock().await;
            bucket.destroyed += 1;
        }
        self.trigger_refill(language);
    }

    fn trigger_refill(self: &Arc<Self>, language: &str) {
        let language = language.to_string();
        let pool = self.clone();
        tokio::spawn(async move {
            pool.refill_tick(&language).await;
        });
    }

    /// Tops a bucket back up to `target_size`. The needed-count computation
    /// and the `creating` reservation happen under a single lock hold, so
    /// concurrent callers (acquire misses, release, the periodic loop) can't
    /// both observe the same shortfall and double-provision; whichever
    /// caller wins the lock first reserves the full gap and the rest see
    /// `needed == 0`. The generation counter only labels the spawned
    /// sessions for observability, it plays no part in the coalescing.
    pub async fn refill_tick(self: &Arc<Self>, language: &str) {
        let Some(bucket_lock) = self.buckets.get(language) else { return };
        let generation = self.refill_generation.fetch_add(1, Ordering::SeqCst);

        let needed = {
            let mut bucket = bucket_lock.lock().await;
            let needed = bucket.target_size.saturating_sub(bucket.available.len() + bucket.creating);
            bucket.creating += needed;
            needed
        };
        if needed == 0 {
            return;
        }

        for i in 0..needed {
            let manager = self.manager.clone();
            let language = language.to_string();
            let session_id = format!("refill-{language}-{generation}-{i}");
            match manager.create_for_session(&language, &session_id, false).await {
                Ok(handle) => {
                    let mut bucket = bucket_lock.lock().await;
                    bucket.available.push_back(handle);
                    bucket.created += 1;
                    bucket.creating -= 1;
                }
                Err(_) => {
                    let mut bucket = bucket_lock.lock().await;
                    bucket.creating -= 1;
                }
            }
        }
    }

    pub async fn stats(&self, language: &str) -> Option<PoolStats> {
        let bucket = self.buckets.get(language)?.lock().await;
        Some(bucket.stats())
    }

    pub async fn stats_all(&self) -> HashMap<String, PoolStats> {
        let mut out = HashMap::new();
        for (lang, bucket_lock) in &self.buckets {
            out.insert(lang.clone(), bucket_lock.lock().await.stats());
        }
        out
    }
}

/// Spawns the periodic refill loop for every configured language. Returns
/// the join handle so the caller can abort it on shutdown.
pub fn spawn_refill_loop(pool: Arc<Pool>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let languages: Vec<String> = pool.buckets.keys().cloned().collect();
            for language in languages {
                pool.refill_tick(&language).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_blends_toward_new_samples() {
        let mut bucket = Bucket::new("py", 2, false);
        bucket.record_acquire(Duration::from_millis(100), true);
        assert!((bucket.avg_acquire_ms - 100.0).abs() < 1e-9);
        bucket.record_acquire(Duration::from_millis(200), true);
        let expected = EWMA_ALPHA * 200.0 + (1.0 - EWMA_ALPHA) * 100.0;
        assert!((bucket.avg_acquire_ms - expected).abs() < 1e-9);
    }

    #[test]
    fn stats_reflect_hits_and_misses() {
        let mut bucket = Bucket::new("rs", 0, false);
        bucket.record_acquire(Duration::from_millis(5), false);
        bucket.record_acquire(Duration::from_millis(5), true);
        let stats = bucket.stats();
        assert_eq!(stats.total_acquisitions, 2);
        assert_eq!(stats.pool_hits, 1);
        assert_eq!(stats.pool_misses, 1);
    }
}
