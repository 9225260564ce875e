//! Policy layer above the runtime adapter: hardening injection, image
//! resolution, session labeling, and batched or queued destruction.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::runtime::{CreateSpec, HardeningSpec, NetworkMode, RuntimeAdapter, SandboxHandle};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const DEFAULT_CHUNK_SIZE: usize = 50;
const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_WORKING_DIR: &str = "/mnt/data";
const DESTRUCTION_QUEUE_CAPACITY: usize = 1024;

pub const MASKED_PATHS: &[&str] = &[
    "/proc/version",
    "/proc/version_signature",
    "/proc/cpuinfo",
    "/proc/meminfo",
    "/proc/kcore",
    "/proc/keys",
    "/proc/timer_list",
    "/proc/sched_debug",
    "/proc/kallsyms",
    "/proc/modules",
    "/sys/firmware",
    "/sys/kernel/security",
    "/etc/machine-id",
    "/var/lib/dbus/machine-id",
];

pub const READONLY_PATHS: &[&str] = &["/proc/bus", "/proc/fs", "/proc/irq", "/proc/sys", "/proc/sysrq-trigger"];

pub struct SandboxManager {
    runtime: Arc<dyn RuntimeAdapter>,
    config: Config,
    destroy_tx: mpsc::Sender<SandboxHandle>,
}

impl SandboxManager {
    pub fn new(runtime: Arc<dyn RuntimeAdapter>, config: Config) -> CoreResult<Self> {
        let limits = &config.resource_limits;
        if limits.max_memory_mb.is_none()
            || limits.max_cpus.is_none()
            || limits.max_pids.is_none()
            || limits.max_open_files.is_none()
        {
            return Err(CoreError::internal(
                "refusing to construct a sandbox manager with unset resource ceilings",
            ));
        }

        let (destroy_tx, mut destroy_rx) = mpsc::channel::<SandboxHandle>(DESTRUCTION_QUEUE_CAPACITY);
        let consumer_runtime = runtime.clone();
        tokio::spawn(async move {
            // Drains whatever queued up since the last chunk (up to
            // DEFAULT_CHUNK_SIZE) so a removal stall in one chunk can't
            // let the queue grow unboundedly behind it; each chunk gets
            // the same timeout protection as `batch_destroy_with`.
            let mut buffer = Vec::with_capacity(DEFAULT_CHUNK_SIZE);
            while let Some(handle) = destroy_rx.recv().await {
                buffer.push(handle);
                while buffer.len() < DEFAULT_CHUNK_SIZE {
                    match destroy_rx.try_recv() {
                        Ok(handle) => buffer.push(handle),
                        Err(_) => break,
                    }
                }

                let chunk = std::mem::replace(&mut buffer, Vec::with_capacity(DEFAULT_CHUNK_SIZE));
                let futures = chunk.iter().map(|h| {
                    let runtime = consumer_runtime.clone();
                    let h = h.clone();
                    async move { runtime.remove(&h, true).await }
                });

                match tokio::time::timeout(DEFAULT_CHUNK_TIMEOUT, futures_util::future::join_all(futures)).await {
                    Ok(results) => {
                        for (handle, result) in chunk.iter().zip(results) {
                            if let Err(e) = result {
                                warn!(sandbox_id = %handle.id, error = %e, "queued destruction failed");
                            }
                        }
                    }
                    Err(_) => warn!(chunk_size = chunk.len(), "queued destruction chunk timed out after {DEFAULT_CHUNK_TIMEOUT:?}"),
                }
            }
        });

        Ok(Self { runtime, config, destroy_tx })
    }

    /// Enqueues a sandbox for asynchronous destruction. Backpressure from a
    /// full queue degrades to an immediate synchronous removal rather than
    /// blocking the caller indefinitely.
    pub async fn enqueue_destroy(&self, handle: SandboxHandle) {
        if let Err(mpsc::error::TrySendError::Full(handle)) = self.destroy_tx.try_send(handle) {
            warn!(sandbox_id = %handle.id, "destruction queue full, destroying synchronously");
            let _ = self.runtime.remove(&handle, true).await;
        }
    }

    fn hardening(&self) -> HardeningSpec {
        let limits = &self.config.resource_limits;
        let network_mode = if self.config.network.enable_wan_access { NetworkMode::Wan } else { NetworkMode::None };

        HardeningSpec {
            memory_mb: limits.max_memory_mb.unwrap(),
            nano_cpus: (limits.max_cpus.unwrap() * 1_000_000_000.0) as u64,
            pids_limit: limits.max_pids.unwrap(),
            open_files_limit: limits.max_open_files.unwrap(),
            cap_drop_all: true,
            cap_add: vec!["CHOWN".into(), "DAC_OVERRIDE".into(), "FOWNER".into(), "SETGID".into(), "SETUID".into()],
            masked_paths: if self.config.hardening.mask_host_info {
                MASKED_PATHS.iter().map(|s| s.to_string()).collect()
            } else {
                Vec::new()
            },
            readonly_paths: READONLY_PATHS.iter().map(|s| s.to_string()).collect(),
            seccomp_profile_json: self
                .config
                .hardening
                .seccomp_profile_path
                .as_ref()
                .and_then(|p| std::fs::read_to_string(p).ok())
                .or_else(|| Some(crate::runtime::seccomp::default_profile_json().to_string())),
            hostname: "sandbox".to_string(),
            network_mode,
            wan_dns_servers: self.config.network.wan_dns_servers.clone(),
        }
    }

    /// Creates, starts, and returns a sandbox bound to `session_id`, using
    /// the idle-loop command by default or a REPL-mode env flag when asked.
    pub async fn create_for_session(&self, language: &str, session_id: &str, repl_mode: bool) -> CoreResult<SandboxHandle> {
        let image = self.runtime.resolve_image(language).await?;

        let mut env = HashMap::new();
        if repl_mode {
            env.insert("REPL_MODE".to_string(), "true".to_string());
        }

        let mut labels = HashMap::new();
        labels.insert("repl-mode".to_string(), repl_mode.to_string());
        labels.insert("wan-access".to_string(), self.config.network.enable_wan_access.to_string());

        let spec = CreateSpec {
            image,
            session_id: session_id.to_string(),
            working_dir: DEFAULT_WORKING_DIR.to_string(),
            env,
            language: language.to_string(),
            hardening: self.hardening(),
            command: Vec::new(),
            labels,
        };

        let handle = self.runtime.create(spec).await?;
        self.runtime.start(&handle).await?;
        Ok(handle)
    }

    /// Prefers the `created-at` label (ISO8601, UTC); falls back to the
    /// handle's adapter-recorded `created_at` if the label is missing or
    /// fails to parse, so a sandbox created by a future adapter that
    /// labels differently still ages out correctly.
    pub fn age_minutes(&self, handle: &SandboxHandle) -> Option<f64> {
        let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).ok()?.as_secs();
        let created = handle
            .labels
            .get("created-at")
            .and_then(|s| crate::runtime::local::parse_iso8601(s))
            .or_else(|| handle.created_at.duration_since(std::time::UNIX_EPOCH).ok().map(|d| d.as_secs()))?;
        Some((now.saturating_sub(created)) as f64 / 60.0)
    }

    /// Force-removes sandboxes in chunks of `chunk_size`, concurrently
    /// within each chunk, bounding each chunk to 30s. Returns the number
    /// of successful removals.
    pub async fn batch_destroy(&self, handles: Vec<SandboxHandle>) -> usize {
        self.batch_destroy_with(handles, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_TIMEOUT).await
    }

    pub async fn batch_destroy_with(&self, handles: Vec<SandboxHandle>, chunk_size: usize, chunk_timeout: Duration) -> usize {
        let mut destroyed = 0;
        for chunk in handles.chunks(chunk_size.max(1)) {
            let futures = chunk.iter().map(|h| {
                let runtime = self.runtime.clone();
                let h = h.clone();
                async move { runtime.remove(&h, true).await }
            });

            let result = tokio::time::timeout(chunk_timeout, futures_util::future::join_all(futures)).await;
            match result {
                Ok(results) => destroyed += results.into_iter().filter(|r| r.is_ok()).count(),
                Err(_) => warn!("batch_destroy chunk timed out after {chunk_timeout:?}"),
            }
        }
        destroyed
    }

    pub async fn cleanup_by_session(&self, session_id: &str) -> CoreResult<usize> {
        let handles = self.runtime.list_by_label("session-id", session_id).await?;
        let n = handles.len();
        self.batch_destroy(handles).await;
        info!(session_id, removed = n, "cleaned up sandboxes for session");
        Ok(n)
    }

    pub async fn cleanup_aged(&self, max_age_min: f64) -> CoreResult<usize> {
        let handles = self.runtime.list_by_label("managed", "true").await?;
        let aged: Vec<SandboxHandle> = handles
            .into_iter()
            .filter(|h| self.age_minutes(h).map(|age| age >= max_age_min).unwrap_or(false))
            .collect();
        let n = aged.len();
        self.batch_destroy(aged).await;
        Ok(n)
    }

    pub fn runtime(&self) -> Arc<dyn RuntimeAdapter> {
        self.runtime.clone()
    }
}
