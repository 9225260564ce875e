//! Uniform surface over a container runtime: create, start, exec,
//! put/get archive, stop, remove, list-by-label, stats.
//!
//! [`RuntimeAdapter`] is the trait boundary. [`local::LocalRuntime`] is the
//! one shipped implementation, built on Linux namespaces and bind mounts
//! rather than a daemon socket, since no HTTP-based container client is
//! part of this crate's dependency stack. A cluster-pod-API backend would
//! be a second implementation of the same trait.

pub mod local;
pub mod seccomp;

use crate::error::CoreResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Opaque handle to a created sandbox. Cheap to clone; carries only
/// identifying metadata, not the underlying OS resources.
///
/// `created_at` is set once at creation time by the adapter and never
/// changes; it backs [`crate::sandbox_manager::SandboxManager::age_minutes`]
/// when the `created-at` label is missing or fails to parse.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub id: String,
    pub labels: HashMap<String, String>,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    None,
    Wan,
}

#[derive(Debug, Clone)]
pub struct HardeningSpec {
    pub memory_mb: u64,
    pub nano_cpus: u64,
    pub pids_limit: u64,
    pub open_files_limit: u64,
    pub cap_drop_all: bool,
    pub cap_add: Vec<String>,
    pub masked_paths: Vec<String>,
    pub readonly_paths: Vec<String>,
    pub seccomp_profile_json: Option<String>,
    pub hostname: String,
    pub network_mode: NetworkMode,
    pub wan_dns_servers: Vec<String>,
}

/// Parameters for [`RuntimeAdapter::create`].
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub image: String,
    pub session_id: String,
    pub working_dir: String,
    pub env: HashMap<String, String>,
    pub language: String,
    pub hardening: HardeningSpec,
    pub command: Vec<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy)]
pub struct SandboxStats {
    pub mem_mb: f64,
    pub mem_limit_mb: f64,
    pub cpu_pct: f64,
    pub ts: SystemTime,
}

/// Result of a single [`RuntimeAdapter::exec`] call.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Resolve a language tag to the first locally available image,
    /// trying a configured override, then a local-build prefix, then a
    /// public-registry prefix. Returns the full attempted list on failure.
    async fn resolve_image(&self, language: &str) -> CoreResult<String>;

    async fn create(&self, spec: CreateSpec) -> CoreResult<SandboxHandle>;

    /// Start the sandbox and poll until three consecutive reads report
    /// running, up to a 2s ceiling at 50ms intervals.
    async fn start(&self, handle: &SandboxHandle) -> CoreResult<()>;

    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: Vec<String>,
        timeout: Duration,
        cwd: Option<String>,
        stdin: Option<Vec<u8>>,
    ) -> CoreResult<ExecOutcome>;

    /// Stream a tar archive's contents into `dest_dir` inside the sandbox.
    async fn put_archive(&self, handle: &SandboxHandle, dest_dir: &str, tar_bytes: Vec<u8>) -> CoreResult<()>;

    /// Stream `path` out of the sandbox as a tar archive.
    async fn get_archive(&self, handle: &SandboxHandle, path: &str) -> CoreResult<Vec<u8>>;

    async fn stop(&self, handle: &SandboxHandle, grace: Duration) -> CoreResult<()>;

    async fn remove(&self, handle: &SandboxHandle, force: bool) -> CoreResult<()>;

    /// Merge `labels` into the sandbox's existing label set and return the
    /// updated handle. Used to rebind a pooled sandbox's `session-id` (and
    /// any other session-scoped labels) when it moves from the warm pool to
    /// a caller's execution.
    async fn relabel(&self, handle: &SandboxHandle, labels: HashMap<String, String>) -> CoreResult<SandboxHandle>;

    async fn list_by_label(&self, key: &str, value: &str) -> CoreResult<Vec<SandboxHandle>>;

    async fn stats(&self, handle: &SandboxHandle) -> CoreResult<SandboxStats>;
}

/// `(Δtotal_cpu / Δsystem_cpu) × core_count × 100`; `0.0` when either delta
/// is non-positive. Mirrors the reference container manager's
/// `_calculate_cpu_percent`.
pub fn calculate_cpu_percent(cpu_delta: i64, system_delta: i64, core_count: u32) -> f64 {
    if cpu_delta <= 0 || system_delta <= 0 {
        return 0.0;
    }
    (cpu_delta as f64 / system_delta as f64) * core_count as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_percent_zero_on_nonpositive_delta() {
        assert_eq!(calculate_cpu_percent(0, 1000, 4), 0.0);
        assert_eq!(calculate_cpu_percent(100, 0, 4), 0.0);
        assert_eq!(calculate_cpu_percent(-5, 1000, 4), 0.0);
    }

    #[test]
    fn cpu_percent_formula() {
        let pct = calculate_cpu_percent(200_000_000, 1_000_000_000, 2);
        assert!((pct - 40.0).abs() < 1e-9);
    }
}
