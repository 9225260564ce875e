//! Namespace-based [`RuntimeAdapter`] implementation.
//!
//! Each sandbox is a long-lived idle process running as PID 1 of a fresh
//! PID+mount namespace, chrooted into a private tmpfs-backed root. `exec`
//! clones its own short-lived PID+mount namespace chrooted into that same
//! root rather than joining the init process's namespace with `setns` —
//! the execution coordinator only ever runs one `exec` per sandbox before
//! destroying it, so the two processes never need to share a PID
//! namespace. `join_namespace` is kept for a future multi-exec sandbox
//! but is currently unused.

use super::seccomp::{self, SeccompProfile};
use super::{CreateSpec, ExecOutcome, HardeningSpec, RuntimeAdapter, SandboxHandle, SandboxStats};
use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{clone, setns, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, chroot, execvpe, pipe, Pid};
use std::collections::HashMap;
use std::ffi::CString;
use std::fs;
use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::RwLock;
use tracing::{info, warn};

struct CpuSample {
    proc_ticks: u64,
    system_ticks: u64,
    sampled_at: Instant,
}

struct SandboxState {
    root: PathBuf,
    init_pid: Pid,
    labels: HashMap<String, String>,
    hardening: HardeningSpec,
    last_cpu_sample: Option<CpuSample>,
    created_at: SystemTime,
}

/// Root directory under which every sandbox gets its own subdirectory, and
/// the directory used to resolve language images (each "image" is a
/// prebuilt root-fs template directory, since no registry client is part
/// of this crate's dependency stack).
pub struct LocalRuntime {
    base_dir: PathBuf,
    image_registry: Option<String>,
    image_overrides: HashMap<String, String>,
    sandboxes: RwLock<HashMap<String, Mutex<SandboxState>>>,
}

impl LocalRuntime {
    pub fn new(base_dir: PathBuf, image_registry: Option<String>, image_overrides: HashMap<String, String>) -> Self {
        Self {
            base_dir,
            image_registry,
            image_overrides,
            sandboxes: RwLock::new(HashMap::new()),
        }
    }

    fn image_candidates(&self, language: &str) -> Vec<String> {
        let mut candidates = Vec::new();
        if let Some(over) = self.image_overrides.get(language) {
            candidates.push(over.clone());
        }
        if let Some(registry) = &self.image_registry {
            candidates.push(format!("{registry}/code-interpreter/{language}"));
        }
        candidates.push(format!("code-interpreter/{language}"));
        candidates.push(format!("ghcr.io/liberator-oss/code-interpreter/{language}"));

        let mut seen = std::collections::HashSet::new();
        candidates.retain(|c| seen.insert(c.clone()));
        candidates
    }

    fn image_root(&self, image_ref: &str) -> PathBuf {
        let sanitized = image_ref.replace(['/', ':'], "_");
        self.base_dir.join("images").join(sanitized)
    }
}

#[async_trait]
impl RuntimeAdapter for LocalRuntime {
    async fn resolve_image(&self, language: &str) -> CoreResult<String> {
        let candidates = self.image_candidates(language);
        for candidate in &candidates {
            if self.image_root(candidate).is_dir() {
                return Ok(candidate.clone());
            }
        }
        Err(CoreError::ImageUnavailable { tried: candidates })
    }

    async fn create(&self, spec: CreateSpec) -> CoreResult<SandboxHandle> {
        let id = format!(
            "ci-exec-{}-{}",
            &spec.session_id.chars().take(12).collect::<String>(),
            random_hex(8)
        );
        let root = self.base_dir.join("sandboxes").join(&id);
        let image_root = self.image_root(&spec.image);

        let created_at = SystemTime::now();
        let mut labels = spec.labels.clone();
        labels.insert("managed".to_string(), "true".to_string());
        labels.insert("type".to_string(), "execution".to_string());
        labels.insert("session-id".to_string(), spec.session_id.clone());
        labels.insert("language".to_string(), spec.language.clone());
        labels.insert("created-at".to_string(), iso8601(created_at));

        let command = if spec.command.is_empty() {
            vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()]
        } else {
            spec.command.clone()
        };

        let hardening = spec.hardening.clone();
        let working_dir = spec.working_dir.clone();
        let env = spec.env.clone();
        let root_for_child = root.clone();
        let image_root_for_setup = image_root.clone();

        let init_pid = tokio::task::spawn_blocking(move || -> CoreResult<Pid> {
            setup_sandbox_dir(&root_for_child, &image_root_for_setup, &working_dir, &hardening)
                .map_err(CoreError::internal)?;
            spawn_init(&root_for_child, &command, &env, &hardening).map_err(CoreError::internal)
        })
        .await
        .map_err(|e| CoreError::internal(e.to_string()))??;

        self.sandboxes.write().await.insert(
            id.clone(),
            Mutex::new(SandboxState {
                root,
                init_pid,
                labels: labels.clone(),
                hardening: spec.hardening,
                last_cpu_sample: None,
                created_at,
            }),
        );

        info!(sandbox_id = %id, language = %spec.language, "sandbox created");
        Ok(SandboxHandle { id, labels, created_at })
    }

    async fn start(&self, handle: &SandboxHandle) -> CoreResult<()> {
        let pid = {
            let sandboxes = self.sandboxes.read().await;
            let state = sandboxes
                .get(&handle.id)
                .ok_or_else(|| CoreError::SandboxUnavailable(handle.id.clone()))?
                .lock()
                .unwrap();
            state.init_pid
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut consecutive_running = 0;
        while Instant::now() < deadline {
            if process_alive(pid) {
                consecutive_running += 1;
                if consecutive_running >= 3 {
                    return Ok(());
                }
            } else {
                consecutive_running = 0;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Err(CoreError::SandboxUnavailable(format!("{} did not reach a stable running state", handle.id)))
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: Vec<String>,
        timeout: Duration,
        cwd: Option<String>,
        stdin: Option<Vec<u8>>,
    ) -> CoreResult<ExecOutcome> {
        let (root, hardening) = {
            let sandboxes = self.sandboxes.read().await;
            let state = sandboxes
                .get(&handle.id)
                .ok_or_else(|| CoreError::SandboxUnavailable(handle.id.clone()))?
                .lock()
                .unwrap();
            (state.root.clone(), state.hardening.clone())
        };

        let cwd = cwd.unwrap_or_else(|| "/mnt/data".to_string());
        let fut = tokio::task::spawn_blocking(move || run_exec(&root, &command, &cwd, &hardening, stdin.as_deref()));

        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(Ok(outcome))) => Ok(outcome),
            Ok(Ok(Err(e))) => Err(CoreError::internal(e)),
            Ok(Err(join_err)) => Err(CoreError::internal(join_err.to_string())),
            Err(_) => Err(CoreError::Timeout { where_: format!("exec in {}", handle.id) }),
        }
    }

    async fn put_archive(&self, handle: &SandboxHandle, dest_dir: &str, tar_bytes: Vec<u8>) -> CoreResult<()> {
        let root = self.sandbox_root(&handle.id).await?;
        let dest = root.join(dest_dir.trim_start_matches('/'));
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            fs::create_dir_all(&dest)?;
            let mut archive = tar::Archive::new(tar_bytes.as_slice());
            archive.unpack(&dest)
        })
        .await
        .map_err(|e| CoreError::internal(e.to_string()))?
        .map_err(|e| CoreError::internal(e.to_string()))
    }

    async fn get_archive(&self, handle: &SandboxHandle, path: &str) -> CoreResult<Vec<u8>> {
        let root = self.sandbox_root(&handle.id).await?;
        let source = root.join(path.trim_start_matches('/'));
        tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut buf = Vec::new();
            {
                let mut builder = tar::Builder::new(&mut buf);
                if source.is_dir() {
                    builder.append_dir_all(".", &source)?;
                } else {
                    let mut f = fs::File::open(&source)?;
                    let name = source.file_name().unwrap_or_default();
                    builder.append_file(name, &mut f)?;
                }
                builder.finish()?;
            }
            Ok(buf)
        })
        .await
        .map_err(|e| CoreError::internal(e.to_string()))?
        .map_err(|e| CoreError::internal(e.to_string()))
    }

    async fn stop(&self, handle: &SandboxHandle, grace: Duration) -> CoreResult<()> {
        let pid = {
            let sandboxes = self.sandboxes.read().await;
            let Some(state) = sandboxes.get(&handle.id) else { return Ok(()) };
            let pid = state.lock().unwrap().init_pid;
            pid
        };
        let _ = kill(pid, Signal::SIGTERM);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && process_alive(pid) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if process_alive(pid) {
            let _ = kill(pid, Signal::SIGKILL);
        }
        Ok(())
    }

    async fn remove(&self, handle: &SandboxHandle, force: bool) -> CoreResult<()> {
        let removed = self.sandboxes.write().await.remove(&handle.id);
        let Some(state) = removed else { return Ok(()) };
        let state = state.into_inner().unwrap();

        if force {
            let _ = kill(state.init_pid, Signal::SIGKILL);
        }
        let _ = waitpid(state.init_pid, Some(WaitPidFlag::WNOHANG));

        let root = state.root;
        tokio::task::spawn_blocking(move || cleanup_sandbox(&root))
            .await
            .map_err(|e| CoreError::internal(e.to_string()))?;
        Ok(())
    }

    async fn relabel(&self, handle: &SandboxHandle, labels: HashMap<String, String>) -> CoreResult<SandboxHandle> {
        let sandboxes = self.sandboxes.read().await;
        let state_lock = sandboxes
            .get(&handle.id)
            .ok_or_else(|| CoreError::SandboxUnavailable(handle.id.clone()))?;
        let mut state = state_lock.lock().unwrap();
        state.labels.extend(labels);
        Ok(SandboxHandle { id: handle.id.clone(), labels: state.labels.clone(), created_at: state.created_at })
    }

    async fn list_by_label(&self, key: &str, value: &str) -> CoreResult<Vec<SandboxHandle>> {
        let sandboxes = self.sandboxes.read().await;
        Ok(sandboxes
            .iter()
            .filter_map(|(id, state)| {
                let state = state.lock().unwrap();
                if state.labels.get(key).map(|v| v.as_str()) == Some(value) {
                    Some(SandboxHandle { id: id.clone(), labels: state.labels.clone(), created_at: state.created_at })
                } else {
                    None
                }
            })
            .collect())
    }

    async fn stats(&self, handle: &SandboxHandle) -> CoreResult<SandboxStats> {
        let sandboxes = self.sandboxes.read().await;
        let state_lock = sandboxes
            .get(&handle.id)
            .ok_or_else(|| CoreError::SandboxUnavailable(handle.id.clone()))?;
        let mut state = state_lock.lock().unwrap();

        let pid = state.init_pid;
        let mem_mb = read_vm_rss_mb(pid).unwrap_or(0.0);
        let mem_limit_mb = state.hardening.memory_mb as f64;
        let proc_ticks = read_proc_cpu_ticks(pid).unwrap_or(0);
        let system_ticks = read_system_cpu_ticks().unwrap_or(0);

        let cpu_pct = match &state.last_cpu_sample {
            Some(prev) => {
                let cpu_delta = proc_ticks as i64 - prev.proc_ticks as i64;
                let sys_delta = system_ticks as i64 - prev.system_ticks as i64;
                super::calculate_cpu_percent(cpu_delta, sys_delta, num_cpus())
            }
            None => 0.0,
        };

        state.last_cpu_sample = Some(CpuSample { proc_ticks, system_ticks, sampled_at: Instant::now() });

        Ok(SandboxStats { mem_mb, mem_limit_mb, cpu_pct, ts: SystemTime::now() })
    }
}

impl LocalRuntime {
    async fn sandbox_root(&self, id: &str) -> CoreResult<PathBuf> {
        let sandboxes = self.sandboxes.read().await;
        let state = sandboxes
            .get(id)
            .ok_or_else(|| CoreError::SandboxUnavailable(id.to_string()))?
            .lock()
            .unwrap();
        Ok(state.root.clone())
    }
}

fn random_hex(len: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

/// Formats `ts` as `YYYY-MM-DDTHH:MM:SSZ`, matching the reference
/// container manager's `datetime.utcnow().isoformat()` labels closely
/// enough for [`parse_iso8601`] to round-trip it. Hand-rolled since no
/// date/time crate is part of this crate's dependency stack; the
/// civil-from-days conversion is Howard Hinnant's `civil_from_days`.
fn iso8601(ts: SystemTime) -> String {
    let secs = ts.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_secs();
    let (y, m, d) = civil_from_days((secs / 86_400) as i64);
    let rem = secs % 86_400;
    format!("{y:04}-{m:02}-{d:02}T{:02}:{:02}:{:02}Z", rem / 3600, (rem % 3600) / 60, rem % 60)
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Parses an `iso8601` label back into seconds since the epoch. Returns
/// `None` on anything that isn't the `YYYY-MM-DDTHH:MM:SSZ` shape this
/// adapter writes.
pub(crate) fn parse_iso8601(s: &str) -> Option<u64> {
    let s = s.strip_suffix('Z')?;
    let (date, time) = s.split_once('T')?;
    let mut date_parts = date.split('-');
    let y: i64 = date_parts.next()?.parse().ok()?;
    let m: i64 = date_parts.next()?.parse().ok()?;
    let d: i64 = date_parts.next()?.parse().ok()?;
    let mut time_parts = time.split(':');
    let hh: u64 = time_parts.next()?.parse().ok()?;
    let mm: u64 = time_parts.next()?.parse().ok()?;
    let ss: u64 = time_parts.next()?.parse().ok()?;

    let y_adj = if m <= 2 { y - 1 } else { y };
    let era = if y_adj >= 0 { y_adj } else { y_adj - 399 } / 400;
    let yoe = (y_adj - era * 400) as u64;
    let mp = if m > 2 { m - 3 } else { m + 9 } as u64;
    let doy = (153 * mp + 2) / 5 + d as u64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146_097 + doe as i64 - 719_468;

    Some((days as u64) * 86_400 + hh * 3600 + mm * 60 + ss)
}

fn process_alive(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}

/// Prepares the sandbox root: tmpfs mount, read-only bind mounts of the
/// image's runtime directories, masked paths, device nodes, and the proc
/// mount, mirroring the hardening bundle the sandbox manager attaches.
fn setup_sandbox_dir(root: &Path, image_root: &Path, working_dir: &str, hardening: &HardeningSpec) -> Result<(), String> {
    if root.exists() {
        cleanup_sandbox(root);
    }
    fs::create_dir_all(root).map_err(|e| format!("mkdir: {e}"))?;

    mount(
        Some("tmpfs"),
        root,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("size=2G,mode=755"),
    )
    .map_err(|e| format!("mount tmpfs: {e}"))?;

    for dir in ["bin", "lib", "lib64", "usr", "etc"] {
        let source = image_root.join(dir);
        if !source.exists() {
            continue;
        }
        let target = root.join(dir);
        fs::create_dir_all(&target).map_err(|e| format!("mkdir {dir}: {e}"))?;
        mount(Some(&source), &target, None::<&str>, MsFlags::MS_BIND | MsFlags::MS_REC, None::<&str>)
            .map_err(|e| format!("bind {dir}: {e}"))?;
        mount(
            None::<&str>,
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| format!("remount ro {dir}: {e}"))?;
    }

    let work_rel = working_dir.trim_start_matches('/');
    let work_dir = root.join(work_rel);
    fs::create_dir_all(&work_dir).map_err(|e| format!("mkdir working_dir: {e}"))?;
    fs::set_permissions(&work_dir, fs::Permissions::from_mode(0o1777)).map_err(|e| format!("chmod working_dir: {e}"))?;

    let dev_dir = root.join("dev");
    fs::create_dir_all(&dev_dir).map_err(|e| format!("mkdir dev: {e}"))?;
    for dev in ["null", "zero", "urandom", "random"] {
        let host_dev = format!("/dev/{dev}");
        let sandbox_dev = dev_dir.join(dev);
        if Path::new(&host_dev).exists() {
            fs::write(&sandbox_dev, "").map_err(|e| format!("touch {dev}: {e}"))?;
            mount(Some(host_dev.as_str()), &sandbox_dev, None::<&str>, MsFlags::MS_BIND, None::<&str>)
                .map_err(|e| format!("bind {dev}: {e}"))?;
        }
    }

    let proc_dir = root.join("proc");
    fs::create_dir_all(&proc_dir).map_err(|e| format!("mkdir proc: {e}"))?;
    mount(
        Some("proc"),
        &proc_dir,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| format!("mount proc: {e}"))?;

    for masked in &hardening.masked_paths {
        let target = root.join(masked.trim_start_matches('/'));
        if let Some(parent) = target.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _ = fs::write(&target, "");
        let _ = mount(Some("/dev/null"), &target, None::<&str>, MsFlags::MS_BIND, None::<&str>);
    }

    for ro in &hardening.readonly_paths {
        let target = root.join(ro.trim_start_matches('/'));
        if target.exists() {
            let _ = mount(
                None::<&str>,
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            );
        }
    }

    Ok(())
}

/// Clones a new PID+mount namespace and execs the idle command as PID 1 of
/// that namespace, applying hardening (rlimits, hostname, seccomp) before
/// the exec. Returns the pid as seen from the caller's (host) namespace.
fn spawn_init(root: &Path, command: &[String], env: &HashMap<String, String>, hardening: &HardeningSpec) -> Result<Pid, String> {
    const STACK_SIZE: usize = 1024 * 1024;
    let mut stack = vec![0u8; STACK_SIZE];

    let root = root.to_path_buf();
    let command = command.to_vec();
    let env = env.clone();
    let hardening = hardening.clone();

    let child_fn = Box::new(move || -> isize {
        match run_child(&root, &command, &env, &hardening, "/") {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("sandbox init failed: {e}");
                1
            }
        }
    });

    let flags = CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUTS;
    unsafe { clone(child_fn, &mut stack, flags, Some(libc::SIGCHLD)) }.map_err(|e| format!("clone: {e}"))
}

fn run_child(root: &Path, command: &[String], env: &HashMap<String, String>, hardening: &HardeningSpec, cwd: &str) -> Result<(), String> {
    nix::unistd::sethostname(&hardening.hostname).map_err(|e| format!("sethostname: {e}"))?;
    chroot(root).map_err(|e| format!("chroot: {e}"))?;
    chdir(cwd).map_err(|e| format!("chdir: {e}"))?;

    apply_rlimits(hardening)?;

    if let Some(profile_json) = &hardening.seccomp_profile_json {
        let profile = SeccompProfile::parse(profile_json)?;
        seccomp::apply(&profile)?;
    }

    exec_command(command, env)
}

/// Enforces the open-files, process-count, and memory ceilings via rlimits.
/// `nano_cpus` has no rlimit equivalent (rlimits cap resource counts, not
/// a CPU share) and is left to whatever cgroup controller the image root
/// is provisioned under; it is not enforced here.
fn apply_rlimits(hardening: &HardeningSpec) -> Result<(), String> {
    use nix::sys::resource::{setrlimit, Resource};
    setrlimit(Resource::RLIMIT_NOFILE, hardening.open_files_limit, hardening.open_files_limit)
        .map_err(|e| format!("rlimit nofile: {e}"))?;
    setrlimit(Resource::RLIMIT_NPROC, hardening.pids_limit, hardening.pids_limit)
        .map_err(|e| format!("rlimit nproc: {e}"))?;
    if hardening.memory_mb > 0 {
        let bytes = hardening.memory_mb.saturating_mul(1024 * 1024);
        setrlimit(Resource::RLIMIT_AS, bytes, bytes).map_err(|e| format!("rlimit as: {e}"))?;
    }
    Ok(())
}

fn exec_command(command: &[String], env: &HashMap<String, String>) -> Result<(), String> {
    let cmd = CString::new(command[0].as_str()).map_err(|e| e.to_string())?;
    let args: Vec<CString> = command.iter().map(|s| CString::new(s.as_str()).unwrap()).collect();
    let mut envp: Vec<CString> = env.iter().map(|(k, v)| CString::new(format!("{k}={v}")).unwrap()).collect();
    envp.push(CString::new("PATH=/usr/local/bin:/usr/bin:/bin").unwrap());
    execvpe(&cmd, &args, &envp).map_err(|e| format!("exec: {e}"))?;
    Ok(())
}

/// Runs one command inside the sandbox's root by cloning a fresh
/// PID+mount namespace chrooted into the same directory tree the init
/// process set up. Isolation for this call comes from the chroot and the
/// fresh PID namespace, not from sharing the init process's namespace.
fn run_exec(root: &Path, command: &[String], cwd: &str, hardening: &HardeningSpec, stdin: Option<&[u8]>) -> Result<ExecOutcome, String> {
    let (stdout_read, stdout_write) = pipe().map_err(|e| format!("pipe: {e}"))?;
    let (stderr_read, stderr_write) = pipe().map_err(|e| format!("pipe: {e}"))?;
    let (stdin_read, stdin_write) = pipe().map_err(|e| format!("pipe: {e}"))?;

    let stdout_write_fd = stdout_write.as_raw_fd();
    let stderr_write_fd = stderr_write.as_raw_fd();
    let stdin_read_fd = stdin_read.as_raw_fd();

    let root = root.to_path_buf();
    let command = command.to_vec();
    let cwd = cwd.to_string();
    let hardening = hardening.clone();
    let env = HashMap::new();

    const STACK_SIZE: usize = 1024 * 1024;
    let mut stack = vec![0u8; STACK_SIZE];

    let child_fn = Box::new(move || -> isize {
        unsafe {
            libc::dup2(stdin_read_fd, 0);
            libc::dup2(stdout_write_fd, 1);
            libc::dup2(stderr_write_fd, 2);
        }
        match run_child(&root, &command, &env, &hardening, &cwd) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("exec failed: {e}");
                1
            }
        }
    });

    let flags = CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS;
    let child_pid = unsafe { clone(child_fn, &mut stack, flags, Some(libc::SIGCHLD)) }.map_err(|e| format!("clone: {e}"))?;

    drop(stdout_write);
    drop(stderr_write);
    drop(stdin_read);

    if let Some(bytes) = stdin {
        use std::io::Write;
        let mut f = unsafe { fs::File::from_raw_fd(stdin_write.as_fd().as_raw_fd()) };
        let _ = f.write_all(bytes);
        std::mem::forget(f);
    }
    drop(stdin_write);

    let status = waitpid(child_pid, None).map_err(|e| format!("waitpid: {e}"))?;
    let stdout = read_all(stdout_read);
    let stderr = read_all(stderr_read);

    let exit_code = match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
        _ => -1,
    };

    Ok(ExecOutcome { exit_code, stdout, stderr })
}

fn read_all(fd: OwnedFd) -> Vec<u8> {
    let mut file = unsafe { fs::File::from_raw_fd(fd.as_raw_fd()) };
    std::mem::forget(fd);
    let mut buf = Vec::new();
    let _ = file.read_to_end(&mut buf);
    buf
}

fn cleanup_sandbox(root: &Path) {
    for mp in ["proc", "etc", "usr", "lib64", "lib", "bin"] {
        let path = root.join(mp);
        if path.exists() {
            let _ = umount2(&path, MntFlags::MNT_DETACH);
        }
    }
    let dev_dir = root.join("dev");
    if dev_dir.exists() {
        for dev in ["null", "zero", "urandom", "random"] {
            let p = dev_dir.join(dev);
            if p.exists() {
                let _ = umount2(&p, MntFlags::MNT_DETACH);
            }
        }
    }
    let _ = umount2(root, MntFlags::MNT_DETACH);
    if let Err(e) = fs::remove_dir_all(root) {
        warn!(?root, error = %e, "failed to remove sandbox root");
    }
}

fn read_vm_rss_mb(pid: Pid) -> Option<f64> {
    let contents = fs::read_to_string(format!("/proc/{}/status", pid.as_raw())).ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: f64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb / 1024.0);
        }
    }
    None
}

fn read_proc_cpu_ticks(pid: Pid) -> Option<u64> {
    let contents = fs::read_to_string(format!("/proc/{}/stat", pid.as_raw())).ok()?;
    let after_comm = contents.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // utime is field 14, stime is field 15 counting from 1 in `man proc`;
    // after stripping "pid (comm)" the remaining fields are 0-indexed from state.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn read_system_cpu_ticks() -> Option<u64> {
    let contents = fs::read_to_string("/proc/stat").ok()?;
    let line = contents.lines().next()?;
    let sum: u64 = line.split_whitespace().skip(1).filter_map(|s| s.parse::<u64>().ok()).sum();
    Some(sum)
}

fn num_cpus() -> u32 {
    std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1)
}

#[allow(dead_code)]
fn join_namespace(ns_fd: &OwnedFd, ns_type: CloneFlags) -> Result<(), String> {
    setns(ns_fd.as_fd(), ns_type).map_err(|e| format!("setns: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_candidates_prefer_overrides_then_registry_then_defaults() {
        let mut overrides = HashMap::new();
        overrides.insert("py".to_string(), "internal/py-runner".to_string());
        let runtime = LocalRuntime::new(PathBuf::from("/tmp/liberator-test"), Some("registry.example".to_string()), overrides);
        let candidates = runtime.image_candidates("py");
        assert_eq!(candidates[0], "internal/py-runner");
        assert_eq!(candidates[1], "registry.example/code-interpreter/py");
        assert!(candidates.contains(&"code-interpreter/py".to_string()));
    }

    #[test]
    fn image_candidates_dedupe_preserving_order() {
        let runtime = LocalRuntime::new(PathBuf::from("/tmp/liberator-test"), None, HashMap::new());
        let candidates = runtime.image_candidates("rs");
        let mut seen = std::collections::HashSet::new();
        assert!(candidates.iter().all(|c| seen.insert(c.clone())));
    }

    #[test]
    fn iso8601_round_trips_through_parse() {
        let ts = SystemTime::UNIX_EPOCH + Duration::from_secs(1_732_147_845);
        let formatted = iso8601(ts);
        assert_eq!(parse_iso8601(&formatted), Some(1_732_147_845));
    }

    #[test]
    fn iso8601_matches_known_timestamp() {
        let ts = SystemTime::UNIX_EPOCH + Duration::from_secs(0);
        assert_eq!(iso8601(ts), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn parse_iso8601_rejects_malformed_input() {
        assert_eq!(parse_iso8601("not-a-timestamp"), None);
        assert_eq!(parse_iso8601("2024-01-01T00:00:00"), None);
    }
}
