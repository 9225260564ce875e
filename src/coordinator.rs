//! Execution coordinator: per-request wiring between an acquired sandbox
//! and a code execution, including input staging and output harvesting.

use crate::error::{CoreError, CoreResult};
use crate::pool::{Pool, PoolOrigin};
use crate::runtime::RuntimeAdapter;
use crate::sandbox_manager::SandboxManager;
use crate::security::{sanitize_filename, FilePolicy};
use crate::session::{FileInfo, SessionRegistry};
use serde::Serialize;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const WORKING_DIR: &str = "/mnt/data";

/// A file attached to the request by its session file id.
pub struct AttachedFile {
    pub id: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

pub struct ExecutionRequest {
    pub session_id: String,
    pub language: String,
    pub code: String,
    pub attached_files: Vec<AttachedFile>,
    pub timeout: Duration,
    /// Cancelling this token mid-execution has the same effect as a
    /// timeout: the coordinator destroys the sandbox before returning,
    /// rather than propagating the running command's output.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutedFile {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub session_id: String,
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub files: Vec<ExecutedFile>,
    pub pool_origin: &'static str,
    pub partial_files: bool,
}

/// Maps a language tag to the runner invocation and source filename used
/// inside the sandbox.
fn runner_for(language: &str) -> (&'static str, Vec<&'static str>) {
    match language {
        "py" => ("main.py", vec!["python3", "/mnt/data/main.py"]),
        "js" => ("main.js", vec!["node", "/mnt/data/main.js"]),
        "ts" => ("main.ts", vec!["ts-node", "/mnt/data/main.ts"]),
        "go" => ("main.go", vec!["go", "run", "/mnt/data/main.go"]),
        "rs" => ("main.rs", vec!["sh", "-c", "rustc /mnt/data/main.rs -o /tmp/main && /tmp/main"]),
        "java" => ("Main.java", vec!["sh", "-c", "cd /mnt/data && javac Main.java && java Main"]),
        "c" => ("main.c", vec!["sh", "-c", "cc /mnt/data/main.c -o /tmp/main && /tmp/main"]),
        "cpp" => ("main.cpp", vec!["sh", "-c", "c++ /mnt/data/main.cpp -o /tmp/main && /tmp/main"]),
        "php" => ("main.php", vec!["php", "/mnt/data/main.php"]),
        "r" => ("main.r", vec!["Rscript", "/mnt/data/main.r"]),
        "f90" => ("main.f90", vec!["sh", "-c", "gfortran /mnt/data/main.f90 -o /tmp/main && /tmp/main"]),
        "d" => ("main.d", vec!["sh", "-c", "dmd -run /mnt/data/main.d"]),
        _ => ("main.txt", vec!["cat", "/mnt/data/main.txt"]),
    }
}

pub struct ExecutionCoordinator {
    sessions: Arc<SessionRegistry>,
    pool: Arc<Pool>,
    manager: Arc<SandboxManager>,
    file_policy: FilePolicy,
}

impl ExecutionCoordinator {
    pub fn new(sessions: Arc<SessionRegistry>, pool: Arc<Pool>, manager: Arc<SandboxManager>, file_policy: FilePolicy) -> Self {
        Self { sessions, pool, manager, file_policy }
    }

    pub async fn execute(&self, req: ExecutionRequest) -> CoreResult<ExecutionResult> {
        self.sessions.touch(&req.session_id).await?;

        let (handle, origin) = self.pool.acquire(&req.language, &req.session_id).await?;
        let runtime = self.manager.runtime();
        let execution_id = Uuid::new_v4().to_string();
        let started_at = SystemTime::now();

        let outcome = self.run(&runtime, &handle, &req).await;

        self.pool.release(&req.language, handle).await;

        let (status, exit_code, stdout, stderr, files, partial_files) = match outcome {
            Ok(value) => value,
            Err(e) if e.kind() == crate::error::ErrorKind::Timeout => {
                return Ok(ExecutionResult {
                    session_id: req.session_id,
                    execution_id,
                    status: ExecutionStatus::TimedOut,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: "execution timed out".to_string(),
                    files: Vec::new(),
                    pool_origin: origin_label(&origin),
                    partial_files: false,
                });
            }
            Err(e) => return Err(e),
        };

        info!(
            session_id = %req.session_id,
            execution_id = %execution_id,
            elapsed_ms = started_at.elapsed().unwrap_or_default().as_millis(),
            "execution complete"
        );

        Ok(ExecutionResult {
            session_id: req.session_id,
            execution_id,
            status,
            exit_code,
            stdout,
            stderr,
            files,
            pool_origin: origin_label(&origin),
            partial_files,
        })
    }

    async fn run(
        &self,
        runtime: &Arc<dyn RuntimeAdapter>,
        handle: &crate::runtime::SandboxHandle,
        req: &ExecutionRequest,
    ) -> CoreResult<(ExecutionStatus, Option<i32>, String, String, Vec<ExecutedFile>, bool)> {
        for attached in &req.attached_files {
            let safe_name = sanitize_filename(Some(&attached.filename));
            if let Err(violation) = self.file_policy.check(&safe_name) {
                return Err(CoreError::InputFileError { id: attached.id.clone(), cause: violation.to_string() });
            }
            let tar_bytes = tar_of_single_file(&safe_name, &attached.bytes).map_err(CoreError::from)?;
            runtime.put_archive(handle, WORKING_DIR, tar_bytes).await?;
        }

        let (source_name, command) = runner_for(&req.language);
        let source_tar = tar_of_single_file(source_name, req.code.as_bytes()).map_err(CoreError::from)?;
        runtime.put_archive(handle, WORKING_DIR, source_tar).await?;

        let existing_files: std::collections::HashSet<String> = req.attached_files.iter().map(|f| f.filename.clone()).collect();

        let outcome = tokio::select! {
            result = runtime.exec(handle, command.iter().map(|s| s.to_string()).collect(), req.timeout, Some(WORKING_DIR.to_string()), None) => result?,
            _ = req.cancel.cancelled() => return Err(CoreError::Cancelled),
        };

        let (files, partial) = match self.harvest_outputs(runtime, handle, &req.session_id, &existing_files).await {
            Ok(files) => (files, false),
            Err(e) => {
                warn!(error = %e, "output harvest failed, returning partial result");
                (Vec::new(), true)
            }
        };

        let status = if outcome.exit_code == 0 { ExecutionStatus::Completed } else { ExecutionStatus::Failed };

        Ok((
            status,
            Some(outcome.exit_code),
            String::from_utf8_lossy(&outcome.stdout).to_string(),
            String::from_utf8_lossy(&outcome.stderr).to_string(),
            files,
            partial,
        ))
    }

    async fn harvest_outputs(
        &self,
        runtime: &Arc<dyn RuntimeAdapter>,
        handle: &crate::runtime::SandboxHandle,
        session_id: &str,
        existing_files: &std::collections::HashSet<String>,
    ) -> CoreResult<Vec<ExecutedFile>> {
        let archive_bytes = runtime.get_archive(handle, WORKING_DIR).await?;
        let extracted = extract_archive_entries(archive_bytes, existing_files)?;
        let mut out = Vec::new();

        for (filename, size) in extracted {
            let id = Uuid::new_v4().to_string();
            let mime = mime_guess(&filename);

            self.sessions
                .register_file(session_id, FileInfo { id: id.clone(), filename: filename.clone(), size, mime: mime.clone(), created_at: SystemTime::now() })
                .await?;

            out.push(ExecutedFile { id, name: filename, size, mime });
        }

        Ok(out)
    }
}

fn origin_label(origin: &PoolOrigin) -> &'static str {
    match origin {
        PoolOrigin::Hit => "pool_hit",
        PoolOrigin::Miss => "pool_miss",
    }
}

fn tar_of_single_file(name: &str, bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut buf);
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, bytes)?;
        builder.finish()?;
    }
    Ok(buf)
}

fn extract_archive_entries(
    archive_bytes: Vec<u8>,
    existing_files: &std::collections::HashSet<String>,
) -> CoreResult<Vec<(String, u64)>> {
    let mut archive = tar::Archive::new(Cursor::new(archive_bytes));
    let mut out = Vec::new();

    for entry in archive.entries().map_err(CoreError::from)? {
        let mut entry = entry.map_err(CoreError::from)?;
        let path = entry.path().map_err(CoreError::from)?.to_string_lossy().to_string();
        let filename = sanitize_filename(Some(&path));

        if existing_files.contains(&filename) {
            continue;
        }

        let mut bytes = Vec::new();
        std::io::copy(&mut entry, &mut bytes).map_err(CoreError::from)?;
        let size = bytes.len() as u64;
        if size == 0 && entry.header().entry_type().is_dir() {
            continue;
        }

        out.push((filename, size));
    }

    Ok(out)
}

fn mime_guess(filename: &str) -> String {
    let ext = filename.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "txt" => "text/plain",
        "json" => "application/json",
        "csv" => "text/csv",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "html" => "text/html",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_dispatch_matches_language_tag() {
        let (name, cmd) = runner_for("py");
        assert_eq!(name, "main.py");
        assert_eq!(cmd[0], "python3");
    }

    #[test]
    fn unknown_language_falls_back_to_cat() {
        let (_, cmd) = runner_for("cobol");
        assert_eq!(cmd[0], "cat");
    }

    #[test]
    fn mime_guess_covers_common_extensions() {
        assert_eq!(mime_guess("out.json"), "application/json");
        assert_eq!(mime_guess("out.bin"), "application/octet-stream");
    }

    #[test]
    fn single_file_tar_round_trips() {
        let tar_bytes = tar_of_single_file("hello.txt", b"hi").unwrap();
        let mut archive = tar::Archive::new(Cursor::new(tar_bytes));
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        let mut content = Vec::new();
        std::io::copy(&mut entry, &mut content).unwrap();
        assert_eq!(content, b"hi");
    }
}
