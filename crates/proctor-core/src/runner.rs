//! The test-runner collaborator.
//!
//! The executor invokes a [`Runner`] to launch one test run as a child
//! process and only observes its exit status; stdout/stderr are not parsed.
//! [`ProcessRunner`] wraps a configurable command line (a Playwright
//! invocation by default), injecting the per-execution report folder and
//! optional grep filter.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One requested test run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Directory the runner executes in.
    pub tests_dir: PathBuf,
    /// Per-execution output folder override.
    pub report_dir: PathBuf,
    /// Optional test-name filter.
    pub grep: Option<String>,
    /// Extra environment for the child process.
    pub env: HashMap<String, String>,
}

/// Handle to a spawned run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub pid: u32,
}

/// External test-process collaborator. Exit code 0 means pass.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Launch a run and return its handle.
    async fn spawn(&self, request: &RunRequest) -> Result<RunHandle>;

    /// Poll for completion. Returns the exit code once the child has
    /// exited, `None` while it is still running.
    async fn try_wait(&self, handle: &RunHandle) -> Result<Option<i32>>;

    /// Terminate the run: SIGTERM first, SIGKILL after a grace period.
    async fn kill(&self, handle: &RunHandle) -> Result<()>;
}

// Compile-time assertion: Runner must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Runner) {}
};

// ---------------------------------------------------------------------------
// Process-backed implementation
// ---------------------------------------------------------------------------

/// Spawns the configured command as a child process per run.
pub struct ProcessRunner {
    program: String,
    args: Vec<String>,
    /// Per-process bookkeeping, keyed by OS pid.
    processes: Arc<Mutex<HashMap<u32, Child>>>,
}

impl ProcessRunner {
    /// Default command line: `npx playwright test`.
    pub fn new() -> Self {
        Self::with_command(
            "npx",
            ["playwright".to_string(), "test".to_string()],
        )
    }

    /// Use a custom program and base arguments.
    pub fn with_command(program: impl Into<String>, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn spawn(&self, request: &RunRequest) -> Result<RunHandle> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.arg(format!("--output={}", request.report_dir.display()));
        if let Some(grep) = &request.grep {
            cmd.arg(format!("--grep={grep}"));
        }
        cmd.current_dir(&request.tests_dir);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());

        let child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn runner '{}' -- is it installed and on PATH?",
                self.program
            )
        })?;
        let pid = child.id().context("child process has no pid")?;

        {
            let mut processes = self.processes.lock().await;
            processes.insert(pid, child);
        }

        debug!(pid, program = %self.program, "runner spawned");
        Ok(RunHandle { pid })
    }

    async fn try_wait(&self, handle: &RunHandle) -> Result<Option<i32>> {
        let mut processes = self.processes.lock().await;
        let Some(child) = processes.get_mut(&handle.pid) else {
            // Already reaped (or never ours): report a generic failure code.
            return Ok(Some(-1));
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                processes.remove(&handle.pid);
                Ok(Some(status.code().unwrap_or(-1)))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(pid = handle.pid, error = %e, "error polling runner status");
                processes.remove(&handle.pid);
                Ok(Some(-1))
            }
        }
    }

    async fn kill(&self, handle: &RunHandle) -> Result<()> {
        let pid = handle.pid;
        let mut processes = self.processes.lock().await;

        if let Some(child) = processes.get_mut(&pid) {
            #[cfg(unix)]
            {
                // SAFETY: pid is a valid u32 from a child we spawned.
                let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if ret != 0 {
                    warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
                }
            }

            // Wait briefly for graceful shutdown, then force.
            let exited =
                tokio::time::timeout(std::time::Duration::from_secs(5), child.wait()).await;
            match exited {
                Ok(Ok(_status)) => {
                    debug!(pid, "runner exited after SIGTERM");
                }
                _ => {
                    debug!(pid, "runner did not exit after SIGTERM, sending SIGKILL");
                    let _ = child.kill().await;
                }
            }
            processes.remove(&pid);
        } else {
            debug!(pid, "kill called but runner not in map (already exited?)");
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(dir: &std::path::Path) -> RunRequest {
        RunRequest {
            tests_dir: dir.to_path_buf(),
            report_dir: dir.join("out"),
            grep: None,
            env: HashMap::new(),
        }
    }

    #[cfg(unix)]
    fn script_runner(dir: &std::path::Path, body: &str) -> ProcessRunner {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("fake_runner.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        ProcessRunner::with_command(script.to_string_lossy().to_string(), [])
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_zero_reports_pass() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = script_runner(tmp.path(), "exit 0");
        let handle = runner.spawn(&request(tmp.path())).await.unwrap();

        let mut code = None;
        for _ in 0..50 {
            if let Some(c) = runner.try_wait(&handle).await.unwrap() {
                code = Some(c);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_reports_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = script_runner(tmp.path(), "exit 3");
        let handle = runner.spawn(&request(tmp.path())).await.unwrap();

        let mut code = None;
        for _ in 0..50 {
            if let Some(c) = runner.try_wait(&handle).await.unwrap() {
                code = Some(c);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_terminates_a_hung_run() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = script_runner(tmp.path(), "sleep 3600");
        let handle = runner.spawn(&request(tmp.path())).await.unwrap();

        assert_eq!(runner.try_wait(&handle).await.unwrap(), None);
        runner.kill(&handle).await.unwrap();
        // After the kill the process is reaped and reports a failure code.
        assert!(runner.try_wait(&handle).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_program_errors_on_spawn() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::with_command("/nonexistent/path/to/runner", []);
        let result = runner.spawn(&request(tmp.path())).await;
        assert!(result.is_err());
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("failed to spawn runner"));
    }
}
