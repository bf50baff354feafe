//! Shared subprocess runner for the exec and package brokers.
//!
//! Commands run under `sh -c` with piped stdout/stderr collected into
//! memory. A timeout kills the child, appends a `[timed out]` marker to
//! stderr, and reports exit code 124; a spawn failure reports -1.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

/// Default command timeout: five minutes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Exit code reported for timed-out commands (mirrors GNU timeout).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Captured result of a shell invocation.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Run `sh -c command`, capturing output until exit or timeout.
pub async fn run_shell(command: &str, cwd: Option<&Path>, timeout: Duration) -> RunOutput {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return RunOutput {
                stdout: String::new(),
                stderr: format!("spawn failed: {}", e),
                exit_code: -1,
            };
        }
    };

    // Drain both pipes concurrently so a chatty child never blocks on a
    // full pipe buffer while we wait for it.
    let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let status = tokio::time::timeout(timeout, child.wait()).await;

    let timed_out = status.is_err();
    if timed_out {
        debug!("Command timed out after {:?}, killing: {}", timeout, command);
        let _ = child.kill().await;
    }

    let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
    let mut stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

    let exit_code = if timed_out {
        stderr.push_str("\n[timed out]");
        TIMEOUT_EXIT_CODE
    } else {
        match status {
            Ok(Ok(status)) => status.code().unwrap_or(-1),
            _ => -1,
        }
    };

    RunOutput {
        stdout,
        stderr,
        exit_code,
    }
}
