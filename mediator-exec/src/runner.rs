//! Shared subprocess runner used by both the exec broker and the package
//! broker. Grounded on the teacher's spawn/timeout/capture pipeline in
//! `core/src/exec.rs`, simplified to a plain `sh -c` invocation with no
//! platform sandboxing escalation — hardening comes from always routing
//! through human approval, not from OS-level confinement of the
//! subprocess itself.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const TIMEOUT_EXIT_CODE: i32 = 124;
const SPAWN_ERROR_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
    pub spawn_failed: bool,
}

/// Spawn `sh -c command`, optionally in `cwd`, capturing stdout/stderr in
/// memory and enforcing `timeout`. On timeout the child is killed and
/// `"\n[timed out]"` is appended to stderr with exit code 124. On spawn
/// failure, exit code -1 is reported with the error in stderr.
pub async fn run_shell(command: &str, cwd: Option<&Path>, timeout: Duration) -> RunOutput {
    let start = Instant::now();

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            return RunOutput {
                exit_code: SPAWN_ERROR_EXIT_CODE,
                stdout: String::new(),
                stderr: format!("failed to spawn command: {err}"),
                duration: start.elapsed(),
                timed_out: false,
                spawn_failed: true,
            };
        }
    };

    let Some(mut stdout_pipe) = child.stdout.take() else {
        return RunOutput {
            exit_code: SPAWN_ERROR_EXIT_CODE,
            stdout: String::new(),
            stderr: "stdout pipe unavailable".to_string(),
            duration: start.elapsed(),
            timed_out: false,
            spawn_failed: true,
        };
    };
    let Some(mut stderr_pipe) = child.stderr.take() else {
        return RunOutput {
            exit_code: SPAWN_ERROR_EXIT_CODE,
            stdout: String::new(),
            stderr: "stderr pipe unavailable".to_string(),
            duration: start.elapsed(),
            timed_out: false,
            spawn_failed: true,
        };
    };

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

    let wait_result = tokio::time::timeout(timeout, child.wait()).await;
    let (exit_code, timed_out, extra_stderr) = match wait_result {
        Ok(Ok(status)) => (status.code().unwrap_or(-1), false, None),
        Ok(Err(err)) => (SPAWN_ERROR_EXIT_CODE, false, Some(format!("wait failed: {err}"))),
        Err(_elapsed) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            (TIMEOUT_EXIT_CODE, true, Some("\n[timed out]".to_string()))
        }
    };

    let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
    let mut stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();
    if let Some(extra) = extra_stderr {
        stderr.push_str(&extra);
    }

    RunOutput {
        exit_code,
        stdout,
        stderr,
        duration: start.elapsed(),
        timed_out,
        spawn_failed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run_shell("echo hello", None, Duration::from_secs(5)).await;
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_without_timeout() {
        let out = run_shell("exit 3", None, Duration::from_secs(5)).await;
        assert_eq!(out.exit_code, 3);
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn timeout_kills_and_reports_124() {
        let out = run_shell("sleep 5", None, Duration::from_millis(50)).await;
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert!(out.timed_out);
        assert!(out.stderr.contains("[timed out]"));
    }
}
