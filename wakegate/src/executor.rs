//! Command Executor (spec §4.1): runs user-supplied shell commands and never
//! raises — spawn failures, non-zero exits, and timeouts are all reported
//! through the same `ExecOutput` triple.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub env: Option<HashMap<String, String>>,
    pub timeout: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Evaluate `command` through the system shell, merging `env` over the
/// process environment. Exceeding `timeout` kills the process and reports a
/// non-zero exit; a spawn failure is reported the same way, with the failure
/// message captured as stderr.
pub async fn run(command: &str, opts: ExecOptions) -> ExecOutput {
    let mut cmd = shell_command(command);
    if let Some(cwd) = &opts.cwd {
        // `~`-expand the configured working directory, the same convention
        // the teacher applies to path-like config fields.
        cmd.current_dir(shellexpand::tilde(cwd).into_owned());
    }
    if let Some(env) = &opts.env {
        cmd.envs(env);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    // Dropping the `wait_with_output` future on timeout must actually kill
    // the child rather than leave it running as an orphan (spec §4.1).
    cmd.kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecOutput {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("failed to spawn command: {e}"),
            }
        }
    };

    match tokio::time::timeout(opts.timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        },
        Ok(Err(e)) => ExecOutput {
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("failed to wait on command: {e}"),
        },
        Err(_) => ExecOutput {
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("command timed out after {:?}", opts.timeout),
        },
    }
}

/// Convenience wrapper: did the command exit with status 0?
pub async fn check(command: &str, opts: ExecOptions) -> bool {
    run(command, opts).await.exit_code == 0
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tilde_in_cwd_is_expanded_to_the_home_directory() {
        let opts = ExecOptions {
            cwd: Some("~".to_string()),
            ..Default::default()
        };
        let out = run("pwd", opts).await;
        assert_eq!(out.exit_code, 0);
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(out.stdout.trim(), home.to_string_lossy());
        }
    }

    #[tokio::test]
    async fn successful_command_reports_exit_zero() {
        let out = run("exit 0", ExecOptions::default()).await;
        assert_eq!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn failing_command_reports_nonzero_exit() {
        let out = run("exit 7", ExecOptions::default()).await;
        assert_eq!(out.exit_code, 7);
    }

    #[tokio::test]
    async fn check_is_a_boolean_view_of_exit_code() {
        assert!(check("true", ExecOptions::default()).await);
        assert!(!check("false", ExecOptions::default()).await);
    }

    #[tokio::test]
    async fn timeout_kills_the_process_and_reports_failure() {
        let opts = ExecOptions {
            timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let out = run("sleep 5", opts).await;
        assert_ne!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn stdout_and_stderr_are_captured() {
        let out = run("echo hello; echo world 1>&2", ExecOptions::default()).await;
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "world");
    }
}
