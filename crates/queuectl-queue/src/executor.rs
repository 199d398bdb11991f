//! Shell command execution with a wall-clock bound.
//!
//! Each command runs in its own process group so a timeout can terminate
//! the command together with anything it spawned.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured text is cut to this many characters
pub const MAX_CAPTURE_CHARS: usize = 64 * 1024;

/// How a single attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Exit status 0
    Succeeded { output: String },
    /// Nonzero exit, killed by a signal, or could not be spawned
    Failed {
        exit_code: Option<i32>,
        output: String,
        error: String,
    },
    /// Exceeded its timeout and was killed
    TimedOut { timeout_secs: u64 },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Combined stdout and stderr, if the command ran to completion
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Succeeded { output } | Self::Failed { output, .. } => Some(output),
            Self::TimedOut { .. } => None,
        }
    }

    pub fn error_message(&self) -> String {
        match self {
            Self::Succeeded { .. } => String::new(),
            Self::Failed { error, .. } => error.clone(),
            Self::TimedOut { timeout_secs } => {
                format!("execution timed out after {} seconds", timeout_secs)
            }
        }
    }
}

/// Runs job commands through the platform shell
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    shell: String,
    shell_flag: String,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        #[cfg(windows)]
        let (shell, flag) = ("cmd", "/C");
        #[cfg(not(windows))]
        let (shell, flag) = ("sh", "-c");

        Self {
            shell: shell.to_string(),
            shell_flag: flag.to_string(),
        }
    }
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `command` to completion or until `timeout` elapses
    pub async fn run(&self, command: &str, timeout: Duration) -> ExecutionOutcome {
        let mut cmd = Command::new(&self.shell);
        cmd.arg(&self.shell_flag)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionOutcome::Failed {
                    exit_code: None,
                    output: String::new(),
                    error: format!("failed to spawn command: {}", e),
                }
            }
        };
        let pid = child.id();
        debug!(pid = ?pid, timeout_secs = timeout.as_secs(), "Spawned command");

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let collect = async {
            let (status, stdout, stderr) = tokio::join!(
                child.wait(),
                read_pipe(stdout_pipe),
                read_pipe(stderr_pipe)
            );
            Ok::<_, io::Error>((status?, stdout?, stderr?))
        };

        match tokio::time::timeout(timeout, collect).await {
            Ok(Ok((status, stdout, stderr))) => {
                let stdout = String::from_utf8_lossy(&stdout);
                let stderr = String::from_utf8_lossy(&stderr);
                let combined = truncate(format!("{}{}", stdout, stderr));

                if status.success() {
                    ExecutionOutcome::Succeeded { output: combined }
                } else {
                    let exit_code = status.code();
                    let error = if !stderr.trim().is_empty() {
                        truncate(stderr.trim_end().to_string())
                    } else {
                        match exit_code {
                            Some(code) => format!("Command failed with exit code {}", code),
                            None => "Command terminated by signal".to_string(),
                        }
                    };
                    ExecutionOutcome::Failed {
                        exit_code,
                        output: combined,
                        error,
                    }
                }
            }
            Ok(Err(e)) => ExecutionOutcome::Failed {
                exit_code: None,
                output: String::new(),
                error: format!("failed to collect command output: {}", e),
            },
            Err(_) => {
                // Group first; its id stays reserved while any member lives
                kill_process_group(pid);
                if let Err(e) = child.kill().await {
                    debug!(pid = ?pid, error = %e, "Timed out command already exited");
                }
                ExecutionOutcome::TimedOut {
                    timeout_secs: timeout.as_secs(),
                }
            }
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

fn truncate(mut text: String) -> String {
    if let Some((idx, _)) = text.char_indices().nth(MAX_CAPTURE_CHARS) {
        text.truncate(idx);
    }
    text
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else { return };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "Failed to kill timed out process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_success_captures_output() {
        let outcome = CommandExecutor::new()
            .run("echo hello; echo oops >&2", Duration::from_secs(5))
            .await;
        assert!(outcome.is_success());
        let output = outcome.output().unwrap();
        assert!(output.contains("hello"));
        assert!(output.contains("oops"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_stderr() {
        let outcome = CommandExecutor::new()
            .run("exit 3", Duration::from_secs(5))
            .await;
        assert_eq!(
            outcome,
            ExecutionOutcome::Failed {
                exit_code: Some(3),
                output: String::new(),
                error: "Command failed with exit code 3".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_prefers_stderr() {
        let outcome = CommandExecutor::new()
            .run("echo 'disk full' >&2; exit 1", Duration::from_secs(5))
            .await;
        assert_eq!(outcome.error_message(), "disk full");
    }

    #[tokio::test]
    async fn test_unknown_command_fails() {
        let outcome = CommandExecutor::new()
            .run("nonexistent_command_xyz123", Duration::from_secs(5))
            .await;
        assert!(matches!(outcome, ExecutionOutcome::Failed { exit_code: Some(127), .. }));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let started = Instant::now();
        let outcome = CommandExecutor::new()
            .run("sleep 30", Duration::from_secs(1))
            .await;
        assert_eq!(outcome, ExecutionOutcome::TimedOut { timeout_secs: 1 });
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_timeout_kills_spawned_children() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let command = format!("(sleep 2; touch {}) & wait", marker.display());

        let outcome = CommandExecutor::new()
            .run(&command, Duration::from_millis(500))
            .await;
        assert!(matches!(outcome, ExecutionOutcome::TimedOut { .. }));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists(), "background child survived the timeout");
    }

    #[tokio::test]
    async fn test_timeout_kills_group_after_leader_exits() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        // The shell exits at once; its background child keeps the pipes open
        let command = format!("(sleep 2; touch {}) & exit 0", marker.display());

        let outcome = CommandExecutor::new()
            .run(&command, Duration::from_millis(500))
            .await;
        assert!(matches!(outcome, ExecutionOutcome::TimedOut { .. }));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists(), "background child survived the timeout");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let long = "é".repeat(MAX_CAPTURE_CHARS + 10);
        assert_eq!(truncate(long).chars().count(), MAX_CAPTURE_CHARS);
    }
}
