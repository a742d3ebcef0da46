//! Script execution: materialize to a private temp file, run, always clean up.

use std::time::Duration;

use tokio::io::AsyncWriteExt;

use crate::error::TaskError;
use crate::tasks::command::{CommandOutput, is_denied, run_command};

/// Write the script to a private temp file, execute it, and delete the file
/// whether or not execution succeeded (the temp dir guard handles cleanup on
/// every exit path).
pub async fn run_script(
    script: &str,
    interpreter: Option<&str>,
    timeout: Duration,
) -> Result<CommandOutput, TaskError> {
    // The deny-list applies to script bodies too; the invoked command is
    // just a temp path and would never match.
    if let Some(reason) = is_denied(script) {
        return Err(TaskError::SecurityViolation(reason.to_string()));
    }

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("task-script");

    let mut file = tokio::fs::File::create(&path).await?;
    file.write_all(script.as_bytes()).await?;
    file.flush().await?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700)).await?;
    }

    let interpreter = interpreter.unwrap_or("sh");
    let command = format!("{} {}", interpreter, shell_quote(&path.display().to_string()));
    let result = run_command(&command, timeout).await;

    // Explicit so a close error is visible instead of silently ignored.
    if let Err(e) = dir.close() {
        tracing::warn!("failed to remove script temp dir: {e}");
    }

    result
}

/// Single-quote a path for `sh -c`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
