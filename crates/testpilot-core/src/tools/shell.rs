use super::{RunCommandArgs, Workspace};
use crate::error::ToolError;
use std::io;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_TIMEOUT_SECS: u64 = 300;
const MAX_OUTPUT_BYTES: usize = 50 * 1024;

/// Run `command` to completion, or kill it once `limit` elapses.
/// `Ok(None)` means the limit was hit.
pub(crate) async fn run_with_timeout(
    mut command: Command,
    limit: Duration,
) -> io::Result<Option<Output>> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn()?;
    match timeout(limit, child.wait_with_output()).await {
        Ok(output) => output.map(Some),
        Err(_) => Ok(None),
    }
}

pub async fn run_command(workspace: &Workspace, args: &RunCommandArgs) -> Result<String, ToolError> {
    if args.command.trim().is_empty() {
        return Err(ToolError::Validation("command must not be empty".to_string()));
    }

    let secs = args
        .timeout
        .filter(|t| *t >= 1.0)
        .map(|t| (t as u64).min(MAX_TIMEOUT_SECS))
        .unwrap_or(DEFAULT_TIMEOUT_SECS);

    let mut command = Command::new("sh");
    command.arg("-c").arg(&args.command).current_dir(workspace.root());
    debug!(command = %args.command, timeout_secs = secs, "Running shell command");

    let output = run_with_timeout(command, Duration::from_secs(secs))
        .await?
        .ok_or_else(|| {
            ToolError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("Command timed out after {}s", secs),
            ))
        })?;

    let status = match output.status.code() {
        Some(code) => format!("exit code: {}", code),
        None => "exit code: terminated by signal".to_string(),
    };

    Ok(truncate_to_byte_limit(
        format!(
            "{}\nstdout:\n{}\nstderr:\n{}",
            status,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
        MAX_OUTPUT_BYTES,
    ))
}

pub(crate) fn truncate_to_byte_limit(content: String, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content;
    }

    let mut cutoff = max_bytes;
    while cutoff > 0 && !content.is_char_boundary(cutoff) {
        cutoff -= 1;
    }

    let mut truncated = content[..cutoff].to_string();
    truncated.push_str("\n[truncated]");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn args(command: &str, timeout: Option<f64>) -> RunCommandArgs {
        RunCommandArgs {
            command: command.to_string(),
            timeout,
        }
    }

    #[tokio::test]
    async fn test_runs_in_working_root() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let ws = Workspace::new(dir.path()).unwrap();

        let out = run_command(&ws, &args("ls; echo oops >&2; exit 3", None))
            .await
            .unwrap();
        assert!(out.starts_with("exit code: 3"));
        assert!(out.contains("marker.txt"));
        assert!(out.contains("stderr:\noops"));
    }

    #[tokio::test]
    async fn test_timeout_is_an_error() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();

        let err = run_command(&ws, &args("sleep 5", Some(1.0))).await.unwrap_err();
        assert!(err.to_string().contains("timed out after 1s"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let text = "é".repeat(10);
        let cut = truncate_to_byte_limit(text, 5);
        assert_eq!(cut, "éé\n[truncated]");
    }
}
