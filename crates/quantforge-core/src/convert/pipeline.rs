//! Shared subprocess utilities for the conversion pipeline.
//!
//! External programs run for minutes to hours; both pipes are streamed
//! line-by-line to the log while the full output is collected for error
//! reporting.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{ForgeError, Result};

/// Collected output of a finished subprocess.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: std::process::ExitStatus,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

async fn drain_lines<R>(pipe: R, name: String, is_stderr: bool) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe).lines();
    let mut collected = String::new();
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                if is_stderr {
                    warn!("[{name}] {line}");
                } else {
                    info!("[{name}] {line}");
                }
                collected.push_str(&line);
                collected.push('\n');
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Error reading {name} output: {e}");
                break;
            }
        }
    }
    collected
}

/// Spawn a command and stream stdout/stderr concurrently until exit.
pub async fn run_streaming(mut cmd: Command, name: &str) -> Result<CommandOutput> {
    info!("Running {name}");
    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ForgeError::ConversionFailed {
            message: format!("Failed to spawn {name}: {e}"),
        })?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    // One task per pipe so neither side can block the other.
    let stdout_task = tokio::spawn(drain_lines(stdout, name.to_string(), false));
    let stderr_task = tokio::spawn(drain_lines(stderr, name.to_string(), true));

    let status = child.wait().await.map_err(|e| ForgeError::ConversionFailed {
        message: format!("{name} process error: {e}"),
    })?;

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(CommandOutput {
        stdout,
        stderr,
        status,
    })
}

/// Translate a non-zero exit into an error carrying the collected stderr.
pub fn check_success(output: &CommandOutput, name: &str) -> Result<()> {
    if output.success() {
        return Ok(());
    }
    Err(ForgeError::ConversionFailed {
        message: format!(
            "{name} exited with status {}: {}",
            output.status.code().unwrap_or(-1),
            output.stderr.trim(),
        ),
    })
}
