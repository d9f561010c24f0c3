//! External tool invocation with a deadline.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

/// Result of running an external tool.
#[derive(Debug)]
pub struct CommandResult {
    /// Whether the tool exited with status 0.
    pub success: bool,
    /// Combined stdout and stderr output.
    pub output: String,
    /// How long the tool ran in milliseconds.
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl CommandResult {
    fn failed(output: String, duration_ms: u64, timed_out: bool) -> Self {
        Self {
            success: false,
            output,
            duration_ms,
            timed_out,
        }
    }
}

/// Run `program` with `args` in `working_dir`, killing it after `timeout`.
///
/// Spawn failures and timeouts are reported through the result, never as
/// an error.
pub async fn run_command_with_timeout<I, S>(
    working_dir: &Path,
    program: &str,
    args: I,
    timeout: Duration,
) -> CommandResult
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let start = Instant::now();

    let child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(c) => c,
        Err(e) => {
            return CommandResult::failed(
                format!("Failed to spawn {}: {}", program, e),
                start.elapsed().as_millis() as u64,
                false,
            );
        }
    };

    let result = tokio::time::timeout(timeout, child.wait_with_output()).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);

            CommandResult {
                success: output.status.success(),
                output: format!("{}{}", stdout, stderr),
                duration_ms,
                timed_out: false,
            }
        }
        Ok(Err(e)) => {
            CommandResult::failed(format!("{} execution error: {}", program, e), duration_ms, false)
        }
        Err(_) => CommandResult::failed(
            format!("{} timed out after {:?}", program, timeout),
            duration_ms,
            true,
        ),
    }
}
