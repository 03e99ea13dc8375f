//! Subprocess execution helpers

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::TransportError;

/// Captured result of a finished subprocess.
#[derive(Debug)]
pub struct ExecOutput {
    /// Exit code; -1 when the process was killed by a signal
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the process exited 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run a command to completion with a timeout, capturing output.
///
/// The child is killed if the timeout elapses or the future is dropped.
pub async fn exec_with_timeout(
    mut command: Command,
    timeout: Duration,
) -> Result<ExecOutput, TransportError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let label = format!("{:?}", command.as_std());
    debug!(command = %label, ?timeout, "Running subprocess");

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| TransportError::CommandTimeout {
            command: label,
            timeout,
        })??;

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo out; echo err >&2; exit 3"]);
        let output = exec_with_timeout(command, Duration::from_secs(5))
            .await
            .expect("process ran");
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn times_out_and_reports_the_command() {
        let mut command = Command::new("sh");
        command.args(["-c", "sleep 30"]);
        let err = exec_with_timeout(command, Duration::from_millis(100))
            .await
            .expect_err("must time out");
        assert!(matches!(err, TransportError::CommandTimeout { .. }));
    }
}
