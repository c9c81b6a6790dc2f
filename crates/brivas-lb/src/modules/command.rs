//! Bounded execution of external tools

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::{LbError, Result};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs one tool binary with a deadline per call
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run with `args` and return stdout; non-zero exit is an error
    pub async fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
        let rendered = format!("{} {}", self.program, args.join(" "));
        debug!(command = %rendered, "Running command");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| LbError::Timeout(format!("{} after {:?}", rendered, self.timeout)))?
            .map_err(|e| LbError::Command {
                command: rendered.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(LbError::Command {
                command: rendered,
                reason: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_command_error() {
        let runner = CommandRunner::new("/nonexistent/brivas-tool", DEFAULT_COMMAND_TIMEOUT);
        let err = runner.run(&["-L"]).await.unwrap_err();
        assert!(matches!(err, LbError::Command { .. }));
    }
}
