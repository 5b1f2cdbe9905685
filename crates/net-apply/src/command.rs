//! External command execution

use std::process::Stdio;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use tokio::process::Command;
use tokio::time::timeout;

use safenet_core::{NetworkError, Result, SystemError};

/// Captured result of an external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the command exited with status zero
    pub success: bool,
    /// Exit code, `None` when killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Turn a non-zero exit into an error
    pub fn check(self, command: &str) -> Result<Self> {
        if self.success {
            return Ok(self);
        }
        Err(NetworkError::System(SystemError::CommandExit {
            command: command.to_string(),
            code: self.exit_code,
            stderr: self.stderr.trim().to_string(),
        }))
    }
}

/// Runs external programs with an optional time limit
#[derive(Debug, Clone)]
pub struct CommandRunner {
    default_timeout: Option<Duration>,
}

impl CommandRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout: Some(default_timeout),
        }
    }

    pub fn without_timeout() -> Self {
        Self {
            default_timeout: None,
        }
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Run `program` with the default time limit
    pub async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        self.run_with_timeout(program, args, self.default_timeout)
            .await
    }

    /// Run `program`, killing it if it outlives `limit`
    pub async fn run_with_timeout(
        &self,
        program: &str,
        args: &[String],
        limit: Option<Duration>,
    ) -> Result<CommandOutput> {
        let operation = describe(program, args);
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Executing {}", operation);
        let start_time = Instant::now();

        let result = match limit {
            Some(limit) => match timeout(limit, cmd.output()).await {
                Ok(result) => result,
                Err(_) => {
                    error!("{} timed out after {:?}", operation, limit);
                    return Err(SystemError::CommandTimeout { command: operation }.into());
                }
            },
            None => cmd.output().await,
        };

        let duration_ms = start_time.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let success = output.status.success();
                let exit_code = output.status.code();

                if success {
                    debug!("{} completed successfully in {}ms", operation, duration_ms);
                } else {
                    warn!(
                        "{} failed with exit code {:?}: {}",
                        operation,
                        exit_code,
                        stderr.trim()
                    );
                }

                Ok(CommandOutput {
                    success,
                    exit_code,
                    stdout,
                    stderr,
                    duration_ms,
                })
            }
            Err(e) => {
                error!("{} failed to execute: {}", operation, e);
                Err(SystemError::CommandFailed { command: operation }.into())
            }
        }
    }
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

pub(crate) fn describe(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}
