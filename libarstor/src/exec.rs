//! External command execution.
//!
//! Everything the plugin does to the host (`losetup`, `kpartx`, `blkid`,
//! `mkfs.*`, `docker exec ...`) goes through a [`CommandRunner`], so the
//! device and tool layers can be driven by a scripted runner in tests.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::CsiError;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout followed by stderr, the way a terminal would show them.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }
}

/// Runs external programs.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, optionally feeding `stdin`, and capture its
    /// output.  Only a failure to spawn is an `Err`; a non-zero exit is
    /// reported through [`CommandOutput::status`].
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<CommandOutput, CsiError>;

    /// Run a command and turn a non-zero exit into a
    /// [`CsiError::BackendError`] carrying the command's combined output.
    async fn run_checked(&self, program: &str, args: &[&str]) -> Result<String, CsiError> {
        let out = self.run(program, args, None).await?;
        if !out.success() {
            return Err(CsiError::BackendError(format!(
                "{program} {} (exit {:?}): {}",
                args.join(" "),
                out.status,
                out.combined().trim()
            )));
        }
        Ok(out.stdout)
    }
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<CommandOutput, CsiError> {
        debug!(%program, ?args, "exec");
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = cmd
            .spawn()
            .map_err(|e| CsiError::BackendError(format!("spawn {program}: {e}")))?;

        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| CsiError::BackendError(format!("write stdin of {program}: {e}")))?;
            // Close stdin so interactive tools see EOF.
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CsiError::BackendError(format!("wait {program}: {e}")))?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
