//! One-shot invocations of external control binaries.
//!
//! Both the scan engine CLI and the container runtime are driven through a
//! [`CommandRunner`]: every call is a single process with captured output, an
//! explicit timeout, and an environment reduced to the proxy variables.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::EngineError;

/// Environment variables forwarded to child processes.
const PERMITTED_ENV: &[&str] = &["http_proxy", "https_proxy"];

/// Arguments whose following value is masked in logs.
const SECRET_FLAGS: &[&str] = &["-u", "-p"];

const MASK: &str = "**********";

/// Captured result of a finished process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Clone, Debug)]
pub struct CommandRunner {
    program: PathBuf,
    base_args: Vec<String>,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            timeout,
        }
    }

    /// Arguments prepended to every invocation (global flags of the binary).
    pub fn with_base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs the program and returns stdout on exit code 0. Any other exit
    /// code becomes [`EngineError::Exit`] carrying stderr.
    pub async fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<String, EngineError> {
        self.run_with_timeout(args, self.timeout).await
    }

    pub async fn run_with_timeout<S: AsRef<str>>(
        &self,
        args: &[S],
        timeout: Duration,
    ) -> Result<String, EngineError> {
        let output = self.run_raw_with_timeout(args, timeout).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(EngineError::Exit {
                program: self.program_name(),
                code: output.code,
                output: output.stderr,
            })
        }
    }

    /// Runs the program and returns whatever it produced, whatever the exit
    /// code.
    pub async fn run_raw<S: AsRef<str>>(&self, args: &[S]) -> Result<CommandOutput, EngineError> {
        self.run_raw_with_timeout(args, self.timeout).await
    }

    async fn run_raw_with_timeout<S: AsRef<str>>(
        &self,
        args: &[S],
        timeout: Duration,
    ) -> Result<CommandOutput, EngineError> {
        let child = self.spawn(args, false)?;
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| self.spawn_error(e))?,
            Err(_) => {
                return Err(EngineError::Timeout {
                    program: self.program_name(),
                    seconds: timeout.as_secs(),
                });
            }
        };

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Starts the program with piped stdout/stderr for callers that consume
    /// its output while it runs. The child is killed when dropped.
    pub fn spawn_streaming<S: AsRef<str>>(&self, args: &[S]) -> Result<Child, EngineError> {
        self.spawn(args, true)
    }

    fn spawn<S: AsRef<str>>(&self, args: &[S], streaming: bool) -> Result<Child, EngineError> {
        if !self.program.is_absolute() {
            return Err(EngineError::RelativeProgram(self.program_name()));
        }

        let all_args: Vec<&str> = self
            .base_args
            .iter()
            .map(String::as_str)
            .chain(args.iter().map(AsRef::as_ref))
            .collect();

        debug!(
            command = %self.describe(&all_args),
            timeout_secs = self.timeout.as_secs(),
            streaming,
            "run command"
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(&all_args)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in PERMITTED_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }

        cmd.spawn().map_err(|e| self.spawn_error(e))
    }

    /// Command line as logged, with credential values masked.
    pub fn describe(&self, args: &[&str]) -> String {
        let mut parts = vec![self.program.display().to_string()];
        let mut mask_next = false;
        for arg in args {
            if mask_next {
                parts.push(MASK.to_string());
                mask_next = false;
                continue;
            }
            mask_next = SECRET_FLAGS.contains(arg);
            parts.push((*arg).to_string());
        }
        parts.join(" ")
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    fn spawn_error(&self, err: std::io::Error) -> EngineError {
        EngineError::Spawn {
            program: self.program_name(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_masks_credentials() {
        let runner = CommandRunner::new("/usr/bin/podman", Duration::from_secs(5));
        let line = runner.describe(&["login", "registry.local", "-u", "bob", "-p", "hunter2", "--cert-dir", "/certs"]);
        assert_eq!(
            line,
            "/usr/bin/podman login registry.local -u ********** -p ********** --cert-dir /certs"
        );
    }

    #[tokio::test]
    async fn relative_program_is_refused() {
        let runner = CommandRunner::new("kesl-control", Duration::from_secs(5));
        let err = runner.run(&["--app-info"]).await.unwrap_err();
        assert_eq!(err, EngineError::RelativeProgram("kesl-control".into()));
        assert_eq!(err.code(), -1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let runner = CommandRunner::new("/bin/sh", Duration::from_secs(5));
        let out = runner.run(&["-c", "echo ready"]).await.unwrap();
        assert_eq!(out, "ready");

        let err = runner.run(&["-c", "echo broken >&2; exit 3"]).await.unwrap_err();
        assert_eq!(err.code(), 3);
        assert_eq!(err.output(), "broken");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_command_times_out() {
        let runner = CommandRunner::new("/bin/sh", Duration::from_millis(100));
        let err = runner.run(&["-c", "sleep 5"]).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
    }
}
