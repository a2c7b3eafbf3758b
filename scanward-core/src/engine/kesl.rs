use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, warn};

use super::events::decode_events;
use super::product::{EngineStatus, ProductInfo};
use super::{EngineService, ScanEngine, ScanKind, ScanEvent, TaskRun, TaskSettings};
use crate::command::CommandRunner;
use crate::error::EngineError;

/// Storage root podman uses when the container runs unprivileged.
pub const PODMAN_VFS_ROOT: &str = "/var/lib/containers/vfs-storage/";

const UPDATE_TASK: &str = "Update";
const UPDATE_FINISHED_QUERY: &str =
    "EventType == 'TaskStateChanged' and TaskName == 'Update' and TaskState == 'Stopped'";

/// Exit codes meaning the engine did not answer at all.
const NOT_RESPONDING_CODES: &[i32] = &[127, 64];

/// Stderr bytes kept from a streaming run for its error report.
const STDERR_KEEP: usize = 4096;

/// Driver for the `kesl-control` CLI and the engine service script.
#[derive(Clone, Debug)]
pub struct KeslControl {
    control: CommandRunner,
    service: CommandRunner,
    update_timeout: Duration,
}

impl KeslControl {
    pub fn new(
        control_path: impl Into<PathBuf>,
        service_path: impl Into<PathBuf>,
        general_timeout: Duration,
        update_timeout: Duration,
    ) -> Self {
        Self {
            control: CommandRunner::new(control_path, general_timeout),
            service: CommandRunner::new(service_path, general_timeout),
            update_timeout,
        }
    }

    /// Adds an activation code or key file.
    pub async fn activate(&self, key: &str) -> Result<String, EngineError> {
        self.control.run(&["--add-active-key", key]).await
    }

    pub async fn revoke(&self) -> Result<String, EngineError> {
        self.control.run(&["--remove-active-key"]).await
    }

    pub async fn set_trace_level(&self, level: &str) -> Result<String, EngineError> {
        let setting = format!("TraceLevel={level}");
        self.control.run(&["--set-app-settings", setting.as_str()]).await
    }

    /// Applies whitespace separated `key=value` options to the update task.
    pub async fn setup_update_task(&self, options: &str) -> Result<String, EngineError> {
        let mut args = vec!["--set-set", UPDATE_TASK];
        args.extend(options.split_whitespace());
        self.control.run(&args).await
    }

    pub async fn enable_podman(&self, enable: bool) -> Result<String, EngineError> {
        let use_podman = format!("UsePodman={}", if enable { "Yes" } else { "No" });
        let root = format!("PodmanRootFolder={PODMAN_VFS_ROOT}");
        self.control
            .run(&["--set-cont", use_podman.as_str(), root.as_str()])
            .await
    }

    /// Runs the database update task to completion.
    pub async fn update_bases(&self) -> Result<String, EngineError> {
        self.control
            .run_with_timeout(&["--start-task", UPDATE_TASK, "-W"], self.update_timeout)
            .await
    }

    fn stream_lines(&self, args: &[&str]) -> Result<TaskRun, EngineError> {
        let mut child = self.control.spawn_streaming(args)?;
        let program = self.control.program().display().to_string();

        let stdout = child.stdout.take().ok_or_else(|| EngineError::Spawn {
            program: program.clone(),
            message: "stdout not captured".to_string(),
        })?;
        // Drained concurrently so a chatty stderr never blocks stdout.
        let stderr = child.stderr.take().map(|stderr| tokio::spawn(first_stderr_line(stderr)));

        let exit = async move {
            let status = child.wait().await.map_err(|e| EngineError::Spawn {
                program: program.clone(),
                message: e.to_string(),
            })?;
            let output = match stderr {
                Some(handle) => handle.await.unwrap_or_default(),
                None => String::new(),
            };
            if status.success() {
                return Ok(());
            }
            Err(EngineError::Exit {
                program,
                code: status.code().unwrap_or(-1),
                output,
            })
        };

        Ok(TaskRun {
            events: decode_events(raw_lines(stdout)).boxed(),
            exit: Box::pin(exit),
        })
    }
}

/// Splits output on newlines without requiring UTF-8. Undecodable bytes are
/// replaced so a single bad line never ends the stream.
fn raw_lines<R>(reader: R) -> impl Stream<Item = String>
where
    R: AsyncRead + Unpin,
{
    async_stream::stream! {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => yield String::from_utf8_lossy(&buf).into_owned(),
                Err(err) => {
                    warn!(error = %err, "engine output read failed");
                    break;
                }
            }
        }
    }
}

async fn first_stderr_line<R>(mut stderr: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = STDERR_KEEP.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

#[async_trait]
impl ScanEngine for KeslControl {
    async fn create_task(&self, name: &str, kind: ScanKind) -> Result<(), EngineError> {
        self.control
            .run(&["--create-task", name, "--type", kind.as_str()])
            .await
            .map(drop)
    }

    async fn apply_settings(&self, name: &str, settings: &TaskSettings) -> Result<(), EngineError> {
        let mut args = vec!["--set-set".to_string(), name.to_string()];
        args.extend(settings.to_args());
        self.control.run(&args).await.map(drop)
    }

    async fn start_task(&self, name: &str) -> Result<TaskRun, EngineError> {
        debug!(task = name, "start task");
        self.stream_lines(&["--start-task", name, "-W"])
    }

    async fn delete_task(&self, name: &str) -> Result<(), EngineError> {
        self.control.run(&["--delete-task", name]).await.map(drop)
    }
}

#[async_trait]
impl EngineService for KeslControl {
    async fn app_status(&self) -> Result<EngineStatus, EngineError> {
        let output = self.control.run_raw(&["--app-info"]).await?;
        Ok(EngineStatus::from_code(output.code))
    }

    async fn product_info(&self) -> Result<Option<ProductInfo>, EngineError> {
        let output = self.control.run_raw(&["--app-info", "--json"]).await?;
        if NOT_RESPONDING_CODES.contains(&output.code) || output.stdout.is_empty() {
            debug!(code = output.code, "engine did not report product info");
            return Ok(None);
        }
        match serde_json::from_str::<ProductInfo>(&output.stdout) {
            Ok(info) => Ok(Some(info)),
            Err(err) => {
                warn!(error = %err, "unable to decode product info");
                Ok(None)
            }
        }
    }

    async fn restart(&self) -> Result<(), EngineError> {
        self.service.run(&["restart"]).await.map(drop)
    }

    async fn watch_updates(&self) -> Result<BoxStream<'static, ScanEvent>, EngineError> {
        let run = self.stream_lines(&["-W", "--q", UPDATE_FINISHED_QUERY])?;
        let TaskRun { events, exit } = run;
        // Reap the query process once its output ends.
        let stream = events.chain(
            futures::stream::once(async move {
                if let Err(err) = exit.await {
                    warn!(error = %err, "update watch query exited");
                }
            })
            .filter_map(|_| futures::future::ready(None)),
        );
        Ok(stream.boxed())
    }
}
