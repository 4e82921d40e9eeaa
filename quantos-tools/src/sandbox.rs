use crate::error::{Result, ToolError};
use crate::traits::{optional_u64, require_string, Tool, ToolResult, ToolSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Cumulative stdout+stderr budget per run.
pub const OUTPUT_CAP_BYTES: usize = 100 * 1024;

const TRUNCATION_MARKER: &str = "[output truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTimeout {
    Seconds60,
    Minutes5,
    Minutes30,
    Unlimited,
}

impl RunTimeout {
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            Self::Seconds60 => Some(Duration::from_secs(60)),
            Self::Minutes5 => Some(Duration::from_secs(5 * 60)),
            Self::Minutes30 => Some(Duration::from_secs(30 * 60)),
            Self::Unlimited => None,
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "60s" | "1min" => Ok(Self::Seconds60),
            "5min" | "5m" => Ok(Self::Minutes5),
            "30min" | "30m" => Ok(Self::Minutes30),
            "unlimited" | "none" => Ok(Self::Unlimited),
            other => Err(ToolError::InvalidArguments(format!(
                "timeout must be one of 60s, 5min, 30min, unlimited; got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    Completed,
    Timeout,
    Cancelled,
}

/// Frames streamed back while a process runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxEvent {
    Started { command: String },
    Stdout { chunk: String },
    Stderr { chunk: String },
    Exit { exit_code: i64, duration_ms: u64, kind: ExitKind },
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub user_id: u64,
    pub command: String,
    pub working_dir: PathBuf,
    /// None means unlimited.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub exit_code: i64,
    pub duration_ms: u64,
    pub kind: ExitKind,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

/// Owns the OS processes spawned on behalf of agents: one active process per
/// user, hard timeouts, cooperative TERM-then-KILL cancellation, and a
/// bounded output budget.
pub struct SandboxRunner {
    active_users: Mutex<HashSet<u64>>,
    grace: Duration,
}

impl Default for SandboxRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl SandboxRunner {
    pub fn new(grace: Duration) -> Self {
        Self {
            active_users: Mutex::new(HashSet::new()),
            grace,
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(user_id = request.user_id, command = %request.command)
    )]
    pub async fn run(
        &self,
        request: RunRequest,
        events: Option<UnboundedSender<SandboxEvent>>,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let _slot = self.claim_slot(request.user_id)?;

        let mut child = Command::new("/bin/sh")
            .arg("-lc")
            .arg(&request.command)
            .current_dir(&request.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("spawn failed: {e}")))?;

        send_event(
            &events,
            SandboxEvent::Started {
                command: request.command.clone(),
            },
        );

        let budget = Arc::new(AtomicUsize::new(OUTPUT_CAP_BYTES));
        let marker_sent = Arc::new(AtomicBool::new(false));
        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));

        let stdout_task = child.stdout.take().map(|pipe| {
            spawn_stream_collector(
                pipe,
                events.clone(),
                StreamKind::Stdout,
                stdout_buf.clone(),
                budget.clone(),
                marker_sent.clone(),
            )
        });
        let stderr_task = child.stderr.take().map(|pipe| {
            spawn_stream_collector(
                pipe,
                events.clone(),
                StreamKind::Stderr,
                stderr_buf.clone(),
                budget.clone(),
                marker_sent.clone(),
            )
        });

        let started = Instant::now();
        let deadline = request.timeout;
        let (exit_code, kind) = self
            .wait_for_exit(&mut child, deadline, cancel, started)
            .await?;

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        send_event(
            &events,
            SandboxEvent::Exit {
                exit_code,
                duration_ms,
                kind,
            },
        );
        tracing::info!(exit_code, duration_ms, kind = ?kind, "sandbox run finished");

        Ok(RunSummary {
            exit_code,
            duration_ms,
            kind,
            stdout: take_buffer(&stdout_buf),
            stderr: take_buffer(&stderr_buf),
            truncated: marker_sent.load(Ordering::Relaxed),
        })
    }

    async fn wait_for_exit(
        &self,
        child: &mut Child,
        deadline: Option<Duration>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<(i64, ExitKind)> {
        let sleep_for = deadline.unwrap_or(Duration::from_secs(u64::MAX / 4));
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
                Ok((status.code().map(i64::from).unwrap_or(-1), ExitKind::Completed))
            }
            _ = cancel.cancelled() => {
                tracing::warn!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "sandbox run cancelled, terminating child"
                );
                self.terminate_with_grace(child).await;
                Ok((-1, ExitKind::Cancelled))
            }
            _ = tokio::time::sleep(sleep_for), if deadline.is_some() => {
                tracing::warn!(
                    timeout_ms = sleep_for.as_millis() as u64,
                    "sandbox run hit hard timeout, terminating child"
                );
                self.terminate_with_grace(child).await;
                Ok((-1, ExitKind::Timeout))
            }
        }
    }

    /// Polite SIGTERM first; hard kill once the grace period elapses.
    async fn terminate_with_grace(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            let _ = Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .status()
                .await;
        }
        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "hard kill failed");
                }
                let _ = child.wait().await;
            }
        }
    }

    fn claim_slot(&self, user_id: u64) -> Result<SlotGuard<'_>> {
        let mut active = self
            .active_users
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !active.insert(user_id) {
            return Err(ToolError::Busy(format!(
                "user {user_id} already has a running process"
            )));
        }
        Ok(SlotGuard {
            runner: self,
            user_id,
        })
    }

    fn release_slot(&self, user_id: u64) {
        self.active_users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&user_id);
    }
}

struct SlotGuard<'a> {
    runner: &'a SandboxRunner,
    user_id: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.runner.release_slot(self.user_id);
    }
}

#[derive(Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

fn spawn_stream_collector<R>(
    reader: R,
    events: Option<UnboundedSender<SandboxEvent>>,
    kind: StreamKind,
    buffer: Arc<Mutex<String>>,
    budget: Arc<AtomicUsize>,
    marker_sent: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let chunk = format!("{line}\n");
            let cost = chunk.len();
            let remaining = budget.fetch_sub(cost, Ordering::AcqRel);
            if remaining < cost || remaining > OUTPUT_CAP_BYTES {
                // Budget exhausted (or wrapped past zero); drop further
                // chunks after a single marker.
                if !marker_sent.swap(true, Ordering::AcqRel) {
                    let marker = format!("{TRUNCATION_MARKER}\n");
                    append(&buffer, &marker);
                    emit(&events, kind, marker);
                }
                continue;
            }
            append(&buffer, &chunk);
            emit(&events, kind, chunk);
        }
    })
}

fn emit(events: &Option<UnboundedSender<SandboxEvent>>, kind: StreamKind, chunk: String) {
    let event = match kind {
        StreamKind::Stdout => SandboxEvent::Stdout { chunk },
        StreamKind::Stderr => SandboxEvent::Stderr { chunk },
    };
    send_event(events, event);
}

fn send_event(events: &Option<UnboundedSender<SandboxEvent>>, event: SandboxEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

fn append(buffer: &Arc<Mutex<String>>, chunk: &str) {
    buffer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push_str(chunk);
}

fn take_buffer(buffer: &Arc<Mutex<String>>) -> String {
    std::mem::take(&mut *buffer.lock().unwrap_or_else(PoisonError::into_inner))
}

/// Run a command in the project sandbox and return collected output.
pub struct ShellExecTool {
    runner: Arc<SandboxRunner>,
    working_dir: PathBuf,
    user_id: u64,
    default_timeout: RunTimeout,
    cancel: CancellationToken,
}

impl ShellExecTool {
    pub fn new(
        runner: Arc<SandboxRunner>,
        working_dir: PathBuf,
        user_id: u64,
        default_timeout: RunTimeout,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            working_dir,
            user_id,
            default_timeout,
            cancel,
        }
    }

    async fn exec(&self, args: &serde_json::Value) -> Result<ToolResult> {
        let command = require_string(args, "command")?;
        if command.trim().is_empty() {
            return Err(ToolError::InvalidArguments(
                "command must not be empty".to_string(),
            ));
        }
        let timeout = match optional_u64(args, "timeout_secs")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => self.default_timeout.as_duration(),
        };

        let summary = self
            .runner
            .run(
                RunRequest {
                    user_id: self.user_id,
                    command: command.clone(),
                    working_dir: self.working_dir.clone(),
                    timeout,
                },
                None,
                &self.cancel,
            )
            .await?;

        let mut output = String::new();
        if !summary.stdout.is_empty() {
            output.push_str(&summary.stdout);
        }
        if !summary.stderr.is_empty() {
            output.push_str("\n[stderr]\n");
            output.push_str(&summary.stderr);
        }
        output.push_str(&format!(
            "\n[exit code {} after {} ms]",
            summary.exit_code, summary.duration_ms
        ));

        let success = summary.kind == ExitKind::Completed;
        if !success {
            let kind = match summary.kind {
                ExitKind::Timeout => crate::ToolErrorKind::Timeout,
                ExitKind::Cancelled => crate::ToolErrorKind::Cancelled,
                ExitKind::Completed => unreachable!(),
            };
            let mut failed = ToolResult::fail(kind, output);
            failed.data = Some(serde_json::json!({
                "exit_code": summary.exit_code,
                "duration_ms": summary.duration_ms,
            }));
            return Ok(failed);
        }

        Ok(ToolResult::ok_with_data(
            output,
            serde_json::json!({
                "stdout": summary.stdout,
                "stderr": summary.stderr,
                "exit_code": summary.exit_code,
                "duration_ms": summary.duration_ms,
                "truncated": summary.truncated,
            }),
        ))
    }
}

#[async_trait]
impl Tool for ShellExecTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "shell_exec".to_string(),
            description: "Run a shell command in the project sandbox and capture its output."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "command": { "type": "string" },
                    "timeout_secs": { "type": "integer" }
                },
                "required": ["command"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolResult {
        match self.exec(&arguments).await {
            Ok(result) => result,
            Err(e) => e.into(),
        }
    }
}
