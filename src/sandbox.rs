//! Running the external generation and render tools.
//!
//! Each tool runs as the leader of its own process group inside a
//! workspace. Whatever happens (normal exit, timeout, cancellation) the whole
//! group is killed afterwards so no descendant outlives the call. stdout and
//! stderr are merged line by line into one combined log, mirrored to a file.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::adapters::cancelled;
use crate::brief::{Brief, GENERATOR_PROMPT};
use crate::error::{PipelineError, PipelineResult};
use crate::workspace::Workspace;

/// How long to wait for output pipes to drain after the group is killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);
/// Characters of log kept in failure messages.
pub const LOG_TAIL_CHARS: usize = 4_000;
/// Bytes of combined output held in memory; the log file keeps everything.
pub const LOG_BUFFER_BYTES: usize = 64 * 1024;
const LINE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct SandboxCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Most recent output, capped near [`LOG_BUFFER_BYTES`].
    pub combined_log: String,
}

impl GenerationOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a non-zero exit into a [`PipelineError::GenerationFailure`]
    /// carrying the end of the log.
    pub fn into_result(self, tool: &str) -> PipelineResult<Self> {
        if self.success() {
            return Ok(self);
        }
        let code = self
            .exit_code
            .map_or_else(|| "a signal".to_string(), |c| format!("code {}", c));
        Err(PipelineError::GenerationFailure(format!(
            "{} exited with {}\n{}",
            tool,
            code,
            log_tail(&self.combined_log, LOG_TAIL_CHARS)
        )))
    }
}

/// The last `max` characters of `log`.
pub fn log_tail(log: &str, max: usize) -> &str {
    let count = log.chars().count();
    if count <= max {
        return log;
    }
    match log.char_indices().nth(count - max) {
        Some((idx, _)) => &log[idx..],
        None => log,
    }
}

/// Append `line` to `log`, dropping the oldest output once `log` grows past
/// twice `limit` so that roughly the last `limit` bytes remain.
fn push_bounded(log: &mut String, line: &str, limit: usize) {
    log.push_str(line);
    log.push('\n');
    if log.len() <= limit.saturating_mul(2) {
        return;
    }
    let mut cut = log.len() - limit;
    while !log.is_char_boundary(cut) {
        cut += 1;
    }
    log.drain(..cut);
}

fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    // SAFETY: signalling a process group has no memory-safety preconditions.
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).split(b'\n');
        while let Ok(Some(line)) = lines.next_segment().await {
            if tx.send(String::from_utf8_lossy(&line).into_owned()).await.is_err() {
                break;
            }
        }
    });
}

async fn open_log(path: Option<&Path>) -> Option<tokio::fs::File> {
    let path = path?;
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    match tokio::fs::OpenOptions::new().create(true).append(true).open(path).await {
        Ok(file) => Some(file),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Cannot open generator log");
            None
        }
    }
}

enum Exit {
    Finished(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Run `cmd` to completion, its timeout, or cancellation.
///
/// Returns the exit code and combined log on completion, even for non-zero
/// exits. A timeout yields [`PipelineError::GenerationTimeout`] and
/// cancellation yields [`PipelineError::Cancelled`]; in both cases every
/// process in the group has been sent SIGKILL before this returns.
pub async fn run_sandboxed(
    cmd: &SandboxCommand,
    timeout: Duration,
    cancel: &CancellationToken,
    log_path: Option<&Path>,
) -> PipelineResult<GenerationOutcome> {
    let mut log_file = open_log(log_path).await;

    let mut child = Command::new(&cmd.program)
        .args(&cmd.args)
        .current_dir(&cmd.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PipelineError::GenerationFailure(format!("failed to launch {}: {}", cmd.program, e)))?;
    let pid = child.id();

    tracing::info!(
        program = %cmd.program,
        pid = ?pid,
        cwd = %cmd.cwd.display(),
        timeout_secs = timeout.as_secs(),
        "Started sandboxed process"
    );

    let (tx, mut rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, tx.clone());
    }
    drop(tx);

    let combined = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&combined);
    let collector = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Some(file) = log_file.as_mut() {
                let _ = file.write_all(line.as_bytes()).await;
                let _ = file.write_all(b"\n").await;
            }
            if let Ok(mut log) = sink.lock() {
                push_bounded(&mut log, &line, LOG_BUFFER_BYTES);
            }
        }
        if let Some(file) = log_file.as_mut() {
            let _ = file.flush().await;
        }
    });

    let exit = tokio::select! {
        status = child.wait() => Exit::Finished(status),
        _ = tokio::time::sleep(timeout) => Exit::TimedOut,
        _ = cancel.cancelled() => Exit::Cancelled,
    };

    kill_group(pid);
    if !matches!(exit, Exit::Finished(_)) {
        let _ = child.kill().await;
    }

    if tokio::time::timeout(DRAIN_GRACE, collector).await.is_err() {
        tracing::warn!(program = %cmd.program, "Output pipes still open after kill, log may be incomplete");
    }
    let combined_log = combined.lock().map(|log| log.clone()).unwrap_or_default();

    match exit {
        Exit::Finished(Ok(status)) => {
            tracing::info!(program = %cmd.program, exit_code = ?status.code(), "Sandboxed process exited");
            Ok(GenerationOutcome {
                exit_code: status.code(),
                combined_log,
            })
        }
        Exit::Finished(Err(e)) => Err(PipelineError::GenerationFailure(format!(
            "failed waiting for {}: {}",
            cmd.program, e
        ))),
        Exit::TimedOut => {
            tracing::warn!(program = %cmd.program, timeout_secs = timeout.as_secs(), "Sandboxed process timed out, killed");
            Err(PipelineError::GenerationTimeout {
                seconds: timeout.as_secs(),
            })
        }
        Exit::Cancelled => {
            tracing::info!(program = %cmd.program, "Sandboxed process cancelled, killed");
            Err(cancelled())
        }
    }
}

/// Locate the produced video in `out_dir`: the expected file name first,
/// otherwise the newest non-empty `.mp4`.
pub async fn locate_artifact(out_dir: &Path, expected: &str) -> PipelineResult<PathBuf> {
    let expected_path = out_dir.join(expected);
    if let Ok(meta) = tokio::fs::metadata(&expected_path).await {
        if meta.is_file() && meta.len() > 0 {
            return Ok(expected_path);
        }
    }

    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    if let Ok(mut entries) = tokio::fs::read_dir(out_dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("mp4") {
                continue;
            }
            let Ok(meta) = entry.metadata().await else { continue };
            if !meta.is_file() || meta.len() == 0 {
                continue;
            }
            let modified = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
            if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                newest = Some((modified, path));
            }
        }
    }

    match newest {
        Some((_, path)) => {
            tracing::info!(found = %path.display(), expected = %expected, "Using newest video in output directory");
            Ok(path)
        }
        None => Err(PipelineError::GenerationFailure("produced no output".to_string())),
    }
}

/// The external code-generation tool.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Write `brief` into the workspace and run the tool there.
    async fn run(
        &self,
        workspace: &mut Workspace,
        brief: &Brief,
        timeout: Duration,
        cancel: &CancellationToken,
        log_path: Option<&Path>,
    ) -> PipelineResult<GenerationOutcome>;
}

/// Invokes a headless coding agent: `{program} -y --timeout {secs} "{prompt}"`.
pub struct CommandGenerator {
    program: String,
}

impl CommandGenerator {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    async fn run(
        &self,
        workspace: &mut Workspace,
        brief: &Brief,
        timeout: Duration,
        cancel: &CancellationToken,
        log_path: Option<&Path>,
    ) -> PipelineResult<GenerationOutcome> {
        brief.write_once(workspace.path())?;
        let cmd = SandboxCommand {
            program: self.program.clone(),
            args: vec![
                "-y".to_string(),
                "--timeout".to_string(),
                timeout.as_secs().to_string(),
                GENERATOR_PROMPT.to_string(),
            ],
            cwd: workspace.path().to_path_buf(),
        };
        run_sandboxed(&cmd, timeout, cancel, log_path).await
    }
}

/// Renders the template project with its props file.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        workspace: &mut Workspace,
        output_name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        log_path: Option<&Path>,
    ) -> PipelineResult<GenerationOutcome>;
}

pub const PROPS_PATH: &str = "src/configs/signal.json";
pub const COMPOSITION_ID: &str = "PromoVideo";

pub struct RemotionRenderer {
    program: String,
}

impl RemotionRenderer {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }

    fn args(output_name: &str) -> Vec<String> {
        vec![
            "remotion".to_string(),
            "render".to_string(),
            COMPOSITION_ID.to_string(),
            format!("out/{}", output_name),
            format!("--props={}", PROPS_PATH),
            "--concurrency=1".to_string(),
        ]
    }
}

#[async_trait]
impl Renderer for RemotionRenderer {
    async fn render(
        &self,
        workspace: &mut Workspace,
        output_name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        log_path: Option<&Path>,
    ) -> PipelineResult<GenerationOutcome> {
        let cmd = SandboxCommand {
            program: self.program.clone(),
            args: Self::args(output_name),
            cwd: workspace.path().to_path_buf(),
        };
        run_sandboxed(&cmd, timeout, cancel, log_path).await
    }
}
