//! Bounded subprocess execution.
//!
//! The executor runs already-validated input. It never decides whether the
//! input is safe and never decides whether a non-zero exit is a failure; it
//! reports what happened. Two outcome classes are distinguished: the process
//! ran to completion, or it was killed at its deadline (`timed_out`).

mod script_file;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{GuardError, GuardResult};
use crate::policy::ExecutionMode;
use crate::shell::Interpreter;

pub use script_file::ScriptFile;

/// How long to wait for output pipes to drain after the process is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// A validated request, ready to run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// The command line or the full script text.
    pub command_or_script: String,
    pub mode: ExecutionMode,
    /// Effective deadline.
    pub timeout: Duration,
    /// Canonical working directory.
    pub working_directory: PathBuf,
    /// Merged into the inherited environment.
    pub environment_overrides: BTreeMap<String, String>,
    pub allow_shell_access: bool,
}

/// What happened when the process ran.
///
/// If `timed_out` is set, the process was killed and `exit_code` carries no
/// meaning for success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_millis: u64,
    pub timed_out: bool,
    /// Number of script statements, in script mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines_executed: Option<usize>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stdout_truncated: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stderr_truncated: bool,
}

impl ExecutionResult {
    /// Returns `true` if the process ran to completion with exit code 0.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Bytes captured from one output stream.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

type SharedCapture = Arc<Mutex<Captured>>;

/// Reads a pipe to EOF, keeping at most `limit` bytes.
///
/// Reading continues past the limit so the child never blocks on a full pipe.
async fn capture<R>(mut reader: R, limit: usize, sink: SharedCapture)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let mut captured = sink.lock().unwrap_or_else(PoisonError::into_inner);
                let room = limit.saturating_sub(captured.bytes.len());
                let take = room.min(n);
                captured.bytes.extend_from_slice(&chunk[..take]);
                if take < n {
                    captured.truncated = true;
                }
            }
            Err(e) => {
                debug!(error = %e, "output pipe read failed");
                break;
            }
        }
    }
}

fn take_captured(sink: &SharedCapture) -> (String, bool) {
    let mut captured = sink.lock().unwrap_or_else(PoisonError::into_inner);
    let bytes = std::mem::take(&mut captured.bytes);
    (String::from_utf8_lossy(&bytes).into_owned(), captured.truncated)
}

/// Waits briefly for a reader; aborts it if the pipe stays open.
///
/// A grandchild that inherited the pipe can keep it open after the
/// interpreter is killed.
async fn finish_reader(handle: Option<JoinHandle<()>>) {
    if let Some(mut handle) = handle {
        if tokio::time::timeout(DRAIN_GRACE, &mut handle).await.is_err() {
            debug!("output pipe still open after process exit; abandoning reader");
            handle.abort();
        }
    }
}

/// Spawns the interpreter under a deadline.
#[derive(Debug, Clone)]
pub struct Executor {
    interpreter: Interpreter,
    max_output_bytes: usize,
    temp_dir: PathBuf,
}

impl Executor {
    /// Creates an executor for `interpreter`, capping each output stream.
    #[must_use]
    pub fn new(interpreter: Interpreter, max_output_bytes: usize) -> Self {
        Self {
            interpreter,
            max_output_bytes,
            temp_dir: std::env::temp_dir(),
        }
    }

    /// Places temporary script files in `dir` instead of the system temp dir.
    #[must_use]
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    #[must_use]
    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    #[must_use]
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Runs a request to completion or to its deadline.
    ///
    /// A timeout is reported as `Ok` with `timed_out` set and partial output.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::ExecutionFailed`] if the script file cannot be
    /// written or the interpreter cannot be started or waited on.
    pub async fn run(&self, request: &ExecutionRequest) -> GuardResult<ExecutionResult> {
        // Removed on drop, whichever way this function returns.
        let script_file = match request.mode {
            ExecutionMode::Script => Some(
                ScriptFile::create(
                    &self.temp_dir,
                    &self.interpreter.script_extension,
                    &request.command_or_script,
                )
                .map_err(|e| {
                    GuardError::execution_failed(format!("failed to write script file: {e}"), None)
                })?,
            ),
            ExecutionMode::Command => None,
        };
        let payload = match &script_file {
            Some(file) => file.path().to_string_lossy().into_owned(),
            None => request.command_or_script.clone(),
        };

        let mut cmd = self.interpreter.build_command(request.mode, &payload);
        cmd.current_dir(&request.working_directory)
            .envs(&request.environment_overrides)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            warn!(program = %self.interpreter.program, error = %e, "failed to start interpreter");
            GuardError::execution_failed(
                format!("failed to start '{}': {e}", self.interpreter.program),
                None,
            )
        })?;
        debug!(
            pid = ?child.id(),
            mode = %request.mode,
            timeout_ms = request.timeout.as_millis() as u64,
            "interpreter started"
        );

        let stdout_sink = SharedCapture::default();
        let stderr_sink = SharedCapture::default();
        let stdout_reader = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(capture(pipe, self.max_output_bytes, stdout_sink.clone())));
        let stderr_reader = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(capture(pipe, self.max_output_bytes, stderr_sink.clone())));

        let (exit_code, timed_out) = match tokio::time::timeout(request.timeout, child.wait()).await
        {
            Ok(Ok(status)) => (status.code().unwrap_or(-1), false),
            Ok(Err(e)) => {
                return Err(GuardError::execution_failed(
                    format!("failed waiting for interpreter: {e}"),
                    None,
                ))
            }
            Err(_) => {
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "failed to kill timed-out interpreter");
                }
                if tokio::time::timeout(DRAIN_GRACE, child.wait()).await.is_err() {
                    warn!("timed-out interpreter did not exit after kill");
                }
                warn!(
                    timeout_ms = request.timeout.as_millis() as u64,
                    "execution timed out and was killed"
                );
                (-1, true)
            }
        };
        let duration = started.elapsed();

        finish_reader(stdout_reader).await;
        finish_reader(stderr_reader).await;
        let (stdout, stdout_truncated) = take_captured(&stdout_sink);
        let (stderr, stderr_truncated) = take_captured(&stderr_sink);
        if stdout_truncated || stderr_truncated {
            warn!(
                max_bytes = self.max_output_bytes,
                "execution output truncated"
            );
        }

        drop(script_file);

        Ok(ExecutionResult {
            exit_code,
            stdout,
            stderr,
            duration_millis: duration.as_millis() as u64,
            timed_out,
            lines_executed: None,
            stdout_truncated,
            stderr_truncated,
        })
    }
}
