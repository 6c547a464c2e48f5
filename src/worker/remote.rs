//! Workers running in a child process.
//!
//! The parent writes one JSON line describing the execution to the child's
//! stdin and closes it. The child answers on stdout with any number of
//! progress lines followed by exactly one result line:
//!
//! ```text
//! -> {"job_id":"...","job_type":"upload","input":{...},"run_attempt_count":1}
//! <- {"type":"progress","data":{...}}
//! <- {"type":"result","result":{"status":"success","value":{...}}}
//! ```
//!
//! Anything else (a crash, a non-zero exit, closing stdout early, a line
//! that does not parse or exceeds [`MAX_REMOTE_MESSAGE_BYTES`], or running
//! past the timeout) is reported as a [`RemoteError`].

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::registry::{WorkerKind, WorkerRegistry};
use super::runner::{self, ExecutionOutcome};
use super::{ProgressSink, WorkContext, WorkResult};
use crate::core::data::Data;
use crate::core::types::JobId;

/// Largest single line accepted in either direction.
pub const MAX_REMOTE_MESSAGE_BYTES: usize = 64 * 1024;

/// Errors at the process boundary.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The child could not be started.
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    /// Reading from or writing to the child failed.
    #[error("i/o error talking to worker process: {0}")]
    Io(#[from] std::io::Error),

    /// The child exited unsuccessfully.
    #[error("worker process exited unsuccessfully (code {0:?})")]
    Exited(Option<i32>),

    /// The stream closed before a result arrived.
    #[error("worker process closed its output before replying")]
    Disconnected,

    /// A line could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A line exceeded the size limit.
    #[error("message exceeds {limit} bytes")]
    MessageTooLarge { limit: usize },

    /// No result within the time limit.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct RemoteRequest {
    pub job_id: JobId,
    pub job_type: String,
    pub input: Data,
    pub run_attempt_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum RemoteReply {
    Progress { data: Data },
    Result { result: WorkResult },
}

/// A worker that runs an external program per execution.
#[derive(Debug, Clone)]
pub struct RemoteWorker {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    timeout: Option<Duration>,
}

impl RemoteWorker {
    pub fn builder(program: impl Into<String>) -> RemoteWorkerBuilder {
        RemoteWorkerBuilder::new(program)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Per-worker timeout, overriding the scheduler default.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run one execution in a fresh child process.
    pub async fn run(
        &self,
        ctx: &WorkContext,
        default_timeout: Duration,
    ) -> Result<WorkResult, RemoteError> {
        let limit = self.timeout.unwrap_or(default_timeout);
        match timeout(limit, self.exchange(ctx)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(job_id = %ctx.job_id(), program = %self.program, timeout = ?limit, "Remote worker timed out");
                Err(RemoteError::Timeout(limit))
            }
        }
    }

    async fn exchange(&self, ctx: &WorkContext) -> Result<WorkResult, RemoteError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(RemoteError::Spawn)?;
        let mut stdin = child.stdin.take().ok_or(RemoteError::Disconnected)?;
        let stdout = child.stdout.take().ok_or(RemoteError::Disconnected)?;

        let request = RemoteRequest {
            job_id: *ctx.job_id(),
            job_type: ctx.job_type().to_string(),
            input: ctx.input().clone(),
            run_attempt_count: ctx.run_attempt_count(),
        };
        write_line(&mut stdin, &request).await?;
        drop(stdin);

        let mut reader = BufReader::new(stdout);
        let mut result = None;
        while let Some(line) = read_line(&mut reader).await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RemoteReply>(&line) {
                Ok(RemoteReply::Progress { data }) => ctx.set_progress(data),
                Ok(RemoteReply::Result { result: r }) => {
                    result = Some(r);
                    break;
                }
                Err(e) => return Err(RemoteError::Malformed(e.to_string())),
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(RemoteError::Exited(status.code()));
        }
        result.ok_or(RemoteError::Disconnected)
    }
}

/// Builder for [`RemoteWorker`].
#[derive(Debug, Clone)]
pub struct RemoteWorkerBuilder {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    timeout: Option<Duration>,
}

impl RemoteWorkerBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    pub fn build(self) -> RemoteWorker {
        RemoteWorker {
            program: self.program,
            args: self.args,
            envs: self.envs,
            timeout: self.timeout,
        }
    }
}

async fn write_line<W, T>(writer: &mut W, message: &T) -> Result<(), RemoteError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line =
        serde_json::to_vec(message).map_err(|e| RemoteError::Malformed(e.to_string()))?;
    if line.len() > MAX_REMOTE_MESSAGE_BYTES {
        return Err(RemoteError::MessageTooLarge {
            limit: MAX_REMOTE_MESSAGE_BYTES,
        });
    }
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one line of at most [`MAX_REMOTE_MESSAGE_BYTES`]. `None` at end of stream.
async fn read_line<R>(reader: &mut R) -> Result<Option<String>, RemoteError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(MAX_REMOTE_MESSAGE_BYTES as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.len() > MAX_REMOTE_MESSAGE_BYTES {
        return Err(RemoteError::MessageTooLarge {
            limit: MAX_REMOTE_MESSAGE_BYTES,
        });
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|e| RemoteError::Malformed(e.to_string()))
}

/// Serve one execution over the given streams using workers from `registry`.
///
/// This is the child side of [`RemoteWorker`]. Remote registrations are not
/// served, to keep a child from spawning itself.
pub async fn serve<R, W>(registry: &WorkerRegistry, input: R, mut output: W) -> Result<(), RemoteError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(input);
    let line = read_line(&mut reader).await?.ok_or(RemoteError::Disconnected)?;
    let request: RemoteRequest =
        serde_json::from_str(&line).map_err(|e| RemoteError::Malformed(e.to_string()))?;

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let ctx = WorkContext::new(request.job_id, request.job_type.clone(), request.input)
        .with_run_attempt_count(request.run_attempt_count)
        .with_progress(ProgressSink::from_fn(move |data| {
            let _ = progress_tx.send(data);
        }));

    // The progress channel closes once `ctx` is gone, which ends `forward`.
    let work = async {
        match registry.resolve(&request.job_type) {
            Some(WorkerKind::Remote(_)) => {
                drop(ctx);
                WorkResult::Failure(format!("{} is not served locally", request.job_type))
            }
            Some(kind) => match runner::execute(kind, ctx, Duration::ZERO).await {
                ExecutionOutcome::Completed(result) => result,
                ExecutionOutcome::Panicked(message) => WorkResult::Failure(message),
                ExecutionOutcome::Stopped => WorkResult::Failure("stopped".to_string()),
                ExecutionOutcome::Lost(message) => WorkResult::Failure(message),
            },
            None => {
                drop(ctx);
                WorkResult::Failure(format!("unknown job type: {}", request.job_type))
            }
        }
    };

    let forward = async {
        while let Some(data) = progress_rx.recv().await {
            write_line(&mut output, &RemoteReply::Progress { data }).await?;
        }
        Ok::<_, RemoteError>(())
    };

    let (result, forwarded) = tokio::join!(work, forward);
    forwarded?;
    write_line(&mut output, &RemoteReply::Result { result }).await
}

/// Serve one execution over this process's stdin and stdout.
pub async fn serve_stdio(registry: &WorkerRegistry) -> Result<(), RemoteError> {
    serve(registry, tokio::io::stdin(), tokio::io::stdout()).await
}
