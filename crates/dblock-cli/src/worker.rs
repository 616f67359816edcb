//! Line-oriented lock worker
//!
//! Reads one JSON command per line and answers each with one line, so that
//! another process (typically a test harness) can drive locks held by this
//! process's connection. The worker never exits on its own: end of input is
//! reported as an error, since the parent is expected to kill it.

use anyhow::{Context, anyhow, bail};
use dblock_core::prelude::*;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// One request line
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Command {
    pub operation: String,
    #[serde(alias = "lockNames")]
    pub lock_names: Vec<String>,
    #[serde(alias = "timeoutSeconds")]
    pub timeout_seconds: u64,
    #[serde(alias = "taskDurationSeconds")]
    pub task_duration_seconds: u64,
    #[serde(alias = "taskMessage")]
    pub task_message: String,
}

/// What the task of a `synchronize` operation does after sleeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Return the task message
    Return,
    /// Fail with the task message
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOperation {
    Acquire,
    TryAcquire,
    TryAcquireWithTimeout,
    Release,
    Wait,
    TryWaitWithTimeout,
    Synchronize(TaskKind),
    TrySynchronize(TaskKind),
    TrySynchronizeWithTimeout(TaskKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Ping,
    Lock(LockOperation),
}

impl FromStr for Operation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        use LockOperation::*;

        let op = match s {
            "ping" => return Ok(Self::Ping),
            "acquire" => Acquire,
            "tryAcquire" => TryAcquire,
            "tryAcquireWithTimeout" => TryAcquireWithTimeout,
            "release" => Release,
            "wait" => Wait,
            "tryWaitWithTimeout" => TryWaitWithTimeout,
            "synchronize_return" => Synchronize(TaskKind::Return),
            "synchronize_exception" => Synchronize(TaskKind::Fail),
            "trySynchronize_return" => TrySynchronize(TaskKind::Return),
            "trySynchronize_exception" => TrySynchronize(TaskKind::Fail),
            "trySynchronizeWithTimeout_return" => TrySynchronizeWithTimeout(TaskKind::Return),
            "trySynchronizeWithTimeout_exception" => TrySynchronizeWithTimeout(TaskKind::Fail),
            other => return Err(anyhow!("Unknown operation: {}", other)),
        };
        Ok(Self::Lock(op))
    }
}

/// Executes commands against locks made by one factory
pub struct Worker<W> {
    factory: LockFactory,
    out: W,
}

impl<W: AsyncWrite + Unpin> Worker<W> {
    pub fn new(factory: LockFactory, out: W) -> Self {
        Self { factory, out }
    }

    /// Answer every line of `input` until it ends
    ///
    /// Returns an error on a malformed line, an unknown operation, or the
    /// end of input.
    pub async fn run<R: AsyncBufRead + Unpin>(&mut self, input: R) -> anyhow::Result<()> {
        let mut lines = input.lines();

        while let Some(line) = lines.next_line().await.context("Failed to read command")? {
            if line.trim().is_empty() {
                continue;
            }

            let command: Command = serde_json::from_str(&line)
                .with_context(|| format!("Malformed command: {}", line))?;
            let reply = self.execute(&command).await?;
            self.write(&reply).await?;
        }

        bail!("Unexpected end of input")
    }

    /// Execute one command and return the reply line
    ///
    /// Lock errors become replies; only an unknown operation is an error.
    pub async fn execute(&self, command: &Command) -> anyhow::Result<String> {
        let op = match command.operation.parse::<Operation>()? {
            Operation::Ping => return Ok("PONG".to_string()),
            Operation::Lock(op) => op,
        };

        debug!(operation = %command.operation, lock_names = ?command.lock_names, "Executing command");

        let lock = match self.factory.create(command.lock_names.iter().cloned()) {
            Ok(lock) => lock,
            Err(e) => return Ok(e.kind().to_string()),
        };

        let timeout = command.timeout_seconds;
        let reply = match op {
            LockOperation::Acquire => lock.acquire().await.map(|()| acquire_reply(true)),
            LockOperation::TryAcquire => lock.try_acquire().await.map(acquire_reply),
            LockOperation::TryAcquireWithTimeout => {
                lock.try_acquire_with_timeout(timeout).await.map(acquire_reply)
            }
            LockOperation::Release => lock.release().await.map(|()| "RELEASED".to_string()),
            LockOperation::Wait => lock.wait().await.map(|()| wait_reply(true)),
            LockOperation::TryWaitWithTimeout => {
                lock.try_wait_with_timeout(timeout).await.map(wait_reply)
            }
            LockOperation::Synchronize(kind) => {
                Ok(match lock.synchronize(task(command, kind)).await {
                    Ok(value) => sync_reply(true, Some(&value), None),
                    Err(e) => sync_error_reply(&e),
                })
            }
            LockOperation::TrySynchronize(kind) => {
                Ok(try_sync_reply(lock.try_synchronize(task(command, kind)).await))
            }
            LockOperation::TrySynchronizeWithTimeout(kind) => Ok(try_sync_reply(
                lock.try_synchronize_with_timeout(timeout, task(command, kind))
                    .await,
            )),
        };

        Ok(reply.unwrap_or_else(|e| e.kind().to_string()))
    }

    async fn write(&mut self, reply: &str) -> anyhow::Result<()> {
        self.out.write_all(reply.as_bytes()).await?;
        self.out.write_all(b"\n").await?;
        self.out.flush().await?;
        Ok(())
    }
}

type TaskFuture = Pin<Box<dyn Future<Output = std::result::Result<String, std::io::Error>> + Send>>;

/// Sleep for the command's task duration, then return or fail with its message
fn task(command: &Command, kind: TaskKind) -> impl FnOnce() -> TaskFuture + Send + 'static {
    let duration = Duration::from_secs(command.task_duration_seconds);
    let message = command.task_message.clone();

    move || -> TaskFuture {
        Box::pin(async move {
            tokio::time::sleep(duration).await;
            match kind {
                TaskKind::Return => Ok(message),
                TaskKind::Fail => Err(std::io::Error::other(message)),
            }
        })
    }
}

fn acquire_reply(acquired: bool) -> String {
    let reply = if acquired { "ACQUIRED" } else { "NOT_ACQUIRED" };
    reply.to_string()
}

fn wait_reply(free: bool) -> String {
    let reply = if free { "WAIT_SUCCESS" } else { "WAIT_FAILURE" };
    reply.to_string()
}

fn sync_reply(lock_success: bool, value: Option<&str>, error: Option<&str>) -> String {
    let mut reply = if lock_success {
        "SYNC_LOCK_SUCCESS".to_string()
    } else {
        "SYNC_LOCK_FAILURE".to_string()
    };
    if let Some(value) = value {
        reply.push_str(";RETURN:");
        reply.push_str(value);
    }
    if let Some(error) = error {
        reply.push_str(";EXCEPTION:");
        reply.push_str(error);
    }
    reply
}

fn sync_error_reply(err: &SynchronizeError<std::io::Error>) -> String {
    // The release failure is what the caller sees when both failed.
    let message = match err {
        SynchronizeError::Lock(e) => e.to_string(),
        SynchronizeError::Task(e) => e.to_string(),
        SynchronizeError::ReleaseAfterTask { release, .. } => release.to_string(),
    };
    sync_reply(err.lock_was_acquired(), None, Some(&message))
}

fn try_sync_reply(
    result: std::result::Result<SynchronizeResult<String>, SynchronizeError<std::io::Error>>,
) -> String {
    match result {
        Ok(SynchronizeResult::Success(value)) => sync_reply(true, Some(&value), None),
        Ok(SynchronizeResult::Failure) => sync_reply(false, None, None),
        Err(e) => sync_error_reply(&e),
    }
}
