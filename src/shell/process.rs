//! Process spawning and output capture on top of `tokio::process`.
//!
//! Every child is spawned with `kill_on_drop(true)` so a cancelled task never
//! leaves an orphaned process behind.

use std::fmt::Write;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{CommandExecutor, ExecError, ExecFailure, StreamingProcess};
use crate::config::ShellConfig;

/// Executes commands as direct child processes.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    /// Bytes kept per stream for one-shot commands. The rest is drained and dropped.
    max_output_bytes: usize,
    /// Hard upper bound on any process this executor starts.
    max_lifetime: Duration,
}

impl ShellExecutor {
    pub fn new(config: &ShellConfig) -> Self {
        Self {
            max_output_bytes: config.max_output_bytes,
            max_lifetime: Duration::from_secs(config.max_process_lifetime_secs),
        }
    }

    async fn capture(&self, command: &str, deadline: Duration) -> Result<String, ExecFailure> {
        let mut child = spawn(command)?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::ProcessFailed("Failed to take stdout pipe".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecError::ProcessFailed("Failed to take stderr pipe".to_string()))?;

        // Buffers live outside the deadline so a timeout keeps what was printed.
        let mut out = CappedBuffer::new(self.max_output_bytes);
        let mut err = CappedBuffer::new(self.max_output_bytes);
        let result = tokio::time::timeout(deadline, async {
            // Read both pipes concurrently so neither can fill up and block the child.
            tokio::join!(out.fill(&mut stdout), err.fill(&mut stderr));
            child.wait().await
        })
        .await;
        let output = out.into_string() + &err.into_string();

        match result {
            Ok(Ok(status)) if status.success() => Ok(output),
            Ok(Ok(status)) => Err(ExecFailure {
                output,
                error: ExecError::NonZeroExit(status.code().unwrap_or(-1)),
            }),
            Ok(Err(e)) => Err(ExecFailure {
                output,
                error: ExecError::ProcessFailed(e.to_string()),
            }),
            Err(_) => Err(ExecFailure {
                output,
                error: ExecError::Timeout,
            }),
        }
    }
}

/// Split `command` into argv and build a `Command` with piped output.
fn build(command: &str) -> Result<Command, ExecError> {
    let argv = shlex::split(command)
        .ok_or_else(|| ExecError::InvalidCommand("unbalanced quotes".to_string()))?;
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| ExecError::InvalidCommand("empty command".to_string()))?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    Ok(cmd)
}

fn spawn(command: &str) -> Result<Child, ExecError> {
    build(command)?
        .spawn()
        .map_err(|e| ExecError::SpawnFailed(e.to_string()))
}

/// Output from one pipe, keeping the first `max_bytes` and counting the rest.
struct CappedBuffer {
    buf: Vec<u8>,
    total_read: usize,
    max_bytes: usize,
}

impl CappedBuffer {
    fn new(max_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_bytes.min(65536)),
            total_read: 0,
            max_bytes,
        }
    }

    /// Read until EOF. Keeps draining past the cap so the child never blocks
    /// on a full pipe.
    async fn fill(&mut self, reader: &mut (impl AsyncRead + Unpin)) {
        let mut tmp = [0u8; 8192];
        loop {
            match reader.read(&mut tmp).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    self.total_read += n;
                    if self.buf.len() < self.max_bytes {
                        let take = n.min(self.max_bytes - self.buf.len());
                        self.buf.extend_from_slice(&tmp[..take]);
                    }
                }
            }
        }
    }

    fn into_string(self) -> String {
        let mut s = String::from_utf8_lossy(&self.buf).into_owned();
        if self.total_read > self.max_bytes {
            let _ = write!(s, "\n[truncated: {} bytes total]", self.total_read);
        }
        s
    }
}

enum Exit {
    Cancelled,
    Expired,
    Exited,
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn run(&self, command: &str) -> Result<String, ExecFailure> {
        self.capture(command, self.max_lifetime).await
    }

    async fn run_with_deadline(
        &self,
        command: &str,
        deadline: Duration,
    ) -> Result<String, ExecFailure> {
        self.capture(command, deadline.min(self.max_lifetime)).await
    }

    async fn run_streaming(&self, command: &str) -> Result<StreamingProcess, ExecError> {
        let mut child = spawn(command)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::ProcessFailed("Failed to take stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecError::ProcessFailed("Failed to take stderr pipe".to_string()))?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let lifetime = self.max_lifetime;
        let pid = child.id();
        tokio::spawn(async move {
            let exit = tokio::select! {
                () = token.cancelled() => Exit::Cancelled,
                () = tokio::time::sleep(lifetime) => Exit::Expired,
                status = child.wait() => {
                    debug!(?pid, ?status, "Streaming process exited");
                    Exit::Exited
                }
            };
            match exit {
                Exit::Exited => {}
                Exit::Expired => {
                    warn!(?pid, "Streaming process exceeded its lifetime, killing");
                    let _ = child.kill().await;
                }
                Exit::Cancelled => {
                    debug!(?pid, "Streaming process cancelled");
                    let _ = child.kill().await;
                }
            }
        });

        Ok(StreamingProcess {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            cancel,
        })
    }
}
