//! Running external commands.
//!
//! Every command the gateway runs goes through a [`CommandExecutor`]:
//!
//! - **One-shot** ([`CommandExecutor::run`], [`CommandExecutor::run_with_deadline`])
//!   runs to completion and returns combined output.
//! - **Streaming** ([`CommandExecutor::run_streaming`]) hands back live
//!   stdout/stderr readers and a cancellation token that kills the process.
//!
//! [`process::ShellExecutor`] is the real implementation. Commands are split
//! with shell-word rules and executed directly, never through `sh -c`.

pub mod port;
pub mod process;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

pub use port::reserve_local_port;
pub use process::ShellExecutor;

/// Why a command could not run to a successful exit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    /// The command string was empty or had unbalanced quotes.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    /// The binary could not be started (e.g. not found, permission denied).
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),
    /// The child started but waiting on it failed.
    #[error("Process error: {0}")]
    ProcessFailed(String),
    #[error("exit status {0}")]
    NonZeroExit(i32),
    #[error("Command timed out")]
    Timeout,
}

/// A failed one-shot command together with whatever it printed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}")]
pub struct ExecFailure {
    pub output: String,
    pub error: ExecError,
}

impl ExecFailure {
    pub fn new(error: ExecError) -> Self {
        Self {
            output: String::new(),
            error,
        }
    }
}

impl From<ExecError> for ExecFailure {
    fn from(error: ExecError) -> Self {
        Self::new(error)
    }
}

pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// A running process with live output.
///
/// Cancelling [`StreamingProcess::cancel`] kills the process; both readers
/// then reach EOF.
pub struct StreamingProcess {
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `command` and return its combined stdout and stderr.
    async fn run(&self, command: &str) -> Result<String, ExecFailure>;

    /// Like [`CommandExecutor::run`] but killed after `deadline`.
    async fn run_with_deadline(
        &self,
        command: &str,
        deadline: Duration,
    ) -> Result<String, ExecFailure>;

    /// Start `command` and return its output streams.
    async fn run_streaming(&self, command: &str) -> Result<StreamingProcess, ExecError>;
}
