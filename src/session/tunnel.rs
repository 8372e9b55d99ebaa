//! Starting the tunnel and deciding whether it came up.
//!
//! Both output streams are scanned line by line in their own task. The first
//! line containing the ready marker or the error marker decides the outcome.
//! If both streams close without either, or the ready timeout passes first,
//! the tunnel is treated as failed. Scanners keep draining after the decision
//! so the long-lived process never blocks on a full pipe.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

use super::cleanup::Cleanup;
use super::{render_command, SessionContext};
use crate::instance::TargetInstance;
use crate::shell::OutputStream;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    #[error("{0}")]
    Command(String),
    /// The error marker appeared; holds the offending line.
    #[error("{0}")]
    Reported(String),
    #[error("tunnel process exited before it was ready")]
    Closed,
    #[error("tunnel not ready after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug)]
enum Signal {
    Ready,
    Failed(String),
}

/// Start the tunnel on `port` and wait until it is ready.
///
/// The process's cancellation token is handed to `cleanup` as soon as it
/// exists, so it is stopped on every exit path.
pub async fn establish(
    ctx: &SessionContext,
    instance: &TargetInstance,
    port: &str,
    cleanup: &mut Cleanup,
) -> Result<(), TunnelError> {
    let config = &ctx.settings.config;
    let command = render_command(&config.tunnel_command, instance, &[("PORT", port)])
        .map_err(TunnelError::Command)?;
    let process = ctx
        .executor
        .run_streaming(&command)
        .await
        .map_err(|e| TunnelError::Command(e.to_string()))?;
    cleanup.set_tunnel(process.cancel.clone());

    await_ready(
        process.stdout,
        process.stderr,
        &config.tunnel_ready_marker,
        &config.tunnel_error_marker,
        ctx.settings.tunnel_ready_timeout,
    )
    .await
}

/// Race both streams for the ready or error marker.
pub async fn await_ready(
    stdout: OutputStream,
    stderr: OutputStream,
    ready_marker: &str,
    error_marker: &str,
    timeout: Duration,
) -> Result<(), TunnelError> {
    let (tx, mut rx) = mpsc::channel(1);
    for (label, stream) in [("stdout", stdout), ("stderr", stderr)] {
        tokio::spawn(scan(
            label,
            stream,
            ready_marker.to_string(),
            error_marker.to_string(),
            tx.clone(),
        ));
    }
    drop(tx);

    match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(Some(Signal::Ready)) => Ok(()),
        Ok(Some(Signal::Failed(line))) => Err(TunnelError::Reported(line)),
        Ok(None) => Err(TunnelError::Closed),
        Err(_) => Err(TunnelError::Timeout(timeout)),
    }
}

async fn scan(
    label: &'static str,
    stream: OutputStream,
    ready_marker: String,
    error_marker: String,
    tx: mpsc::Sender<Signal>,
) {
    let mut sender = Some(tx);
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(stream = label, "tunnel: {line}");
        if sender.is_none() {
            continue;
        }
        let signal = if line.contains(&ready_marker) {
            Signal::Ready
        } else if !error_marker.is_empty() && line.contains(&error_marker) {
            Signal::Failed(line)
        } else {
            continue;
        };
        if let Some(tx) = sender.take() {
            let _ = tx.send(signal).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(data: &'static str) -> OutputStream {
        Box::new(data.as_bytes())
    }

    async fn race(stdout: &'static str, stderr: &'static str) -> Result<(), TunnelError> {
        await_ready(
            stream(stdout),
            stream(stderr),
            "Listening on port",
            "ERROR:",
            Duration::from_secs(2),
        )
        .await
    }

    #[tokio::test]
    async fn ready_on_either_stream() {
        assert_eq!(race("Listening on port [4000].\n", "").await, Ok(()));
        assert_eq!(race("", "noise\nListening on port [4000].\n").await, Ok(()));
    }

    #[tokio::test]
    async fn error_marker_fails_with_line() {
        assert_eq!(
            race("", "ERROR: (gcloud) instance not found\n").await,
            Err(TunnelError::Reported("ERROR: (gcloud) instance not found".into()))
        );
    }

    #[tokio::test]
    async fn first_marker_on_a_stream_wins() {
        assert!(race("ERROR: boom\nListening on port 1\n", "").await.is_err());
        assert_eq!(race("Listening on port 1\nERROR: later\n", "").await, Ok(()));
    }

    #[tokio::test]
    async fn eof_without_marker_is_failure() {
        assert_eq!(race("starting\n", "debug\n").await, Err(TunnelError::Closed));
    }

    #[tokio::test]
    async fn silence_times_out() {
        let (_writer, reader) = tokio::io::duplex(64);
        let result = await_ready(
            Box::new(reader),
            stream(""),
            "Listening on port",
            "ERROR:",
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(result, Err(TunnelError::Timeout(Duration::from_millis(50))));
    }
}
