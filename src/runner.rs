//! Generic operation run path.
//!
//! A client registers a filled operation over HTTP, then opens a fresh
//! connection and sends `{"hash": ...}`. The first claimant runs it; the
//! hash is released again however the run ends.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::operations::FilledOperation;
use crate::registry::OperationRegistry;
use crate::shell::{CommandExecutor, OutputStream};
use crate::transport::{recv_json, ClaimRequest, ClientCommand, CommandKind, ServerMessage, Transport, TransportError};

/// Claim, run, and release one operation over `transport`.
pub async fn run_claimed_operation(
    registry: &OperationRegistry,
    executor: Arc<dyn CommandExecutor>,
    transport: Arc<dyn Transport>,
    run_timeout: Duration,
) {
    let request: ClaimRequest = match recv_json(transport.as_ref()).await {
        Ok(request) => request,
        Err(e) => {
            if let TransportError::Malformed(reason) = &e {
                let _ = transport
                    .send(ServerMessage::error(format!("Invalid operation request: {reason}")))
                    .await;
            }
            debug!(error = %e, "No claim received");
            transport.close().await;
            return;
        }
    };

    let operation = match registry.claim(&request.hash).await {
        Ok(operation) => operation,
        Err(e) => {
            warn!(hash = %request.hash, error = %e, "Claim rejected");
            let _ = transport.send(ServerMessage::error(e.to_string())).await;
            transport.close().await;
            return;
        }
    };
    tracing::Span::current().record("hash", operation.hash.as_str());
    info!(realtime = operation.realtime_output, "Operation claimed");

    let _ = transport
        .send(ServerMessage::message(format!(
            "Server received operation {}",
            operation.operation
        )))
        .await;

    let ended = CancellationToken::new();
    let listener = tokio::spawn(listen_for_end(
        Arc::clone(&transport),
        operation.hash.clone(),
        ended.clone(),
    ));

    tokio::select! {
        () = execute(executor.as_ref(), transport.as_ref(), &operation, run_timeout) => {}
        () = ended.cancelled() => info!("Operation ended by client"),
        () = tokio::time::sleep(run_timeout) => {
            warn!(timeout_secs = run_timeout.as_secs(), "Operation timed out");
            let _ = transport
                .send(ServerMessage::error(format!(
                    "Operation timed out after {}s",
                    run_timeout.as_secs()
                )))
                .await;
        }
    }

    listener.abort();
    registry.release(&operation.hash).await;
    let _ = transport.send(ServerMessage::message("Ended operation")).await;
    transport.close().await;
}

/// Resolve `ended` when the client asks to stop this operation or goes away.
async fn listen_for_end(transport: Arc<dyn Transport>, hash: String, ended: CancellationToken) {
    loop {
        match recv_json::<ClientCommand>(transport.as_ref()).await {
            Ok(command) if command.kind() == CommandKind::EndOperation && command.hash == hash => {
                break;
            }
            Ok(command) => debug!(cmd = %command.cmd, "Ignoring command during operation"),
            Err(TransportError::Malformed(e)) => debug!(error = %e, "Ignoring malformed frame"),
            Err(_) => break,
        }
    }
    ended.cancel();
}

async fn execute(
    executor: &dyn CommandExecutor,
    transport: &dyn Transport,
    operation: &FilledOperation,
    run_timeout: Duration,
) {
    if operation.realtime_output {
        let process = match executor.run_streaming(&operation.operation).await {
            Ok(process) => process,
            Err(e) => {
                let _ = transport
                    .send(ServerMessage::error(format!("Operation failed: {e}")))
                    .await;
                return;
            }
        };
        // Dropping this future (client end, deadline) must stop the process too.
        let _kill = process.cancel.clone().drop_guard();
        tokio::join!(
            relay_lines(process.stdout, transport, ServerMessage::stdout),
            relay_lines(process.stderr, transport, ServerMessage::stderr),
        );
        return;
    }

    let frame = match executor
        .run_with_deadline(&operation.operation, run_timeout)
        .await
    {
        Ok(output) => ServerMessage::message(output.trim_end()),
        Err(failure) => {
            let output = failure.output.trim_end();
            if output.is_empty() {
                ServerMessage::error(format!("Operation failed: {}", failure.error))
            } else {
                ServerMessage::error(format!("Operation failed: {}: {output}", failure.error))
            }
        }
    };
    let _ = transport.send(frame).await;
}

async fn relay_lines(
    stream: OutputStream,
    transport: &dyn Transport,
    frame: impl Fn(String) -> ServerMessage,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if transport.send(frame(line)).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockExecutor, MockTransport, StreamScript};

    async fn run(
        registry: &OperationRegistry,
        executor: &Arc<MockExecutor>,
        transport: &Arc<MockTransport>,
        timeout: Duration,
    ) {
        tokio::time::timeout(
            Duration::from_secs(5),
            run_claimed_operation(
                registry,
                Arc::clone(executor) as Arc<dyn CommandExecutor>,
                Arc::clone(transport) as Arc<dyn Transport>,
                timeout,
            ),
        )
        .await
        .expect("run did not finish");
    }

    fn claim(hash: &str) -> String {
        format!(r#"{{"hash":"{hash}"}}"#)
    }

    #[tokio::test]
    async fn batch_run_reports_output_and_releases() {
        let registry = OperationRegistry::new();
        let op = FilledOperation::new("echo hi".into(), false);
        registry.register(op.clone()).await;
        let executor = Arc::new(MockExecutor::new().on_run(|_| Ok("hi\n".into())));
        let (transport, client) = MockTransport::new();
        client.send(claim(&op.hash)).unwrap();

        run(&registry, &executor, &transport, Duration::from_secs(5)).await;

        assert_eq!(
            transport.messages(),
            vec!["Server received operation echo hi", "hi", "Ended operation"]
        );
        assert_eq!(executor.commands(), vec!["echo hi"]);
        assert!(registry.is_empty().await);
        assert_eq!(transport.close_count(), 1);
    }

    #[tokio::test]
    async fn unknown_hash_is_rejected() {
        let registry = OperationRegistry::new();
        let executor = Arc::new(MockExecutor::new());
        let (transport, client) = MockTransport::new();
        client.send(claim("deadbeef")).unwrap();

        run(&registry, &executor, &transport, Duration::from_secs(5)).await;

        assert_eq!(transport.errors(), vec!["operation not found"]);
        assert!(executor.commands().is_empty());
        assert_eq!(transport.close_count(), 1);
    }

    #[tokio::test]
    async fn running_hash_is_rejected_and_kept() {
        let registry = OperationRegistry::new();
        let op = FilledOperation::new("echo hi".into(), false);
        registry.register(op.clone()).await;
        registry.claim(&op.hash).await.unwrap();
        let executor = Arc::new(MockExecutor::new());
        let (transport, client) = MockTransport::new();
        client.send(claim(&op.hash)).unwrap();

        run(&registry, &executor, &transport, Duration::from_secs(5)).await;

        assert_eq!(transport.errors(), vec!["operation already running"]);
        assert_eq!(registry.len().await, 1);
        assert!(executor.commands().is_empty());
    }

    #[tokio::test]
    async fn realtime_output_is_relayed_by_stream() {
        let registry = OperationRegistry::new();
        let op = FilledOperation::new("tail log".into(), true);
        registry.register(op.clone()).await;
        let executor = Arc::new(
            MockExecutor::new().on_stream(|_| Ok(StreamScript::closed("a\nb\n", "warn\n"))),
        );
        let (transport, client) = MockTransport::new();
        client.send(claim(&op.hash)).unwrap();

        run(&registry, &executor, &transport, Duration::from_secs(5)).await;

        let sent = transport.sent();
        let stdout: Vec<_> = sent.iter().filter_map(|m| m.stdout.clone()).collect();
        let stderr: Vec<_> = sent.iter().filter_map(|m| m.stderr.clone()).collect();
        assert_eq!(stdout, vec!["a", "b"]);
        assert_eq!(stderr, vec!["warn"]);
        assert_eq!(transport.messages().last().map(String::as_str), Some("Ended operation"));
        assert!(executor.tokens().iter().all(CancellationToken::is_cancelled));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn end_operation_stops_the_process() {
        let registry = OperationRegistry::new();
        let op = FilledOperation::new("tail -f log".into(), true);
        registry.register(op.clone()).await;
        let executor = Arc::new(MockExecutor::new().on_stream(|_| Ok(StreamScript::open("started\n"))));
        let (transport, client) = MockTransport::new();
        client.send(claim(&op.hash)).unwrap();
        client
            .send(r#"{"cmd":"end_operation","hash":"other"}"#.to_string())
            .unwrap();
        client
            .send(format!(r#"{{"cmd":"end_operation","hash":"{}"}}"#, op.hash))
            .unwrap();

        run(&registry, &executor, &transport, Duration::from_secs(5)).await;

        assert_eq!(transport.messages().last().map(String::as_str), Some("Ended operation"));
        assert_eq!(executor.tokens().len(), 1);
        assert!(executor.tokens()[0].is_cancelled());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn deadline_ends_the_run() {
        let registry = OperationRegistry::new();
        let op = FilledOperation::new("sleep 60".into(), false);
        registry.register(op.clone()).await;
        let executor = Arc::new(MockExecutor::new().with_run_delay(Duration::from_secs(2)));
        let (transport, client) = MockTransport::new();
        client.send(claim(&op.hash)).unwrap();

        run(&registry, &executor, &transport, Duration::from_millis(50)).await;

        let errors = transport.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("timed out"));
        assert!(registry.is_empty().await);
        drop(client);
    }
}
