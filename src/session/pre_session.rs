use tracing::{info, warn};

use crate::instance::TargetInstance;
use crate::operations::fill::fill_instance_template;
use crate::operations::PreSessionOperation;
use crate::shell::CommandExecutor;
use crate::transport::{ServerMessage, Transport, TransportError};

/// Run each pre-session operation whose dependencies `instance` satisfies.
///
/// Skips and fill failures affect only that operation. Only a broken
/// connection stops the sequence.
pub async fn run_pre_session_operations(
    executor: &dyn CommandExecutor,
    operations: &[PreSessionOperation],
    instance: &TargetInstance,
    transport: &dyn Transport,
) -> Result<(), TransportError> {
    for op in operations {
        let unmet = op
            .dependencies
            .iter()
            .find(|(key, required)| instance.param(key) != Some(required.as_str()));
        if let Some((key, _)) = unmet {
            info!(operation = %op.name, dependency = %key, "Skipping pre-session operation");
            transport
                .send(ServerMessage::message(format!(
                    "Not running {} due to dependency {key}",
                    op.name
                )))
                .await?;
            continue;
        }

        let command = match fill_instance_template(&op.operation, instance) {
            Ok(command) => command,
            Err(e) => {
                warn!(operation = %op.name, error = %e, "Could not fill pre-session operation");
                transport
                    .send(ServerMessage::error(format!(
                        "Could not fill params of pre-session operation {}: {e}",
                        op.name
                    )))
                    .await?;
                continue;
            }
        };

        info!(operation = %op.name, "Running pre-session operation");
        let frame = match executor.run(&command).await {
            Ok(output) => ServerMessage::message(format!("{}: {}", op.name, output.trim())),
            Err(failure) => {
                warn!(operation = %op.name, error = %failure, "Pre-session operation failed");
                let output = failure.output.trim();
                if output.is_empty() {
                    ServerMessage::error(format!("{} failed: {}", op.name, failure.error))
                } else {
                    ServerMessage::error(format!("{} failed: {}: {output}", op.name, failure.error))
                }
            }
        };
        transport.send(frame).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::{ExecError, ExecFailure};
    use crate::testing::{MockExecutor, MockTransport};

    fn instance() -> TargetInstance {
        serde_json::from_str(
            r#"{"name":"vm-1","zone":"z","project":"p","params":{"start_vm":"yes"}}"#,
        )
        .unwrap()
    }

    fn op(name: &str, operation: &str, deps: &[(&str, &str)]) -> PreSessionOperation {
        PreSessionOperation {
            name: name.into(),
            operation: operation.into(),
            dependencies: deps
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn fill_failure_skips_only_that_operation() {
        let executor = MockExecutor::new().on_run(|_| Ok(" ok \n".into()));
        let (transport, _client) = MockTransport::new();
        let ops = [
            op("needs-disk", "attach ${{DISK}}", &[]),
            op("start", "start ${{NAME}}", &[("START_VM", "yes")]),
        ];

        run_pre_session_operations(&executor, &ops, &instance(), transport.as_ref())
            .await
            .unwrap();

        assert_eq!(executor.commands(), vec!["start vm-1"]);
        assert_eq!(transport.messages(), vec!["start: ok"]);
        let errors = transport.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Could not fill params of pre-session operation needs-disk"));
    }

    #[tokio::test]
    async fn dependency_value_must_match() {
        let executor = MockExecutor::new();
        let (transport, _client) = MockTransport::new();
        let ops = [op("start", "start ${{NAME}}", &[("START_VM", "no")])];

        run_pre_session_operations(&executor, &ops, &instance(), transport.as_ref())
            .await
            .unwrap();

        assert!(executor.commands().is_empty());
        assert_eq!(
            transport.messages(),
            vec!["Not running start due to dependency START_VM"]
        );
    }

    #[tokio::test]
    async fn failed_run_reports_output() {
        let executor = MockExecutor::new().on_run(|_| {
            Err(ExecFailure {
                output: "no such instance\n".into(),
                error: ExecError::NonZeroExit(1),
            })
        });
        let (transport, _client) = MockTransport::new();
        let ops = [op("start", "start ${{NAME}}", &[])];

        run_pre_session_operations(&executor, &ops, &instance(), transport.as_ref())
            .await
            .unwrap();

        assert_eq!(
            transport.errors(),
            vec!["start failed: exit status 1: no such instance"]
        );
    }
}
