//! Temporary firewall rule letting the tunnel reach the instance's desktop port.

use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::shell::{CommandExecutor, ExecFailure};
use crate::transport::ServerMessage;

/// Result of trying to create the rule. Exactly one is reported to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallOutcome {
    Created,
    /// A rule with the same name is already in place; the session proceeds.
    AlreadyExists,
    AuthFailed,
    ProjectInvalid,
    Failed(String),
}

impl FirewallOutcome {
    /// Classify a create command's result by its output.
    ///
    /// Markers are matched case-insensitively, in the order auth, project,
    /// already-exists.
    pub fn classify(result: &Result<String, ExecFailure>, config: &SessionConfig) -> Self {
        let failure = match result {
            Ok(_) => return Self::Created,
            Err(failure) => failure,
        };
        let output = failure.output.to_lowercase();
        let contains = |marker: &str| !marker.is_empty() && output.contains(&marker.to_lowercase());
        if contains(&config.auth_error_marker) {
            Self::AuthFailed
        } else if contains(&config.project_error_marker) {
            Self::ProjectInvalid
        } else if contains(&config.already_exists_marker) {
            Self::AlreadyExists
        } else {
            Self::Failed(failure.error.to_string())
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Created | Self::AlreadyExists)
    }

    /// The one frame sent to the client for this outcome.
    pub fn report(&self, name: &str) -> ServerMessage {
        let reason = match self {
            Self::Created => return ServerMessage::message(format!("Created firewall for {name}")),
            Self::AlreadyExists => {
                return ServerMessage::message(format!("Firewall rule already exists for {name}"))
            }
            Self::AuthFailed => "cloud SDK authorization is invalid",
            Self::ProjectInvalid => "cloud SDK project is invalid",
            Self::Failed(e) => e.as_str(),
        };
        ServerMessage::error(format!("Didn't create firewall for {name}: {reason}"))
    }
}

/// Run the create command and classify what happened.
pub async fn provision(
    executor: &dyn CommandExecutor,
    command: &str,
    config: &SessionConfig,
) -> FirewallOutcome {
    let result = executor.run(command).await;
    if let Err(failure) = &result {
        debug!(output = %failure.output, "Firewall create failed");
    }
    let outcome = FirewallOutcome::classify(&result, config);
    if !outcome.is_success() {
        warn!(?outcome, "Firewall provisioning failed");
    }
    outcome
}

/// Run the delete command.
pub async fn delete(executor: &dyn CommandExecutor, command: &str) -> Result<(), ExecFailure> {
    executor.run(command).await.map(|_| ())
}
