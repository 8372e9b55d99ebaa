//! Private remote-desktop sessions.
//!
//! One call to [`run_private_session`] drives one client connection through:
//!
//! ```text
//! AwaitIdentity → PreSessionOperations → ProvisionAccess → AllocateEndpoint
//!   → EstablishTunnel → AwaitCommand ⇄ RunInteractiveProcess → Cleanup → Closed
//! ```
//!
//! Any failure, a client `end`, the interactive process exiting, the
//! connection dropping, or the session deadline jumps straight to
//! [`cleanup::Cleanup::finish`], which runs exactly once. The firewall rule
//! has its own shorter deadline and is removed early when it expires.
//!
//! | Module | Role |
//! |---|---|
//! | [`firewall`] | create / classify / delete the temporary rule |
//! | [`tunnel`] | start the tunnel and race its output for readiness |
//! | [`commands`] | client command loop and the interactive process |
//! | [`pre_session`] | conditional operations before provisioning |
//! | [`cleanup`] | idempotent teardown |

pub mod cleanup;
pub mod commands;
pub mod firewall;
pub mod pre_session;
pub mod tunnel;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::instance::TargetInstance;
use crate::operations::{template, OperationsConfig};
use crate::shell::{reserve_local_port, CommandExecutor};
use crate::transport::{recv_json, ServerMessage, Transport, TransportError};

use cleanup::Cleanup;
use firewall::FirewallOutcome;

/// Deadlines plus the command templates and output markers sessions use.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub session_timeout: Duration,
    pub firewall_timeout: Duration,
    pub tunnel_ready_timeout: Duration,
    pub config: SessionConfig,
}

impl SessionSettings {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            session_timeout: Duration::from_secs(config.session_timeout_secs),
            firewall_timeout: Duration::from_secs(config.firewall_timeout_secs),
            tunnel_ready_timeout: Duration::from_secs(config.tunnel_ready_timeout_secs),
            config: config.clone(),
        }
    }
}

/// Everything a session needs besides its connection.
#[derive(Clone)]
pub struct SessionContext {
    pub executor: Arc<dyn CommandExecutor>,
    /// Catalogue snapshot taken when the session started, for pre-session operations.
    pub operations: Option<Arc<OperationsConfig>>,
    pub settings: Arc<SessionSettings>,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    ClientEnded,
    InteractiveExited,
    Deadline,
    Transport(TransportError),
    Aborted(String),
}

/// Values available to session command templates, shell-quoted.
pub(crate) fn command_vars(
    instance: &TargetInstance,
    extra: &[(&str, &str)],
) -> Result<BTreeMap<String, String>, String> {
    let base = [
        ("NAME", instance.name.as_str()),
        ("ZONE", instance.zone.as_str()),
        ("PROJECT", instance.project.as_str()),
        ("NETWORK", instance.firewall_network.as_str()),
    ];
    base.iter()
        .chain(extra)
        .map(|(key, value)| {
            let quoted = if value.is_empty() {
                String::new()
            } else {
                shlex::try_quote(value)
                    .map_err(|e| format!("{key} cannot be used in a command: {e}"))?
                    .into_owned()
            };
            Ok(((*key).to_string(), quoted))
        })
        .collect()
}

/// Render a session command template for `instance`.
pub(crate) fn render_command(
    template_str: &str,
    instance: &TargetInstance,
    extra: &[(&str, &str)],
) -> Result<String, String> {
    let vars = command_vars(instance, extra)?;
    template::render(template_str, &vars)
        .map_err(|missing| format!("Command template has no value for: {}", missing.join(", ")))
}

/// Drive one private session to completion over `transport`.
pub async fn run_private_session(ctx: SessionContext, transport: Arc<dyn Transport>) {
    let mut cleanup = Cleanup::new(
        Arc::clone(&ctx.executor),
        Arc::clone(&transport),
        ctx.settings.config.firewall_delete_command.clone(),
    );

    let reason = match tokio::time::timeout(
        ctx.settings.session_timeout,
        drive(&ctx, &transport, &mut cleanup),
    )
    .await
    {
        Ok(reason) => reason,
        Err(_) => EndReason::Deadline,
    };

    match &reason {
        EndReason::Aborted(why) => warn!(reason = %why, "Session aborted"),
        other => info!(reason = ?other, "Session ending"),
    }
    cleanup.finish().await;
}

async fn drive(
    ctx: &SessionContext,
    transport: &Arc<dyn Transport>,
    cleanup: &mut Cleanup,
) -> EndReason {
    // AwaitIdentity
    let instance: TargetInstance = match recv_json(transport.as_ref()).await {
        Ok(instance) => instance,
        Err(TransportError::Malformed(e)) => {
            let _ = transport
                .send(ServerMessage::error(format!("Invalid instance: {e}")))
                .await;
            return EndReason::Aborted(format!("invalid instance: {e}"));
        }
        Err(e) => return EndReason::Transport(e),
    };
    let missing = instance.missing_identity();
    if !missing.is_empty() {
        let why = format!("Instance is missing: {}", missing.join(", "));
        let _ = transport.send(ServerMessage::error(why.clone())).await;
        return EndReason::Aborted(why);
    }
    cleanup.set_instance(instance.clone());
    tracing::Span::current().record("instance", instance.name.as_str());

    if let Err(e) = transport
        .send(ServerMessage::message(format!(
            "Server received instance {}",
            instance.name
        )))
        .await
    {
        return EndReason::Transport(e);
    }

    // PreSessionOperations
    if let Some(operations) = &ctx.operations {
        if let Err(e) = pre_session::run_pre_session_operations(
            ctx.executor.as_ref(),
            &operations.pre_session_operations,
            &instance,
            transport.as_ref(),
        )
        .await
        {
            return EndReason::Transport(e);
        }
    }

    // ProvisionAccess
    let config = &ctx.settings.config;
    let outcome = match render_command(&config.firewall_create_command, &instance, &[]) {
        Ok(command) => firewall::provision(ctx.executor.as_ref(), &command, config).await,
        Err(e) => FirewallOutcome::Failed(e),
    };
    if outcome.is_success() {
        cleanup.firewall_created();
    }
    if let Err(e) = transport.send(outcome.report(&instance.name)).await {
        return EndReason::Transport(e);
    }
    if !outcome.is_success() {
        return EndReason::Aborted(format!("firewall: {outcome:?}"));
    }

    // AllocateEndpoint
    let port = match reserve_local_port().await {
        Ok(port) => port,
        Err(e) => {
            let why = format!("Could not reserve a local port: {e}");
            let _ = transport.send(ServerMessage::error(why.clone())).await;
            return EndReason::Aborted(why);
        }
    };

    // EstablishTunnel
    let port_str = port.to_string();
    if let Err(e) = tunnel::establish(ctx, &instance, &port_str, cleanup).await {
        let _ = transport
            .send(ServerMessage::error(format!(
                "Could not start tunnel for {}: {e}",
                instance.name
            )))
            .await;
        return EndReason::Aborted(format!("tunnel: {e}"));
    }
    info!(port, "Tunnel established");
    let ready = [
        format!("Started tunnel for {} on port: {port}", instance.name),
        "Ready for command".to_string(),
    ];
    for text in ready {
        if let Err(e) = transport.send(ServerMessage::message(text)).await {
            return EndReason::Transport(e);
        }
    }

    // AwaitCommand
    commands::await_end(ctx, transport, &instance, &port_str, cleanup).await
}
