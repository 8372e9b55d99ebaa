//! The AwaitCommand state: client commands, the interactive process, and the
//! firewall deadline.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::cleanup::Cleanup;
use super::{render_command, EndReason, SessionContext};
use crate::instance::TargetInstance;
use crate::shell::CommandExecutor;
use crate::transport::{recv_json, ClientCommand, CommandKind, ServerMessage, Transport, TransportError};

#[derive(Debug)]
enum SessionEvent {
    End(EndReason),
    StartInteractive { username: String, password: String },
}

/// Serve client commands until something ends the session.
///
/// The firewall deadline counts from rule creation, fires at most once and
/// removes the rule early. If it already passed while the tunnel came up, the
/// rule is removed straight away. The tunnel and any interactive process keep
/// running.
pub async fn await_end(
    ctx: &SessionContext,
    transport: &Arc<dyn Transport>,
    instance: &TargetInstance,
    port: &str,
    cleanup: &mut Cleanup,
) -> EndReason {
    let (events_tx, mut events) = mpsc::channel(1);
    cleanup.track(tokio::spawn(command_loop(
        Arc::clone(transport),
        instance.name.clone(),
        events_tx.clone(),
    )));

    let firewall_deadline = tokio::time::sleep_until(
        cleanup.firewall_created_at().unwrap_or_else(Instant::now) + ctx.settings.firewall_timeout,
    );
    tokio::pin!(firewall_deadline);
    let mut firewall_expired = false;
    let mut interactive_started = false;

    loop {
        tokio::select! {
            () = &mut firewall_deadline, if !firewall_expired => {
                firewall_expired = true;
                info!(instance = %instance.name, "Firewall deadline reached");
                cleanup.delete_firewall().await;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    return EndReason::Aborted("command loop stopped".into());
                };
                let (username, password) = match event {
                    SessionEvent::End(reason) => return reason,
                    SessionEvent::StartInteractive { username, password } => (username, password),
                };
                let rejection = if username.is_empty() || password.is_empty() {
                    Some("Username and password are required to start an interactive session".to_string())
                } else if interactive_started {
                    Some("An interactive session is already running".to_string())
                } else {
                    match render_command(
                        &ctx.settings.config.interactive_command,
                        instance,
                        &[("PORT", port), ("USERNAME", &username), ("PASSWORD", &password)],
                    ) {
                        Ok(command) => {
                            interactive_started = true;
                            cleanup.track(tokio::spawn(run_interactive(
                                Arc::clone(&ctx.executor),
                                Arc::clone(transport),
                                command,
                                username,
                                events_tx.clone(),
                            )));
                            None
                        }
                        Err(e) => Some(format!("Unable to start interactive session for {username}: {e}")),
                    }
                };
                if let Some(text) = rejection {
                    if let Err(e) = transport.send(ServerMessage::error(text)).await {
                        return EndReason::Transport(e);
                    }
                }
            }
        }
    }
}

async fn command_loop(
    transport: Arc<dyn Transport>,
    instance_name: String,
    events: mpsc::Sender<SessionEvent>,
) {
    loop {
        let command: ClientCommand = match recv_json(transport.as_ref()).await {
            Ok(command) => command,
            Err(TransportError::Malformed(e)) => {
                warn!(error = %e, "Ignoring malformed command");
                continue;
            }
            Err(e) => {
                let _ = events.send(SessionEvent::End(EndReason::Transport(e))).await;
                return;
            }
        };

        let event = match command.kind() {
            CommandKind::End if command.name == instance_name => {
                SessionEvent::End(EndReason::ClientEnded)
            }
            CommandKind::End => {
                warn!(requested = %command.name, "Ignoring end for another instance");
                continue;
            }
            CommandKind::StartInteractiveSession => SessionEvent::StartInteractive {
                username: command.username,
                password: command.password,
            },
            CommandKind::EndOperation | CommandKind::Unknown => {
                debug!(cmd = %command.cmd, "Ignoring command");
                continue;
            }
        };
        let ends = matches!(event, SessionEvent::End(_));
        if events.send(event).await.is_err() || ends {
            return;
        }
    }
}

/// Run the desktop client to completion. Its exit ends the session.
async fn run_interactive(
    executor: Arc<dyn CommandExecutor>,
    transport: Arc<dyn Transport>,
    command: String,
    username: String,
    events: mpsc::Sender<SessionEvent>,
) {
    info!(user = %username, "Starting interactive session");
    let frame = match executor.run(&command).await {
        Ok(_) => ServerMessage::message(format!("Quit interactive session for {username}")),
        Err(e) => {
            warn!(user = %username, error = %e, "Interactive session failed");
            ServerMessage::error(format!(
                "Unable to start interactive session for {username}: {e}"
            ))
        }
    };
    let _ = transport.send(frame).await;
    let _ = events
        .send(SessionEvent::End(EndReason::InteractiveExited))
        .await;
}
