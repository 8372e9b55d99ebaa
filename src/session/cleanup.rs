//! Session teardown.
//!
//! Resources are registered here as they are acquired. [`Cleanup::finish`]
//! consumes the value, so teardown cannot run twice, and the firewall rule
//! is deleted at most once even if its own deadline already removed it.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{firewall, render_command};
use crate::instance::TargetInstance;
use crate::shell::CommandExecutor;
use crate::transport::{ServerMessage, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FirewallState {
    Absent,
    Created,
    Removed,
}

pub struct Cleanup {
    executor: Arc<dyn CommandExecutor>,
    transport: Arc<dyn Transport>,
    delete_template: String,
    instance: Option<TargetInstance>,
    firewall: FirewallState,
    firewall_created_at: Option<Instant>,
    tunnel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

impl Cleanup {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        transport: Arc<dyn Transport>,
        delete_template: String,
    ) -> Self {
        Self {
            executor,
            transport,
            delete_template,
            instance: None,
            firewall: FirewallState::Absent,
            firewall_created_at: None,
            tunnel: None,
            tasks: Vec::new(),
        }
    }

    pub fn set_instance(&mut self, instance: TargetInstance) {
        self.instance = Some(instance);
    }

    /// The rule exists and must be removed.
    pub fn firewall_created(&mut self) {
        self.firewall = FirewallState::Created;
        self.firewall_created_at = Some(Instant::now());
    }

    /// When the rule was created, if it was.
    pub fn firewall_created_at(&self) -> Option<Instant> {
        self.firewall_created_at
    }

    pub fn set_tunnel(&mut self, cancel: CancellationToken) {
        self.tunnel = Some(cancel);
    }

    /// Abort `task` during teardown if it is still running.
    pub fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Delete the firewall rule if it was created and not yet removed.
    ///
    /// The rule only counts as removed once the delete command has returned,
    /// so a deletion dropped midway is retried by [`Cleanup::finish`].
    pub async fn delete_firewall(&mut self) {
        if self.firewall != FirewallState::Created {
            return;
        }
        let Some(instance) = &self.instance else {
            return;
        };

        let frame = match render_command(&self.delete_template, instance, &[]) {
            Ok(command) => match firewall::delete(self.executor.as_ref(), &command).await {
                Ok(()) => {
                    info!(instance = %instance.name, "Firewall rule deleted");
                    ServerMessage::message(format!("Deleted firewall for {}", instance.name))
                }
                Err(e) => {
                    error!(instance = %instance.name, error = %e, output = %e.output, "Firewall delete failed");
                    ServerMessage::error(format!(
                        "Could not delete firewall for {}, manual cleanup required: {e}",
                        instance.name
                    ))
                }
            },
            Err(e) => {
                error!(instance = %instance.name, error = %e, "Firewall delete command invalid");
                ServerMessage::error(format!(
                    "Could not delete firewall for {}, manual cleanup required: {e}",
                    instance.name
                ))
            }
        };
        self.firewall = FirewallState::Removed;
        let _ = self.transport.send(frame).await;
    }

    /// Tear everything down and close the connection.
    pub async fn finish(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.delete_firewall().await;
        if let Some(tunnel) = self.tunnel.take() {
            tunnel.cancel();
        }

        let name = self
            .instance
            .as_ref()
            .map_or("unidentified instance", |i| i.name.as_str());
        info!(instance = %name, "Private session shut down");
        let _ = self
            .transport
            .send(ServerMessage::message(format!(
                "Shutdown private session for {name}"
            )))
            .await;
        self.transport.close().await;
    }
}
