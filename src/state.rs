//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::operations::OperationsHandle;
use crate::registry::OperationRegistry;
use crate::session::SessionSettings;
use crate::shell::{CommandExecutor, ShellExecutor};

#[derive(Clone)]
pub struct AppState {
    /// Immutable server configuration loaded at startup.
    pub config: Arc<Config>,
    /// Operation catalogue; swapped on reload.
    pub operations: OperationsHandle,
    /// Filled operations waiting to be claimed over a socket.
    pub registry: OperationRegistry,
    pub executor: Arc<dyn CommandExecutor>,
    pub session_settings: Arc<SessionSettings>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
}

impl AppState {
    /// State backed by the real process executor.
    pub fn new(config: Config, operations: OperationsHandle) -> Self {
        let executor = Arc::new(ShellExecutor::new(&config.shell));
        Self::with_executor(config, operations, executor)
    }

    pub fn with_executor(
        config: Config,
        operations: OperationsHandle,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            registry: OperationRegistry::with_ttl(config.operations.registration_ttl()),
            session_settings: Arc::new(SessionSettings::from_config(&config.session)),
            config: Arc::new(config),
            operations,
            executor,
            start_time: Instant::now(),
        }
    }
}
