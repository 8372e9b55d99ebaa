#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # adminops
//!
//! Control-plane gateway for a browser extension. It fills and runs
//! templated admin commands and brokers private remote-desktop sessions to
//! cloud VMs that have no public address.
//!
//! ## Subcommands
//!
//! - `adminops serve` (default): run the HTTP/WS server
//! - `adminops check`: validate an operations file and list every problem
//!
//! ## API surface
//!
//! | Method | Path                               | Auth  | Description                         |
//! |--------|------------------------------------|-------|-------------------------------------|
//! | GET    | `/health`                          | No    | Liveness probe                      |
//! | GET    | `/admin/get-config`                | Yes   | Reload and return operations config |
//! | POST   | `/admin/get-project`               | Yes   | Discover or validate the project    |
//! | POST   | `/admin/operation-to-run`          | Yes   | Fill and register an operation      |
//! | POST   | `/admin/instance-operation-to-run` | Yes   | Fill and register instance operation|
//! | GET    | `/admin/run-operation`             | Yes*  | WebSocket: claim and run by hash    |
//! | GET    | `/session/start`                   | Yes*  | WebSocket: private session          |
//!
//! *WebSocket auth is via `?token=<key>` query param.

use std::path::Path;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use adminops::operations::{OperationsConfig, OperationsHandle};
use adminops::{routes, AppState, Config};

/// Gateway for templated admin operations and private remote-desktop sessions.
#[derive(Parser)]
#[command(name = "adminops", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Validate an operations file.
    Check {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Operations file to check instead of the configured one.
        #[arg(long)]
        operations: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Check { config, operations }) => {
            check(config.as_deref(), operations.as_deref())
        }
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("adminops: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

fn check(config_path: Option<&str>, operations_path: Option<&str>) -> Result<(), String> {
    let config = Config::load(config_path)?;
    let path = operations_path.unwrap_or(&config.operations.path);

    match OperationsConfig::load(Path::new(path)) {
        Ok(operations) => {
            println!(
                "{path}: OK ({} operations, {} instance operations, {} pre-session operations, {} workflows)",
                operations.operations.len(),
                operations.instance_operations.len(),
                operations.pre_session_operations.len(),
                operations.workflows.len(),
            );
            Ok(())
        }
        Err(e) => {
            let violations = e.violations();
            for violation in &violations {
                println!("{path}: {violation}");
            }
            Err(format!("{path}: {} problem(s) found", violations.len()))
        }
    }
}

async fn run_server(config_path: Option<&str>) -> Result<(), String> {
    let config = Config::load(config_path)?;
    init_tracing(&config);

    info!("adminops v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key, set ADMINOPS_API_KEY or update config");
    }

    // A broken catalogue is not fatal: sessions still work and
    // `/admin/get-config` retries the load.
    let operations_path = Path::new(&config.operations.path);
    let operations = match OperationsConfig::load(operations_path) {
        Ok(operations) => {
            info!(
                path = %operations_path.display(),
                operations = operations.operations.len(),
                instance_operations = operations.instance_operations.len(),
                "Operations config loaded"
            );
            OperationsHandle::new(Some(operations))
        }
        Err(e) => {
            error!(path = %operations_path.display(), error = %e, "Operations config not loaded");
            OperationsHandle::new(None)
        }
    };

    let state = AppState::new(config, operations);
    let app = routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .map_err(|e| format!("Failed to bind {}: {e}", state.config.server.listen))?;

    info!("Server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("Server error: {e}"))?;

    info!("Goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
