//! Server configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `ADMINOPS_API_KEY`, `ADMINOPS_LISTEN`,
//!    `ADMINOPS_OPERATIONS`
//! 2. **Config file**: path via `--config <path>`, or `adminops.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! This file only covers the gateway process itself. The operation catalogue
//! lives in a separate YAML file (see [`crate::operations`]) that can be
//! reloaded without a restart.
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:23966"
//! allowed_origins = ["chrome-extension://abcdefghijklmnop"]
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [operations]
//! path = "operations.yml"
//! run_timeout_secs = 300
//! project_timeout_secs = 20
//! registration_ttl_secs = 3600
//!
//! [session]
//! session_timeout_secs = 3600
//! firewall_timeout_secs = 300
//! tunnel_ready_timeout_secs = 60
//! tunnel_command = "gcloud compute start-iap-tunnel ${{NAME}} 3389 ..."
//!
//! [shell]
//! max_process_lifetime_secs = 3600
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub operations: OperationsFileConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:23966`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Origins allowed to call the API and open sockets. Empty allows any.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `ADMINOPS_API_KEY` env var.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Where the operation catalogue lives and how long its commands may run.
#[derive(Debug, Clone, Deserialize)]
pub struct OperationsFileConfig {
    /// Path to the operations YAML file. Override with `ADMINOPS_OPERATIONS`.
    #[serde(default = "default_operations_path")]
    pub path: String,
    /// Hard deadline for a claimed operation run (default 300 s).
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
    /// Deadline for project discovery and validation commands (default 20 s).
    #[serde(default = "default_project_timeout")]
    pub project_timeout_secs: u64,
    /// Registered operations nobody claims are dropped after this long (default 3600 s).
    #[serde(default = "default_registration_ttl")]
    pub registration_ttl_secs: u64,
}

/// Private session behaviour: deadlines, command templates and output markers.
///
/// Command templates use `${{NAME}}` placeholders. Available variables are
/// `NAME`, `ZONE`, `PROJECT`, `NETWORK`, `PORT`, `USERNAME` and `PASSWORD`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Whole-session deadline (default 3600 s).
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    /// Lifetime of the temporary firewall rule (default 300 s).
    #[serde(default = "default_firewall_timeout")]
    pub firewall_timeout_secs: u64,
    /// How long to wait for the tunnel to report readiness (default 60 s).
    #[serde(default = "default_tunnel_ready_timeout")]
    pub tunnel_ready_timeout_secs: u64,
    /// An empty `NETWORK` drops the `--network=` flag entirely.
    #[serde(default = "default_firewall_create_command")]
    pub firewall_create_command: String,
    #[serde(default = "default_firewall_delete_command")]
    pub firewall_delete_command: String,
    #[serde(default = "default_tunnel_command")]
    pub tunnel_command: String,
    #[serde(default = "default_interactive_command")]
    pub interactive_command: String,
    /// Substring on either tunnel stream that means the tunnel is up.
    #[serde(default = "default_tunnel_ready_marker")]
    pub tunnel_ready_marker: String,
    /// Substring on either tunnel stream that means the tunnel failed.
    #[serde(default = "default_tunnel_error_marker")]
    pub tunnel_error_marker: String,
    #[serde(default = "default_auth_error_marker")]
    pub auth_error_marker: String,
    #[serde(default = "default_project_error_marker")]
    pub project_error_marker: String,
    #[serde(default = "default_already_exists_marker")]
    pub already_exists_marker: String,
}

/// Limits applied by the command executor.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Upper bound on any streaming process, tunnel included (default 3600 s).
    #[serde(default = "default_max_process_lifetime")]
    pub max_process_lifetime_secs: u64,
    /// Maximum bytes captured per stream for one-shot commands (default 1 MB).
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "127.0.0.1:23966".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_operations_path() -> String {
    "operations.yml".to_string()
}
fn default_run_timeout() -> u64 {
    300
}
fn default_project_timeout() -> u64 {
    20
}
fn default_registration_ttl() -> u64 {
    3600
}
fn default_session_timeout() -> u64 {
    3600
}
fn default_firewall_timeout() -> u64 {
    300
}
fn default_tunnel_ready_timeout() -> u64 {
    60
}
fn default_firewall_create_command() -> String {
    "gcloud compute firewall-rules create adminops-private-rdp-${{NAME}} \
     --direction=INGRESS --action=allow --rules=tcp:3389 \
     --source-ranges=35.235.240.0/20 --source-tags=${{NAME}} \
     --project=${{PROJECT}} --network=${{NETWORK}}"
        .to_string()
}
fn default_firewall_delete_command() -> String {
    "gcloud compute firewall-rules delete adminops-private-rdp-${{NAME}} -q --project=${{PROJECT}}"
        .to_string()
}
fn default_tunnel_command() -> String {
    "gcloud compute start-iap-tunnel ${{NAME}} 3389 --project=${{PROJECT}} \
     --local-host-port=localhost:${{PORT}} --zone=${{ZONE}}"
        .to_string()
}
fn default_interactive_command() -> String {
    "xfreerdp /v:localhost /port:${{PORT}} /u:${{USERNAME}} /p:${{PASSWORD}} +sec-rdp /cert-ignore"
        .to_string()
}
fn default_tunnel_ready_marker() -> String {
    "Listening on port".to_string()
}
fn default_tunnel_error_marker() -> String {
    "ERROR:".to_string()
}
fn default_auth_error_marker() -> String {
    "there was a problem refreshing your current auth tokens".to_string()
}
fn default_project_error_marker() -> String {
    "failed to find project".to_string()
}
fn default_already_exists_marker() -> String {
    "already exists".to_string()
}
fn default_max_process_lifetime() -> u64 {
    3600
}
fn default_max_output_bytes() -> usize {
    1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            allowed_origins: Vec::new(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for OperationsFileConfig {
    fn default() -> Self {
        Self {
            path: default_operations_path(),
            run_timeout_secs: default_run_timeout(),
            project_timeout_secs: default_project_timeout(),
            registration_ttl_secs: default_registration_ttl(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: default_session_timeout(),
            firewall_timeout_secs: default_firewall_timeout(),
            tunnel_ready_timeout_secs: default_tunnel_ready_timeout(),
            firewall_create_command: default_firewall_create_command(),
            firewall_delete_command: default_firewall_delete_command(),
            tunnel_command: default_tunnel_command(),
            interactive_command: default_interactive_command(),
            tunnel_ready_marker: default_tunnel_ready_marker(),
            tunnel_error_marker: default_tunnel_error_marker(),
            auth_error_marker: default_auth_error_marker(),
            project_error_marker: default_project_error_marker(),
            already_exists_marker: default_already_exists_marker(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            max_process_lifetime_secs: default_max_process_lifetime(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl OperationsFileConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn project_timeout(&self) -> Duration {
        Duration::from_secs(self.project_timeout_secs)
    }

    pub fn registration_ttl(&self) -> Duration {
        Duration::from_secs(self.registration_ttl_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `adminops.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("adminops.toml").exists() => Self::from_file("adminops.toml")?,
            None => Config::default(),
        };

        // Env var overrides
        if let Ok(key) = std::env::var("ADMINOPS_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("ADMINOPS_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(operations) = std::env::var("ADMINOPS_OPERATIONS") {
            config.operations.path = operations;
        }

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {path}: {e}"))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse config file {path}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:23966");
        assert_eq!(config.auth.api_key, "change-me");
        assert_eq!(config.operations.run_timeout(), Duration::from_secs(300));
        assert_eq!(config.operations.project_timeout(), Duration::from_secs(20));
        assert_eq!(config.operations.registration_ttl(), Duration::from_secs(3600));
        assert_eq!(config.session.session_timeout_secs, 3600);
        assert!(config.session.tunnel_command.contains("${{PORT}}"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            allowed_origins = ["chrome-extension://abc"]

            [session]
            firewall_timeout_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:23966");
        assert_eq!(config.server.allowed_origins, vec!["chrome-extension://abc"]);
        assert_eq!(config.session.firewall_timeout_secs, 60);
        assert_eq!(config.session.session_timeout_secs, 3600);
        assert_eq!(config.session.tunnel_ready_marker, "Listening on port");
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adminops.toml");
        std::fs::write(&path, "[operations]\nrun_timeout_secs = 42\n").unwrap();
        let config = Config::load(path.to_str()).unwrap();
        assert_eq!(config.operations.run_timeout_secs, 42);
    }

    #[test]
    fn load_reports_unreadable_file() {
        let err = Config::load(Some("/nonexistent/adminops.toml")).unwrap_err();
        assert!(err.starts_with("Failed to read config file"));
    }
}
