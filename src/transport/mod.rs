//! Message-framed duplex connection shared by sessions and operation runs.
//!
//! ## Frames
//!
//! Server → client, at most one field set per frame:
//!
//! ```json
//! {"message": "Ready for command"}
//! {"stdout": "line of output"}
//! {"stderr": "line of output"}
//! {"error": "Could not start tunnel for vm-1"}
//! ```
//!
//! Client → server:
//!
//! | Frame | Meaning |
//! |---|---|
//! | `{"cmd": "end", "name": "<instance>"}` | end the private session |
//! | `{"cmd": "start-interactive-session", "username": "..", "password": ".."}` | launch the desktop client |
//! | `{"cmd": "end_operation", "hash": "<hash>"}` | stop a running operation |
//! | `{"hash": "<hash>"}` | claim a registered operation (first frame only) |

pub mod ws;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use ws::WsTransport;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("connection error: {0}")]
    Io(String),
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// One structured server → client frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerMessage {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            message: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stdout: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stderr: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            error: Some(text.into()),
            ..Self::default()
        }
    }
}

/// What a [`ClientCommand`] asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    End,
    StartInteractiveSession,
    EndOperation,
    Unknown,
}

/// A client → server command frame. Unused fields may be omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClientCommand {
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub hash: String,
}

impl ClientCommand {
    pub fn kind(&self) -> CommandKind {
        match self.cmd.as_str() {
            "end" => CommandKind::End,
            // "start-rdp" is what older extension builds send.
            "start-interactive-session" | "start-rdp" => CommandKind::StartInteractiveSession,
            "end_operation" => CommandKind::EndOperation,
            _ => CommandKind::Unknown,
        }
    }
}

/// First frame on an operation-run connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClaimRequest {
    #[serde(default)]
    pub hash: String,
}

/// A bidirectional connection carrying one JSON document per frame.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait for the next text frame.
    async fn recv(&self) -> Result<String, TransportError>;

    async fn send(&self, message: ServerMessage) -> Result<(), TransportError>;

    /// Close the connection. Calling it more than once is harmless.
    async fn close(&self);
}

/// Receive the next frame and decode it as `T`.
pub async fn recv_json<T>(transport: &dyn Transport) -> Result<T, TransportError>
where
    T: for<'de> Deserialize<'de>,
{
    let text = transport.recv().await?;
    serde_json::from_str(&text).map_err(|e| TransportError::Malformed(e.to_string()))
}
