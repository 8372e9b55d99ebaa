#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! adminops library: the building blocks of the gateway.
//!
//! - `operations`: operation catalogue, validation and fill
//! - `registry`: filled operations waiting to be claimed
//! - `session`: private remote-desktop session orchestration
//! - `runner`: claim-and-run path for registered operations
//! - `transport`: message-framed connection contract and its WebSocket adapter
//! - `shell`: command execution
//! - `routes`: HTTP and WebSocket handlers
//! - `auth` / `config` / `state`: service plumbing

pub mod auth;
pub mod config;
pub mod instance;
pub mod operations;
pub mod registry;
pub mod routes;
pub mod runner;
pub mod session;
pub mod shell;
pub mod state;
pub mod transport;

#[cfg(test)]
mod testing;

pub use auth::ApiKey;
pub use config::Config;
pub use operations::{OperationsConfig, OperationsHandle};
pub use registry::OperationRegistry;
pub use state::AppState;
