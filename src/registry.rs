//! In-memory registry of filled operations waiting to be claimed.
//!
//! A client first registers an operation over HTTP, then opens a socket and
//! claims it by hash. Claims are serialized behind one mutex so only the
//! first claimant of a hash gets to run it. Entries that stay unclaimed
//! longer than the registry's TTL are pruned on the next registration.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::operations::{FilledOperation, OperationStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("operation not found")]
    NotFound,
    #[error("operation already running")]
    AlreadyRunning,
}

const DEFAULT_TTL: Duration = Duration::from_secs(3600);

struct Entry {
    operation: FilledOperation,
    registered_at: Instant,
}

#[derive(Clone)]
pub struct OperationRegistry {
    entries: Arc<Mutex<Vec<Entry>>>,
    ttl: Duration,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose unclaimed entries expire after `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            ttl,
        }
    }

    /// Add `operation` unless an entry with the same hash is already present.
    ///
    /// Ready entries older than the TTL are dropped first. Running entries
    /// stay until released.
    pub async fn register(&self, operation: FilledOperation) {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| {
            e.operation.status == OperationStatus::Running || e.registered_at.elapsed() < self.ttl
        });
        if entries.len() < before {
            debug!(pruned = before - entries.len(), "Dropped stale operations");
        }
        if entries.iter().any(|e| e.operation.hash == operation.hash) {
            debug!(hash = %operation.hash, "Operation already registered");
            return;
        }
        entries.push(Entry {
            operation,
            registered_at: Instant::now(),
        });
    }

    /// Mark the entry for `hash` as running and return a copy of it.
    pub async fn claim(&self, hash: &str) -> Result<FilledOperation, RegistryError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.operation.hash == hash)
            .map(|e| &mut e.operation)
            .ok_or(RegistryError::NotFound)?;
        if entry.status == OperationStatus::Running {
            return Err(RegistryError::AlreadyRunning);
        }
        entry.status = OperationStatus::Running;
        Ok(entry.clone())
    }

    /// Drop the entry for `hash`, whatever its status.
    pub async fn release(&self, hash: &str) {
        self.entries.lock().await.retain(|e| e.operation.hash != hash);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
