//! Per-identity locks
//!
//! Messages for the same (kind, source, external id) serialize on one async
//! mutex; messages for different identities never contend. Entries are
//! created on demand and removed when the last holder or waiter goes away.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use lims_common::events::EntityKind;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{IngestError, IngestResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub kind: EntityKind,
    pub source: String,
    pub external_id: String,
}

impl LockKey {
    pub fn new(kind: EntityKind, source: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            external_id: external_id.into(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.source, self.external_id)
    }
}

type LockTable = Arc<StdMutex<HashMap<LockKey, Arc<Mutex<()>>>>>;

#[derive(Clone, Default)]
pub struct IdentityLocks {
    table: LockTable,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for exclusive access to `key`
    ///
    /// Fails with `IngestError::LockTimeout` when the wait runs out.
    pub async fn acquire(&self, key: LockKey, timeout: Duration) -> IngestResult<IdentityGuard> {
        let mutex = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.entry(key.clone()).or_default().clone()
        };

        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(IdentityGuard {
                key,
                guard: Some(guard),
                table: self.table.clone(),
            }),
            Err(_) => {
                release_entry(&self.table, &key);
                Err(IngestError::LockTimeout {
                    key: key.to_string(),
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Identities currently held or waited on
    pub fn active(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Drop the table entry if nobody else holds or waits on it
fn release_entry(table: &LockTable, key: &LockKey) {
    let mut table = table.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(entry) = table.get(key) {
        if Arc::strong_count(entry) == 1 {
            table.remove(key);
        }
    }
}

/// Held lock for one identity; released on drop
pub struct IdentityGuard {
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
    table: LockTable,
}

impl IdentityGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        release_entry(&self.table, &self.key);
    }
}
