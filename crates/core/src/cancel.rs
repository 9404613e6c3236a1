//! Cancellation registry: live tokens keyed by job UUID or session id.
//!
//! A running task registers a key and holds the returned [`CancelGuard`];
//! external callers cancel by key. Dropping the guard releases the entry, so
//! every exit path of the task cleans up after itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Entries = Arc<Mutex<HashMap<String, (u64, CancellationToken)>>>;

/// Shared registry of in-flight cancellation tokens.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    entries: Entries,
    generation: Arc<AtomicU64>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token under `key`.
    ///
    /// A token already registered under the same key is cancelled and
    /// replaced; its guard no longer releases the new entry.
    pub fn register(&self, key: impl Into<String>) -> CancelGuard {
        let key = key.into();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, previous)) = entries.insert(key.clone(), (generation, token.clone())) {
            previous.cancel();
        }
        debug!(key = %key, "Cancellation token registered");

        CancelGuard {
            entries: self.entries.clone(),
            key,
            generation,
            token,
        }
    }

    /// Cancel the token under `key`. Returns `false` if nothing is registered.
    pub fn cancel(&self, key: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some((_, token)) => {
                token.cancel();
                debug!(key = %key, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Drop the entry under `key` regardless of which guard owns it.
    pub fn release(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ownership of one registry entry. Releases it on drop.
pub struct CancelGuard {
    entries: Entries,
    key: String,
    generation: u64,
    token: CancellationToken,
}

impl CancelGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl std::fmt::Debug for CancelGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelGuard")
            .field("key", &self.key)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries
            .get(&self.key)
            .is_some_and(|(generation, _)| *generation == self.generation)
        {
            entries.remove(&self.key);
        }
    }
}
