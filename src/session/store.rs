use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::{Error, Result};

const MAX_TOTAL_SESSIONS: usize = 100_000;

/// Key/value store holding serialized sessions with a per-entry time-to-live.
///
/// The store is the only source of truth for session liveness: an entry whose TTL
/// has lapsed must read as absent.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Writes `value` under `key` for `ttl`.
    ///
    /// # Errors
    /// [`Error::AlreadyExists`] if a live entry already holds `key`,
    /// [`Error::Store`] if the backend fails.
    async fn insert(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Reads the live value under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Deletes `key`. Deleting an absent key succeeds.
    async fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Clone, Debug)]
struct StoredEntry {
    value: String,
    expires_at: Instant,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process [`SessionStore`] with lazy and periodic expiry.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    entries: Arc<RwLock<HashMap<String, StoredEntry>>>,
}

impl MemorySessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes every expired entry and returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Number of entries currently held, including expired ones not yet purged.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();

        if let Some(existing) = entries.get(key) {
            if !existing.is_expired(now) {
                return Err(Error::AlreadyExists("session key already in use".to_string()));
            }
        }

        if entries.len() >= MAX_TOTAL_SESSIONS {
            entries.retain(|_, entry| !entry.is_expired(now));
            if entries.len() >= MAX_TOTAL_SESSIONS {
                return Err(Error::Store(format!(
                    "session store has reached maximum capacity ({MAX_TOTAL_SESSIONS})"
                )));
            }
        }

        entries.insert(
            key.to_string(),
            StoredEntry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        let now = Instant::now();

        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone()))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
