//! Counter stores holding request histories for rate policies.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// External store shared by throttle policies.
///
/// A history is a list of request timestamps (seconds since the epoch), newest first.
pub trait CounterStore: Send + Sync {
    fn get_history(&self, key: &str) -> Result<Vec<f64>>;

    fn set_history(&self, key: &str, history: &[f64], ttl: Duration) -> Result<()>;

    fn clear(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Entry {
    history: Vec<f64>,
    expires_at: Instant,
}

/// Process-local store, used when no Redis URL is configured.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired histories, returning how many were removed.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut entries = self.entries.write().map_err(|_| {
            Error::Store("Failed to acquire write lock on histories".to_string())
        })?;

        let initial_count = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(initial_count - entries.len())
    }

    /// Run [`InMemoryStore::cleanup_expired`] every `every` until the store is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        let every = every.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                match store.cleanup_expired() {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "expired throttle histories dropped"),
                    Err(err) => warn!(error = %err, "throttle history cleanup failed"),
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CounterStore for InMemoryStore {
    fn get_history(&self, key: &str) -> Result<Vec<f64>> {
        let entries = self.entries.read().map_err(|_| {
            Error::Store("Failed to acquire read lock on histories".to_string())
        })?;

        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.history.clone())
            .unwrap_or_default())
    }

    fn set_history(&self, key: &str, history: &[f64], ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| {
            Error::Store("Failed to acquire write lock on histories".to_string())
        })?;

        entries.insert(
            key.to_string(),
            Entry {
                history: history.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| {
            Error::Store("Failed to acquire write lock on histories".to_string())
        })?;
        entries.remove(key);
        Ok(())
    }
}
