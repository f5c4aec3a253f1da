//! TTL-based key-value cache shared by the enrichment providers.
//!
//! Every provider keys its results through [`CacheStore::key`] so cache-key
//! construction lives in one place. Entries are written through to a JSON
//! file when one is configured; any storage failure degrades the store to
//! in-memory (or to always-miss), never to an error for the caller.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// A single cached value with its absolute expiry time.
///
/// Expiry is kept as unix seconds so persisted entries stay valid across
/// process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    value: Value,
    expires_at: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Thread-safe TTL cache with optional disk persistence.
pub struct CacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    path: Option<PathBuf>,
    max_entries: usize,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl CacheStore {
    /// Create a cache store, loading any previously persisted entries.
    ///
    /// A missing or unreadable persistence file starts the store empty.
    pub fn new(path: Option<PathBuf>, max_entries: usize) -> Self {
        let entries = path
            .as_deref()
            .and_then(|p| match std::fs::read_to_string(p) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(map) => Some(map),
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Discarding unreadable cache file");
                        None
                    }
                },
                Err(_) => None,
            })
            .unwrap_or_default();

        Self {
            entries: RwLock::new(entries),
            path,
            max_entries,
        }
    }

    /// In-memory store without persistence.
    pub fn ephemeral() -> Self {
        Self::new(None, 10_000)
    }

    /// Build a cache key from a provider prefix and an IP (or any display
    /// value). The single place key shapes are decided.
    pub fn key(prefix: &str, ip: impl Display) -> String {
        format!("{}:{}", prefix, ip)
    }

    /// Get a cached value if present and not expired.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key)?;

        if entry.is_expired(now_unix()) {
            // Expired entries are dropped on the next write pass.
            return None;
        }

        serde_json::from_value(entry.value.clone()).ok()
    }

    /// Store a value with a TTL, overwriting any previous entry.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                debug!(key, error = %e, "Value not cacheable");
                return;
            }
        };

        let entry = CacheEntry {
            value,
            expires_at: now_unix().saturating_add(ttl.as_secs()),
        };

        if let Ok(mut entries) = self.entries.write() {
            if entries.len() >= self.max_entries && !entries.contains_key(key) {
                let now = now_unix();
                entries.retain(|_, v| !v.is_expired(now));

                // Still full: drop the entry closest to expiry.
                if entries.len() >= self.max_entries {
                    if let Some(soonest) = entries
                        .iter()
                        .min_by_key(|(_, v)| v.expires_at)
                        .map(|(k, _)| k.clone())
                    {
                        entries.remove(&soonest);
                    }
                }
            }

            entries.insert(key.to_string(), entry);
            self.persist(&entries);
        }
    }

    /// Remove every entry whose key starts with `prefix`. Returns the number
    /// of entries removed.
    pub fn delete_by_prefix(&self, prefix: &str) -> usize {
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        let removed = before - entries.len();
        if removed > 0 {
            self.persist(&entries);
        }
        removed
    }

    /// Drop all expired entries.
    pub fn purge_expired(&self) {
        if let Ok(mut entries) = self.entries.write() {
            let now = now_unix();
            entries.retain(|_, v| !v.is_expired(now));
            self.persist(&entries);
        }
    }

    /// Remove every entry.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
            self.persist(&entries);
        }
    }

    /// Number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, entries: &HashMap<String, CacheEntry>) {
        let Some(path) = &self.path else {
            return;
        };

        let result = serde_json::to_string(entries)
            .map_err(std::io::Error::other)
            .and_then(|json| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, json)
            });

        if let Err(e) = result {
            debug!(path = %path.display(), error = %e, "Cache persistence failed");
        }
    }
}
