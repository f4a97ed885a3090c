//! # OffKit Cache
//!
//! Named, versioned cache stores for the OffKit offline-first proxy engine.
//!
//! ## Architecture
//!
//! ```text
//! CacheStorage
//!     └── CacheStore ("app-shell-v2")
//!             └── URL → CachedResponse
//! ```
//!
//! A store maps request identity (method + URL, GET-only) to a materialized
//! response. Stores are created whole at install time and deleted whole on
//! version rollover or purge; there is no per-entry eviction. Every
//! operation is individually atomic; there are no cross-operation
//! transactions, so concurrent writers race and the last `put` wins.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Cache store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Not cacheable: {0}")]
    NotCacheable(String),
}

/// A stored request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Stored-at timestamp (ms since epoch).
    pub stored_at: u64,
}

impl CachedResponse {
    /// Create a GET entry stamped with the current time.
    pub fn get(url: &str, status: u16, headers: HashMap<String, String>, body: Vec<u8>) -> Self {
        Self {
            url: url.to_string(),
            method: "GET".to_string(),
            status,
            headers,
            body,
            stored_at: now_millis(),
        }
    }
}

type Entries = HashMap<String, CachedResponse>;

/// The set of named cache stores.
#[derive(Debug, Clone, Default)]
pub struct CacheStorage {
    stores: Arc<RwLock<HashMap<String, Entries>>>,
}

impl CacheStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store (creates if absent) and return a handle to it.
    pub async fn open(&self, name: &str) -> CacheStore {
        let mut stores = self.stores.write().await;
        if !stores.contains_key(name) {
            info!(store = name, "Creating cache store");
            stores.insert(name.to_string(), Entries::new());
        }

        CacheStore {
            name: name.to_string(),
            stores: Arc::clone(&self.stores),
        }
    }

    /// Check whether a store exists.
    pub async fn has(&self, name: &str) -> bool {
        self.stores.read().await.contains_key(name)
    }

    /// Delete a store and all of its entries.
    pub async fn delete(&self, name: &str) -> bool {
        let removed = self.stores.write().await.remove(name).is_some();
        if removed {
            info!(store = name, "Deleted cache store");
        }
        removed
    }

    /// Names of all existing stores.
    pub async fn keys(&self) -> Vec<String> {
        self.stores.read().await.keys().cloned().collect()
    }
}

/// Handle to one named store.
///
/// Handles stay valid across a storage-level delete of their store: reads
/// simply miss, and a later write re-creates the store. This mirrors the
/// per-operation atomicity of the storage model — a handle is a name, not
/// a lease.
#[derive(Debug, Clone)]
pub struct CacheStore {
    name: String,
    stores: Arc<RwLock<HashMap<String, Entries>>>,
}

impl CacheStore {
    /// Store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a request identity.
    pub async fn match_request(&self, url: &str) -> Option<CachedResponse> {
        self.stores
            .read()
            .await
            .get(&self.name)
            .and_then(|entries| entries.get(url))
            .cloned()
    }

    /// Store an entry. Only GET identities are cacheable.
    pub async fn put(&self, entry: CachedResponse) -> Result<(), CacheError> {
        if entry.method != "GET" {
            return Err(CacheError::NotCacheable(format!(
                "{} {}",
                entry.method, entry.url
            )));
        }

        debug!(store = %self.name, url = %entry.url, "Caching response");
        self.stores
            .write()
            .await
            .entry(self.name.clone())
            .or_default()
            .insert(entry.url.clone(), entry);
        Ok(())
    }

    /// Store a batch of entries under a single write lock.
    ///
    /// The batch is validated up front; either every entry lands or none
    /// does. Install-time precaching commits through this.
    pub async fn put_all(&self, entries: Vec<CachedResponse>) -> Result<(), CacheError> {
        for entry in &entries {
            if entry.method != "GET" {
                return Err(CacheError::NotCacheable(format!(
                    "{} {}",
                    entry.method, entry.url
                )));
            }
        }

        let mut stores = self.stores.write().await;
        let store = stores.entry(self.name.clone()).or_default();
        for entry in entries {
            store.insert(entry.url.clone(), entry);
        }
        Ok(())
    }

    /// Delete an entry.
    pub async fn delete(&self, url: &str) -> bool {
        self.stores
            .write()
            .await
            .get_mut(&self.name)
            .map(|entries| entries.remove(url).is_some())
            .unwrap_or(false)
    }

    /// All stored URLs.
    pub async fn keys(&self) -> Vec<String> {
        self.stores
            .read()
            .await
            .get(&self.name)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        self.stores
            .read()
            .await
            .get(&self.name)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// Whether the store holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
