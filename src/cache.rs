//! Cache (spec §4.3): persists one `CacheRoot` under one KV key, exposes
//! per-chain fresh/raw reads and whole-root writes. Backed by a pluggable
//! `CacheStore` so durability is swappable without touching call sites.

use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::data::{CacheRoot, ChainCacheEntry, ChainId, ProbeResult, Url};
use crate::error::ProxyError;

/// The pluggable persistent key-value store named in spec §1/§2.3. A
/// single logical key (the "cache key prefix") holds the entire
/// `CacheRoot` document; implementations never expose per-chain sub-keys.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get_root(&self, key: &str) -> Result<Option<CacheRoot>, ProxyError>;
    async fn put_root(&self, key: &str, root: &CacheRoot) -> Result<(), ProxyError>;
}

/// Default, in-process backing store: a `RwLock<HashMap<..>>` holding one
/// `CacheRoot` value.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<String, CacheRoot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get_root(&self, key: &str) -> Result<Option<CacheRoot>, ProxyError> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn put_root(&self, key: &str, root: &CacheRoot) -> Result<(), ProxyError> {
        self.inner.write().await.insert(key.to_string(), root.clone());
        Ok(())
    }
}

/// Embedded, on-disk backing store (spec §2.3 "in-memory or embedded
/// store"). One `sled` tree entry per cache key, JSON-encoded.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: &Path) -> Result<Self, ProxyError> {
        let db = sled::open(path).map_err(|e| ProxyError::Cache(e.to_string()))?;
        Ok(Self { db })
    }
}

#[async_trait]
impl CacheStore for SledStore {
    async fn get_root(&self, key: &str) -> Result<Option<CacheRoot>, ProxyError> {
        let bytes = self.db.get(key).map_err(|e| ProxyError::Cache(e.to_string()))?;
        let Some(bytes) = bytes else { return Ok(None) };
        let root: CacheRoot =
            serde_json::from_slice(&bytes).map_err(|e| ProxyError::Cache(e.to_string()))?;
        Ok(Some(root))
    }

    async fn put_root(&self, key: &str, root: &CacheRoot) -> Result<(), ProxyError> {
        let bytes = serde_json::to_vec(root).map_err(|e| ProxyError::Cache(e.to_string()))?;
        self.db.insert(key, bytes).map_err(|e| ProxyError::Cache(e.to_string()))?;
        self.db.flush_async().await.map_err(|e| ProxyError::Cache(e.to_string()))?;
        Ok(())
    }
}

/// `disableCache = true` (spec §4.3): every read is a miss, every write a
/// no-op, but the Selector still runs probes and computes a ranking.
#[derive(Default)]
pub struct NullStore;

#[async_trait]
impl CacheStore for NullStore {
    async fn get_root(&self, _key: &str) -> Result<Option<CacheRoot>, ProxyError> {
        Ok(None)
    }

    async fn put_root(&self, _key: &str, _root: &CacheRoot) -> Result<(), ProxyError> {
        Ok(())
    }
}

pub struct Cache {
    store: Arc<dyn CacheStore>,
    cache_key: String,
    ttl_ms: u64,
    // Serializes the whole-root read-modify-write in `put` across chains.
    // The Selector's single-flight guard only serializes writes *for the
    // same* chain (spec §5); without this, two different chains probing
    // concurrently can both read the same stale root and the later write
    // silently discards the earlier chain's entry.
    write_lock: tokio::sync::Mutex<()>,
}

impl Cache {
    pub fn new(store: Arc<dyn CacheStore>, cache_key: String, ttl_ms: u64) -> Self {
        Self { store, cache_key, ttl_ms, write_lock: tokio::sync::Mutex::new(()) }
    }

    /// Whether `entry` would currently be considered fresh by this cache's
    /// configured TTL. Introspection-only helper for the `/status` endpoint.
    pub fn entry_is_fresh(&self, entry: &ChainCacheEntry) -> bool {
        entry.is_fresh(now_unix_ms(), self.ttl_ms)
    }

    /// `GetFresh` — `None` if missing, hard-store-error, or stale.
    pub async fn get_fresh(&self, chain_id: ChainId) -> Option<ChainCacheEntry> {
        let entry = self.get_raw(chain_id).await?;
        let now = now_unix_ms();
        if entry.is_fresh(now, self.ttl_ms) {
            Some(entry)
        } else {
            None
        }
    }

    /// `GetRaw` — whatever is stored regardless of freshness. KV read
    /// failure is treated as a miss (spec §4.3 failure semantics).
    pub async fn get_raw(&self, chain_id: ChainId) -> Option<ChainCacheEntry> {
        let root = match self.store.get_root(&self.cache_key).await {
            Ok(root) => root,
            Err(e) => {
                warn!(error = %e, "cache read failed, treating as miss");
                None
            }
        };
        root.and_then(|mut r| r.remove(&chain_id))
    }

    /// `Put` — whole-root replace with `lastTested = now`. KV write
    /// failure is logged and swallowed; the caller's in-memory selection
    /// for this call still proceeds (spec §4.3). The read-modify-write is
    /// held under `write_lock` so concurrent `put`s for different chains
    /// never race each other's read of the root.
    pub async fn put(&self, chain_id: ChainId, probe_map: HashMap<Url, ProbeResult>, fastest_url: Option<Url>) {
        let _guard = self.write_lock.lock().await;
        let mut root = self.store.get_root(&self.cache_key).await.ok().flatten().unwrap_or_default();
        root.insert(
            chain_id,
            ChainCacheEntry { last_tested_unix_ms: now_unix_ms(), probe_map, fastest_url },
        );
        if let Err(e) = self.store.put_root(&self.cache_key, &root).await {
            warn!(error = %e, chain_id, "cache write failed");
        } else {
            debug!(chain_id, "cache updated");
        }
    }
}

fn now_unix_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}
