//! Process-wide composition root: wires the Whitelist, Cache, Selector and
//! Dispatcher together for the HTTP layer.

use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::{Cache, CacheStore, MemoryStore, NullStore, SledStore};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::probe::Prober;
use crate::selector::Selector;
use crate::whitelist::Whitelist;

pub struct AppState {
    pub cfg: Arc<RwLock<Config>>,
    pub whitelist: Arc<RwLock<Arc<Whitelist>>>,
    pub dispatcher: Arc<RwLock<Arc<Dispatcher>>>,
    /// Cancelled once when the process begins graceful shutdown (`main.rs`'s
    /// `ctrl_c` listener). Per-request tokens are child tokens of this one,
    /// so an in-flight `Send` aborts its current attempt instead of
    /// outliving the server that is trying to stop.
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(cfg: Config, whitelist: Whitelist, client: Client) -> Self {
        let whitelist = Arc::new(whitelist);
        let dispatcher = Arc::new(build_dispatcher(&cfg, whitelist.clone(), client));
        Self {
            cfg: Arc::new(RwLock::new(cfg)),
            whitelist: Arc::new(RwLock::new(whitelist)),
            dispatcher: Arc::new(RwLock::new(dispatcher)),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.read().await.clone()
    }

    pub async fn whitelist(&self) -> Arc<Whitelist> {
        self.whitelist.read().await.clone()
    }

    /// A fresh child of the process-wide shutdown token, handed to one
    /// request. Cancelling the parent (graceful shutdown) cancels every
    /// outstanding child; cancelling a child never affects its siblings.
    pub fn request_cancellation(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// The root token itself, so `main.rs` can hold the other end and
    /// `.cancel()` it from the `ctrl_c` handler.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Swaps in a freshly-loaded whitelist and rebuilds the dependent
    /// Cache/Selector/Dispatcher stack by swapping an `Arc` under a write
    /// lock rather than mutating shared state in place.
    pub async fn reload_whitelist(&self, new_whitelist: Whitelist, client: Client) {
        let new_whitelist = Arc::new(new_whitelist);
        let cfg = self.cfg.read().await.clone();
        let dispatcher = Arc::new(build_dispatcher(&cfg, new_whitelist.clone(), client));
        *self.whitelist.write().await = new_whitelist;
        *self.dispatcher.write().await = dispatcher;
        info!("applied reloaded whitelist");
    }
}

fn build_cache_store(cfg: &Config) -> Arc<dyn CacheStore> {
    if cfg.cache.disable {
        return Arc::new(NullStore);
    }
    match &cfg.cache.sled_path {
        Some(path) => match SledStore::open(path) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::warn!(error = %e, "failed to open sled cache, falling back to memory store");
                Arc::new(MemoryStore::new())
            }
        },
        None => Arc::new(MemoryStore::new()),
    }
}

fn build_dispatcher(cfg: &Config, whitelist: Arc<Whitelist>, client: Client) -> Dispatcher {
    let store = build_cache_store(cfg);
    let cache = Arc::new(Cache::new(store, cfg.cache.cache_key.clone(), cfg.cache.ttl_ms));
    let prober = Arc::new(Prober::new(client.clone(), cfg.probe.latency_timeout_ms));
    let selector = Arc::new(Selector::new(whitelist, cache, prober));
    Dispatcher::new(selector, client, cfg.request_timeout_ms)
}

pub fn resolve_whitelist_path(cfg: &Config, cfg_path: &std::path::Path) -> Option<PathBuf> {
    cfg.whitelist_path.clone().map(|p| {
        if p.is_absolute() {
            p
        } else {
            cfg_path.parent().unwrap_or_else(|| std::path::Path::new(".")).join(p)
        }
    })
}
