//! Selector (spec §4.4): returns a ranked list of usable URLs for a chain,
//! triggering at most one in-flight probe per chain even under a
//! concurrent burst of callers.

use futures::future::{FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::cache::Cache;
use crate::data::{rank_probe_map, ChainCacheEntry, ChainId, ProbeResult, Url};
use crate::probe::Prober;
use crate::whitelist::Whitelist;

type ProbeMap = HashMap<Url, ProbeResult>;
type SharedProbe = Shared<Pin<Box<dyn Future<Output = ProbeMap> + Send>>>;

pub struct Selector {
    whitelist: Arc<Whitelist>,
    cache: Arc<Cache>,
    prober: Arc<Prober>,
    in_flight: AsyncMutex<HashMap<ChainId, SharedProbe>>,
}

impl Selector {
    pub fn new(whitelist: Arc<Whitelist>, cache: Arc<Cache>, prober: Arc<Prober>) -> Self {
        Self { whitelist, cache, prober, in_flight: AsyncMutex::new(HashMap::new()) }
    }

    /// Whatever cache entry currently exists for `chain_id`, fresh or not,
    /// plus whether it is currently fresh. Introspection-only, used by the
    /// `/status` endpoint — never consulted by `get_ranked_list` itself
    /// beyond the one read already in step 1.
    pub async fn cache_snapshot(&self, chain_id: ChainId) -> Option<(ChainCacheEntry, bool)> {
        let entry = self.cache.get_raw(chain_id).await?;
        let fresh = self.cache.entry_is_fresh(&entry);
        Some((entry, fresh))
    }

    /// spec §4.4 `GetRankedList` algorithm.
    pub async fn get_ranked_list(&self, chain_id: ChainId) -> Vec<Url> {
        if let Some(entry) = self.cache.get_fresh(chain_id).await {
            if is_entry_valid(&entry) {
                debug!(chain_id, "cache hit, serving ranked list from cache");
                return rank_probe_map(&entry.probe_map);
            }
        }

        let probe_map = self.probe_with_single_flight(chain_id).await;
        rank_probe_map(&probe_map)
    }

    /// At-most-one in-flight probe per chain (spec §4.4 step 4, §9). The
    /// check-then-register happens under one held lock so there is never
    /// a race between "is there one in flight" and "register mine" — the
    /// caller that performs the registration is the only one that goes on
    /// to write the cache and deregister when the probe completes.
    async fn probe_with_single_flight(&self, chain_id: ChainId) -> ProbeMap {
        let mut guard = self.in_flight.lock().await;
        if let Some(shared) = guard.get(&chain_id).cloned() {
            drop(guard);
            debug!(chain_id, "joining in-flight probe");
            return shared.await;
        }

        let whitelist = self.whitelist.clone();
        let prober = self.prober.clone();
        let urls = whitelist.urls_for(chain_id).to_vec();

        let fut: Pin<Box<dyn Future<Output = ProbeMap> + Send>> = Box::pin(async move {
            if urls.is_empty() {
                HashMap::new()
            } else {
                prober.probe_all(&urls).await
            }
        });
        let shared: SharedProbe = fut.shared();
        guard.insert(chain_id, shared.clone());
        drop(guard);

        info!(chain_id, "triggering fresh probe");
        let probe_map = shared.await;

        // Only the registering call reaches here; deregister and persist
        // exactly once regardless of how many followers joined.
        self.in_flight.lock().await.remove(&chain_id);
        let fastest_url = rank_probe_map(&probe_map).into_iter().next();
        self.cache.put(chain_id, probe_map.clone(), fastest_url).await;

        probe_map
    }
}

fn is_entry_valid(entry: &ChainCacheEntry) -> bool {
    // A fresh entry with no fastest URL means every probed URL hard-failed
    // last time; that is a validly-empty result, not an invalidated one —
    // re-probing it on every call within TTL would defeat the TTL (spec
    // §4.4 edge cases, §8 S5). Only a `fastest_url` whose tier has since
    // dropped out of ACCEPT (§8 S7) makes the entry invalid.
    let Some(fastest) = &entry.fastest_url else { return true };
    matches!(entry.probe_map.get(fastest), Some(r) if r.status.is_acceptable())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, MemoryStore};
    use crate::whitelist::{Whitelist, WhitelistSource};
    use axum::{routing::post, Json, Router};
    use reqwest::Client;
    use serde_json::{json, Value};
    use indexmap::IndexMap;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn ok_prefix_hex() -> String {
        format!("0x{}", hex::encode(&*crate::probe::permit2_prefix_for_tests()))
    }

    async fn spawn_counting_mock(hit_count: Arc<AtomicUsize>, delay_ms: u64) -> String {
        let prefix_hex = ok_prefix_hex();
        let app = Router::new().route(
            "/",
            post(move |Json(body): Json<Value>| {
                let hit_count = hit_count.clone();
                let prefix_hex = prefix_hex.clone();
                async move {
                    let method = body.get("method").and_then(Value::as_str).unwrap_or_default();
                    if method == "eth_getCode" {
                        hit_count.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    }
                    if method == "eth_getCode" {
                        Json(json!({"jsonrpc":"2.0","id":body["id"],"result": prefix_hex}))
                    } else {
                        Json(json!({"jsonrpc":"2.0","id":body["id"],"result": false}))
                    }
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn whitelist_with(chain_id: u64, urls: Vec<String>) -> Arc<Whitelist> {
        let mut rpcs = IndexMap::new();
        // the filter in Whitelist requires https://; tests point at a
        // local plain-http mock, so bypass the public constructor here.
        rpcs.insert(chain_id.to_string(), urls);
        Arc::new(Whitelist::from_source_unfiltered_for_tests(WhitelistSource { rpcs }))
    }

    #[tokio::test]
    async fn single_flight_probes_once_under_concurrent_burst() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_counting_mock(hits.clone(), 150).await;

        let whitelist = whitelist_with(100, vec![url]);
        let cache = Arc::new(Cache::new(Arc::new(MemoryStore::new()), "k".to_string(), 60_000));
        let prober = Arc::new(Prober::new(Client::new(), 2_000));
        let selector = Arc::new(Selector::new(whitelist, cache, prober));

        let mut tasks = Vec::new();
        for _ in 0..25 {
            let selector = selector.clone();
            tasks.push(tokio::spawn(async move { selector.get_ranked_list(100).await }));
        }
        let results: Vec<_> = futures::future::join_all(tasks).await;
        for r in results {
            assert_eq!(r.unwrap().len(), 1);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_whitelist_returns_empty_without_probing() {
        let whitelist = whitelist_with(100, vec![]);
        let cache = Arc::new(Cache::new(Arc::new(MemoryStore::new()), "k".to_string(), 60_000));
        let prober = Arc::new(Prober::new(Client::new(), 2_000));
        let selector = Selector::new(whitelist, cache, prober);

        let ranked = selector.get_ranked_list(100).await;
        assert!(ranked.is_empty());
    }

    async fn spawn_failing_mock(hit_count: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/",
            post(move |Json(_body): Json<Value>| {
                let hit_count = hit_count.clone();
                async move {
                    hit_count.fetch_add(1, Ordering::SeqCst);
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// spec §4.4 edge cases / §8 S5: a fresh entry with no usable URL must
    /// be served from cache, not re-probed, on the next call within TTL.
    #[tokio::test]
    async fn fresh_all_hard_fail_entry_is_not_reprobed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_failing_mock(hits.clone()).await;
        let whitelist = whitelist_with(100, vec![url]);
        let cache = Arc::new(Cache::new(Arc::new(MemoryStore::new()), "k".to_string(), 60_000));
        let prober = Arc::new(Prober::new(Client::new(), 2_000));
        let selector = Arc::new(Selector::new(whitelist, cache.clone(), prober));

        let first = selector.get_ranked_list(100).await;
        assert!(first.is_empty());
        let entry = cache.get_raw(100).await.unwrap();
        assert!(entry.fastest_url.is_none());
        // each probe issues two calls (eth_getCode, eth_syncing) against the one URL.
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let second = selector.get_ranked_list(100).await;
        assert!(second.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 2, "second call must be served from cache, not re-probed");
    }
}
