//! Dispatcher (spec §4.5): the public `Send` entry point. Resolves the
//! ranked list once per call, picks a round-robin starting index, and
//! iterates the list on failure with a per-attempt timeout.

use parking_lot::Mutex;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::data::{ChainId, Url};
use crate::error::ProxyError;
use crate::selector::Selector;

pub struct Dispatcher {
    selector: Arc<Selector>,
    client: Client,
    request_timeout: Duration,
    round_robin: Mutex<HashMap<ChainId, AtomicUsize>>,
}

impl Dispatcher {
    pub fn new(selector: Arc<Selector>, client: Client, request_timeout_ms: u64) -> Self {
        Self {
            selector,
            client,
            request_timeout: Duration::from_millis(request_timeout_ms),
            round_robin: Mutex::new(HashMap::new()),
        }
    }

    /// spec §4.5 `Send`. `cancel` lets the caller abort the current
    /// `ExecuteOne` attempt — driven by process-wide graceful shutdown in
    /// the running server (see `AppState::request_cancellation`) — without
    /// affecting any shared in-flight probe another waiter might still need
    /// (spec §5).
    pub async fn send(
        &self,
        chain_id: ChainId,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, ProxyError> {
        let list = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ProxyError::Network("request cancelled".to_string()));
            }
            list = self.selector.get_ranked_list(chain_id) => list,
        };
        if list.is_empty() {
            return Err(ProxyError::NoEndpoints(chain_id));
        }

        let n = list.len();
        let start = self.advance_round_robin(chain_id, n);

        let mut last_error: Option<ProxyError> = None;
        for k in 0..n {
            let url = &list[(start + k) % n];

            if cancel.is_cancelled() {
                return Err(ProxyError::Network("request cancelled".to_string()));
            }

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ProxyError::Network("request cancelled".to_string()));
                }
                result = self.execute_one(url, method, params.clone()) => result,
            };

            match attempt {
                Ok(result) => return Ok(result),
                Err(e) => {
                    debug!(chain_id, url = %url, error = %e, "attempt failed, trying next endpoint");
                    last_error = Some(e);
                }
            }
        }

        let last_error = last_error.unwrap_or(ProxyError::Network("no attempts were made".to_string()));
        warn!(chain_id, error = %last_error, "all endpoints failed");
        Err(ProxyError::AllEndpointsFailed { chain_id, last_error: Box::new(last_error) })
    }

    /// Introspection-only passthrough to the Selector's cache snapshot —
    /// reports whatever was last probed without triggering a fresh probe,
    /// so hitting `/status` never pays a probe's cost.
    pub async fn cache_snapshot(&self, chain_id: ChainId) -> Option<(crate::data::ChainCacheEntry, bool)> {
        self.selector.cache_snapshot(chain_id).await
    }

    /// Read-then-increment of the per-chain round-robin counter, advanced
    /// exactly once per `Send` call before the first attempt (spec §3).
    fn advance_round_robin(&self, chain_id: ChainId, n: usize) -> usize {
        let mut guard = self.round_robin.lock();
        let counter = guard.entry(chain_id).or_insert_with(|| AtomicUsize::new(0));
        let i = counter.fetch_add(1, Ordering::SeqCst);
        i % n
    }

    /// spec §4.5 `ExecuteOne`.
    async fn execute_one(&self, url: &str, method: &str, params: Value) -> Result<Value, ProxyError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": format!("rpc-call-{}", now_unix_ms()),
        });

        // One deadline covers the whole attempt — send plus body read —
        // matching spec §4.5's singular "request deadline", not one
        // timeout per leg.
        let attempt = async {
            let response = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| ProxyError::Network(e.to_string()))?;

            if !response.status().is_success() {
                return Err(ProxyError::Http(response.status().as_u16()));
            }

            response.json::<Value>().await.map_err(|e| ProxyError::Malformed(e.to_string()))
        };

        let value = match tokio::time::timeout(self.request_timeout, attempt).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ProxyError::Timeout(self.request_timeout.as_millis() as u64)),
        };

        if let Some(error) = value.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error.get("message").and_then(Value::as_str).unwrap_or("unknown error").to_string();
            return Err(ProxyError::Rpc { code, message });
        }

        match value.get("result") {
            Some(result) => Ok(result.clone()),
            // A `result` key holding JSON `null` is matched above and
            // returned as `Value::Null`, which is a legitimate success
            // (spec §4.5, Testable Property 8) — only a response with
            // neither `result` nor `error` reaches here.
            None => Err(ProxyError::Malformed("response has neither result nor error".to_string())),
        }
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, MemoryStore};
    use crate::probe::Prober;
    use crate::whitelist::{Whitelist, WhitelistSource};
    use axum::{routing::post, Json, Router};
    use indexmap::IndexMap;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn spawn_mock(handler: impl Fn(Value) -> (u16, Value) + Send + Sync + 'static) -> String {
        let handler = Arc::new(handler);
        let app = Router::new().route(
            "/",
            post(move |Json(body): Json<Value>| {
                let handler = handler.clone();
                async move {
                    let (status, value) = handler(body);
                    (axum::http::StatusCode::from_u16(status).unwrap(), Json(value))
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
        rpcs.insert(chain_id.to_string(), urls);
        Arc::new(Whitelist::from_source_unfiltered_for_tests(WhitelistSource { rpcs }))
    }

    fn ok_prefix_hex() -> String {
        format!("0x{}", hex::encode(crate::probe::permit2_prefix_for_tests()))
    }

    fn build_dispatcher(chain_id: u64, urls: Vec<String>) -> Dispatcher {
        let whitelist = whitelist_with(chain_id, urls);
        let cache = Arc::new(Cache::new(Arc::new(MemoryStore::new()), "k".to_string(), 60_000));
        let prober = Arc::new(Prober::new(Client::new(), 2_000));
        let selector = Arc::new(crate::selector::Selector::new(whitelist, cache, prober));
        Dispatcher::new(selector, Client::new(), 2_000)
    }

    #[tokio::test]
    async fn happy_path_returns_result_passthrough_including_null() {
        let prefix_hex = ok_prefix_hex();
        let url = spawn_mock(move |body: Value| {
            let method = body.get("method").and_then(Value::as_str).unwrap_or_default();
            let id = body["id"].clone();
            if method == "eth_getCode" {
                (200, serde_json::json!({"jsonrpc":"2.0","id":id,"result": prefix_hex}))
            } else if method == "eth_syncing" {
                (200, serde_json::json!({"jsonrpc":"2.0","id":id,"result": false}))
            } else {
                (200, serde_json::json!({"jsonrpc":"2.0","id":id,"result": Value::Null}))
            }
        })
        .await;

        let dispatcher = build_dispatcher(100, vec![url]);
        let cancel = CancellationToken::new();
        let result = dispatcher.send(100, "eth_getBalance", serde_json::json!([]), &cancel).await.unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn falls_back_to_second_endpoint_on_first_failure() {
        let prefix_hex = ok_prefix_hex();
        let good_prefix = prefix_hex.clone();
        let url_a = spawn_mock(move |body: Value| {
            let method = body.get("method").and_then(Value::as_str).unwrap_or_default();
            let id = body["id"].clone();
            match method {
                "eth_getCode" => (200, serde_json::json!({"jsonrpc":"2.0","id":id,"result": good_prefix})),
                "eth_syncing" => (200, serde_json::json!({"jsonrpc":"2.0","id":id,"result": false})),
                _ => (500, serde_json::json!({"error":"boom"})),
            }
        })
        .await;
        let url_b = spawn_mock(move |body: Value| {
            let method = body.get("method").and_then(Value::as_str).unwrap_or_default();
            let id = body["id"].clone();
            match method {
                "eth_getCode" => (200, serde_json::json!({"jsonrpc":"2.0","id":id,"result": prefix_hex})),
                "eth_syncing" => (200, serde_json::json!({"jsonrpc":"2.0","id":id,"result": false})),
                _ => (200, serde_json::json!({"jsonrpc":"2.0","id":id,"result":"0x64"})),
            }
        })
        .await;

        let dispatcher = build_dispatcher(100, vec![url_a, url_b]);
        let cancel = CancellationToken::new();
        let result =
            dispatcher.send(100, "eth_chainId", serde_json::json!([]), &cancel).await.unwrap();
        assert_eq!(result, Value::String("0x64".to_string()));
    }

    #[tokio::test]
    async fn no_endpoints_when_whitelist_empty() {
        let dispatcher = build_dispatcher(100, vec![]);
        let cancel = CancellationToken::new();
        let err = dispatcher.send(100, "eth_chainId", serde_json::json!([]), &cancel).await.unwrap_err();
        assert!(matches!(err, ProxyError::NoEndpoints(100)));
    }

    #[tokio::test]
    async fn all_endpoints_failed_carries_last_error() {
        let url = spawn_mock(|body: Value| {
            let method = body.get("method").and_then(Value::as_str).unwrap_or_default();
            let id = body["id"].clone();
            match method {
                "eth_getCode" => {
                    let prefix_hex = format!("0x{}", hex::encode(crate::probe::permit2_prefix_for_tests()));
                    (200, serde_json::json!({"jsonrpc":"2.0","id":id,"result": prefix_hex}))
                }
                "eth_syncing" => (200, serde_json::json!({"jsonrpc":"2.0","id":id,"result": false})),
                _ => (200, serde_json::json!({"jsonrpc":"2.0","id":id,"error":{"code":-32601,"message":"method not found"}})),
            }
        })
        .await;

        let dispatcher = build_dispatcher(100, vec![url]);
        let cancel = CancellationToken::new();
        let err = dispatcher.send(100, "eth_call", serde_json::json!([]), &cancel).await.unwrap_err();
        match err {
            ProxyError::AllEndpointsFailed { chain_id, last_error } => {
                assert_eq!(chain_id, 100);
                assert!(matches!(*last_error, ProxyError::Rpc { code: -32601, .. }));
            }
            other => panic!("expected AllEndpointsFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn round_robin_start_advances_across_calls() {
        let prefix_hex = ok_prefix_hex();
        let hits: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let mut urls = Vec::new();
        for label in ["a", "b"] {
            let prefix_hex = prefix_hex.clone();
            let hits = hits.clone();
            let label = label.to_string();
            let url = spawn_mock(move |body: Value| {
                let method = body.get("method").and_then(Value::as_str).unwrap_or_default();
                let id = body["id"].clone();
                match method {
                    "eth_getCode" => (200, serde_json::json!({"jsonrpc":"2.0","id":id,"result": prefix_hex.clone()})),
                    "eth_syncing" => (200, serde_json::json!({"jsonrpc":"2.0","id":id,"result": false})),
                    _ => {
                        hits.lock().push(label.clone());
                        (200, serde_json::json!({"jsonrpc":"2.0","id":id,"result": label}))
                    }
                }
            })
            .await;
            urls.push(url);
        }

        let dispatcher = build_dispatcher(100, urls);
        let cancel = CancellationToken::new();
        let first = dispatcher.send(100, "eth_chainId", serde_json::json!([]), &cancel).await.unwrap();
        let second = dispatcher.send(100, "eth_chainId", serde_json::json!([]), &cancel).await.unwrap();
        assert_ne!(first, second);
    }
}
