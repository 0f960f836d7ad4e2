//! Prober (spec §4.2): for a list of URLs, concurrently run the
//! `eth_getCode`/`eth_syncing` capability probe and classify each URL into
//! a `ProbeResult`.

use futures::stream::{FuturesUnordered, StreamExt};
use once_cell::sync::Lazy;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::data::{ProbeResult, ProbeStatus, Url};

/// Permit2 (`0x000000000022D473030F116dDEE9F6B43aC78BA3`) deployed
/// bytecode prefix, used as a capability witness: an upstream that does
/// not serve this prefix for `eth_getCode` is not trusted as a full,
/// correctly-synced node for this deployment.
static PERMIT2_BYTECODE_PREFIX: Lazy<Vec<u8>> = Lazy::new(|| {
    let hex_str = include_str!("permit2_bytecode.hex");
    hex::decode(hex_str.trim()).expect("embedded permit2 bytecode prefix must be valid hex")
});

const PERMIT2_ADDRESS: &str = "0x000000000022D473030F116dDEE9F6B43aC78BA3";

#[cfg(test)]
pub(crate) fn permit2_prefix_for_tests() -> &'static [u8] {
    &PERMIT2_BYTECODE_PREFIX
}

pub struct Prober {
    client: Client,
    latency_timeout: Duration,
}

impl Prober {
    pub fn new(client: Client, latency_timeout_ms: u64) -> Self {
        Self { client, latency_timeout: Duration::from_millis(latency_timeout_ms) }
    }

    /// Probes every URL concurrently and returns a `url -> ProbeResult`
    /// map. A failure on one URL never short-circuits the others — all
    /// outcomes are collected via a settled join.
    pub async fn probe_all(&self, urls: &[Url]) -> HashMap<Url, ProbeResult> {
        let mut futs: FuturesUnordered<_> = urls
            .iter()
            .map(|url| {
                let url = url.clone();
                async move { (url.clone(), self.probe_one(&url).await) }
            })
            .collect();

        let mut out = HashMap::with_capacity(urls.len());
        while let Some((url, result)) = futs.next().await {
            debug!(url = %url, status = %result.status, latency_ms = ?result.latency_ms, "probe complete");
            out.insert(url, result);
        }
        out
    }

    async fn probe_one(&self, url: &Url) -> ProbeResult {
        let start = Instant::now();
        let epoch_ms = now_unix_ms();

        let get_code_fut = self.call(url, "eth_getCode", json!([PERMIT2_ADDRESS, "latest"]), epoch_ms);
        let syncing_fut = self.call(url, "eth_syncing", json!([]), epoch_ms);

        let deadline = tokio::time::timeout(self.latency_timeout, futures::future::join(get_code_fut, syncing_fut)).await;

        let Ok((get_code, syncing)) = deadline else {
            return ProbeResult::failed(url.clone(), ProbeStatus::Timeout, "latency probe deadline elapsed");
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        classify(url, get_code, syncing, latency_ms)
    }

    async fn call(&self, url: &str, method: &str, params: Value, epoch_ms: u64) -> Result<Value, CallError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": format!("latency-test-{method}-{epoch_ms}"),
        });

        let resp = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CallError::Http(resp.status().as_u16()));
        }

        let value: Value = resp.json().await.map_err(|e| CallError::Network(e.to_string()))?;
        if let Some(error) = value.get("error") {
            return Err(CallError::Rpc(error.to_string()));
        }
        Ok(value)
    }
}

enum CallError {
    Network(String),
    Http(u16),
    Rpc(String),
}

/// Ordered classification (spec §4.2 table) — first matching rule wins.
/// `latency_ms` here is the already-measured URL-level stopwatch value,
/// discarded for hard-fail statuses per the `ProbeResult` invariant.
fn classify(
    url: &str,
    get_code: Result<Value, CallError>,
    syncing: Result<Value, CallError>,
    latency_ms: u64,
) -> ProbeResult {
    for call in [&get_code, &syncing] {
        if let Err(CallError::Network(msg)) = call {
            return ProbeResult::failed(url.to_string(), ProbeStatus::NetworkError, msg.clone());
        }
    }
    for call in [&get_code, &syncing] {
        if let Err(CallError::Http(status)) = call {
            return ProbeResult::failed(url.to_string(), ProbeStatus::HttpError, format!("HTTP {status}"));
        }
    }
    for call in [&get_code, &syncing] {
        if let Err(CallError::Rpc(msg)) = call {
            return ProbeResult::failed(url.to_string(), ProbeStatus::RpcError, msg.clone());
        }
    }

    // Both calls succeeded at the transport/JSON-RPC level past this point.
    let get_code = get_code.unwrap();
    let syncing = syncing.unwrap();

    let syncing_result = syncing.get("result").cloned().unwrap_or(Value::Null);
    if syncing_result != Value::Bool(false) {
        return ProbeResult::measured(url.to_string(), ProbeStatus::Syncing, latency_ms);
    }

    let Some(code_hex) = get_code.get("result").and_then(Value::as_str) else {
        return ProbeResult::measured(url.to_string(), ProbeStatus::WrongBytecode, latency_ms);
    };

    if !has_permit2_prefix(code_hex) {
        return ProbeResult::measured(url.to_string(), ProbeStatus::WrongBytecode, latency_ms);
    }

    ProbeResult::measured(url.to_string(), ProbeStatus::Ok, latency_ms)
}

fn has_permit2_prefix(code_hex: &str) -> bool {
    let trimmed = code_hex.trim_start_matches("0x");
    let Ok(decoded) = hex::decode(trimmed) else {
        return false;
    };
    decoded.starts_with(&PERMIT2_BYTECODE_PREFIX)
}

fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
