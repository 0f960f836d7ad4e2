//! Shared data model (spec §3). These types flow between the Prober, the
//! Cache and the Selector and are otherwise inert: nothing here does I/O.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub type ChainId = u64;
pub type Url = String;

/// A closed set of probe outcome tags (spec §3 `ProbeStatus`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Ok,
    WrongBytecode,
    Syncing,
    Timeout,
    HttpError,
    RpcError,
    NetworkError,
}

impl ProbeStatus {
    /// spec §4.4 `ACCEPT = (ok, wrong_bytecode, syncing)`. Index in this
    /// tuple is the ranking's primary key; `None` for hard failures that
    /// can never be selected.
    pub fn accept_rank(&self) -> Option<u8> {
        match self {
            ProbeStatus::Ok => Some(0),
            ProbeStatus::WrongBytecode => Some(1),
            ProbeStatus::Syncing => Some(2),
            ProbeStatus::Timeout
            | ProbeStatus::HttpError
            | ProbeStatus::RpcError
            | ProbeStatus::NetworkError => None,
        }
    }

    pub fn is_acceptable(&self) -> bool {
        self.accept_rank().is_some()
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbeStatus::Ok => "ok",
            ProbeStatus::WrongBytecode => "wrong_bytecode",
            ProbeStatus::Syncing => "syncing",
            ProbeStatus::Timeout => "timeout",
            ProbeStatus::HttpError => "http_error",
            ProbeStatus::RpcError => "rpc_error",
            ProbeStatus::NetworkError => "network_error",
        };
        f.write_str(s)
    }
}

/// spec §3 `ProbeResult`. `latency_ms = None` encodes `+∞`; the invariant
/// `status ∈ hard-fail ⇒ latency = +∞` is enforced by the two constructors
/// below rather than by validating an arbitrary combination later.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub url: Url,
    pub latency_ms: Option<u64>,
    pub status: ProbeStatus,
    pub error_text: Option<String>,
}

impl ProbeResult {
    pub fn measured(url: Url, status: ProbeStatus, latency_ms: u64) -> Self {
        debug_assert!(status.is_acceptable(), "measured() is only for ACCEPT statuses");
        Self { url, latency_ms: Some(latency_ms), status, error_text: None }
    }

    pub fn failed(url: Url, status: ProbeStatus, error_text: impl Into<String>) -> Self {
        debug_assert!(!status.is_acceptable(), "failed() is only for hard-fail statuses");
        Self { url, latency_ms: None, status, error_text: Some(error_text.into()) }
    }
}

/// spec §3 `ChainCacheEntry`. `probe_map` is an `IndexMap` (not `HashMap`)
/// so that `rank_probe_map`'s tie-break can follow probeMap iteration order
/// as inserted by the Prober (spec §4.4), instead of an arbitrary hash order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainCacheEntry {
    pub last_tested_unix_ms: i64,
    pub probe_map: IndexMap<Url, ProbeResult>,
    pub fastest_url: Option<Url>,
}

impl ChainCacheEntry {
    pub fn is_fresh(&self, now_unix_ms: i64, ttl_ms: u64) -> bool {
        now_unix_ms.saturating_sub(self.last_tested_unix_ms) < ttl_ms as i64
    }
}

/// spec §3 `CacheRoot` — the entire root is read and written atomically
/// per update, one JSON document under one KV key.
pub type CacheRoot = HashMap<ChainId, ChainCacheEntry>;

/// spec §4.4 ranking: stable sort by `(ACCEPT rank, latency)`, ties broken
/// by iteration/insertion order. Non-ACCEPT statuses are dropped entirely.
/// `Vec::sort_by` is stable and `IndexMap::values` iterates in insertion
/// order, so two results tied on `(rank, latency)` keep the relative order
/// they were probed/inserted in.
pub fn rank_probe_map(probe_map: &IndexMap<Url, ProbeResult>) -> Vec<Url> {
    let mut ranked: Vec<&ProbeResult> =
        probe_map.values().filter(|r| r.status.is_acceptable()).collect();
    ranked.sort_by(|a, b| {
        let rank_a = a.status.accept_rank().expect("filtered above");
        let rank_b = b.status.accept_rank().expect("filtered above");
        rank_a
            .cmp(&rank_b)
            .then_with(|| a.latency_ms.unwrap_or(u64::MAX).cmp(&b.latency_ms.unwrap_or(u64::MAX)))
    });
    ranked.into_iter().map(|r| r.url.clone()).collect()
}
