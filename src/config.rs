use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf};

use crate::whitelist::WhitelistSource;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_server")]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    /// Path to the whitelist JSON document, relative to the config file's
    /// own directory when not absolute.
    #[serde(default)]
    pub whitelist_path: Option<PathBuf>,
    /// Inline whitelist; overrides `whitelist_path` when present (spec §6
    /// `initialRpcData`).
    #[serde(default)]
    pub initial_rpc_data: Option<WhitelistSource>,
}

fn default_server() -> ServerConfig {
    ServerConfig { bind_addr: "0.0.0.0".to_string(), port: 8787 }
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    None,
}

fn default_log_level() -> LogLevel {
    LogLevel::Warn
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::None => "off",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_cache_key")]
    pub cache_key: String,
    #[serde(default)]
    pub disable: bool,
    /// When set, `Cache` backs onto an embedded `sled` database at this
    /// path instead of the in-process `MemoryStore`.
    #[serde(default)]
    pub sled_path: Option<PathBuf>,
}

fn default_cache_ttl_ms() -> u64 {
    3_600_000
}
fn default_cache_key() -> String {
    "permit2RpcManagerCache".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_cache_ttl_ms(),
            cache_key: default_cache_key(),
            disable: false,
            sled_path: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_latency_timeout_ms")]
    pub latency_timeout_ms: u64,
}

fn default_latency_timeout_ms() -> u64 {
    5_000
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self { latency_timeout_ms: default_latency_timeout_ms() }
    }
}

impl Config {
    pub fn load_from_path(path: &PathBuf) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut cfg: Self = serde_yaml::from_str(&content)?;
        apply_env_overrides(&mut cfg);
        Ok(cfg)
    }
}

pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(addr) = env::var("RPC_GATEWAY_HTTP_ADDR") {
        cfg.server.bind_addr = addr;
    }
    if let Ok(port) = env::var("RPC_GATEWAY_HTTP_PORT") {
        if let Ok(p) = port.parse::<u16>() {
            cfg.server.port = p;
        }
    }
    if let Ok(ms) = env::var("RPC_GATEWAY_REQUEST_TIMEOUT_MS") {
        if let Ok(v) = ms.parse::<u64>() {
            cfg.request_timeout_ms = v.max(1);
        }
    }
    if let Ok(ms) = env::var("RPC_GATEWAY_LATENCY_TIMEOUT_MS") {
        if let Ok(v) = ms.parse::<u64>() {
            cfg.probe.latency_timeout_ms = v.max(1);
        }
    }
    if let Ok(ms) = env::var("RPC_GATEWAY_CACHE_TTL_MS") {
        if let Ok(v) = ms.parse::<u64>() {
            cfg.cache.ttl_ms = v;
        }
    }
    // spec §3/§4.3: DISABLE_RPC_CACHE ∈ {"true","1"} disables the cache
    // regardless of what `cache.disable` said in the file.
    if let Ok(v) = env::var("DISABLE_RPC_CACHE") {
        if v == "true" || v == "1" {
            cfg.cache.disable = true;
        }
    }
}
