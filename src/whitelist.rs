//! Whitelist Provider (spec §4.1): a read-only `chainId -> [url]` mapping,
//! filtered once at construction and never mutated again.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::data::{ChainId, Url};

/// Wire shape of the whitelist document (spec §6):
/// `{ "rpcs": { "<chainId>": ["https://...", ...] } }`. `IndexMap` (not
/// `HashMap`) so `chain_ids()` can preserve first-seen document order
/// (SPEC_FULL.md's Whitelist Provider addition) instead of an arbitrary
/// hash order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WhitelistSource {
    pub rpcs: IndexMap<String, Vec<String>>,
}

pub struct Whitelist {
    urls: HashMap<ChainId, Vec<Url>>,
    chain_order: Vec<ChainId>,
}

impl Whitelist {
    pub fn from_source(source: WhitelistSource) -> Self {
        let mut urls = HashMap::new();
        let mut chain_order = Vec::new();
        for (chain_str, list) in source.rpcs {
            let Ok(chain_id) = chain_str.parse::<ChainId>() else {
                tracing::warn!(chain = %chain_str, "ignoring whitelist entry with non-numeric chain id");
                continue;
            };
            let filtered: Vec<Url> = list.into_iter().filter(|u| is_allowed_url(u)).collect();
            chain_order.push(chain_id);
            urls.insert(chain_id, filtered);
        }
        Self { urls, chain_order }
    }

    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let source: WhitelistSource = serde_json::from_str(&content)?;
        Ok(Self::from_source(source))
    }

    /// Returns the (possibly empty) slice for `chain_id` in insertion order.
    /// Empty is not an error.
    pub fn urls_for(&self, chain_id: ChainId) -> &[Url] {
        self.urls.get(&chain_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Chain ids in the order they were first seen in the source document
    /// (SPEC_FULL.md's Whitelist Provider addition), not numeric order.
    pub fn chain_ids(&self) -> &[ChainId] {
        &self.chain_order
    }
}

#[cfg(test)]
impl Whitelist {
    /// Test-only constructor that skips the `https://` filter so unit
    /// tests can point the Selector/Prober at a local plain-HTTP mock.
    pub(crate) fn from_source_unfiltered_for_tests(source: WhitelistSource) -> Self {
        let mut urls = HashMap::new();
        let mut chain_order = Vec::new();
        for (chain_str, list) in source.rpcs {
            let chain_id = chain_str.parse::<ChainId>().expect("test chain ids are numeric");
            chain_order.push(chain_id);
            urls.insert(chain_id, list);
        }
        Self { urls, chain_order }
    }
}

/// A URL survives filtering only if it starts with `https://` and carries
/// no unresolved `${...}` placeholder (spec §4.1/§3).
fn is_allowed_url(url: &str) -> bool {
    url.starts_with("https://") && !url.contains("${")
}
