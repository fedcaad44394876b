//! Block and flowgraph metadata registry
//!
//! One process-wide [`Store`] behind [`Store::global`]. Filtered listings are
//! cached per kind and keyed by the last filter string.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub title: String,
    pub summary: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowgraphMetadata {
    pub title: String,
    pub description: String,
}

/// Last filter and what it matched.
#[derive(Debug)]
struct FilterCache<T> {
    filter: Option<String>,
    hits: BTreeMap<String, T>,
}

impl<T> Default for FilterCache<T> {
    fn default() -> Self {
        Self {
            filter: None,
            hits: BTreeMap::new(),
        }
    }
}

impl<T: Clone> FilterCache<T> {
    /// An empty result is never trusted, so it is recomputed on every call.
    fn lookup<'a, F>(&'a mut self, filter: &str, all: &BTreeMap<String, T>, matches: F) -> &'a BTreeMap<String, T>
    where
        F: Fn(&T, &str) -> bool,
    {
        let fresh = self.filter.as_deref() == Some(filter) && !self.hits.is_empty();
        if !fresh {
            let needle = filter.to_lowercase();
            self.hits = all
                .iter()
                .filter(|(_, value)| matches(value, &needle))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            self.filter = Some(filter.to_string());
        }
        &self.hits
    }

    fn invalidate(&mut self) {
        self.filter = None;
        self.hits.clear();
    }
}

fn contains_folded(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

#[derive(Debug, Default)]
pub struct Store {
    blocks: BTreeMap<String, BlockMetadata>,
    flowgraphs: BTreeMap<String, FlowgraphMetadata>,
    block_cache: FilterCache<BlockMetadata>,
    flowgraph_cache: FilterCache<FlowgraphMetadata>,
}

static STORE: Lazy<RwLock<Store>> = Lazy::new(|| RwLock::new(Store::new()));

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static RwLock<Store> {
        &STORE
    }

    /// Replaces any previous entry under `key`.
    pub fn register_block(&mut self, key: impl Into<String>, metadata: BlockMetadata) {
        let key = key.into();
        debug!("Registering block '{key}'.");
        self.blocks.insert(key, metadata);
        self.block_cache.invalidate();
    }

    pub fn register_flowgraph(&mut self, key: impl Into<String>, metadata: FlowgraphMetadata) {
        let key = key.into();
        debug!("Registering flowgraph '{key}'.");
        self.flowgraphs.insert(key, metadata);
        self.flowgraph_cache.invalidate();
    }

    pub fn block(&self, key: &str) -> Option<&BlockMetadata> {
        self.blocks.get(key)
    }

    pub fn flowgraph(&self, key: &str) -> Option<&FlowgraphMetadata> {
        self.flowgraphs.get(key)
    }

    /// Blocks whose title, summary or description contains `filter`,
    /// ignoring case. An empty filter lists everything.
    pub fn blocks(&mut self, filter: &str) -> &BTreeMap<String, BlockMetadata> {
        self.block_cache.lookup(filter, &self.blocks, |block, needle| {
            needle.is_empty()
                || contains_folded(&block.title, needle)
                || contains_folded(&block.summary, needle)
                || contains_folded(&block.description, needle)
        })
    }

    /// Flowgraphs whose title or description contains `filter`, ignoring case.
    pub fn flowgraphs(&mut self, filter: &str) -> &BTreeMap<String, FlowgraphMetadata> {
        self.flowgraph_cache.lookup(filter, &self.flowgraphs, |flowgraph, needle| {
            contains_folded(&flowgraph.title, needle) || contains_folded(&flowgraph.description, needle)
        })
    }
}
