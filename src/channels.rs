//! Channel-name to channel-identifier lookup.
//!
//! The mapping is a capability injected into the loader and the enricher so
//! it can be extended (or backed by a lookup service) without touching either.

use std::collections::BTreeMap;

pub trait ChannelResolver: Send + Sync {
    /// Identifier for a channel name, or `None` when the channel is unknown.
    fn resolve(&self, channel_name: &str) -> Option<String>;
}

/// Resolver over a fixed table, normally the `[channels]` config section.
#[derive(Debug, Clone, Default)]
pub struct StaticChannelMap {
    entries: BTreeMap<String, String>,
}

impl StaticChannelMap {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StaticChannelMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl ChannelResolver for StaticChannelMap {
    fn resolve(&self, channel_name: &str) -> Option<String> {
        self.entries.get(channel_name).cloned()
    }
}
