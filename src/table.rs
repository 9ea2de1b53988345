//! In-memory mapping state
//!
//! Two independent maps keyed by external port:
//! - `local` - mappings this process created and must remove
//! - `mirror` - snapshot of what the gateway last reported, replaced wholesale

use crate::types::{IpProtocol, PortMapping};
use std::collections::BTreeMap;

/// Local and mirrored mapping tables
#[derive(Debug, Default, Clone)]
pub struct MappingTable {
    local: BTreeMap<u16, PortMapping>,
    mirror: BTreeMap<u16, PortMapping>,
}

impl MappingTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `port` is a key in neither map
    pub fn is_free(&self, port: u16) -> bool {
        !self.local.contains_key(&port) && !self.mirror.contains_key(&port)
    }

    /// Record a confirmed mapping; replaces any entry on the same port
    pub fn insert_local(&mut self, mapping: PortMapping) -> Option<PortMapping> {
        self.local.insert(mapping.external_port, mapping)
    }

    /// Look up a mapping this process owns
    pub fn local(&self, external_port: u16) -> Option<&PortMapping> {
        self.local.get(&external_port)
    }

    /// Forget a mapping this process owns
    pub fn remove_local(&mut self, external_port: u16) -> Option<PortMapping> {
        self.local.remove(&external_port)
    }

    /// Take every local mapping, leaving `local` empty
    pub fn drain_local(&mut self) -> Vec<PortMapping> {
        std::mem::take(&mut self.local).into_values().collect()
    }

    /// Replace the mirror with the UDP subset of `mappings`
    ///
    /// Returns the number of entries kept.
    pub fn replace_mirror<I>(&mut self, mappings: I) -> usize
    where
        I: IntoIterator<Item = PortMapping>,
    {
        self.mirror = mappings
            .into_iter()
            .filter(|m| m.protocol == IpProtocol::UDP)
            .map(|m| (m.external_port, m))
            .collect();
        self.mirror.len()
    }

    /// Mirror entry for `external_port`
    pub fn mirrored(&self, external_port: u16) -> Option<&PortMapping> {
        self.mirror.get(&external_port)
    }

    /// Snapshot of `local`, ordered by external port
    pub fn local_mappings(&self) -> Vec<PortMapping> {
        self.local.values().cloned().collect()
    }

    /// Snapshot of `mirror`, ordered by external port
    pub fn mirror_mappings(&self) -> Vec<PortMapping> {
        self.mirror.values().cloned().collect()
    }

    /// Number of local mappings
    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    /// Number of mirrored mappings
    pub fn mirror_len(&self) -> usize {
        self.mirror.len()
    }

    /// Drop both maps
    pub fn clear(&mut self) {
        self.local.clear();
        self.mirror.clear();
    }
}
