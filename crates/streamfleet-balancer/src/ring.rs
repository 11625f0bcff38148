//! Consistent-hash ring.
//!
//! Each physical node occupies `virtual_nodes` hashed positions so a
//! membership change remaps only a small key fraction. Lookup walks to
//! the smallest position at or after the key's hash, wrapping to the
//! ring minimum.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use streamfleet_types::NodeId;

/// Hash a string to a ring position: first 8 bytes of sha256, big-endian.
pub fn hash64(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("sha256 yields 32 bytes"))
}

/// A rebuildable consistent-hash ring over node ids.
#[derive(Debug, Clone)]
pub struct HashRing {
    positions: BTreeMap<u64, NodeId>,
    virtual_nodes: u32,
}

impl HashRing {
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            positions: BTreeMap::new(),
            virtual_nodes: virtual_nodes.max(1),
        }
    }

    /// Rebuild the ring from scratch for the given node set.
    pub fn rebuild(&mut self, node_ids: &[NodeId]) {
        self.positions.clear();
        for id in node_ids {
            for replica in 0..self.virtual_nodes {
                self.positions.insert(hash64(&format!("{id}:{replica}")), id.clone());
            }
        }
    }

    /// Node owning `key`, or `None` on an empty ring.
    pub fn get(&self, key: &str) -> Option<&NodeId> {
        if self.positions.is_empty() {
            return None;
        }
        let h = hash64(key);
        self.positions
            .range(h..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, id)| id)
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Total virtual positions on the ring.
    pub fn len(&self) -> usize {
        self.positions.len()
    }
}
