use super::hash::{RingDigest, RingPosition};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// One `node_list` entry as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub address: String,
    pub name: Option<String>,
}

/// Where an incoming node list came from. Servers derive the hashed name
/// from the address; clients receive already-derived names and use them
/// verbatim. Mixing the two on one list would shift every ring position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    Server,
    Client,
}

#[derive(Debug, Clone)]
struct RingNode {
    address: String,
    name: String,
    position: RingPosition,
}

struct TableState {
    nodes: Vec<RingNode>,
    self_index: Option<usize>,
}

/// The cluster membership table: nodes sorted ascending by ring position.
///
/// One mutex guards all state; every reader and mutator takes it for a short,
/// allocation-light critical section.
pub struct RingTable {
    digest: RingDigest,
    hash_port: bool,
    self_address: Arc<str>,
    state: Mutex<TableState>,
}

impl RingTable {
    /// Creates a one-element table containing this server.
    pub fn new(digest: RingDigest, hash_port: bool, self_address: &str) -> Self {
        let table = RingTable {
            digest,
            hash_port,
            self_address: Arc::from(self_address),
            state: Mutex::new(TableState {
                nodes: Vec::new(),
                self_index: None,
            }),
        };
        table.update(
            &[NodeEntry {
                address: self_address.to_string(),
                name: None,
            }],
            UpdateSource::Server,
        );
        table
    }

    /// The refcounted handle on this server's address. Dispatchers clone it
    /// before a lookup and hold the clone until they have responded.
    pub fn self_address(&self) -> Arc<str> {
        Arc::clone(&self.self_address)
    }

    /// This server's entry with its derived name, for merging into a
    /// snapshot fetched from a peer.
    pub fn self_entry(&self) -> NodeEntry {
        NodeEntry {
            address: self.self_address.to_string(),
            name: Some(self.derive_name(&self.self_address, None)),
        }
    }

    /// Derives the hashed name for a server-sourced entry: the address with
    /// its port suffix stripped (unless port hashing is on), then `:`, then
    /// the advertised name.
    fn derive_name(&self, address: &str, name: Option<&str>) -> String {
        let mut base = address;
        if !self.hash_port
            && let Some(colon) = address.rfind(':')
        {
            base = &address[..colon];
        }
        format!("{}:{}", base, name.unwrap_or(""))
    }

    /// Atomically replaces the table contents.
    pub fn update(&self, list: &[NodeEntry], source: UpdateSource) {
        let mut nodes: Vec<RingNode> = list
            .iter()
            .map(|entry| {
                let name = match source {
                    UpdateSource::Server => {
                        self.derive_name(&entry.address, entry.name.as_deref())
                    }
                    UpdateSource::Client => entry.name.clone().unwrap_or_default(),
                };
                let position = self.digest.position(name.as_bytes());
                RingNode {
                    address: entry.address.clone(),
                    name,
                    position,
                }
            })
            .collect();
        nodes.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then_with(|| a.address.cmp(&b.address))
        });

        let self_index = nodes
            .iter()
            .position(|n| n.address.as_str() == self.self_address.as_ref());
        if self_index.is_none() {
            warn!(self_address = %self.self_address, "ring update: no self server");
        }

        let mut state = self.state.lock();
        state.nodes = nodes;
        state.self_index = self_index;
    }

    /// Removes one node by address; idempotent after the first call.
    pub fn remove(&self, address: &str) {
        let mut state = self.state.lock();
        let Some(i) = state.nodes.iter().position(|n| n.address == address) else {
            return;
        };
        state.nodes.remove(i);
        if state.nodes.is_empty() {
            warn!("ring remove: no server left");
        }
        state.self_index = state
            .nodes
            .iter()
            .position(|n| n.address.as_str() == self.self_address.as_ref());
    }

    /// Deep-copy snapshot for answering `node_list` requests. The returned
    /// names are the derived (hashed) names, to be consumed verbatim.
    pub fn snapshot(&self) -> Vec<NodeEntry> {
        let state = self.state.lock();
        state
            .nodes
            .iter()
            .map(|n| NodeEntry {
                address: n.address.clone(),
                name: Some(n.name.clone()),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True iff `key` hashes into this server's arc.
    ///
    /// With self at index `i > 0` the arc is `(nodes[i-1], nodes[i]]`; at
    /// index 0 it wraps around the top of the ring. An absent self (not in
    /// the table) serves everything, as does a single-node table.
    pub fn is_in_charge(&self, key: &[u8]) -> bool {
        let pos = self.digest.position(key);
        let state = self.state.lock();
        match state.self_index {
            Some(i) if i > 0 => {
                state.nodes[i - 1].position < pos && pos <= state.nodes[i].position
            }
            Some(_) => {
                let last = state.nodes.len() - 1;
                state.nodes[last].position < pos || pos <= state.nodes[0].position
            }
            None => true,
        }
    }

    /// Returns the address of the owner of `key`, or `None` when the table
    /// is empty (no owner available).
    ///
    /// Small tables are scanned linearly so they pay no binary-search
    /// overhead; both strategies pick the first node at or after the key's
    /// position, wrapping to index 0.
    pub fn lookup(&self, key: &[u8]) -> Option<String> {
        let pos = self.digest.position(key);
        let state = self.state.lock();
        let n = state.nodes.len();
        if n == 0 {
            return None;
        }
        let i = if n < 7 {
            match state.nodes.iter().position(|node| node.position >= pos) {
                Some(i) => i,
                None => 0,
            }
        } else {
            let i = state.nodes.partition_point(|node| node.position < pos);
            if i == n { 0 } else { i }
        };
        Some(state.nodes[i].address.clone())
    }

    /// True iff this server's address sorts after every other member: the
    /// tail of the address order drives re-election.
    pub fn is_coordinator(&self) -> bool {
        let state = self.state.lock();
        !state
            .nodes
            .iter()
            .any(|n| self.self_address.as_ref() < n.address.as_str())
    }
}
