//! Weighted consistent-hash ring.
//!
//! Each member is placed on the ring as `replicas` virtual entries, hashed
//! from `"<canonical>_virtual<i>"`. A lookup hashes the key, binary-searches
//! the sorted replica array for the first hash at or after it (wrapping at
//! the end), and returns the member owning that slot. Two members whose
//! virtual entries collide share a slot; a secondary hash over
//! `"<prime>:<key>"` picks deterministically among them.
//!
//! Membership changes move as few keys as possible: adding a node relocates
//! roughly `1/N` of the keyspace onto it, removing a node relocates only the
//! keys it owned.
//!
//! The ring is internally synchronized: lookups take a read lock, mutations
//! a write lock.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::constants::{COLLISION_PRIME, MIN_REPLICAS, TOP_WEIGHT};

/// The hash method used for ring placement and lookup.
pub type HashFn = fn(&[u8]) -> u64;

/// Default 64-bit hash (XxHash64 with a zero seed).
pub fn hash(data: &[u8]) -> u64 {
    twox_hash::XxHash64::oneshot(0, data)
}

/// A value that can live on the ring.
///
/// Members need a canonical string form that is stable for the lifetime of
/// the process; placement and removal both derive replica positions from it.
pub trait RingNode: Clone + Send + Sync {
    /// Stable canonical representation of this member.
    fn canonical(&self) -> String;
}

impl RingNode for String {
    fn canonical(&self) -> String {
        self.clone()
    }
}

struct RingState<N> {
    /// Sorted replica hashes. Collisions appear once per colliding member.
    keys: Vec<u64>,
    /// Replica hash to the members occupying that slot.
    ring: HashMap<u64, Vec<N>>,
    /// Canonical identifiers of current members.
    nodes: HashSet<String>,
}

/// A weighted consistent-hash ring.
pub struct HashRing<N> {
    hash_fn: HashFn,
    replicas: usize,
    state: RwLock<RingState<N>>,
}

impl<N: RingNode> Default for HashRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: RingNode> HashRing<N> {
    /// Create a ring with the default replica factor and hash.
    pub fn new() -> Self {
        Self::with_config(MIN_REPLICAS, hash)
    }

    /// Create a ring with a custom replica factor and hash function.
    ///
    /// The replica factor is raised to the minimum if a smaller value is
    /// given.
    pub fn with_config(replicas: usize, hash_fn: HashFn) -> Self {
        Self {
            hash_fn,
            replicas: replicas.max(MIN_REPLICAS),
            state: RwLock::new(RingState {
                keys: Vec::new(),
                ring: HashMap::new(),
                nodes: HashSet::new(),
            }),
        }
    }

    /// The configured replica factor.
    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Add a node with the full replica factor.
    ///
    /// A later call for the same node overwrites its earlier placement.
    pub fn add(&self, node: N) {
        self.add_with_replicas(node, self.replicas);
    }

    /// Add a node with an explicit replica count, truncated to the ring's
    /// replica factor.
    pub fn add_with_replicas(&self, node: N, replicas: usize) {
        self.remove(&node);

        let replicas = replicas.min(self.replicas);
        let canonical = node.canonical();

        let mut state = self.state.write().expect("ring lock poisoned");
        state.nodes.insert(canonical.clone());

        for i in 0..replicas {
            let h = (self.hash_fn)(replica_repr(&canonical, i).as_bytes());
            state.keys.push(h);
            state.ring.entry(h).or_default().push(node.clone());
        }

        state.keys.sort_unstable();
    }

    /// Add a node with a weight between 1 and 100, interpreted as a
    /// percentage of the full replica factor.
    pub fn add_with_weight(&self, node: N, weight: usize) {
        // add_with_replicas truncates above; only the floor needs guarding.
        let replicas = self.replicas * weight.max(1) / TOP_WEIGHT;
        self.add_with_replicas(node, replicas);
    }

    /// Return the member owning `v`, or `None` for an empty ring.
    pub fn get(&self, v: &str) -> Option<N> {
        let state = self.state.read().expect("ring lock poisoned");
        if state.keys.is_empty() {
            return None;
        }

        let h = (self.hash_fn)(v.as_bytes());
        let index = state.keys.partition_point(|&k| k < h) % state.keys.len();

        let slot = state.ring.get(&state.keys[index])?;
        match slot.len() {
            0 => None,
            1 => Some(slot[0].clone()),
            n => {
                let inner = (self.hash_fn)(inner_repr(v).as_bytes());
                Some(slot[inner as usize % n].clone())
            }
        }
    }

    /// Remove a node and all of its replica positions.
    ///
    /// Ownership of every other member's keys is unchanged.
    pub fn remove(&self, node: &N) {
        let canonical = node.canonical();

        let mut state = self.state.write().expect("ring lock poisoned");
        if !state.nodes.contains(&canonical) {
            return;
        }

        for i in 0..self.replicas {
            let h = (self.hash_fn)(replica_repr(&canonical, i).as_bytes());
            let index = state.keys.partition_point(|&k| k < h);
            if index < state.keys.len() && state.keys[index] == h {
                state.keys.remove(index);
            }

            let slot_emptied = state.ring.get_mut(&h).is_some_and(|slot| {
                slot.retain(|n| n.canonical() != canonical);
                slot.is_empty()
            });
            if slot_emptied {
                state.ring.remove(&h);
            }
        }

        state.nodes.remove(&canonical);
    }

    /// All distinct members currently on the ring.
    pub fn all_nodes(&self) -> Vec<N> {
        let state = self.state.read().expect("ring lock poisoned");
        let mut seen = HashSet::with_capacity(state.nodes.len());
        let mut out = Vec::with_capacity(state.nodes.len());
        for slot in state.ring.values() {
            for node in slot {
                if seen.insert(node.canonical()) {
                    out.push(node.clone());
                }
            }
        }
        out
    }

    /// Number of distinct members on the ring.
    pub fn nodes_count(&self) -> usize {
        self.state.read().expect("ring lock poisoned").nodes.len()
    }

    /// Whether a member with this canonical form is on the ring.
    pub fn contains(&self, canonical: &str) -> bool {
        self.state
            .read()
            .expect("ring lock poisoned")
            .nodes
            .contains(canonical)
    }
}

impl<N: RingNode> std::fmt::Debug for HashRing<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().expect("ring lock poisoned");
        f.debug_struct("HashRing")
            .field("replicas", &self.replicas)
            .field("members", &state.nodes.len())
            .field("slots", &state.keys.len())
            .finish()
    }
}

fn replica_repr(canonical: &str, replica: usize) -> String {
    format!("{canonical}_virtual{replica}")
}

fn inner_repr(v: &str) -> String {
    format!("{COLLISION_PRIME}:{v}")
}
