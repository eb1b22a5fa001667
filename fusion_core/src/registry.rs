//! Live roster of L1 nodes.
//!
//! The registry tracks which nodes exist, when they were last heard from,
//! and what status they last reported. Eviction of silent nodes happens
//! through [`NodeRegistry::sweep_and_remove`], a single write-locked pass
//! so no observer can see a node as both evicted and active.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::clock::{Clock, SystemClock};
use crate::messages::{NodeIdentity, NodeStatus};

/// The three maps live together in one struct so every mutation updates
/// them under the same lock. An id present in one map is present in all.
#[derive(Default)]
struct RegistryTables {
    nodes: HashMap<String, NodeIdentity>,
    last_seen: HashMap<String, Instant>,
    status: HashMap<String, NodeStatus>,
}

/// Concurrent node roster with atomic timeout-and-evict.
pub struct NodeRegistry {
    tables: RwLock<RegistryTables>,
    clock: Arc<dyn Clock>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Builds a registry reading time from `clock` (tests drive this).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: RwLock::new(RegistryTables::default()),
            clock,
        }
    }

    /// Registers (or re-registers) a node and marks it seen now.
    ///
    /// A node re-registering keeps its last reported status; a brand new
    /// node starts `Online`.
    pub fn register(&self, identity: NodeIdentity) {
        let now = self.clock.now();
        let mut t = self.tables.write();
        let id = identity.node_id.clone();
        t.nodes.insert(id.clone(), identity);
        t.last_seen.insert(id.clone(), now);
        t.status.entry(id).or_insert(NodeStatus::Online);
    }

    /// Refreshes the last-seen stamp for a known node. Unknown ids are
    /// ignored; the subscription path registers senders before touching.
    pub fn touch_heartbeat(&self, node_id: &str) {
        let now = self.clock.now();
        let mut t = self.tables.write();
        if t.nodes.contains_key(node_id) {
            t.last_seen.insert(node_id.to_string(), now);
        }
    }

    /// Records a status report for a known node and marks it seen.
    pub fn update_status(&self, node_id: &str, status: NodeStatus) {
        let now = self.clock.now();
        let mut t = self.tables.write();
        if t.nodes.contains_key(node_id) {
            t.status.insert(node_id.to_string(), status);
            t.last_seen.insert(node_id.to_string(), now);
        }
    }

    /// Ids of nodes heard from within `timeout`.
    pub fn active(&self, timeout: Duration) -> Vec<String> {
        let now = self.clock.now();
        let t = self.tables.read();
        t.last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) < timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn get(&self, node_id: &str) -> Option<NodeIdentity> {
        self.tables.read().nodes.get(node_id).cloned()
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.tables.read().status.get(node_id).copied()
    }

    pub fn all(&self) -> Vec<NodeIdentity> {
        self.tables.read().nodes.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tables.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().nodes.is_empty()
    }

    /// Removes one node from all three maps.
    pub fn remove(&self, node_id: &str) {
        let mut t = self.tables.write();
        t.nodes.remove(node_id);
        t.last_seen.remove(node_id);
        t.status.remove(node_id);
    }

    /// Atomically finds every node silent for at least `timeout`, removes
    /// it from all three maps, and returns the evicted ids.
    ///
    /// Find-and-evict happens under one write lock. A read-then-write
    /// split would race against heartbeats arriving in between and evict
    /// nodes that just came back.
    pub fn sweep_and_remove(&self, timeout: Duration) -> Vec<String> {
        let now = self.clock.now();
        let mut t = self.tables.write();

        let evicted: Vec<String> = t
            .last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &evicted {
            t.nodes.remove(id);
            t.last_seen.remove(id);
            t.status.remove(id);
        }

        evicted
    }

    /// Checks the all-three-or-none map invariant. Test support.
    #[doc(hidden)]
    pub fn is_consistent(&self) -> bool {
        let t = self.tables.read();
        t.nodes.len() == t.last_seen.len()
            && t.nodes.len() == t.status.len()
            && t.nodes
                .keys()
                .all(|id| t.last_seen.contains_key(id) && t.status.contains_key(id))
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::messages::NodeType;

    fn identity(id: &str) -> NodeIdentity {
        NodeIdentity::new(id, NodeType::Radar)
    }

    #[test]
    fn register_and_lookup() {
        let reg = NodeRegistry::new();
        reg.register(identity("radar_001").with_location("north"));

        let node = reg.get("radar_001").unwrap();
        assert_eq!(node.location, "north");
        assert_eq!(reg.status_of("radar_001"), Some(NodeStatus::Online));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn reregistration_overwrites_identity_but_keeps_status() {
        let reg = NodeRegistry::new();
        reg.register(identity("a"));
        reg.update_status("a", NodeStatus::Degraded);

        reg.register(identity("a").with_location("moved"));
        assert_eq!(reg.get("a").unwrap().location, "moved");
        assert_eq!(reg.status_of("a"), Some(NodeStatus::Degraded));
    }

    #[test]
    fn heartbeat_on_unknown_node_is_ignored() {
        let reg = NodeRegistry::new();
        reg.touch_heartbeat("ghost");
        reg.update_status("ghost", NodeStatus::Online);
        assert!(reg.is_empty());
        assert!(reg.is_consistent());
    }

    #[test]
    fn sweep_evicts_only_silent_nodes() {
        let clock = ManualClock::new();
        let reg = NodeRegistry::with_clock(clock.clone());
        let timeout = Duration::from_secs(30);

        reg.register(identity("a"));
        reg.register(identity("b"));

        // A keeps talking, B goes silent.
        clock.advance(Duration::from_secs(20));
        reg.touch_heartbeat("a");
        clock.advance(Duration::from_secs(15));

        let evicted = reg.sweep_and_remove(timeout);
        assert_eq!(evicted, vec!["b".to_string()]);
        assert_eq!(reg.active(timeout), vec!["a".to_string()]);

        // Second sweep reports nothing new.
        assert!(reg.sweep_and_remove(timeout).is_empty());
        assert!(reg.is_consistent());
    }

    #[test]
    fn evicted_node_is_never_active_afterwards() {
        let clock = ManualClock::new();
        let reg = NodeRegistry::with_clock(clock.clone());
        reg.register(identity("x"));
        clock.advance(Duration::from_secs(31));

        let evicted = reg.sweep_and_remove(Duration::from_secs(30));
        assert_eq!(evicted, vec!["x".to_string()]);
        assert!(reg.active(Duration::from_secs(30)).is_empty());
        assert!(reg.get("x").is_none());
    }

    #[test]
    fn maps_stay_consistent_under_random_operations() {
        use rand::Rng;

        let clock = ManualClock::new();
        let reg = NodeRegistry::with_clock(clock.clone());
        let mut rng = rand::thread_rng();
        let ids = ["a", "b", "c", "d", "e"];

        for _ in 0..2_000 {
            let id = ids[rng.gen_range(0..ids.len())];
            match rng.gen_range(0..5) {
                0 => reg.register(identity(id)),
                1 => reg.touch_heartbeat(id),
                2 => reg.update_status(id, NodeStatus::Degraded),
                3 => reg.remove(id),
                _ => {
                    clock.advance(Duration::from_millis(rng.gen_range(0..5_000)));
                    let _ = reg.sweep_and_remove(Duration::from_secs(10));
                }
            }
            assert!(reg.is_consistent());
        }
    }
}
