//! Mutable execution context shared by the manager and the algorithm.
//!
//! Everything an algorithm is allowed to mutate lives here: inbound
//! message bookkeeping, a typed key-value scratch store, and the queue of
//! outbound messages waiting to be published. The manager serializes all
//! access behind its context lock; the algorithm never sees the context
//! from two calls at once.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::messages::{L1ToL2Message, L2ToL1Message};

/// Per-node history keeps at most this many messages...
const HISTORY_SOFT_CAP: usize = 100;
/// ...and sheds the oldest this many in one splice when it overflows.
const HISTORY_TRIM: usize = 50;

/// State bag handed to every algorithm hook.
pub struct AlgorithmContext {
    /// Name of the algorithm machine's current state, mirrored here after
    /// every transition so observers (stats, fusion results) can read it
    /// without touching the machine.
    pub current_state_name: String,

    /// Most recent message per node.
    latest_messages: HashMap<String, L1ToL2Message>,

    /// Bounded per-node message history.
    message_history: HashMap<String, Vec<L1ToL2Message>>,

    /// Algorithm-owned typed storage. Retrieval with the wrong type
    /// behaves like absence.
    data: HashMap<String, Box<dyn Any + Send + Sync>>,

    /// Outbound messages appended by the algorithm, drained by the
    /// manager after each call returns.
    pending_outputs: Vec<L2ToL1Message>,

    /// When `update` last ran.
    pub last_update: Instant,

    /// Cadence of the periodic `update` call.
    pub update_interval: Duration,

    clock: Arc<dyn Clock>,
}

impl AlgorithmContext {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            current_state_name: String::new(),
            latest_messages: HashMap::new(),
            message_history: HashMap::new(),
            data: HashMap::new(),
            pending_outputs: Vec::new(),
            last_update: now,
            update_interval: Duration::from_millis(100),
            clock,
        }
    }

    /// Current instant from the injected clock.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    // ------------------------------------------------------------------
    // Inbound bookkeeping
    // ------------------------------------------------------------------

    /// Records an inbound message as both the node's latest and in its
    /// history, trimming the history when it outgrows the soft cap.
    pub fn record_message(&mut self, message: L1ToL2Message) {
        let node_id = message.sender.node_id.clone();
        let history = self.message_history.entry(node_id.clone()).or_default();
        history.push(message.clone());
        if history.len() > HISTORY_SOFT_CAP {
            history.drain(..HISTORY_TRIM);
        }
        self.latest_messages.insert(node_id, message);
    }

    pub fn latest_from_node(&self, node_id: &str) -> Option<&L1ToL2Message> {
        self.latest_messages.get(node_id)
    }

    pub fn messages_from_node(&self, node_id: &str) -> &[L1ToL2Message] {
        self.message_history
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    // ------------------------------------------------------------------
    // Typed key-value store
    // ------------------------------------------------------------------

    pub fn set_data<T: Send + Sync + 'static>(&mut self, key: impl Into<String>, value: T) {
        self.data.insert(key.into(), Box::new(value));
    }

    /// Returns the stored value, or `None` when the key is absent *or*
    /// stored under a different type.
    pub fn get_data<T: 'static>(&self, key: &str) -> Option<&T> {
        self.data.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_data_mut<T: 'static>(&mut self, key: &str) -> Option<&mut T> {
        self.data.get_mut(key).and_then(|v| v.downcast_mut::<T>())
    }

    pub fn remove_data(&mut self, key: &str) {
        self.data.remove(key);
    }

    // ------------------------------------------------------------------
    // Outbound queue
    // ------------------------------------------------------------------

    /// Appends a message for publication after the current call returns.
    pub fn add_output(&mut self, message: L2ToL1Message) {
        self.pending_outputs.push(message);
    }

    /// Moves all pending outputs out, in append order.
    pub fn drain_outputs(&mut self) -> Vec<L2ToL1Message> {
        std::mem::take(&mut self.pending_outputs)
    }

    pub fn pending_output_count(&self) -> usize {
        self.pending_outputs.len()
    }
}

impl Default for AlgorithmContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{
        Heartbeat, L1Payload, L2Payload, NodeIdentity, NodeType, SystemCommand,
    };
    use std::collections::BTreeMap;

    fn heartbeat_msg(node: &str, n: u64) -> L1ToL2Message {
        L1ToL2Message {
            message_id: format!("{node}_{n}"),
            sender: NodeIdentity::new(node, NodeType::Imu),
            timestamp_ms: n,
            payload: L1Payload::Heartbeat(Heartbeat {
                node_id: node.into(),
                timestamp_ms: n,
                status_info: BTreeMap::new(),
            }),
        }
    }

    #[test]
    fn typed_store_misses_on_wrong_type() {
        let mut ctx = AlgorithmContext::new();
        ctx.set_data("count", 3_usize);

        assert_eq!(ctx.get_data::<usize>("count"), Some(&3));
        assert!(ctx.get_data::<String>("count").is_none());
        assert!(ctx.get_data::<usize>("missing").is_none());
    }

    #[test]
    fn overwrite_changes_the_stored_type() {
        let mut ctx = AlgorithmContext::new();
        ctx.set_data("k", 1_u32);
        ctx.set_data("k", "text".to_string());

        assert!(ctx.get_data::<u32>("k").is_none());
        assert_eq!(ctx.get_data::<String>("k").map(String::as_str), Some("text"));
    }

    #[test]
    fn history_trims_oldest_fifty_past_the_cap() {
        let mut ctx = AlgorithmContext::new();
        for n in 0..101 {
            ctx.record_message(heartbeat_msg("imu_001", n));
        }

        let history = ctx.messages_from_node("imu_001");
        assert_eq!(history.len(), 51);
        // Oldest 50 are gone; history now starts at message 50.
        assert_eq!(history[0].timestamp_ms, 50);
        assert_eq!(history.last().unwrap().timestamp_ms, 100);
        assert_eq!(ctx.latest_from_node("imu_001").unwrap().timestamp_ms, 100);
    }

    #[test]
    fn drain_outputs_moves_in_append_order() {
        let mut ctx = AlgorithmContext::new();
        for i in 0..3 {
            ctx.add_output(L2ToL1Message::broadcast(
                format!("L2_{i}"),
                i,
                L2Payload::System(SystemCommand::SyncTime),
            ));
        }

        let drained = ctx.drain_outputs();
        assert_eq!(
            drained.iter().map(|m| m.message_id.as_str()).collect::<Vec<_>>(),
            vec!["L2_0", "L2_1", "L2_2"]
        );
        assert_eq!(ctx.pending_output_count(), 0);
    }
}
