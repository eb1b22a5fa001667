//! Transport abstraction over the pub/sub message bus.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::BusError;

/// Callback invoked for every message delivered on a subscribed topic.
///
/// Handlers run on the subscription task, in arrival order. They must not
/// block for long; heavy work belongs behind a queue.
pub type MessageHandler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Abstraction for pub/sub I/O between the L2 coordinator and L1 nodes.
///
/// # Implementations
///
/// - **Production**: [`RedisBus`](crate::RedisBus) over Redis pub/sub
/// - **Tests/demos**: [`LocalBus`](crate::LocalBus), an in-process topic map
///
/// Payloads are opaque byte strings; callers pick a stable encoding.
///
/// # Message Flow
///
/// ```text
/// L1 node                     Bus                      L2 coordinator
///   |                          |                            |
///   |-- publish(l1_to_l2) ---->|                            |
///   |                          |-- handler(payload) ------->|
///   |                          |                            |
///   |<------- publish(l2_to_l1, payload) -------------------|
/// ```
#[async_trait]
pub trait BusTransport: Send + Sync + 'static {
    /// Publishes a payload on a named topic.
    ///
    /// Concurrent publish calls are serialized internally; the underlying
    /// connection is not safe for concurrent use.
    ///
    /// # Returns
    /// * `Ok(())` - the bus accepted the message
    /// * `Err(BusError::Publish)` - the publish failed; the caller decides
    ///   whether to care (the coordinator logs and moves on)
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError>;

    /// Consumes a topic, delivering each message to `handler` in arrival
    /// order, until `cancel` flips to `true` or the bus errors fatally.
    ///
    /// The consume loop runs on the calling task and does not share the
    /// publish path's connection. Transient errors are logged and end the
    /// loop; there is no automatic re-subscribe.
    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), BusError>;
}
