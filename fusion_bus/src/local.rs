//! In-process bus implementation for tests and demos.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::warn;

use crate::error::BusError;
use crate::transport::{BusTransport, MessageHandler};

/// How many messages a topic buffers before slow subscribers start losing
/// the oldest ones.
const TOPIC_BUFFER: usize = 1024;

/// In-process [`BusTransport`] backed by per-topic broadcast channels.
///
/// Delivery is in publish order per topic, matching the ordering guarantee
/// of the production bus. Cloning shares the topic table, so publishers
/// and subscribers created from clones see each other.
#[derive(Clone)]
pub struct LocalBus {
    topics: std::sync::Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            topics: std::sync::Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        let mut topics = self.topics.lock();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0)
            .clone()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusTransport for LocalBus {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        // A send with no subscribers is not an error on a pub/sub bus.
        let _ = self.sender_for(topic).send(payload.to_vec());
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), BusError> {
        let mut rx = self.sender_for(topic).subscribe();

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Ok(payload) => handler(&payload),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(topic, dropped = n, "local bus subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
