//! Production bus implementation over Redis pub/sub.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::error::BusError;
use crate::transport::{BusTransport, MessageHandler};

/// Redis-backed [`BusTransport`].
///
/// Publishes go through one multiplexed connection guarded by a mutex so
/// only one publish is in flight at a time. Each subscription opens its
/// own pub/sub connection; consuming never contends with publishing.
pub struct RedisBus {
    client: redis::Client,
    publish_conn: Mutex<redis::aio::MultiplexedConnection>,
}

impl RedisBus {
    /// Connects to Redis at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|e| BusError::connection(e.to_string()))?;
        let publish_conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::connection(e.to_string()))?;

        Ok(Self {
            client,
            publish_conn: Mutex::new(publish_conn),
        })
    }
}

#[async_trait]
impl BusTransport for RedisBus {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        let mut conn = self.publish_conn.lock().await;
        conn.publish::<_, _, ()>(topic, payload)
            .await
            .map_err(|e| BusError::publish(topic, e))
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::subscribe(topic, e))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| BusError::subscribe(topic, e))?;

        debug!(topic, "redis subscription established");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                msg = stream.next() => {
                    match msg {
                        Some(msg) => match msg.get_payload::<Vec<u8>>() {
                            Ok(payload) => handler(&payload),
                            Err(e) => warn!(topic, error = %e, "dropping undecodable bus payload"),
                        },
                        None => {
                            warn!(topic, "redis subscription stream closed");
                            return Err(BusError::subscribe(topic, "connection closed"));
                        }
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        debug!(topic, "redis subscription cancelled");
                        return Ok(());
                    }
                }
            }
        }
    }
}
