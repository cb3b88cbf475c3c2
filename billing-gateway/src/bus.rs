//! Cross-instance pub/sub keyed by license, with an in-process fallback.
//!
//! `publish` never blocks the caller and never fails the caller: a [`Bus::publish`] failure on
//! the distributed backend falls through to the in-process broadcaster so a single-instance
//! deployment (or a distributed one suffering a transient outage) keeps delivering locally. This
//! fallback is a deliberate degradation but deserves an operator-visible alarm rather than
//! silence, which is why it's logged at `warn` with a distinguishable message.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::wire::EventEnvelope;

/// Builds the transport channel name for a license key: `sse:license:{LICENSE_KEY}`.
pub fn channel_name(license_key: &str) -> String {
    format!("sse:license:{}", license_key.to_uppercase())
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, license_key: &str, envelope: &EventEnvelope);

    fn subscribe(&self, license_key: &str) -> BusSubscription;
}

pub struct BusSubscription {
    receiver: broadcast::Receiver<EventEnvelope>,
}

impl BusSubscription {
    /// Awaits the next event, transparently skipping over any the broadcaster dropped because
    /// this subscriber fell too far behind (it will simply miss them; the replay phase covers
    /// the same ground from the event store).
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "bus subscriber lagged, skipping to latest");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Single multi-listener broadcaster keyed by channel name, used when no pub/sub URL is
/// configured, and as the fallback target when the distributed backend is unreachable.
pub struct InProcessBus {
    channels: DashMap<String, broadcast::Sender<EventEnvelope>>,
    capacity: usize,
}

impl InProcessBus {
    pub fn new(capacity: usize) -> Self {
        Self { channels: DashMap::new(), capacity }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<EventEnvelope> {
        self.channels.entry(channel.to_owned()).or_insert_with(|| broadcast::channel(self.capacity).0).clone()
    }
}

#[async_trait]
impl Bus for InProcessBus {
    async fn publish(&self, license_key: &str, envelope: &EventEnvelope) {
        let channel = channel_name(license_key);
        let sender = self.sender_for(&channel);
        // `send` errors only when there are no subscribers; that's a normal, expected state.
        let _ = sender.send(envelope.clone());
    }

    fn subscribe(&self, license_key: &str) -> BusSubscription {
        let channel = channel_name(license_key);
        let sender = self.sender_for(&channel);
        BusSubscription { receiver: sender.subscribe() }
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Distributed backend over a networked pub/sub transport. The publisher is a
/// process-wide singleton connection; subscribers each get their own connection, since the
/// redis client's pub/sub connections can't also issue regular commands.
pub struct RedisBus {
    client: redis::Client,
    publish_conn: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
    fallback: InProcessBus,
}

impl RedisBus {
    pub fn new(redis_url: &str, fallback_capacity: usize) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client, publish_conn: tokio::sync::Mutex::new(None), fallback: InProcessBus::new(fallback_capacity) })
    }

    async fn publish_connection(&self) -> anyhow::Result<redis::aio::MultiplexedConnection> {
        let mut guard = self.publish_conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_tokio_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, license_key: &str, envelope: &EventEnvelope) {
        let channel = channel_name(license_key);

        let attempt = async {
            let mut conn = self.publish_connection().await?;
            let payload = serde_json::to_string(envelope)?;
            redis::cmd("PUBLISH").arg(&channel).arg(payload).query_async::<()>(&mut conn).await?;
            anyhow::Ok(())
        }
        .await;

        if let Err(error) = attempt {
            warn!(%error, %channel, "distributed bus publish failed, falling back to in-process delivery only");
            self.fallback.publish(license_key, envelope).await;
            // Clear the cached connection so the next publish reconnects instead of reusing a dead one.
            *self.publish_conn.lock().await = None;
        }
    }

    fn subscribe(&self, license_key: &str) -> BusSubscription {
        let channel = channel_name(license_key);
        let client = self.client.clone();
        let (tx, rx) = broadcast::channel(self.fallback.capacity);

        tokio::spawn(async move {
            if let Err(error) = run_redis_subscription(client, channel.clone(), tx).await {
                warn!(%error, %channel, "distributed bus subscription ended");
            }
        });

        BusSubscription { receiver: rx }
    }
}

async fn run_redis_subscription(
    client: redis::Client,
    channel: String,
    tx: broadcast::Sender<EventEnvelope>,
) -> anyhow::Result<()> {
    use futures::StreamExt as _;

    let mut backoff = backoff::ExponentialBackoff {
        initial_interval: std::time::Duration::from_millis(200),
        max_interval: std::time::Duration::from_secs(30),
        max_elapsed_time: None,
        ..Default::default()
    };

    loop {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(error) => {
                let delay = backoff::backoff::Backoff::next_backoff(&mut backoff).unwrap_or(std::time::Duration::from_secs(30));
                warn!(%error, %channel, ?delay, "failed to open pub/sub connection, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        if let Err(error) = pubsub.subscribe(&channel).await {
            warn!(%error, %channel, "failed to subscribe to channel, retrying");
            continue;
        }

        backoff::backoff::Backoff::reset(&mut backoff);

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let Ok(payload) = msg.get_payload::<String>() else { continue };
            let Ok(envelope) = serde_json::from_str::<EventEnvelope>(&payload) else { continue };

            if tx.send(envelope).is_err() {
                // No local subscribers left; the per-connection task will be dropped by its caller.
            }
        }

        if tx.receiver_count() == 0 {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{EventPayload, HeartbeatAck};
    use time::OffsetDateTime;

    fn sample() -> EventEnvelope {
        EventEnvelope {
            id: "evt_1".to_owned(),
            timestamp: OffsetDateTime::now_utc(),
            license_key: "AUR-PRO-V2-X".to_owned(),
            payload: EventPayload::HeartbeatAck(HeartbeatAck { server_time_ms: 0 }),
        }
    }

    #[test]
    fn channel_name_uppercases_the_license_key() {
        assert_eq!(channel_name("aur-bas-v2-x"), "sse:license:AUR-BAS-V2-X");
    }

    #[tokio::test]
    async fn in_process_bus_delivers_to_subscriber_of_same_license() {
        let bus = InProcessBus::default();
        let mut sub = bus.subscribe("AUR-PRO-V2-X");

        bus.publish("AUR-PRO-V2-X", &sample()).await;

        let received = sub.recv().await.unwrap();
        assert_eq!(received.id, "evt_1");
    }

    #[tokio::test]
    async fn in_process_bus_does_not_cross_license_channels() {
        let bus = InProcessBus::default();
        let mut sub = bus.subscribe("AUR-BAS-V2-OTHER");

        bus.publish("AUR-PRO-V2-X", &sample()).await;

        let result = tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await;
        assert!(result.is_err(), "subscriber on a different license channel should not receive the event");
    }
}
