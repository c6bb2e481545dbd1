use async_trait::async_trait;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client as RedisClient};
use roomvoice_core::config::SignalingConfig;
use roomvoice_core::models::{generate_id, RoomName};
use roomvoice_core::voice::{SignalMessage, SignalingTransport};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Reconnect attempts before the inbound stream is ended
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Wire envelope; `node_id` identifies the publishing transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub node_id: String,
    pub message: SignalMessage,
}

/// [`SignalingTransport`] over Redis Pub/Sub
///
/// Each room maps to the channel `{channel_prefix}{room}`. Messages this
/// transport published are not delivered back to it.
pub struct RedisSignaling {
    client: RedisClient,
    channel_prefix: String,
    node_id: String,
    publisher: Mutex<Option<ConnectionManager>>,
    subscription: Mutex<Option<Subscription>>,
}

struct Subscription {
    channel: String,
    cancel: CancellationToken,
}

enum SubscriberExit {
    Cancelled,
    Disconnected,
}

impl RedisSignaling {
    pub fn new(redis_url: &str, channel_prefix: impl Into<String>) -> Result<Self> {
        let client = RedisClient::open(redis_url)?;
        Ok(Self {
            client,
            channel_prefix: channel_prefix.into(),
            node_id: generate_id(),
            publisher: Mutex::new(None),
            subscription: Mutex::new(None),
        })
    }

    pub fn from_config(config: &SignalingConfig) -> Result<Self> {
        if config.redis_url.is_empty() {
            return Err(Error::Configuration("redis_url is empty".to_string()));
        }
        Self::new(&config.redis_url, config.channel_prefix.clone())
    }

    #[must_use]
    pub fn channel_for(&self, room: &RoomName) -> String {
        format!("{}{}", self.channel_prefix, room)
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn publisher(&self) -> Result<ConnectionManager> {
        if let Some(conn) = self.publisher.lock().clone() {
            return Ok(conn);
        }
        let conn = with_timeout("connect publisher", self.client.get_connection_manager()).await?;
        *self.publisher.lock() = Some(conn.clone());
        Ok(conn)
    }

    fn encode(&self, message: SignalMessage) -> Result<String> {
        Ok(serde_json::to_string(&SignalEnvelope {
            node_id: self.node_id.clone(),
            message,
        })?)
    }
}

async fn with_timeout<T>(
    operation: &str,
    fut: impl Future<Output = redis::RedisResult<T>>,
) -> Result<T> {
    match timeout(Duration::from_secs(REDIS_TIMEOUT_SECS), fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::Timeout(format!("{operation} timed out"))),
    }
}

async fn connect_pubsub(client: &RedisClient, channel: &str) -> Result<PubSub> {
    let mut pubsub = with_timeout("connect subscriber", client.get_async_pubsub()).await?;
    with_timeout("subscribe", pubsub.subscribe(channel)).await?;
    Ok(pubsub)
}

/// Forward decoded messages until the connection drops or the session
/// stops listening
async fn forward(
    pubsub: PubSub,
    node_id: &str,
    tx: &mpsc::UnboundedSender<SignalMessage>,
    cancel: &CancellationToken,
) -> SubscriberExit {
    let mut stream = pubsub.into_on_message();
    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => return SubscriberExit::Cancelled,
            () = tx.closed() => return SubscriberExit::Cancelled,
            msg = stream.next() => msg,
        };
        let Some(msg) = msg else {
            return SubscriberExit::Disconnected;
        };

        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, channel = %channel, "Invalid payload");
                continue;
            }
        };

        match serde_json::from_str::<SignalEnvelope>(&payload) {
            Ok(envelope) if envelope.node_id == node_id => {}
            Ok(envelope) => {
                if tx.send(envelope.message).is_err() {
                    return SubscriberExit::Cancelled;
                }
            }
            Err(e) => {
                warn!(error = %e, channel = %channel, "Failed to deserialize signal envelope");
            }
        }
    }
}

async fn run_subscriber(
    client: RedisClient,
    channel: String,
    node_id: String,
    mut pubsub: PubSub,
    tx: mpsc::UnboundedSender<SignalMessage>,
    cancel: CancellationToken,
) {
    loop {
        match forward(pubsub, &node_id, &tx, &cancel).await {
            SubscriberExit::Cancelled => {
                debug!(channel = %channel, "Redis subscriber stopped");
                return;
            }
            SubscriberExit::Disconnected => {
                warn!(channel = %channel, "Redis subscriber connection lost, reconnecting");
            }
        }

        let mut backoff_secs = INITIAL_BACKOFF_SECS;
        let mut attempt = 0;
        pubsub = loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
            }
            attempt += 1;
            match connect_pubsub(&client, &channel).await {
                Ok(pubsub) => {
                    info!(channel = %channel, attempt, "Redis subscriber reconnected");
                    break pubsub;
                }
                Err(e) if attempt < MAX_RECONNECT_ATTEMPTS => {
                    warn!(
                        error = %e,
                        channel = %channel,
                        attempt,
                        backoff_secs,
                        "Redis subscriber failed to reconnect, retrying after backoff"
                    );
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                }
                Err(e) => {
                    // dropping `tx` ends the session's signal stream
                    error!(error = %e, channel = %channel, "Redis subscriber giving up");
                    return;
                }
            }
        };
    }
}

#[async_trait]
impl SignalingTransport for RedisSignaling {
    async fn subscribe(
        &self,
        room: &RoomName,
    ) -> roomvoice_core::Result<mpsc::UnboundedReceiver<SignalMessage>> {
        self.close().await;

        let channel = self.channel_for(room);
        let pubsub = connect_pubsub(&self.client, &channel).await?;
        self.publisher().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run_subscriber(
            self.client.clone(),
            channel.clone(),
            self.node_id.clone(),
            pubsub,
            tx,
            cancel.clone(),
        ));

        info!(channel = %channel, node_id = %self.node_id, "Subscribed to Redis signaling channel");
        *self.subscription.lock() = Some(Subscription { channel, cancel });
        Ok(rx)
    }

    async fn send(&self, message: SignalMessage) -> roomvoice_core::Result<()> {
        let channel = self
            .subscription
            .lock()
            .as_ref()
            .map(|sub| sub.channel.clone())
            .ok_or(Error::NotSubscribed)?;

        let kind = message.payload.kind();
        let payload = self.encode(message)?;
        let mut conn = self.publisher().await?;
        let receivers: usize = with_timeout("publish", conn.publish(&channel, payload)).await?;
        debug!(channel = %channel, kind, receivers, "Signal published to Redis");
        Ok(())
    }

    async fn close(&self) {
        let subscription = self.subscription.lock().take();
        if let Some(sub) = subscription {
            sub.cancel.cancel();
            info!(channel = %sub.channel, "Left Redis signaling channel");
        }
    }
}

impl Drop for RedisSignaling {
    fn drop(&mut self) {
        if let Some(sub) = self.subscription.get_mut().take() {
            sub.cancel.cancel();
        }
    }
}
