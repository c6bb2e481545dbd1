use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use roomvoice_core::models::{generate_id, RoomName};
use roomvoice_core::voice::{SignalMessage, SignalingTransport};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Error;

/// Handle for a transport subscription
pub type ConnectionId = String;

/// Message sender for a subscribed transport
pub type MessageSender = mpsc::UnboundedSender<SignalMessage>;

#[derive(Debug, Clone)]
pub struct Subscriber {
    pub connection_id: ConnectionId,
    pub sender: MessageSender,
}

/// In-memory room channels for sessions running in one process
///
/// Every message is delivered to every subscriber of the room, the sender
/// included; sessions discard their own messages.
#[derive(Clone, Default)]
pub struct RoomMessageHub {
    /// Map of room -> list of subscribers
    rooms: Arc<DashMap<RoomName, Vec<Subscriber>>>,

    /// Map of connection_id -> room for cleanup
    connections: Arc<DashMap<ConnectionId, RoomName>>,
}

impl RoomMessageHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to a room; returns its inbound messages
    pub fn subscribe(
        &self,
        room: RoomName,
        connection_id: ConnectionId,
    ) -> mpsc::UnboundedReceiver<SignalMessage> {
        let (tx, rx) = mpsc::unbounded_channel();

        self.rooms
            .entry(room.clone())
            .or_default()
            .push(Subscriber {
                connection_id: connection_id.clone(),
                sender: tx,
            });
        self.connections.insert(connection_id.clone(), room.clone());

        info!(
            room = %room,
            connection_id = %connection_id,
            "Connection subscribed to room"
        );
        rx
    }

    pub fn unsubscribe(&self, connection_id: &str) {
        let Some((_, room)) = self.connections.remove(connection_id) else {
            warn!(connection_id = %connection_id, "Attempted to unsubscribe unknown connection");
            return;
        };

        if let Some(mut subscribers) = self.rooms.get_mut(&room) {
            subscribers.retain(|sub| sub.connection_id != connection_id);
            if subscribers.is_empty() {
                drop(subscribers); // Drop the RefMut before removing
                self.rooms.remove(&room);
                debug!(room = %room, "Room has no more subscribers, removed");
            }
        }

        info!(room = %room, connection_id = %connection_id, "Connection unsubscribed from room");
    }

    /// Deliver a message to every subscriber of `room`
    pub fn broadcast(&self, room: &RoomName, message: &SignalMessage) -> usize {
        let mut sent_count = 0;
        let mut failed_connections = Vec::new();

        if let Some(subscribers) = self.rooms.get(room) {
            for subscriber in subscribers.iter() {
                if subscriber.sender.send(message.clone()).is_ok() {
                    sent_count += 1;
                } else {
                    failed_connections.push(subscriber.connection_id.clone());
                }
            }
        }

        for conn_id in failed_connections {
            debug!(room = %room, connection_id = %conn_id, "Receiver dropped, cleaning up");
            self.unsubscribe(&conn_id);
        }

        debug!(
            room = %room,
            from = %message.from,
            kind = message.payload.kind(),
            sent_count,
            "Signal broadcast"
        );
        sent_count
    }

    pub fn subscriber_count(&self, room: &RoomName) -> usize {
        self.rooms.get(room).map_or(0, |subscribers| subscribers.len())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// A transport endpoint for one session
    #[must_use]
    pub fn endpoint(&self) -> HubSignaling {
        HubSignaling {
            hub: self.clone(),
            subscription: Mutex::new(None),
        }
    }
}

/// [`SignalingTransport`] over a [`RoomMessageHub`]
pub struct HubSignaling {
    hub: RoomMessageHub,
    subscription: Mutex<Option<(RoomName, ConnectionId)>>,
}

#[async_trait]
impl SignalingTransport for HubSignaling {
    async fn subscribe(
        &self,
        room: &RoomName,
    ) -> roomvoice_core::Result<mpsc::UnboundedReceiver<SignalMessage>> {
        let connection_id = generate_id();
        let rx = self.hub.subscribe(room.clone(), connection_id.clone());
        let previous = self
            .subscription
            .lock()
            .replace((room.clone(), connection_id));
        if let Some((_, previous)) = previous {
            self.hub.unsubscribe(&previous);
        }
        Ok(rx)
    }

    async fn send(&self, message: SignalMessage) -> roomvoice_core::Result<()> {
        let room = self
            .subscription
            .lock()
            .as_ref()
            .map(|(room, _)| room.clone())
            .ok_or(Error::NotSubscribed)?;
        self.hub.broadcast(&room, &message);
        Ok(())
    }

    async fn close(&self) {
        let subscription = self.subscription.lock().take();
        if let Some((_, connection_id)) = subscription {
            self.hub.unsubscribe(&connection_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomvoice_core::models::{ParticipantId, Profile};

    fn join(from: &str) -> SignalMessage {
        SignalMessage::join(ParticipantId::from(from), Profile::default())
    }

    #[tokio::test]
    async fn test_subscribe_and_broadcast() {
        let hub = RoomMessageHub::new();
        let room = RoomName::from("lobby");

        let mut rx1 = hub.subscribe(room.clone(), "conn1".to_string());
        let mut rx2 = hub.subscribe(room.clone(), "conn2".to_string());
        let mut other = hub.subscribe(RoomName::from("other"), "conn3".to_string());
        assert_eq!(hub.subscriber_count(&room), 2);
        assert_eq!(hub.room_count(), 2);

        assert_eq!(hub.broadcast(&room, &join("alice")), 2);
        assert_eq!(rx1.recv().await.unwrap().from.as_str(), "alice");
        assert_eq!(rx2.recv().await.unwrap().from.as_str(), "alice");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_empty_room() {
        let hub = RoomMessageHub::new();
        let room = RoomName::from("lobby");

        let _rx = hub.subscribe(room.clone(), "conn1".to_string());
        hub.unsubscribe("conn1");
        assert_eq!(hub.subscriber_count(&room), 0);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.room_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_cleaned_up() {
        let hub = RoomMessageHub::new();
        let room = RoomName::from("lobby");

        let rx = hub.subscribe(room.clone(), "conn1".to_string());
        let _keep = hub.subscribe(room.clone(), "conn2".to_string());
        drop(rx);

        assert_eq!(hub.broadcast(&room, &join("alice")), 1);
        assert_eq!(hub.subscriber_count(&room), 1);
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_endpoints_exchange_messages() {
        let hub = RoomMessageHub::new();
        let room = RoomName::from("lobby");
        let a = hub.endpoint();
        let b = hub.endpoint();

        assert!(a.send(join("alice")).await.is_err());

        let mut a_rx = a.subscribe(&room).await.unwrap();
        let mut b_rx = b.subscribe(&room).await.unwrap();
        a.send(join("alice")).await.unwrap();

        assert_eq!(b_rx.recv().await.unwrap().from.as_str(), "alice");
        // echo reaches the sender too
        assert_eq!(a_rx.recv().await.unwrap().from.as_str(), "alice");

        b.close().await;
        assert_eq!(hub.subscriber_count(&room), 1);
        assert!(b_rx.recv().await.is_none());
        assert!(b.send(join("bob")).await.is_err());
    }
}
