// Module: sync

pub mod redis_pubsub;
pub mod room_hub;

pub use redis_pubsub::{RedisSignaling, SignalEnvelope};
pub use room_hub::{ConnectionId, HubSignaling, MessageSender, RoomMessageHub, Subscriber};
