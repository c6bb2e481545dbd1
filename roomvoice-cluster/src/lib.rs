//! Signaling transports for `RoomVoice`
//!
//! - [`RoomMessageHub`] / [`HubSignaling`]: in-process rooms, for sessions
//!   sharing one process and for tests
//! - [`RedisSignaling`]: Redis Pub/Sub, one channel per room

pub mod error;
pub mod sync;

use std::sync::Arc;

use roomvoice_core::config::SignalingConfig;
use roomvoice_core::voice::SignalingTransport;

pub use error::{Error, Result};
pub use sync::{HubSignaling, RedisSignaling, RoomMessageHub, SignalEnvelope};

/// Pick the transport named by `config`; an empty `redis_url` selects `hub`
pub fn transport_from_config(
    config: &SignalingConfig,
    hub: &RoomMessageHub,
) -> Result<Arc<dyn SignalingTransport>> {
    if config.redis_url.is_empty() {
        tracing::info!("Using in-process signaling hub");
        return Ok(Arc::new(hub.endpoint()));
    }
    tracing::info!(channel_prefix = %config.channel_prefix, "Using Redis signaling");
    Ok(Arc::new(RedisSignaling::from_config(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_url_selects_hub() {
        let hub = RoomMessageHub::new();
        let config = SignalingConfig {
            redis_url: String::new(),
            channel_prefix: "roomvoice:room:".to_string(),
        };
        assert!(transport_from_config(&config, &hub).is_ok());

        let config = SignalingConfig {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            ..config
        };
        assert!(transport_from_config(&config, &hub).is_ok());
    }
}
