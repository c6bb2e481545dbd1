//! Keyed collection of peer links
//!
//! At most one [`PeerLink`] exists per remote id. Creation is idempotent and
//! wires the local tracks in; the connection's events flow back through the
//! session's event channel tagged with the link generation.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::peer::{PeerConnectionFactory, PeerEventSink, PeerLink, PeerSignal};
use crate::media::MediaStream;
use crate::models::ParticipantId;
use crate::Result;

pub struct PeerConnectionManager {
    factory: Arc<dyn PeerConnectionFactory>,
    links: HashMap<ParticipantId, PeerLink>,
    next_generation: u64,
    events_tx: mpsc::UnboundedSender<PeerSignal>,
}

impl PeerConnectionManager {
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        events_tx: mpsc::UnboundedSender<PeerSignal>,
    ) -> Self {
        Self {
            factory,
            links: HashMap::new(),
            next_generation: 1,
            events_tx,
        }
    }

    /// Return the link for `remote_id`, creating and wiring it on first contact.
    ///
    /// The boolean is true when the link was created by this call.
    pub async fn get_or_create(
        &mut self,
        remote_id: &ParticipantId,
        local: Option<&MediaStream>,
    ) -> Result<(&mut PeerLink, bool)> {
        if self.links.contains_key(remote_id) {
            let link = self
                .links
                .get_mut(remote_id)
                .ok_or_else(|| crate::Error::Internal("peer link vanished".to_string()))?;
            return Ok((link, false));
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let sink = PeerEventSink::new(remote_id.clone(), generation, self.events_tx.clone());
        let connection = self.factory.create(sink).await?;

        if let Some(stream) = local {
            for track in stream.tracks() {
                if let Err(e) = connection.add_track(track.clone(), stream).await {
                    warn!(peer_id = %remote_id, error = %e, "Failed to attach local track");
                }
            }
        }

        info!(peer_id = %remote_id, generation, "Peer link created");
        let link = self
            .links
            .entry(remote_id.clone())
            .or_insert_with(|| PeerLink::new(remote_id.clone(), generation, connection));
        Ok((link, true))
    }

    pub fn get(&self, remote_id: &ParticipantId) -> Option<&PeerLink> {
        self.links.get(remote_id)
    }

    pub fn get_mut(&mut self, remote_id: &ParticipantId) -> Option<&mut PeerLink> {
        self.links.get_mut(remote_id)
    }

    /// The link only if it is still the given generation
    pub fn get_current(&mut self, remote_id: &ParticipantId, generation: u64) -> Option<&mut PeerLink> {
        self.links
            .get_mut(remote_id)
            .filter(|link| link.generation == generation)
    }

    pub fn contains(&self, remote_id: &ParticipantId) -> bool {
        self.links.contains_key(remote_id)
    }

    /// Detach a link from the map, cancelling its timer. The caller closes it.
    pub fn remove(&mut self, remote_id: &ParticipantId) -> Option<PeerLink> {
        let mut link = self.links.remove(remote_id)?;
        link.cancel_cleanup();
        debug!(peer_id = %remote_id, "Peer link removed");
        Some(link)
    }

    pub fn drain(&mut self) -> Vec<PeerLink> {
        let mut links: Vec<_> = self.links.drain().map(|(_, link)| link).collect();
        for link in &mut links {
            link.cancel_cleanup();
        }
        links
    }

    pub fn links(&self) -> impl Iterator<Item = &PeerLink> {
        self.links.values()
    }

    pub fn ids(&self) -> Vec<ParticipantId> {
        self.links.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
