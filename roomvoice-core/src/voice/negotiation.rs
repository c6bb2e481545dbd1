//! Perfect negotiation
//!
//! Either side may start an offer at any time. When both do (glare), the
//! impolite side drops the incoming offer and the polite side rolls its own
//! offer back and answers. Roles come from comparing participant ids, so
//! both sides agree without exchanging anything.

use tracing::{debug, warn};

use super::peer::{PeerLink, SignalingState};
use super::{IceCandidate, SdpType, SessionDescription, SignalMessage, SignalingTransport};
use crate::models::{ParticipantId, Profile};
use crate::{Error, Result};

/// The polite side yields on collision. Exactly one of `polite(a, b)` and
/// `polite(b, a)` holds for distinct ids.
#[must_use]
pub fn is_polite(local: &ParticipantId, remote: &ParticipantId) -> bool {
    local < remote
}

/// An incoming offer collides with our own negotiation in progress
#[must_use]
pub fn is_collision(incoming: SdpType, making_offer: bool, state: SignalingState) -> bool {
    incoming == SdpType::Offer && (making_offer || state != SignalingState::Stable)
}

/// What happened to an incoming description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionOutcome {
    /// Impolite side dropped a colliding offer
    Ignored,
    /// Applied; `rolled_back` when our own offer was discarded first
    Applied { rolled_back: bool, answered: bool },
}

/// Runs offer/answer exchanges for links on behalf of the local participant
pub struct Negotiator<'a> {
    local: &'a ParticipantId,
    profile: &'a Profile,
    signaling: &'a dyn SignalingTransport,
}

impl<'a> Negotiator<'a> {
    pub fn new(
        local: &'a ParticipantId,
        profile: &'a Profile,
        signaling: &'a dyn SignalingTransport,
    ) -> Self {
        Self {
            local,
            profile,
            signaling,
        }
    }

    /// Handle negotiation-needed: create, set and send a local offer.
    ///
    /// `making_offer` is held for the whole exchange and cleared afterwards
    /// even on failure so later negotiations are not blocked.
    pub async fn negotiate(&self, link: &mut PeerLink) -> Result<()> {
        let ice_restart = std::mem::take(&mut link.ice_restart_pending);
        link.negotiation.making_offer = true;
        let result = self.send_offer(link, ice_restart).await;
        link.negotiation.making_offer = false;

        if result.is_err() && ice_restart {
            link.ice_restart_pending = true;
        }
        result
    }

    async fn send_offer(&self, link: &PeerLink, ice_restart: bool) -> Result<()> {
        let offer = link.connection.create_offer(ice_restart).await?;
        // a description may have arrived while the offer was being created
        if link.connection.signaling_state() != SignalingState::Stable {
            debug!(peer_id = %link.remote_id, "Skipping stale offer");
            return Ok(());
        }
        link.connection.set_local_description(offer.clone()).await?;
        debug!(peer_id = %link.remote_id, ice_restart, "Sending offer");
        self.signaling
            .send(SignalMessage::description(
                self.local.clone(),
                link.remote_id.clone(),
                offer,
                Some(self.profile),
            ))
            .await
    }

    /// Apply a remote description with collision handling
    pub async fn handle_description(
        &self,
        link: &mut PeerLink,
        description: SessionDescription,
    ) -> Result<DescriptionOutcome> {
        let polite = is_polite(self.local, &link.remote_id);
        let state = link.connection.signaling_state();
        let collision = is_collision(
            description.sdp_type,
            link.negotiation.making_offer,
            state,
        );

        link.negotiation.ignoring_offer = !polite && collision;
        if link.negotiation.ignoring_offer {
            link.ignored_offers += 1;
            debug!(peer_id = %link.remote_id, ?state, "Ignoring colliding offer");
            return Ok(DescriptionOutcome::Ignored);
        }

        if collision {
            debug!(peer_id = %link.remote_id, ?state, "Rolling back local offer");
            link.connection.rollback().await?;
            link.negotiation.making_offer = false;
        }

        let is_offer = description.sdp_type == SdpType::Offer;
        link.connection
            .set_remote_description(description)
            .await
            .map_err(|e| Error::Negotiation(format!("set remote description: {e}")))?;

        self.drain_candidates(link).await;

        if is_offer {
            let answer = link.connection.create_answer().await?;
            link.connection.set_local_description(answer.clone()).await?;
            self.signaling
                .send(SignalMessage::description(
                    self.local.clone(),
                    link.remote_id.clone(),
                    answer,
                    None,
                ))
                .await?;
        }

        Ok(DescriptionOutcome::Applied {
            rolled_back: collision,
            answered: is_offer,
        })
    }

    /// Apply a remote candidate, or buffer it until a remote description exists
    pub async fn handle_candidate(&self, link: &mut PeerLink, candidate: IceCandidate) {
        let candidate = if link.connection.has_remote_description().await {
            candidate
        } else {
            match link.ice_queue.push(candidate) {
                Ok(()) => {
                    debug!(
                        peer_id = %link.remote_id,
                        queued = link.ice_queue.len(),
                        "Queued ICE candidate"
                    );
                    return;
                }
                Err(candidate) => candidate,
            }
        };
        self.apply_candidate(link, candidate).await;
    }

    /// Replay buffered candidates once, in arrival order
    async fn drain_candidates(&self, link: &mut PeerLink) {
        if link.ice_queue.is_drained() {
            return;
        }
        let pending = link.ice_queue.drain();
        if !pending.is_empty() {
            debug!(peer_id = %link.remote_id, count = pending.len(), "Draining ICE candidates");
        }
        for candidate in pending {
            self.apply_candidate(link, candidate).await;
        }
    }

    async fn apply_candidate(&self, link: &PeerLink, candidate: IceCandidate) {
        if let Err(e) = link.connection.add_ice_candidate(candidate).await {
            // expected when the offer those candidates belonged to was dropped
            if !link.negotiation.ignoring_offer {
                warn!(peer_id = %link.remote_id, error = %e, "Failed to add ICE candidate");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FakePeer, LoopbackSignaling};
    use crate::voice::PeerConnection;
    use std::sync::Arc;

    fn link_for(remote: &str, peer: &Arc<FakePeer>) -> PeerLink {
        PeerLink::new(ParticipantId::from(remote), 1, peer.clone())
    }

    #[test]
    fn test_politeness_is_antisymmetric() {
        let ids = ["a", "alice", "bob", "Bob", "zed", "0", "alice2"];
        for a in ids {
            for b in ids {
                if a == b {
                    continue;
                }
                let (a, b) = (ParticipantId::from(a), ParticipantId::from(b));
                assert_ne!(is_polite(&a, &b), is_polite(&b, &a), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_collision_rule() {
        assert!(!is_collision(SdpType::Offer, false, SignalingState::Stable));
        assert!(is_collision(SdpType::Offer, true, SignalingState::Stable));
        assert!(is_collision(SdpType::Offer, false, SignalingState::HaveLocalOffer));
        assert!(!is_collision(SdpType::Answer, true, SignalingState::HaveLocalOffer));
    }

    #[tokio::test]
    async fn test_negotiate_sends_offer_and_clears_flag() {
        let signaling = LoopbackSignaling::new();
        let local = ParticipantId::from("alice");
        let profile = Profile::default();
        let negotiator = Negotiator::new(&local, &profile, &signaling);
        let peer = FakePeer::new();
        let mut link = link_for("bob", &peer);

        negotiator.negotiate(&mut link).await.unwrap();
        assert!(!link.negotiation.making_offer);
        assert_eq!(peer.signaling_state(), SignalingState::HaveLocalOffer);

        let sent = signaling.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to.as_ref().unwrap().as_str(), "bob");
    }

    #[tokio::test]
    async fn test_negotiate_clears_flag_on_error() {
        let signaling = LoopbackSignaling::new();
        let local = ParticipantId::from("alice");
        let profile = Profile::default();
        let negotiator = Negotiator::new(&local, &profile, &signaling);
        let peer = FakePeer::new();
        peer.fail_next_offer();
        let mut link = link_for("bob", &peer);
        link.ice_restart_pending = true;

        assert!(negotiator.negotiate(&mut link).await.is_err());
        assert!(!link.negotiation.making_offer);
        assert!(link.ice_restart_pending);
        assert!(signaling.sent().is_empty());
    }

    #[tokio::test]
    async fn test_polite_side_rolls_back_on_glare() {
        let signaling = LoopbackSignaling::new();
        // alice < bob, so alice is polite towards bob
        let local = ParticipantId::from("alice");
        let profile = Profile::default();
        let negotiator = Negotiator::new(&local, &profile, &signaling);
        let peer = FakePeer::new();
        let mut link = link_for("bob", &peer);

        negotiator.negotiate(&mut link).await.unwrap();
        let outcome = negotiator
            .handle_description(&mut link, SessionDescription::offer("bob-offer"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DescriptionOutcome::Applied {
                rolled_back: true,
                answered: true
            }
        );
        assert_eq!(peer.rollbacks(), 1);
        assert_eq!(peer.signaling_state(), SignalingState::Stable);
        assert!(!link.negotiation.ignoring_offer);
        assert_eq!(signaling.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_impolite_side_ignores_colliding_offer() {
        let signaling = LoopbackSignaling::new();
        let local = ParticipantId::from("bob");
        let profile = Profile::default();
        let negotiator = Negotiator::new(&local, &profile, &signaling);
        let peer = FakePeer::new();
        let mut link = link_for("alice", &peer);

        negotiator.negotiate(&mut link).await.unwrap();
        let outcome = negotiator
            .handle_description(&mut link, SessionDescription::offer("alice-offer"))
            .await
            .unwrap();

        assert_eq!(outcome, DescriptionOutcome::Ignored);
        assert!(link.negotiation.ignoring_offer);
        assert_eq!(link.ignored_offers, 1);
        assert_eq!(peer.rollbacks(), 0);
        assert_eq!(peer.signaling_state(), SignalingState::HaveLocalOffer);
        assert!(!peer.has_remote_description().await);

        // candidates belonging to the dropped offer are buffered, then fail quietly
        negotiator
            .handle_candidate(&mut link, IceCandidate::new("candidate:dropped"))
            .await;
        assert_eq!(link.ice_queue.len(), 1);

        let outcome = negotiator
            .handle_description(&mut link, SessionDescription::answer("alice-answer"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DescriptionOutcome::Applied {
                rolled_back: false,
                answered: false
            }
        );
        assert!(!link.negotiation.ignoring_offer);
        assert_eq!(peer.signaling_state(), SignalingState::Stable);
        assert_eq!(peer.applied_candidates(), vec!["candidate:dropped".to_string()]);
    }

    #[tokio::test]
    async fn test_candidates_before_description_are_replayed_in_order() {
        let signaling = LoopbackSignaling::new();
        let local = ParticipantId::from("alice");
        let profile = Profile::default();
        let negotiator = Negotiator::new(&local, &profile, &signaling);
        let peer = FakePeer::new();
        let mut link = link_for("bob", &peer);

        for i in 0..3 {
            negotiator
                .handle_candidate(&mut link, IceCandidate::new(format!("candidate:{i}")))
                .await;
        }
        assert_eq!(link.ice_queue.len(), 3);
        assert!(peer.applied_candidates().is_empty());

        negotiator
            .handle_description(&mut link, SessionDescription::offer("bob-offer"))
            .await
            .unwrap();
        assert!(link.ice_queue.is_empty());
        assert_eq!(
            peer.applied_candidates(),
            vec!["candidate:0", "candidate:1", "candidate:2"]
        );

        // later candidates go straight to the connection
        negotiator
            .handle_candidate(&mut link, IceCandidate::new("candidate:3"))
            .await;
        assert_eq!(peer.applied_candidates().len(), 4);
        assert!(link.ice_queue.is_empty());
    }
}
