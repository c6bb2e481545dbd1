//! Voice session facade and coordinator
//!
//! [`VoiceSession`] is the composition root handed to the presentation
//! layer. Each `connect` spawns one coordinator task that exclusively owns
//! the peer links, their negotiation flags, ICE queues and grace timers, the
//! speaking state and the audio pipeline. Facade calls, signaling messages,
//! connection events, timer expiries and speaking updates all arrive on the
//! coordinator's inbox, so handlers only interleave at `.await` points.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use super::lifecycle::GraceExpired;
use super::negotiation::Negotiator;
use super::peer::{
    IceConnectionState, PeerConnectionFactory, PeerEvent, PeerLinkPhase, PeerSignal,
};
use super::projection::{project, LocalView};
use super::{
    DescriptionData, GraceTimer, IceCandidate, LifecycleAction, PeerConnectionManager,
    SignalMessage, SignalPayload, SignalingTransport,
};
use crate::config::VoiceConfig;
use crate::media::{AudioGraph, AudioOutput, AudioPipeline, MediaDevices, MediaStream, SpeakingUpdate};
use crate::models::{Identity, ParticipantId, Profile, RoomName, VoiceParticipant};
use crate::{Error, Result};

/// Platform collaborators a session is built from
#[derive(Clone)]
pub struct SessionDeps {
    pub signaling: Arc<dyn SignalingTransport>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub media: Arc<dyn MediaDevices>,
    pub output: Option<Arc<dyn AudioOutput>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Connected,
}

/// Per-link snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStats {
    pub id: ParticipantId,
    pub generation: u64,
    pub phase: PeerLinkPhase,
    pub ice_state: IceConnectionState,
    pub making_offer: bool,
    pub ignoring_offer: bool,
    pub ignored_offers: u64,
    pub queued_candidates: usize,
    pub cleanup_pending: bool,
    pub has_stream: bool,
    pub created_at: DateTime<Utc>,
}

/// Resource counts for the current session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub open_links: usize,
    pub pending_timers: usize,
    pub queued_candidates: usize,
    pub analysis_loops: usize,
    pub peers: Vec<PeerStats>,
}

enum Command {
    Reproject,
    SetVolume(u8),
    ResumeAudio(oneshot::Sender<bool>),
    Foreground(oneshot::Sender<()>),
    Stats(oneshot::Sender<SessionStats>),
    Graph(oneshot::Sender<Option<Arc<AudioGraph>>>),
    Disconnect(oneshot::Sender<()>),
}

struct Shared {
    phase: Mutex<ConnectionPhase>,
    participants: watch::Sender<Vec<VoiceParticipant>>,
    error: watch::Sender<Option<String>>,
}

impl Shared {
    fn set_phase(&self, phase: ConnectionPhase) {
        *self.phase.lock() = phase;
    }
}

struct ActiveSession {
    room: RoomName,
    commands: mpsc::UnboundedSender<Command>,
    local_stream: MediaStream,
    task: JoinHandle<()>,
}

/// Client-side voice chat for one room at a time
pub struct VoiceSession {
    config: VoiceConfig,
    deps: SessionDeps,
    shared: Arc<Shared>,
    volume: AtomicU8,
    active: Mutex<Option<ActiveSession>>,
}

impl VoiceSession {
    pub fn new(config: VoiceConfig, deps: SessionDeps) -> Self {
        let volume = AtomicU8::new(config.default_volume.min(100));
        Self {
            config,
            deps,
            shared: Arc::new(Shared {
                phase: Mutex::new(ConnectionPhase::Idle),
                participants: watch::channel(Vec::new()).0,
                error: watch::channel(None).0,
            }),
            volume,
            active: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.shared.phase.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == ConnectionPhase::Connected
    }

    pub fn room(&self) -> Option<RoomName> {
        self.active.lock().as_ref().map(|a| a.room.clone())
    }

    /// Live participant list; updated whenever any input changes
    pub fn participants(&self) -> watch::Receiver<Vec<VoiceParticipant>> {
        self.shared.participants.subscribe()
    }

    pub fn snapshot(&self) -> Vec<VoiceParticipant> {
        self.shared.participants.borrow().clone()
    }

    /// Last user-facing error, cleared on a successful connect
    pub fn error(&self) -> watch::Receiver<Option<String>> {
        self.shared.error.subscribe()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.error.borrow().clone()
    }

    /// Join `room` as `identity`. No-op while connected or connecting.
    ///
    /// Acquires the microphone, subscribes to the room channel and announces
    /// `join`. Any failure leaves the session idle with `error` set.
    #[instrument(skip(self, room, identity), fields(room = %room, participant = %identity.id))]
    pub async fn connect(&self, room: RoomName, identity: Identity) -> Result<()> {
        {
            let mut phase = self.shared.phase.lock();
            if *phase != ConnectionPhase::Idle {
                debug!(phase = ?*phase, "Connect ignored");
                return Ok(());
            }
            *phase = ConnectionPhase::Connecting;
        }

        match self.start(room, identity).await {
            Ok(active) => {
                let previous = self.active.lock().replace(active);
                if let Some(previous) = previous {
                    previous.task.abort();
                }
                self.shared.error.send_replace(None);
                info!("Voice session connected");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Voice session failed to connect");
                self.shared.set_phase(ConnectionPhase::Idle);
                self.shared.error.send_replace(Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn start(&self, room: RoomName, identity: Identity) -> Result<ActiveSession> {
        let (speaking_tx, speaking_rx) = mpsc::unbounded_channel();
        let mut pipeline =
            AudioPipeline::new(self.config.clone(), self.deps.output.clone(), speaking_tx);
        let local_stream = pipeline.capture(self.deps.media.as_ref()).await?;

        let signaling = self.deps.signaling.clone();
        let inbound = match signaling.subscribe(&room).await {
            Ok(inbound) => inbound,
            Err(e) => {
                pipeline.shutdown();
                return Err(e);
            }
        };

        let profile = identity.profile();
        if let Err(e) = signaling
            .send(SignalMessage::join(identity.id.clone(), profile.clone()))
            .await
        {
            signaling.close().await;
            pipeline.shutdown();
            return Err(e);
        }

        let volume = self.volume.load(Ordering::SeqCst);
        if volume != pipeline.volume() {
            pipeline.set_volume(volume);
        }
        pipeline.start_analysis(identity.id.clone(), local_stream.clone());

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (grace_tx, grace_rx) = mpsc::unbounded_channel();

        let coordinator = Coordinator {
            profile,
            local: identity,
            room: room.clone(),
            signaling,
            local_stream: local_stream.clone(),
            peers: PeerConnectionManager::new(self.deps.peers.clone(), peer_tx),
            pipeline,
            speaking: HashMap::new(),
            grace_period: self.config.grace_period(),
            grace_tx,
            shared: self.shared.clone(),
        };
        coordinator.publish();
        self.shared.set_phase(ConnectionPhase::Connected);

        let task = tokio::spawn(coordinator.run(Inbox {
            commands: commands_rx,
            signals: inbound,
            peer_events: peer_rx,
            grace: grace_rx,
            speaking: speaking_rx,
        }));

        Ok(ActiveSession {
            room,
            commands: commands_tx,
            local_stream,
            task,
        })
    }

    /// Leave the room and release every resource. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let Some(active) = self.active.lock().take() else {
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if active.commands.send(Command::Disconnect(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        if let Err(e) = active.task.await {
            if e.is_panic() {
                warn!(error = %e, "Voice coordinator panicked");
            }
        }
        // the coordinator may already have stopped on a transport failure
        active.local_stream.stop();
        self.shared.participants.send_replace(Vec::new());
        self.shared.set_phase(ConnectionPhase::Idle);
        info!(room = %active.room, "Voice session disconnected");
    }

    /// Flip the local microphone's enabled flag; returns the new muted state.
    ///
    /// The track keeps running, so unmuting is instant and nothing is
    /// renegotiated.
    pub fn toggle_mute(&self) -> bool {
        let active = self.active.lock();
        let Some(active) = active.as_ref() else {
            return false;
        };
        let Some(track) = active.local_stream.primary_track() else {
            return false;
        };
        let muted = track.is_enabled();
        track.set_enabled(!muted);
        debug!(muted, "Local microphone toggled");
        let _ = active.commands.send(Command::Reproject);
        muted
    }

    pub fn is_muted(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .and_then(|a| a.local_stream.primary_track().map(|t| !t.is_enabled()))
            .unwrap_or(false)
    }

    /// Set remote playback volume (0-100) on the shared master gain
    pub fn set_volume(&self, percent: u8) {
        let percent = percent.min(100);
        self.volume.store(percent, Ordering::SeqCst);
        if let Some(active) = self.active.lock().as_ref() {
            let _ = active.commands.send(Command::SetVolume(percent));
        }
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::SeqCst)
    }

    /// Resume the shared audio context after a user gesture. Idempotent.
    pub async fn resume_audio(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ResumeAudio(tx))?;
        let resumed = rx.await.map_err(|_| Error::NotConnected)?;
        if resumed {
            debug!("Audio context resumed");
        }
        Ok(())
    }

    /// The app regained visibility or focus: resume audio, restart ICE on
    /// unhealthy links and re-announce `join`
    pub async fn on_foreground(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Foreground(tx))?;
        rx.await.map_err(|_| Error::NotConnected)
    }

    pub async fn stats(&self) -> SessionStats {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Stats(tx)).is_err() {
            return SessionStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// The shared audio graph, if it has been created
    pub async fn audio_graph(&self) -> Option<Arc<AudioGraph>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Graph(tx)).ok()?;
        rx.await.ok().flatten()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.active
            .lock()
            .as_ref()
            .ok_or(Error::NotConnected)?
            .commands
            .send(command)
            .map_err(|_| Error::NotConnected)
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        // dropping the command sender makes the coordinator shut down
        if let Some(active) = self.active.get_mut().take() {
            active.local_stream.stop();
        }
    }
}

struct Inbox {
    commands: mpsc::UnboundedReceiver<Command>,
    signals: mpsc::UnboundedReceiver<SignalMessage>,
    peer_events: mpsc::UnboundedReceiver<PeerSignal>,
    grace: mpsc::UnboundedReceiver<GraceExpired>,
    speaking: mpsc::UnboundedReceiver<SpeakingUpdate>,
}

enum Exit {
    Disconnect(oneshot::Sender<()>),
    FacadeDropped,
    TransportClosed,
}

struct Coordinator {
    local: Identity,
    profile: Profile,
    room: RoomName,
    signaling: Arc<dyn SignalingTransport>,
    local_stream: MediaStream,
    peers: PeerConnectionManager,
    pipeline: AudioPipeline,
    speaking: HashMap<ParticipantId, bool>,
    grace_period: Duration,
    grace_tx: mpsc::UnboundedSender<GraceExpired>,
    shared: Arc<Shared>,
}

impl Coordinator {
    async fn run(mut self, mut inbox: Inbox) {
        let exit = loop {
            tokio::select! {
                biased;

                command = inbox.commands.recv() => match command {
                    Some(Command::Disconnect(ack)) => break Exit::Disconnect(ack),
                    Some(command) => self.handle_command(command).await,
                    None => break Exit::FacadeDropped,
                },
                Some(signal) = inbox.peer_events.recv() => self.handle_peer_event(signal).await,
                Some(expired) = inbox.grace.recv() => self.handle_grace_expired(expired).await,
                Some(update) = inbox.speaking.recv() => self.handle_speaking(update),
                message = inbox.signals.recv() => match message {
                    Some(message) => self.handle_signal(message).await,
                    None => break Exit::TransportClosed,
                },
            }
        };

        match exit {
            Exit::Disconnect(ack) => {
                self.shutdown(true).await;
                let _ = ack.send(());
            }
            Exit::FacadeDropped => self.shutdown(true).await,
            Exit::TransportClosed => {
                warn!(room = %self.room, "Signaling channel closed");
                self.shutdown(false).await;
                self.shared
                    .error
                    .send_replace(Some(Error::Signaling("channel closed".to_string()).to_string()));
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Reproject => self.publish(),
            Command::SetVolume(percent) => self.pipeline.set_volume(percent),
            Command::ResumeAudio(ack) => {
                let _ = ack.send(self.pipeline.resume());
            }
            Command::Foreground(ack) => {
                self.on_foreground().await;
                let _ = ack.send(());
            }
            Command::Stats(ack) => {
                let _ = ack.send(self.stats());
            }
            Command::Graph(ack) => {
                let _ = ack.send(self.pipeline.existing_graph().cloned());
            }
            // handled by the run loop
            Command::Disconnect(_) => {}
        }
    }

    async fn handle_signal(&mut self, message: SignalMessage) {
        if !message.is_for(&self.local.id) {
            trace!(from = %message.from, kind = message.payload.kind(), "Ignoring signal");
            return;
        }
        let from = message.from;
        match message.payload {
            SignalPayload::Join(profile) => self.handle_join(from, profile).await,
            SignalPayload::Description(data) => self.handle_description(from, data).await,
            SignalPayload::IceCandidate(candidate) => {
                self.handle_remote_candidate(from, candidate).await;
            }
            SignalPayload::Leave => {
                self.teardown(&from, "left the room").await;
            }
        }
    }

    /// A join creates the link; the negotiation-needed event from attaching
    /// the local track starts the exchange. Re-announcements from a peer
    /// whose link is failing trigger an ICE restart.
    async fn handle_join(&mut self, from: ParticipantId, profile: Profile) {
        let negotiator = Negotiator::new(&self.local.id, &self.profile, self.signaling.as_ref());
        match self.peers.get_or_create(&from, Some(&self.local_stream)).await {
            Ok((link, created)) => {
                link.profile = Some(profile);
                if !created && link.ice_state.needs_restart() {
                    info!(peer_id = %from, state = ?link.ice_state, "Peer re-joined, restarting ICE");
                    link.ice_restart_pending = true;
                    if let Err(e) = negotiator.negotiate(link).await {
                        warn!(peer_id = %from, error = %e, "ICE restart failed");
                    }
                }
            }
            Err(e) => warn!(peer_id = %from, error = %e, "Failed to create peer link"),
        }
        self.publish();
    }

    async fn handle_description(&mut self, from: ParticipantId, data: DescriptionData) {
        let negotiator = Negotiator::new(&self.local.id, &self.profile, self.signaling.as_ref());
        let (link, created) = match self.peers.get_or_create(&from, Some(&self.local_stream)).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(peer_id = %from, error = %e, "Failed to create peer link");
                return;
            }
        };
        if let Some(profile) = data.profile() {
            link.profile = Some(profile);
        }
        let kind = data.description.sdp_type;
        match negotiator.handle_description(link, data.description).await {
            Ok(outcome) => debug!(peer_id = %from, ?kind, ?outcome, "Description handled"),
            Err(e) => warn!(peer_id = %from, ?kind, error = %e, "Failed to apply description"),
        }
        if created {
            self.publish();
        }
    }

    async fn handle_remote_candidate(&mut self, from: ParticipantId, candidate: IceCandidate) {
        let negotiator = Negotiator::new(&self.local.id, &self.profile, self.signaling.as_ref());
        let (link, created) = match self.peers.get_or_create(&from, Some(&self.local_stream)).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(peer_id = %from, error = %e, "Failed to create peer link");
                return;
            }
        };
        negotiator.handle_candidate(link, candidate).await;
        if created {
            self.publish();
        }
    }

    async fn handle_peer_event(&mut self, signal: PeerSignal) {
        let PeerSignal {
            peer,
            generation,
            event,
        } = signal;
        let negotiator = Negotiator::new(&self.local.id, &self.profile, self.signaling.as_ref());
        let Some(link) = self.peers.get_current(&peer, generation) else {
            trace!(peer_id = %peer, generation, "Dropping event from a replaced link");
            return;
        };

        match event {
            PeerEvent::NegotiationNeeded => {
                if let Err(e) = negotiator.negotiate(link).await {
                    warn!(peer_id = %peer, error = %e, "Negotiation failed");
                }
            }
            PeerEvent::LocalCandidate(candidate) => {
                let message =
                    SignalMessage::ice_candidate(self.local.id.clone(), peer.clone(), candidate);
                if let Err(e) = self.signaling.send(message).await {
                    warn!(peer_id = %peer, error = %e, "Failed to send ICE candidate");
                }
            }
            PeerEvent::RemoteTrack(stream) => {
                if link
                    .remote_stream
                    .as_ref()
                    .is_some_and(|existing| existing.id() == stream.id())
                {
                    return;
                }
                if let Some(previous) = link.remote_stream.replace(stream.clone()) {
                    previous.stop();
                }
                info!(peer_id = %peer, stream_id = %stream.id(), "Remote audio received");
                self.pipeline.attach_remote(&peer, &stream);
                self.publish();
            }
            PeerEvent::IceStateChanged(state) => {
                let previous = std::mem::replace(&mut link.ice_state, state);
                info!(peer_id = %peer, ?previous, ?state, "ICE connection state changed");

                let action = LifecycleAction::for_state(state, link.cleanup_timer.is_some());
                if action.cancel_grace_timer && link.cancel_cleanup() {
                    info!(peer_id = %peer, "Peer recovered within grace period");
                }
                if action.start_grace_timer {
                    debug!(peer_id = %peer, grace = ?self.grace_period, "Starting grace timer");
                    link.cleanup_timer = Some(GraceTimer::start(
                        peer.clone(),
                        generation,
                        self.grace_period,
                        self.grace_tx.clone(),
                    ));
                }
                if action.restart_ice {
                    link.ice_restart_pending = true;
                    if let Err(e) = negotiator.negotiate(link).await {
                        warn!(peer_id = %peer, error = %e, "ICE restart failed");
                    }
                }
            }
        }
    }

    async fn handle_grace_expired(&mut self, expired: GraceExpired) {
        let Some(link) = self.peers.get_current(&expired.peer, expired.generation) else {
            return;
        };
        // a timer cancelled after it fired may still have an expiry queued
        if link.cleanup_timer.as_ref().map(GraceTimer::id) != Some(expired.timer_id) {
            trace!(peer_id = %expired.peer, timer_id = expired.timer_id, "Ignoring stale grace expiry");
            return;
        }
        link.cleanup_timer = None;
        if link.ice_state.is_healthy() {
            return;
        }
        self.teardown(&expired.peer, "grace period expired").await;
    }

    fn handle_speaking(&mut self, update: SpeakingUpdate) {
        let known = update.participant == self.local.id || self.peers.contains(&update.participant);
        if !known {
            return;
        }
        let previous = self
            .speaking
            .insert(update.participant, update.speaking)
            .unwrap_or(false);
        if previous != update.speaking {
            self.publish();
        }
    }

    async fn on_foreground(&mut self) {
        self.pipeline.resume();

        let negotiator = Negotiator::new(&self.local.id, &self.profile, self.signaling.as_ref());
        for id in self.peers.ids() {
            let Some(link) = self.peers.get_mut(&id) else {
                continue;
            };
            if link.ice_state.needs_restart() {
                info!(peer_id = %id, state = ?link.ice_state, "Restarting ICE on foreground");
                link.ice_restart_pending = true;
                if let Err(e) = negotiator.negotiate(link).await {
                    warn!(peer_id = %id, error = %e, "ICE restart failed");
                }
            }
        }

        let join = SignalMessage::join(self.local.id.clone(), self.profile.clone());
        if let Err(e) = self.signaling.send(join).await {
            warn!(error = %e, "Failed to re-announce join");
        }
    }

    /// Release one link completely and update the projection
    async fn teardown(&mut self, peer: &ParticipantId, reason: &str) {
        let Some(link) = self.peers.remove(peer) else {
            return;
        };
        self.pipeline.detach_remote(peer);
        if let Some(stream) = &link.remote_stream {
            stream.stop();
        }
        self.speaking.remove(peer);
        if let Err(e) = link.connection.close().await {
            warn!(peer_id = %peer, error = %e, "Failed to close peer connection");
        }
        info!(peer_id = %peer, reason, "Peer link closed");
        self.publish();
    }

    async fn shutdown(&mut self, announce_leave: bool) {
        for link in self.peers.drain() {
            if let Some(stream) = &link.remote_stream {
                stream.stop();
            }
            if let Err(e) = link.connection.close().await {
                warn!(peer_id = %link.remote_id, error = %e, "Failed to close peer connection");
            }
        }
        self.pipeline.shutdown();
        self.speaking.clear();

        if announce_leave {
            if let Err(e) = self
                .signaling
                .send(SignalMessage::leave(self.local.id.clone()))
                .await
            {
                debug!(error = %e, "Failed to announce leave");
            }
        }
        self.signaling.close().await;

        self.shared.participants.send_replace(Vec::new());
        self.shared.set_phase(ConnectionPhase::Idle);
        debug!(room = %self.room, "Coordinator stopped");
    }

    fn is_muted(&self) -> bool {
        self.local_stream
            .primary_track()
            .is_some_and(|track| !track.is_enabled())
    }

    fn publish(&self) {
        let list = project(
            Some(LocalView {
                identity: &self.local,
                muted: self.is_muted(),
                has_stream: self.local_stream.is_active(),
            }),
            self.peers.links(),
            &self.speaking,
        );
        self.shared.participants.send_if_modified(|current| {
            if *current == list {
                false
            } else {
                *current = list;
                true
            }
        });
    }

    fn stats(&self) -> SessionStats {
        let mut peers: Vec<_> = self
            .peers
            .links()
            .map(|link| PeerStats {
                id: link.remote_id.clone(),
                generation: link.generation,
                phase: link.phase(),
                ice_state: link.ice_state,
                making_offer: link.negotiation.making_offer,
                ignoring_offer: link.negotiation.ignoring_offer,
                ignored_offers: link.ignored_offers,
                queued_candidates: link.ice_queue.len(),
                cleanup_pending: link.cleanup_timer.is_some(),
                has_stream: link.has_stream(),
                created_at: link.created_at,
            })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));

        SessionStats {
            open_links: peers.len(),
            pending_timers: peers.iter().filter(|p| p.cleanup_pending).count(),
            queued_candidates: peers.iter().map(|p| p.queued_candidates).sum(),
            analysis_loops: self.pipeline.analysis_count(),
            peers,
        }
    }
}
