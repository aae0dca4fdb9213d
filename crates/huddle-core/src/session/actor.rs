//! Per-peer session actor.
//!
//! Each remote peer gets one task that owns its [`PeerSession`]. Signaling
//! commands and link events are processed strictly one at a time, so the
//! negotiation state never needs a lock.
//!
//! ```text
//!  manager ──PeerCommand──▶ ┌─────────────┐ ──signals──▶ SignalSink
//!  link ────LinkEvent─────▶ │  PeerActor  │ ──events───▶ LobbyEvent broadcast
//!  timers (offer wait,      │             │ ──traffic──▶ ChannelEvent (engine)
//!   connect, reconnect, hb) └─────────────┘ ──watch────▶ state / transport
//! ```

use crate::channel::DataChannelTransport;
use crate::config::{ChannelConfig, SessionConfig};
use crate::control::ControlMessage;
use crate::error::Result;
use crate::events::{ChannelEvent, LobbyEvent};
use crate::link::{LinkEvent, LinkState, PeerConnector, PeerId};
use crate::media::AudioTrack;
use crate::session::peer::PeerSession;
use crate::session::state::{SessionState, should_initiate};
use huddle_signaling::{IceCandidateInit, SignalMessage, SignalSink};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

/// Instruction for a peer actor
pub(crate) enum PeerCommand {
    /// Send the initial offer (glare winner only)
    Initiate,
    /// Remote offer
    Offer(String),
    /// Remote answer
    Answer(String),
    /// Remote ICE candidate
    Candidate(IceCandidateInit),
    /// Local audio changed
    ReplaceTrack(Option<Arc<dyn AudioTrack>>),
    /// Tear down and stop
    Close,
}

/// Manager-side view of a peer actor
#[derive(Clone)]
pub(crate) struct PeerHandle {
    pub commands: mpsc::UnboundedSender<PeerCommand>,
    pub state: watch::Receiver<SessionState>,
    pub transport: watch::Receiver<Option<DataChannelTransport>>,
    pub last_seen: watch::Receiver<Option<std::time::Instant>>,
}

impl PeerHandle {
    pub fn send(&self, command: PeerCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

/// Everything an actor needs from its manager
pub(crate) struct ActorContext {
    pub local_id: PeerId,
    pub peer_id: PeerId,
    pub config: SessionConfig,
    pub channel_config: ChannelConfig,
    pub connector: Arc<dyn PeerConnector>,
    pub signals: Arc<dyn SignalSink>,
    pub events: broadcast::Sender<LobbyEvent>,
    pub channel_events: mpsc::UnboundedSender<ChannelEvent>,
    pub local_track: Option<Arc<dyn AudioTrack>>,
    pub mic_enabled: Arc<AtomicBool>,
}

/// Start an actor for `ctx.peer_id`
pub(crate) fn spawn(ctx: ActorContext) -> PeerHandle {
    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (state_tx, state) = watch::channel(SessionState::Connecting);
    let (transport_tx, transport) = watch::channel(None);
    let (last_seen_tx, last_seen) = watch::channel(None);

    let actor = PeerActor {
        initiator: should_initiate(&ctx.local_id, &ctx.peer_id),
        local_track: ctx.local_track.clone(),
        ctx,
        commands,
        state_tx,
        transport_tx,
        last_seen_tx,
        session: None,
        link_events: None,
        orphan_candidates: Vec::new(),
        deferred_offer: None,
        reconnect_at: None,
        reconnect_attempts: 0,
        exhausted_reported: false,
        renegotiate_pending: false,
        stale_reported: false,
    };
    tokio::spawn(actor.run());

    PeerHandle {
        commands: commands_tx,
        state,
        transport,
        last_seen,
    }
}

enum Wake {
    Command(PeerCommand),
    CommandsClosed,
    Link(Option<LinkEvent>),
    OfferWaitExpired,
    ConnectTimeout,
    Reconnect,
    Heartbeat,
}

struct PeerActor {
    ctx: ActorContext,
    initiator: bool,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    state_tx: watch::Sender<SessionState>,
    transport_tx: watch::Sender<Option<DataChannelTransport>>,
    last_seen_tx: watch::Sender<Option<std::time::Instant>>,
    session: Option<PeerSession>,
    link_events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    orphan_candidates: Vec<IceCandidateInit>,
    deferred_offer: Option<(String, Instant)>,
    local_track: Option<Arc<dyn AudioTrack>>,
    reconnect_at: Option<Instant>,
    reconnect_attempts: u32,
    exhausted_reported: bool,
    renegotiate_pending: bool,
    stale_reported: bool,
}

async fn recv_link(rx: &mut Option<mpsc::UnboundedReceiver<LinkEvent>>) -> Option<LinkEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl PeerActor {
    async fn run(mut self) {
        let mut heartbeat = time::interval(self.ctx.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(
            "Session actor for {} started ({})",
            self.ctx.peer_id,
            if self.initiator { "initiator" } else { "responder" }
        );

        loop {
            let offer_deadline = self.deferred_offer.as_ref().map(|(_, at)| *at);
            let connect_deadline = self
                .session
                .as_ref()
                .filter(|s| s.state() == SessionState::Connecting)
                .map(PeerSession::connect_deadline);
            let reconnect_at = self.reconnect_at;

            let wake = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => Wake::CommandsClosed,
                },
                event = recv_link(&mut self.link_events) => Wake::Link(event),
                _ = sleep_until_opt(offer_deadline) => Wake::OfferWaitExpired,
                _ = sleep_until_opt(connect_deadline) => Wake::ConnectTimeout,
                _ = sleep_until_opt(reconnect_at) => Wake::Reconnect,
                _ = heartbeat.tick() => Wake::Heartbeat,
            };

            match wake {
                Wake::Command(PeerCommand::Close) | Wake::CommandsClosed => {
                    self.shutdown().await;
                    return;
                }
                Wake::Command(command) => self.handle_command(command).await,
                Wake::Link(Some(event)) => self.handle_link_event(event).await,
                Wake::Link(None) => self.link_events = None,
                Wake::OfferWaitExpired => self.force_deferred_offer().await,
                Wake::ConnectTimeout => self.connect_timed_out(),
                Wake::Reconnect => self.reconnect().await,
                Wake::Heartbeat => self.heartbeat().await,
            }
        }
    }

    async fn handle_command(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::Initiate => self.initiate().await,
            PeerCommand::Offer(sdp) => self.handle_offer(sdp).await,
            PeerCommand::Answer(sdp) => self.handle_answer(sdp).await,
            PeerCommand::Candidate(candidate) => self.handle_candidate(candidate).await,
            PeerCommand::ReplaceTrack(track) => self.replace_track(track).await,
            PeerCommand::Close => {}
        }
    }

    // ============ Helpers ============

    fn emit(&self, event: LobbyEvent) {
        let _ = self.ctx.events.send(event);
    }

    fn signal(&self, message: SignalMessage) {
        let kind = message.message_type();
        if let Err(e) = self.ctx.signals.send_signal(message) {
            tracing::warn!("Failed to send {} to {}: {}", kind, self.ctx.peer_id, e);
        }
    }

    fn transition(&mut self, state: SessionState) {
        if let Some(session) = self.session.as_mut() {
            session.set_state(state);
        }
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!("Session {}: {} -> {}", self.ctx.peer_id, previous, state);
            self.emit(LobbyEvent::SessionState {
                peer_id: self.ctx.peer_id.clone(),
                state,
            });
        }
    }

    fn touch(&mut self) {
        self.last_seen_tx.send_replace(Some(std::time::Instant::now()));
        self.stale_reported = false;
    }

    /// Close the current session, returning candidates it never got to apply
    async fn teardown(&mut self) -> Vec<IceCandidateInit> {
        self.transport_tx.send_replace(None);
        self.link_events = None;
        self.deferred_offer = None;
        self.renegotiate_pending = false;

        match self.session.take() {
            Some(mut session) => {
                let carried = if session.remote_applied() {
                    Vec::new()
                } else {
                    session.take_pending()
                };
                session.close().await;
                carried
            }
            None => Vec::new(),
        }
    }

    /// Replace the session with one around a fresh link
    async fn open_session(&mut self) -> Result<()> {
        let carried = self.teardown().await;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link = self
            .ctx
            .connector
            .create_link(&self.ctx.local_id, &self.ctx.peer_id, events_tx)
            .await?;

        if self.local_track.is_some() {
            if let Err(e) = link.replace_audio_track(self.local_track.clone()).await {
                tracing::warn!("Could not attach local audio for {}: {}", self.ctx.peer_id, e);
            }
        }

        let mut session = PeerSession::new(
            self.ctx.peer_id.clone(),
            link,
            self.ctx.config.connect_timeout,
        );
        session.adopt_candidates(carried);
        session.adopt_candidates(self.orphan_candidates.drain(..));

        self.session = Some(session);
        self.link_events = Some(events_rx);
        self.transition(SessionState::Connecting);
        Ok(())
    }

    // ============ Negotiation ============

    async fn initiate(&mut self) {
        if self
            .session
            .as_ref()
            .is_some_and(|s| !s.state().is_terminal())
        {
            tracing::debug!("Session with {} already underway", self.ctx.peer_id);
            return;
        }
        // a fresh start owns the session; no stale retry may follow it
        self.reconnect_at = None;
        self.reconnect_attempts = 0;
        self.exhausted_reported = false;
        self.start_session(false).await;
    }

    async fn start_session(&mut self, ice_restart: bool) {
        if let Err(e) = self.open_session().await {
            tracing::warn!("Could not create link to {}: {}", self.ctx.peer_id, e);
            self.transition(SessionState::Failed);
            self.on_failure();
            return;
        }
        self.send_offer(ice_restart).await;
    }

    async fn send_offer(&mut self, ice_restart: bool) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.start_offer(ice_restart).await {
            Ok(sdp) => {
                let state = session.state();
                self.transition(state);
                tracing::info!(
                    "Sent offer to {}{}",
                    self.ctx.peer_id,
                    if ice_restart { " (ICE restart)" } else { "" }
                );
                self.signal(SignalMessage::Offer {
                    from: self.ctx.local_id.clone(),
                    to: self.ctx.peer_id.clone(),
                    sdp,
                });
            }
            Err(e) => {
                tracing::warn!("Failed to create offer for {}: {}", self.ctx.peer_id, e);
                self.fail_session();
            }
        }
    }

    async fn handle_offer(&mut self, sdp: String) {
        match self.session.as_ref() {
            None => self.answer_fresh(sdp).await,
            Some(session) if session.state().is_terminal() => {
                tracing::info!(
                    "Offer from {} replaces {} session",
                    self.ctx.peer_id,
                    session.state()
                );
                self.answer_fresh(sdp).await;
            }
            Some(session) if session.is_negotiating() => {
                tracing::debug!(
                    "Offer from {} deferred until our negotiation settles",
                    self.ctx.peer_id
                );
                let deadline = Instant::now() + self.ctx.config.negotiation_wait;
                self.deferred_offer = Some((sdp, deadline));
            }
            Some(session) if !session.state().is_connected() => {
                // the offerer gave up on the link we answered and started over
                tracing::info!(
                    "Offer from {} restarts the {} session on a new link",
                    self.ctx.peer_id,
                    session.state()
                );
                self.answer_fresh(sdp).await;
            }
            Some(_) => self.answer(sdp).await,
        }
    }

    async fn answer_fresh(&mut self, sdp: String) {
        self.reconnect_at = None;
        if let Err(e) = self.open_session().await {
            tracing::warn!("Could not create link to {}: {}", self.ctx.peer_id, e);
            self.transition(SessionState::Failed);
            return;
        }
        self.answer(sdp).await;
    }

    async fn answer(&mut self, sdp: String) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.accept_offer(&sdp).await {
            Ok(answer) => {
                let state = session.state();
                self.transition(state);
                tracing::debug!("Answered offer from {}", self.ctx.peer_id);
                self.signal(SignalMessage::Answer {
                    from: self.ctx.local_id.clone(),
                    to: self.ctx.peer_id.clone(),
                    sdp: answer,
                });
            }
            Err(e) => {
                tracing::warn!("Failed to answer offer from {}: {}", self.ctx.peer_id, e);
                self.fail_session();
            }
        }
    }

    async fn handle_answer(&mut self, sdp: String) {
        let Some(session) = self.session.as_mut().filter(|s| s.is_negotiating()) else {
            tracing::debug!("Ignoring unexpected answer from {}", self.ctx.peer_id);
            return;
        };

        if let Err(e) = session.accept_answer(&sdp).await {
            tracing::warn!("Failed to apply answer from {}: {}", self.ctx.peer_id, e);
            self.fail_session();
            return;
        }
        let state = session.state();
        self.transition(state);

        if let Some((offer, _)) = self.deferred_offer.take() {
            self.handle_offer(offer).await;
        } else if self.renegotiate_pending {
            self.renegotiate_pending = false;
            self.send_offer(false).await;
        }
    }

    async fn force_deferred_offer(&mut self) {
        let Some((sdp, _)) = self.deferred_offer.take() else {
            return;
        };
        tracing::warn!(
            "Negotiation with {} still in flight after {:?}, proceeding with remote offer",
            self.ctx.peer_id,
            self.ctx.config.negotiation_wait
        );
        if self.session.as_ref().is_some_and(|s| s.state().is_terminal()) {
            self.answer_fresh(sdp).await;
        } else {
            self.answer(sdp).await;
        }
    }

    async fn handle_candidate(&mut self, candidate: IceCandidateInit) {
        match self.session.as_mut() {
            Some(session) => match session.add_candidate(candidate).await {
                Ok(true) => {}
                Ok(false) => tracing::trace!(
                    "Queued candidate from {} ({} pending)",
                    self.ctx.peer_id,
                    session.pending_candidates()
                ),
                Err(e) => tracing::warn!("Candidate from {} rejected: {}", self.ctx.peer_id, e),
            },
            None => self.orphan_candidates.push(candidate),
        }
    }

    async fn replace_track(&mut self, track: Option<Arc<dyn AudioTrack>>) {
        self.local_track = track.clone();

        let Some(session) = self.session.as_ref() else {
            return;
        };
        if let Err(e) = session.link().replace_audio_track(track).await {
            tracing::warn!("Track replace for {} failed: {}", self.ctx.peer_id, e);
            return;
        }

        if session.is_negotiating() {
            self.renegotiate_pending = true;
        } else if session.state().is_connected() {
            tracing::debug!("Renegotiating with {} after track change", self.ctx.peer_id);
            self.send_offer(false).await;
        }
    }

    // ============ Connectivity ============

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::StateChanged(state) => self.link_state_changed(state).await,
            LinkEvent::LocalCandidate(candidate) => self.signal(SignalMessage::IceCandidate {
                from: self.ctx.local_id.clone(),
                to: self.ctx.peer_id.clone(),
                candidate,
            }),
            LinkEvent::RemoteTrack(track) => {
                tracing::debug!("Remote audio from {}", self.ctx.peer_id);
                self.emit(LobbyEvent::RemoteStream {
                    peer_id: self.ctx.peer_id.clone(),
                    track,
                });
            }
            LinkEvent::ControlMessage(bytes) => self.handle_control(&bytes),
            LinkEvent::TransferFrame(data) => {
                let _ = self.ctx.channel_events.send(ChannelEvent::Frame {
                    peer_id: self.ctx.peer_id.clone(),
                    data,
                });
            }
        }
    }

    async fn link_state_changed(&mut self, state: LinkState) {
        let Some(session) = self.session.as_ref() else {
            return;
        };

        match state {
            LinkState::New | LinkState::Connecting => {}
            LinkState::Connected => {
                let next = if session.is_negotiating() {
                    SessionState::Renegotiating
                } else {
                    SessionState::Connected
                };
                let transport = DataChannelTransport::new(
                    self.ctx.peer_id.clone(),
                    session.link().control_channel(),
                    session.link().transfer_channel(),
                    self.ctx.channel_config.clone(),
                );

                self.reconnect_at = None;
                self.reconnect_attempts = 0;
                self.exhausted_reported = false;
                self.touch();
                self.transport_tx.send_replace(Some(transport.clone()));
                self.transition(next);
                tracing::info!("Session with {} established", self.ctx.peer_id);

                let status = ControlMessage::StatusUpdate {
                    mic_enabled: self.ctx.mic_enabled.load(Ordering::SeqCst),
                };
                if let Err(e) = transport.send_control(&status).await {
                    tracing::debug!("Initial status to {} not sent: {}", self.ctx.peer_id, e);
                }
            }
            LinkState::Disconnected => {
                self.transport_tx.send_replace(None);
                self.transition(SessionState::Disconnected);
                if self.initiator {
                    let grace = self.disconnect_grace();
                    tracing::info!(
                        "Session with {} interrupted, reconnecting in {:?} unless it recovers",
                        self.ctx.peer_id,
                        grace
                    );
                    self.reconnect_at = Some(Instant::now() + grace);
                }
            }
            LinkState::Failed | LinkState::Closed => {
                tracing::warn!("Session with {} {:?}", self.ctx.peer_id, state);
                self.fail_session();
            }
        }
    }

    fn disconnect_grace(&self) -> Duration {
        let min = self.ctx.config.disconnect_grace_min.as_millis() as u64;
        let max = self.ctx.config.disconnect_grace_max.as_millis() as u64;
        let ms = rand::thread_rng().gen_range(min..=max.max(min));
        Duration::from_millis(ms)
    }

    fn fail_session(&mut self) {
        self.transport_tx.send_replace(None);
        self.transition(SessionState::Failed);
        self.on_failure();
    }

    /// Schedule a glare-gated reconnect
    fn on_failure(&mut self) {
        if !self.initiator {
            tracing::debug!("Waiting for {} to reconnect", self.ctx.peer_id);
            return;
        }
        if self.reconnect_attempts >= self.ctx.config.max_reconnect_attempts {
            self.reconnect_at = None;
            if !self.exhausted_reported {
                self.exhausted_reported = true;
                tracing::error!(
                    "Giving up on {} after {} reconnect attempts",
                    self.ctx.peer_id,
                    self.reconnect_attempts
                );
                self.emit(LobbyEvent::ReconnectExhausted {
                    peer_id: self.ctx.peer_id.clone(),
                    attempts: self.reconnect_attempts,
                });
            }
            return;
        }
        self.reconnect_at = Some(Instant::now() + self.ctx.config.failed_reconnect_delay);
    }

    fn connect_timed_out(&mut self) {
        tracing::warn!(
            "Session with {} not established within {:?}",
            self.ctx.peer_id,
            self.ctx.config.connect_timeout
        );
        self.fail_session();
    }

    async fn reconnect(&mut self) {
        self.reconnect_at = None;
        if self.state_tx.borrow().is_connected() {
            return;
        }
        self.reconnect_attempts += 1;
        tracing::info!(
            "Reconnecting to {} (attempt {}/{})",
            self.ctx.peer_id,
            self.reconnect_attempts,
            self.ctx.config.max_reconnect_attempts
        );
        self.start_session(true).await;
    }

    // ============ Control channel ============

    fn handle_control(&mut self, bytes: &[u8]) {
        let message = match ControlMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Malformed control message from {}: {}", self.ctx.peer_id, e);
                return;
            }
        };
        self.touch();

        match message {
            ControlMessage::Heartbeat { .. } => {}
            ControlMessage::StatusUpdate { mic_enabled } => {
                self.emit(LobbyEvent::PeerStatus {
                    peer_id: self.ctx.peer_id.clone(),
                    mic_enabled,
                });
            }
            message => {
                let _ = self.ctx.channel_events.send(ChannelEvent::Control {
                    peer_id: self.ctx.peer_id.clone(),
                    message,
                });
            }
        }
    }

    async fn heartbeat(&mut self) {
        let transport = self.transport_tx.borrow().clone();
        let Some(transport) = transport else {
            return;
        };

        let silent_for = self.last_seen_tx.borrow().map(|at| at.elapsed());
        if let Some(silence) = silent_for {
            if silence > self.ctx.config.heartbeat_timeout && !self.stale_reported {
                self.stale_reported = true;
                tracing::warn!("No traffic from {} for {:?}", self.ctx.peer_id, silence);
                self.emit(LobbyEvent::PeerStale {
                    peer_id: self.ctx.peer_id.clone(),
                });
            }
        }

        if let Err(e) = transport.send_control(&ControlMessage::heartbeat()).await {
            tracing::debug!("Heartbeat to {} failed: {}", self.ctx.peer_id, e);
        }
    }

    async fn shutdown(&mut self) {
        self.reconnect_at = None;
        self.teardown().await;
        self.transition(SessionState::Closed);
        tracing::debug!("Session actor for {} stopped", self.ctx.peer_id);
    }
}
