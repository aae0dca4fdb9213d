//! Peer session manager.
//!
//! Owns the roster and one actor per remote peer. Signaling messages are
//! routed to the right actor; everything else the lobby cares about is
//! published as [`LobbyEvent`]s.

use crate::channel::DataChannelTransport;
use crate::config::{ChannelConfig, SessionConfig};
use crate::control::{ControlMessage, now_millis};
use crate::error::Result;
use crate::events::{ChannelEvent, LobbyEvent, ShareChange};
use crate::link::{PeerConnector, PeerId};
use crate::media::AudioTrack;
use crate::session::actor::{self, ActorContext, PeerCommand, PeerHandle};
use crate::session::state::{SessionState, should_initiate};
use crate::transfer::TransportProvider;
use dashmap::{DashMap, DashSet};
use huddle_signaling::{
    ChatMessage, Identity, PeerInfo, RegisterMetadata, SignalMessage, SignalSink,
    SignalingClient, SignalingEvent,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Per-peer session manager
///
/// At most one session exists per peer id. Sessions are created when a peer
/// shows up in the roster or sends the first offer, and are removed only
/// through [`PeerSessionManager::remove_peer`] or
/// [`PeerSessionManager::shutdown`].
pub struct PeerSessionManager {
    identity: Identity,
    connector: Arc<dyn PeerConnector>,
    signals: Arc<dyn SignalSink>,
    config: SessionConfig,
    channel_config: ChannelConfig,
    peers: DashMap<PeerId, PeerHandle>,
    roster: DashMap<PeerId, PeerInfo>,
    events: broadcast::Sender<LobbyEvent>,
    channel_events: mpsc::UnboundedSender<ChannelEvent>,
    muted: DashSet<PeerId>,
    mute_all: AtomicBool,
    mic_enabled: Arc<AtomicBool>,
    local_track: Mutex<Option<Arc<dyn AudioTrack>>>,
    shutdown: CancellationToken,
}

impl PeerSessionManager {
    /// Create a manager
    ///
    /// Returns the manager together with the stream of transfer traffic
    /// received on peer data channels.
    pub fn new(
        identity: Identity,
        connector: Arc<dyn PeerConnector>,
        signals: Arc<dyn SignalSink>,
        config: SessionConfig,
        channel_config: ChannelConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, _) = broadcast::channel(config.event_capacity);
        let (channel_events, channel_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            identity,
            connector,
            signals,
            config,
            channel_config,
            peers: DashMap::new(),
            roster: DashMap::new(),
            events,
            channel_events,
            muted: DashSet::new(),
            mute_all: AtomicBool::new(false),
            mic_enabled: Arc::new(AtomicBool::new(false)),
            local_track: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });
        (manager, channel_rx)
    }

    /// Subscribe to the signaling client and register with the lobby
    ///
    /// The subscription is taken before registering so the roster snapshot
    /// that follows `register-success` is never missed.
    ///
    /// # Errors
    ///
    /// Returns the registration outcome. A refused registration is also
    /// published as [`LobbyEvent::RegistrationFailed`].
    pub async fn initialize(
        self: &Arc<Self>,
        client: &SignalingClient,
        metadata: RegisterMetadata,
    ) -> Result<()> {
        let events = client.subscribe();
        tokio::spawn(dispatch_loop(
            Arc::downgrade(self),
            events,
            self.shutdown.clone(),
        ));

        tracing::info!(
            "Registering {} in lobby {}",
            self.identity.id,
            metadata.lobby_name
        );
        client.register(&self.identity, metadata).await?;
        Ok(())
    }

    /// Local member id
    pub fn local_id(&self) -> &str {
        &self.identity.id
    }

    /// Local identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Subscribe to lobby events
    pub fn subscribe(&self) -> broadcast::Receiver<LobbyEvent> {
        self.events.subscribe()
    }

    /// Route one signaling message
    pub fn handle_signal(&self, message: SignalMessage) {
        match message {
            SignalMessage::PlayersList { players } => {
                tracing::debug!("Roster snapshot with {} members", players.len());
                for player in players {
                    self.peer_discovered(player);
                }
            }
            SignalMessage::PlayerJoined { player } => self.peer_discovered(player),
            SignalMessage::PlayerLeft { id } => self.remove_peer(&id),
            SignalMessage::Offer { from, sdp, .. } => {
                if let Some(handle) = self.ensure_peer(&from) {
                    handle.send(PeerCommand::Offer(sdp));
                }
            }
            SignalMessage::Answer { from, sdp, .. } => match self.handle(&from) {
                Some(handle) => {
                    handle.send(PeerCommand::Answer(sdp));
                }
                None => tracing::debug!("Answer from unknown peer {}", from),
            },
            SignalMessage::IceCandidate {
                from, candidate, ..
            } => {
                if let Some(handle) = self.ensure_peer(&from) {
                    handle.send(PeerCommand::Candidate(candidate));
                }
            }
            SignalMessage::StatusUpdate {
                client_id,
                mic_enabled,
            } => {
                if client_id == self.identity.id {
                    return;
                }
                if let Some(mut entry) = self.roster.get_mut(&client_id) {
                    entry.mic_enabled = mic_enabled;
                }
                self.emit(LobbyEvent::PeerStatus {
                    peer_id: client_id,
                    mic_enabled,
                });
            }
            SignalMessage::ChatMessage(chat) => self.emit(LobbyEvent::Chat(chat)),
            SignalMessage::ShareAdded { share } => self.emit(LobbyEvent::Share {
                change: ShareChange::Added,
                share,
            }),
            SignalMessage::ShareRemoved { share } => self.emit(LobbyEvent::Share {
                change: ShareChange::Removed,
                share,
            }),
            SignalMessage::ShareUpdated { share } => self.emit(LobbyEvent::Share {
                change: ShareChange::Updated,
                share,
            }),
            SignalMessage::RegisterError { message } => {
                tracing::warn!("Registration refused: {}", message);
                self.emit(LobbyEvent::RegistrationFailed { message });
            }
            SignalMessage::VersionTooOld {
                current_version,
                minimum_version,
                download_url,
            } => {
                tracing::error!(
                    "Client version {} is older than the lobby minimum {}",
                    current_version,
                    minimum_version
                );
                self.emit(LobbyEvent::VersionError {
                    current: current_version,
                    minimum: minimum_version,
                    download_url,
                });
            }
            SignalMessage::RegisterSuccess => {
                tracing::info!("Registered as {}", self.identity.id);
            }
            other => tracing::trace!("Ignoring {} message", other.message_type()),
        }
    }

    fn peer_discovered(&self, player: PeerInfo) {
        if player.id == self.identity.id {
            return;
        }
        let peer_id = player.id.clone();
        let fresh = self.roster.insert(peer_id.clone(), player.clone()).is_none();
        if fresh {
            tracing::info!("{} ({}) is in the lobby", player.name, peer_id);
            self.emit(LobbyEvent::PeerJoined(player));
        }

        let Some(handle) = self.ensure_peer(&peer_id) else {
            return;
        };
        if should_initiate(&self.identity.id, &peer_id) {
            handle.send(PeerCommand::Initiate);
        }
    }

    fn handle(&self, peer_id: &str) -> Option<PeerHandle> {
        self.peers.get(peer_id).map(|h| h.value().clone())
    }

    fn ensure_peer(&self, peer_id: &str) -> Option<PeerHandle> {
        if peer_id == self.identity.id || self.shutdown.is_cancelled() {
            return None;
        }
        let handle = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| {
                actor::spawn(ActorContext {
                    local_id: self.identity.id.clone(),
                    peer_id: peer_id.to_string(),
                    config: self.config.clone(),
                    channel_config: self.channel_config.clone(),
                    connector: Arc::clone(&self.connector),
                    signals: Arc::clone(&self.signals),
                    events: self.events.clone(),
                    channel_events: self.channel_events.clone(),
                    local_track: self.current_track(),
                    mic_enabled: Arc::clone(&self.mic_enabled),
                })
            })
            .value()
            .clone();
        Some(handle)
    }

    fn current_track(&self) -> Option<Arc<dyn AudioTrack>> {
        self.local_track
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, event: LobbyEvent) {
        let _ = self.events.send(event);
    }

    /// Tear down the session with `peer_id` and drop it from the roster
    pub fn remove_peer(&self, peer_id: &str) {
        let listed = self.roster.remove(peer_id).is_some();
        self.muted.remove(peer_id);
        let session = self.peers.remove(peer_id);
        if let Some((_, handle)) = &session {
            handle.send(PeerCommand::Close);
        }
        if listed || session.is_some() {
            tracing::info!("{} left the lobby", peer_id);
            self.emit(LobbyEvent::PeerLeft {
                peer_id: peer_id.to_string(),
            });
        }
    }

    // ============ Queries ============

    /// Known peer ids
    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }

    /// Current roster
    pub fn roster(&self) -> Vec<PeerInfo> {
        self.roster.iter().map(|e| e.value().clone()).collect()
    }

    /// Session state for a peer
    pub fn session_state(&self, peer_id: &str) -> Option<SessionState> {
        self.peers.get(peer_id).map(|h| *h.state.borrow())
    }

    /// Watch a peer's session state
    pub fn state_watch(&self, peer_id: &str) -> Option<watch::Receiver<SessionState>> {
        self.peers.get(peer_id).map(|h| h.state.clone())
    }

    /// When traffic was last received on the peer's control channel
    pub fn last_seen(&self, peer_id: &str) -> Option<std::time::Instant> {
        self.peers.get(peer_id).and_then(|h| *h.last_seen.borrow())
    }

    /// Data channels of an established session
    pub fn transport(&self, peer_id: &str) -> Option<DataChannelTransport> {
        self.peers
            .get(peer_id)
            .and_then(|h| h.transport.borrow().clone())
    }

    // ============ Local media ============

    /// Replace the local audio track on every session
    ///
    /// Connected sessions renegotiate once the new track is attached.
    pub fn replace_audio_track(&self, track: Option<Arc<dyn AudioTrack>>) {
        *self
            .local_track
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = track.clone();
        for entry in self.peers.iter() {
            entry.value().send(PeerCommand::ReplaceTrack(track.clone()));
        }
    }

    /// Whether the local microphone is live
    pub fn mic_enabled(&self) -> bool {
        self.mic_enabled.load(Ordering::SeqCst)
    }

    /// Announce the local microphone state
    ///
    /// Sent to the lobby over signaling and to each connected peer over its
    /// control channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the signaling announcement could not be queued.
    pub async fn set_mic_enabled(&self, enabled: bool) -> Result<()> {
        self.mic_enabled.store(enabled, Ordering::SeqCst);

        self.signals.send_signal(SignalMessage::StatusUpdate {
            client_id: self.identity.id.clone(),
            mic_enabled: enabled,
        })?;

        let transports: Vec<DataChannelTransport> = self
            .peers
            .iter()
            .filter_map(|h| h.transport.borrow().clone())
            .collect();
        let status = ControlMessage::StatusUpdate {
            mic_enabled: enabled,
        };
        for transport in transports {
            if let Err(e) = transport.send_control(&status).await {
                tracing::debug!("Status to {} not sent: {}", transport.peer_id(), e);
            }
        }
        Ok(())
    }

    /// Mute or unmute one peer locally
    pub fn mute_peer(&self, peer_id: &str, muted: bool) {
        if muted {
            self.muted.insert(peer_id.to_string());
        } else {
            self.muted.remove(peer_id);
        }
    }

    /// Mute or unmute every peer locally
    pub fn mute_all(&self, muted: bool) {
        self.mute_all.store(muted, Ordering::SeqCst);
    }

    /// Whether audio from `peer_id` should be played
    pub fn should_play_audio(&self, peer_id: &str) -> bool {
        !self.mute_all.load(Ordering::SeqCst) && !self.muted.contains(peer_id)
    }

    // ============ Lobby messages ============

    /// Post a chat message to the lobby
    ///
    /// # Errors
    ///
    /// Returns an error if signaling is unavailable.
    pub fn send_chat(&self, content: impl Into<String>) -> Result<ChatMessage> {
        let chat = ChatMessage {
            player_id: self.identity.id.clone(),
            player_name: self.identity.name.clone(),
            content: content.into(),
            timestamp: now_millis(),
        };
        self.signals
            .send_signal(SignalMessage::ChatMessage(chat.clone()))?;
        Ok(chat)
    }

    /// Send an arbitrary lobby message
    ///
    /// # Errors
    ///
    /// Returns an error if signaling is unavailable.
    pub fn send_signal(&self, message: SignalMessage) -> Result<()> {
        self.signals.send_signal(message)?;
        Ok(())
    }

    /// Close every session and stop routing
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let ids = self.peers();
        for id in ids {
            if let Some((_, handle)) = self.peers.remove(&id) {
                handle.send(PeerCommand::Close);
            }
        }
        self.roster.clear();
        tracing::info!("Session manager for {} shut down", self.identity.id);
    }
}

impl TransportProvider for PeerSessionManager {
    fn transport(&self, peer_id: &str) -> Option<DataChannelTransport> {
        PeerSessionManager::transport(self, peer_id)
    }
}

impl std::fmt::Debug for PeerSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSessionManager")
            .field("local_id", &self.identity.id)
            .field("peers", &self.peers.len())
            .finish()
    }
}

async fn dispatch_loop(
    manager: Weak<PeerSessionManager>,
    mut events: broadcast::Receiver<SignalingEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Signaling dispatch lagged, {} events dropped", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(manager) = manager.upgrade() else {
            break;
        };

        match event {
            SignalingEvent::Message(message) => manager.handle_signal(message),
            SignalingEvent::Reconnecting { attempt, delay } => {
                tracing::info!("Signaling reconnect {} in {:?}", attempt, delay);
                manager.emit(LobbyEvent::SignalingReconnecting { attempt });
            }
            SignalingEvent::Reconnected => manager.emit(LobbyEvent::SignalingRestored),
            SignalingEvent::Disconnected { intentional } => {
                tracing::debug!("Signaling closed (intentional: {})", intentional);
            }
            SignalingEvent::Fatal(e) => {
                tracing::error!("Signaling stopped: {}", e);
                manager.emit(LobbyEvent::SignalingLost);
            }
        }
    }
    tracing::debug!("Signaling dispatch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{LinkState, SdpKind};
    use crate::memory::MemoryNetwork;
    use std::time::Duration;
    use tokio::time::timeout;

    struct RecordingSink {
        tx: mpsc::UnboundedSender<SignalMessage>,
    }

    impl SignalSink for RecordingSink {
        fn send_signal(&self, message: SignalMessage) -> huddle_signaling::Result<()> {
            let _ = self.tx.send(message);
            Ok(())
        }
    }

    fn manager(
        id: &str,
        network: &MemoryNetwork,
    ) -> (Arc<PeerSessionManager>, mpsc::UnboundedReceiver<SignalMessage>) {
        manager_with(id, network, SessionConfig::default())
    }

    fn manager_with(
        id: &str,
        network: &MemoryNetwork,
        config: SessionConfig,
    ) -> (Arc<PeerSessionManager>, mpsc::UnboundedReceiver<SignalMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (manager, _) = PeerSessionManager::new(
            Identity::new(id, id),
            Arc::new(network.clone()),
            Arc::new(RecordingSink { tx }),
            config,
            ChannelConfig::default(),
        );
        (manager, rx)
    }

    async fn next_answer(signals: &mut mpsc::UnboundedReceiver<SignalMessage>) -> String {
        timeout(Duration::from_secs(2), async {
            loop {
                match signals.recv().await {
                    Some(SignalMessage::Answer { sdp, .. }) => return sdp,
                    Some(_) => {}
                    None => panic!("signal sink closed"),
                }
            }
        })
        .await
        .unwrap()
    }

    async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    fn player(id: &str) -> PeerInfo {
        PeerInfo {
            id: id.to_string(),
            name: id.to_string(),
            mic_enabled: false,
            virtual_ip: None,
            client_version: None,
        }
    }

    #[tokio::test]
    async fn test_greater_id_sends_offer() {
        let network = MemoryNetwork::new();
        let (manager, mut signals) = manager("player-200", &network);

        manager.handle_signal(SignalMessage::PlayersList {
            players: vec![player("player-100"), player("player-200")],
        });

        let first = timeout(Duration::from_secs(2), signals.recv())
            .await
            .unwrap()
            .unwrap();
        match first {
            SignalMessage::Offer { from, to, .. } => {
                assert_eq!(from, "player-200");
                assert_eq!(to, "player-100");
            }
            other => panic!("expected offer, got {other:?}"),
        }
        assert_eq!(manager.peers(), vec!["player-100".to_string()]);
    }

    #[tokio::test]
    async fn test_repeated_offer_before_connect_uses_new_link() {
        let network = MemoryNetwork::new();
        network.set_auto_connect(false);
        let (manager, mut signals) = manager("player-100", &network);
        let offer = |sdp: &str| SignalMessage::Offer {
            from: "player-200".to_string(),
            to: "player-100".to_string(),
            sdp: sdp.to_string(),
        };

        manager.handle_signal(offer("offer-1"));
        next_answer(&mut signals).await;
        assert!(manager
            .session_state("player-200")
            .is_some_and(|state| !state.is_connected()));

        // the offerer gave up waiting and starts over
        manager.handle_signal(offer("offer-2"));
        next_answer(&mut signals).await;

        assert_eq!(network.links_created(), 2);
        assert_eq!(
            network.remote_descriptions("player-100", "player-200"),
            vec![(SdpKind::Offer, "offer-2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_fresh_start_drops_pending_retry() {
        let network = MemoryNetwork::new();
        network.set_auto_connect(false);
        let config = SessionConfig {
            failed_reconnect_delay: Duration::from_millis(100),
            ..SessionConfig::default()
        };
        let (manager, _signals) = manager_with("player-200", &network, config);

        manager.handle_signal(SignalMessage::PlayerJoined {
            player: player("player-100"),
        });
        wait_for("first offer", || {
            network.offers_created("player-200", "player-100") == 1
        })
        .await;

        assert!(network.inject_state("player-200", "player-100", LinkState::Failed));
        wait_for("session to fail", || {
            manager.session_state("player-100") == Some(SessionState::Failed)
        })
        .await;

        // the roster names the peer again before the retry timer fires
        manager.handle_signal(SignalMessage::PlayersList {
            players: vec![player("player-100"), player("player-200")],
        });
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(network.links_created(), 2);
        assert_eq!(network.ice_restarts("player-200", "player-100"), 0);
        assert_eq!(network.offers_created("player-200", "player-100"), 1);
    }

    #[tokio::test]
    async fn test_lesser_id_waits() {
        let network = MemoryNetwork::new();
        let (manager, mut signals) = manager("player-100", &network);

        manager.handle_signal(SignalMessage::PlayerJoined {
            player: player("player-200"),
        });

        let nothing = timeout(Duration::from_millis(200), signals.recv()).await;
        assert!(nothing.is_err());
        assert_eq!(network.links_created(), 0);
        assert_eq!(manager.roster().len(), 1);
    }

    #[tokio::test]
    async fn test_player_left_removes_session() {
        let network = MemoryNetwork::new();
        let (manager, _signals) = manager("b", &network);
        let mut events = manager.subscribe();

        manager.handle_signal(SignalMessage::PlayerJoined { player: player("a") });
        manager.handle_signal(SignalMessage::PlayerLeft { id: "a".into() });

        assert!(manager.peers().is_empty());
        assert!(manager.roster().is_empty());

        let mut saw_left = false;
        while let Ok(Ok(event)) = timeout(Duration::from_millis(200), events.recv()).await {
            if let LobbyEvent::PeerLeft { peer_id } = event {
                assert_eq!(peer_id, "a");
                saw_left = true;
                break;
            }
        }
        assert!(saw_left);
    }

    #[tokio::test]
    async fn test_mute_bookkeeping() {
        let network = MemoryNetwork::new();
        let (manager, _signals) = manager("a", &network);

        assert!(manager.should_play_audio("b"));
        manager.mute_peer("b", true);
        assert!(!manager.should_play_audio("b"));
        assert!(manager.should_play_audio("c"));

        manager.mute_all(true);
        assert!(!manager.should_play_audio("c"));
        manager.mute_all(false);
        manager.mute_peer("b", false);
        assert!(manager.should_play_audio("b"));
    }

    #[tokio::test]
    async fn test_lobby_messages_become_events() {
        let network = MemoryNetwork::new();
        let (manager, mut signals) = manager("a", &network);
        let mut events = manager.subscribe();

        manager.handle_signal(SignalMessage::RegisterError {
            message: "Incorrect password".into(),
        });
        match events.recv().await.unwrap() {
            LobbyEvent::RegistrationFailed { message } => {
                assert_eq!(message, "Incorrect password")
            }
            other => panic!("unexpected {other:?}"),
        }

        let sent = manager.send_chat("hi").unwrap();
        assert_eq!(sent.player_id, "a");
        match signals.recv().await.unwrap() {
            SignalMessage::ChatMessage(chat) => assert_eq!(chat.content, "hi"),
            other => panic!("unexpected {other:?}"),
        }

        manager.handle_signal(SignalMessage::StatusUpdate {
            client_id: "a".into(),
            mic_enabled: true,
        });
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_mic_status_goes_over_signaling() {
        let network = MemoryNetwork::new();
        let (manager, mut signals) = manager("a", &network);

        manager.set_mic_enabled(true).await.unwrap();
        assert!(manager.mic_enabled());
        assert_eq!(
            signals.recv().await.unwrap(),
            SignalMessage::StatusUpdate {
                client_id: "a".into(),
                mic_enabled: true
            }
        );
    }
}
