//! Lobby orchestrator.
//!
//! Wires the signaling client, the session manager and the transfer engine
//! together for one local member:
//!
//! ```text
//!               ┌──────────────────┐
//!  relay ◀────▶ │ SignalingClient  │
//!               └────────┬─────────┘
//!                        │ SignalingEvent
//!               ┌────────▼─────────┐  LobbyEvent
//!               │ PeerSessionMgr   │ ───────────▶ subscribers
//!               └────────┬─────────┘
//!                        │ ChannelEvent / transports
//!               ┌────────▼─────────┐  TransferProgress
//!               │ TransferEngine   │ ───────────▶ subscribers
//!               └──────────────────┘
//! ```
//!
//! A session that fails or disconnects pauses the transfers with that peer
//! instead of failing them. They resume when the session reconnects and are
//! aborted only when the peer leaves, reconnection is exhausted, or the
//! session stays down for `resume_timeout`.

use crate::config::LobbyConfig;
use crate::error::{Error, Result};
use crate::events::{ChannelEvent, LobbyEvent};
use crate::link::PeerConnector;
use crate::media::{AudioTrack, MediaSource};
use crate::session::{PeerSessionManager, SessionState};
use crate::transfer::{ChunkedTransferEngine, FileDescriptor, ShareAccess, TransferProgress};
use dashmap::DashMap;
use huddle_files::FileStore;
use huddle_signaling::{
    CLIENT_VERSION, ChatMessage, Identity, RegisterMetadata, ShareInfo, SignalMessage,
    SignalingClient,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A local member of a lobby
pub struct Lobby {
    config: LobbyConfig,
    client: SignalingClient,
    sessions: Arc<PeerSessionManager>,
    transfers: Arc<ChunkedTransferEngine>,
    published: Arc<DashMap<String, ShareInfo>>,
    media: Option<Arc<dyn MediaSource>>,
    mic_track: Mutex<Option<Arc<dyn AudioTrack>>>,
    tasks: CancellationToken,
}

impl Lobby {
    /// Connect and register in one step
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, the server is unreachable, or
    /// registration is refused.
    pub async fn join(
        config: LobbyConfig,
        connector: Arc<dyn PeerConnector>,
        store: Arc<dyn FileStore>,
        media: Option<Arc<dyn MediaSource>>,
    ) -> Result<Self> {
        let lobby = Self::connect(config, connector, store, media).await?;
        if let Err(e) = lobby.register(None).await {
            lobby.leave().await;
            return Err(e);
        }
        Ok(lobby)
    }

    /// Open signaling and start the routing tasks without registering
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the server is unreachable.
    pub async fn connect(
        config: LobbyConfig,
        connector: Arc<dyn PeerConnector>,
        store: Arc<dyn FileStore>,
        media: Option<Arc<dyn MediaSource>>,
    ) -> Result<Self> {
        config.validate()?;

        tracing::info!("Connecting to {}", config.server_url);
        let client = SignalingClient::connect(&config.server_url, config.signaling.clone()).await?;

        let identity = Identity::new(&config.player_id, &config.player_name);
        let (sessions, channel_events) = PeerSessionManager::new(
            identity,
            connector,
            Arc::new(client.clone()),
            config.session.clone(),
            config.channel.clone(),
        );
        let transfers = ChunkedTransferEngine::new(
            config.player_id.clone(),
            config.transfer.clone(),
            sessions.clone(),
            store,
        );

        let tasks = CancellationToken::new();
        tokio::spawn(route_channel_events(
            Arc::clone(&transfers),
            channel_events,
            tasks.clone(),
        ));
        tokio::spawn(watch_peer_sessions(
            Arc::clone(&transfers),
            Arc::clone(&sessions),
            config.transfer.resume_timeout,
            tasks.clone(),
        ));
        let published = Arc::new(DashMap::new());
        tokio::spawn(expire_shares(
            Arc::clone(&transfers),
            Arc::clone(&sessions),
            Arc::clone(&published),
            config.transfer.share_sweep_interval,
            tasks.clone(),
        ));

        Ok(Self {
            config,
            client,
            sessions,
            transfers,
            published,
            media,
            mic_track: Mutex::new(None),
            tasks,
        })
    }

    /// Register with the lobby
    ///
    /// `password` overrides the configured lobby password, so a refused
    /// registration can be retried on the same connection.
    ///
    /// # Errors
    ///
    /// Returns the server's refusal or a signaling failure.
    pub async fn register(&self, password: Option<String>) -> Result<()> {
        let metadata = RegisterMetadata {
            lobby_name: self.config.lobby_name.clone(),
            lobby_password: password.or_else(|| self.config.lobby_password.clone()),
            client_version: CLIENT_VERSION.to_string(),
            virtual_ip: self.config.virtual_ip.clone(),
        };
        self.sessions.initialize(&self.client, metadata).await
    }

    /// Local member id
    pub fn local_id(&self) -> &str {
        &self.config.player_id
    }

    /// Session manager
    pub fn sessions(&self) -> &Arc<PeerSessionManager> {
        &self.sessions
    }

    /// Transfer engine
    pub fn transfers(&self) -> &Arc<ChunkedTransferEngine> {
        &self.transfers
    }

    /// Signaling client
    pub fn signaling(&self) -> &SignalingClient {
        &self.client
    }

    /// Subscribe to lobby events
    pub fn subscribe(&self) -> broadcast::Receiver<LobbyEvent> {
        self.sessions.subscribe()
    }

    /// Subscribe to transfer progress
    pub fn subscribe_progress(&self) -> broadcast::Receiver<TransferProgress> {
        self.transfers.subscribe_progress()
    }

    /// Turn the local microphone on or off
    ///
    /// Enabling acquires a fresh track from the media source and attaches it
    /// to every session; disabling stops and detaches it. Either way the new
    /// state is announced to the lobby.
    ///
    /// # Errors
    ///
    /// Fails if no media source is configured or it cannot provide a track.
    pub async fn set_mic_enabled(&self, enabled: bool) -> Result<()> {
        let track = if enabled {
            let source = self
                .media
                .as_ref()
                .ok_or_else(|| Error::invalid_config("no audio source configured"))?;
            Some(source.acquire().await?)
        } else {
            None
        };

        let previous = std::mem::replace(
            &mut *self
                .mic_track
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            track.clone(),
        );
        if let Some(previous) = previous {
            previous.stop();
        }

        self.sessions.replace_audio_track(track);
        self.sessions.set_mic_enabled(enabled).await
    }

    /// Post a chat message
    ///
    /// # Errors
    ///
    /// Fails if signaling is unavailable.
    pub fn send_chat(&self, content: impl Into<String>) -> Result<ChatMessage> {
        self.sessions.send_chat(content)
    }

    /// Serve `root` openly and announce it to the lobby
    ///
    /// # Errors
    ///
    /// Fails if signaling is unavailable.
    pub fn publish_share(&self, share: ShareInfo, root: impl Into<PathBuf>) -> Result<()> {
        self.publish_share_with(share, ShareAccess::new(root))
    }

    /// Serve a share under `access` and announce it to the lobby
    ///
    /// The announcement's `protected` flag follows the access rules. An
    /// expiring share is withdrawn from the lobby by the periodic sweep.
    ///
    /// # Errors
    ///
    /// Fails if signaling is unavailable.
    pub fn publish_share_with(&self, mut share: ShareInfo, access: ShareAccess) -> Result<()> {
        share.owner_id = self.config.player_id.clone();
        share.protected = access.is_protected();
        self.transfers.share(share.id.clone(), access);
        self.published.insert(share.id.clone(), share.clone());
        self.sessions.send_signal(SignalMessage::ShareAdded { share })
    }

    /// Stop serving a share and withdraw it from the lobby
    ///
    /// # Errors
    ///
    /// Fails if signaling is unavailable.
    pub fn withdraw_share(&self, mut share: ShareInfo) -> Result<()> {
        share.owner_id = self.config.player_id.clone();
        self.transfers.unshare(&share.id);
        self.published.remove(&share.id);
        self.sessions.send_signal(SignalMessage::ShareRemoved { share })
    }

    /// Shares this member currently announces
    pub fn published_shares(&self) -> Vec<ShareInfo> {
        self.published.iter().map(|s| s.value().clone()).collect()
    }

    /// Download a file from another member
    ///
    /// # Errors
    ///
    /// Fails after [`leave`](Self::leave).
    pub fn download(
        &self,
        descriptor: FileDescriptor,
        save_path: impl Into<PathBuf>,
    ) -> Result<String> {
        self.transfers.request_download(descriptor, save_path)
    }

    /// Cancel a download
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransferNotFound`] if the download is not running.
    pub fn cancel_transfer(&self, request_id: &str) -> Result<()> {
        self.transfers.cancel(request_id)
    }

    /// Leave the lobby, closing every session and transfer
    pub async fn leave(&self) {
        tracing::info!("Leaving lobby {}", self.config.lobby_name);
        self.transfers.shutdown();
        self.sessions.shutdown();
        self.client.disconnect();
        self.tasks.cancel();

        let track = self
            .mic_track
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(track) = track {
            track.stop();
        }
        tokio::task::yield_now().await;
    }
}

impl std::fmt::Debug for Lobby {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lobby")
            .field("player_id", &self.config.player_id)
            .field("lobby", &self.config.lobby_name)
            .finish()
    }
}

async fn route_channel_events(
    engine: Arc<ChunkedTransferEngine>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    tasks: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = tasks.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(ChannelEvent::Control { peer_id, message }) => {
                engine.handle_control(&peer_id, message)
            }
            Some(ChannelEvent::Frame { peer_id, data }) => engine.handle_frame(&peer_id, &data),
            None => break,
        }
    }
}

// ============ Session watchdog ============

/// What the transfer engine should do about one peer
#[derive(Debug, Clone, PartialEq, Eq)]
enum PeerAction {
    Suspend(String),
    Resume(String),
    Abort(String),
}

/// Peers whose sessions are down, with the time their transfers give up
#[derive(Debug)]
struct InterruptedPeers {
    resume_timeout: Duration,
    deadlines: HashMap<String, Instant>,
}

impl InterruptedPeers {
    fn new(resume_timeout: Duration) -> Self {
        Self {
            resume_timeout,
            deadlines: HashMap::new(),
        }
    }

    fn observe(&mut self, event: &LobbyEvent, now: Instant) -> Option<PeerAction> {
        match event {
            LobbyEvent::PeerLeft { peer_id } | LobbyEvent::ReconnectExhausted { peer_id, .. } => {
                self.deadlines.remove(peer_id);
                Some(PeerAction::Abort(peer_id.clone()))
            }
            LobbyEvent::SessionState { peer_id, state } if state.is_connected() => self
                .deadlines
                .remove(peer_id)
                .map(|_| PeerAction::Resume(peer_id.clone())),
            LobbyEvent::SessionState {
                peer_id,
                state: SessionState::Failed | SessionState::Disconnected,
            } => {
                if self.deadlines.contains_key(peer_id) {
                    return None;
                }
                self.deadlines
                    .insert(peer_id.clone(), now + self.resume_timeout);
                Some(PeerAction::Suspend(peer_id.clone()))
            }
            _ => None,
        }
    }

    /// Interrupted peers that report connected again, for events lost to lag
    fn recovered(&mut self, is_connected: impl Fn(&str) -> bool) -> Vec<String> {
        let recovered: Vec<String> = self
            .deadlines
            .keys()
            .filter(|peer_id| is_connected(peer_id))
            .cloned()
            .collect();
        for peer_id in &recovered {
            self.deadlines.remove(peer_id);
        }
        recovered
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    fn expire(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(peer_id, _)| peer_id.clone())
            .collect();
        for peer_id in &expired {
            self.deadlines.remove(peer_id);
        }
        expired
    }
}

async fn watch_peer_sessions(
    engine: Arc<ChunkedTransferEngine>,
    sessions: Arc<PeerSessionManager>,
    resume_timeout: Duration,
    tasks: CancellationToken,
) {
    let mut events = sessions.subscribe();
    let mut interrupted = InterruptedPeers::new(resume_timeout);
    loop {
        let deadline = interrupted.next_deadline();
        let event = tokio::select! {
            _ = tasks.cancelled() => break,
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                for peer_id in interrupted.expire(Instant::now()) {
                    tracing::warn!(
                        "Session with {} did not recover within {:?}, aborting its transfers",
                        peer_id,
                        resume_timeout
                    );
                    engine.abort_peer(&peer_id);
                }
                continue;
            }
            event = events.recv() => event,
        };
        match event {
            Ok(event) => match interrupted.observe(&event, Instant::now()) {
                Some(PeerAction::Suspend(peer_id)) => engine.suspend_peer(&peer_id),
                Some(PeerAction::Resume(peer_id)) => engine.resume_peer(&peer_id),
                Some(PeerAction::Abort(peer_id)) => engine.abort_peer(&peer_id),
                None => {}
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Transfer watchdog lagged by {} events", skipped);
                let recovered = interrupted.recovered(|peer_id| {
                    sessions
                        .session_state(peer_id)
                        .is_some_and(|state| state.is_connected())
                });
                for peer_id in recovered {
                    engine.resume_peer(&peer_id);
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Withdraw expired shares from the engine and the lobby
async fn expire_shares(
    engine: Arc<ChunkedTransferEngine>,
    sessions: Arc<PeerSessionManager>,
    published: Arc<DashMap<String, ShareInfo>>,
    every: Duration,
    tasks: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tasks.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for share_id in engine.cleanup_expired_shares() {
            let Some((_, share)) = published.remove(&share_id) else {
                continue;
            };
            if let Err(e) = sessions.send_signal(SignalMessage::ShareRemoved { share }) {
                tracing::warn!("Could not withdraw expired share {}: {}", share_id, e);
            }
        }
    }
}
