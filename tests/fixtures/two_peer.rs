//! Two-peer test fixtures
//!
//! [`TwoPeerFixture`] runs a relay on localhost and two [`Lobby`] members
//! whose peer links live on a shared [`MemoryNetwork`]. [`EnginePair`] skips
//! signaling entirely and wires two transfer engines over one negotiated
//! link, optionally leaving the owner side silent so downloads stall.
//!
//! # Example
//!
//! ```no_run
//! use huddle_tests::fixtures::TwoPeerFixture;
//!
//! # async fn demo() {
//! let fixture = TwoPeerFixture::new("player-100", "player-200").await;
//! fixture.wait_connected().await;
//! fixture.leave().await;
//! # }
//! ```

use crate::test_helpers::wait_until;
use async_trait::async_trait;
use dashmap::DashMap;
use huddle_core::{
    ChannelConfig, ChunkedTransferEngine, ControlMessage, DataChannelTransport, FileDescriptor,
    LinkEvent, Lobby, LobbyConfig, MediaSource, MemoryNetwork, PeerConnector, SdpKind,
    SessionConfig, SessionState, TransferConfig, TransferProgress, TransportProvider,
};
use huddle_files::{ByteRange, FileStore, MemoryFileStore};
use huddle_signaling::{RelayConfig, RelayServer};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Lobby every fixture member joins
pub const LOBBY: &str = "fixture";

/// Root the owner's share is mapped to in its file store
pub const SHARE_ROOT: &str = "/shared";

/// Session timings short enough for tests
pub fn fast_session() -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_secs(5),
        failed_reconnect_delay: Duration::from_millis(50),
        disconnect_grace_min: Duration::from_millis(50),
        disconnect_grace_max: Duration::from_millis(100),
        ..SessionConfig::default()
    }
}

/// Lobby configuration for member `id` on `relay`
pub fn member_config(relay: &RelayServer, id: &str) -> LobbyConfig {
    LobbyConfig {
        server_url: format!("ws://{}", relay.local_addr()),
        player_id: id.to_string(),
        player_name: id.to_uppercase(),
        lobby_name: LOBBY.to_string(),
        session: fast_session(),
        ..LobbyConfig::default()
    }
}

// ============ Gated store ============

/// Switch that holds reads on a [`GatedStore`] while closed
#[derive(Clone)]
pub struct ReadGate(Arc<watch::Sender<bool>>);

impl ReadGate {
    /// Let reads through
    pub fn open(&self) {
        self.0.send_replace(true);
    }

    /// Hold every read started from now on
    pub fn close(&self) {
        self.0.send_replace(false);
    }
}

/// [`MemoryFileStore`] whose range reads wait for a [`ReadGate`]
pub struct GatedStore {
    inner: Arc<MemoryFileStore>,
    gate: watch::Receiver<bool>,
}

impl GatedStore {
    /// Wrap `inner` behind an open gate
    pub fn new(inner: Arc<MemoryFileStore>) -> (Self, ReadGate) {
        let (tx, rx) = watch::channel(true);
        (Self { inner, gate: rx }, ReadGate(Arc::new(tx)))
    }
}

#[async_trait]
impl FileStore for GatedStore {
    async fn size(&self, path: &Path) -> huddle_files::Result<u64> {
        self.inner.size(path).await
    }

    async fn read_range(&self, path: &Path, range: ByteRange) -> huddle_files::Result<Vec<u8>> {
        let mut gate = self.gate.clone();
        // the sender lives as long as the fixture
        let _ = gate.wait_for(|open| *open).await;
        self.inner.read_range(path, range).await
    }

    async fn write_all(&self, path: &Path, data: &[u8]) -> huddle_files::Result<()> {
        self.inner.write_all(path, data).await
    }
}

// ============ Lobby members ============

/// One lobby member and its in-memory file store
pub struct Member {
    /// The joined lobby
    pub lobby: Lobby,
    /// Files visible to this member
    pub store: Arc<MemoryFileStore>,
    /// Holds reads from [`Member::store`] while closed; open by default
    pub gate: ReadGate,
}

impl Member {
    /// Member id
    pub fn id(&self) -> &str {
        self.lobby.local_id()
    }
}

/// Relay plus two lobby members on a shared in-memory network
pub struct TwoPeerFixture {
    /// Relay both members registered with
    pub relay: RelayServer,
    /// Network carrying the peer links
    pub network: MemoryNetwork,
    /// Member that joined first
    pub first: Member,
    /// Member that joined second
    pub second: Member,
}

impl TwoPeerFixture {
    /// Join `first`, then `second`
    pub async fn new(first: &str, second: &str) -> Self {
        Self::with_configs(first, second, |_| {}, None).await
    }

    /// Join two members, letting `adjust` edit each configuration and
    /// giving both the same `media` source
    pub async fn with_configs(
        first: &str,
        second: &str,
        adjust: impl Fn(&mut LobbyConfig),
        media: Option<Arc<dyn MediaSource>>,
    ) -> Self {
        let relay = RelayServer::bind("127.0.0.1:0", RelayConfig::new(LOBBY))
            .await
            .unwrap();
        let network = MemoryNetwork::new();

        let first = join(&relay, &network, first, &adjust, media.clone()).await;
        let second = join(&relay, &network, second, &adjust, media).await;

        Self {
            relay,
            network,
            first,
            second,
        }
    }

    /// Wait until both sides report a connected session with open channels
    pub async fn wait_connected(&self) {
        let (a, b) = (&self.first, &self.second);
        wait_until("sessions to connect", Duration::from_secs(5), || {
            connected(a, b.id()) && connected(b, a.id())
        })
        .await;
    }

    /// Leave with both members and stop the relay
    pub async fn leave(self) {
        self.first.lobby.leave().await;
        self.second.lobby.leave().await;
        self.relay.shutdown();
    }
}

async fn join(
    relay: &RelayServer,
    network: &MemoryNetwork,
    id: &str,
    adjust: &impl Fn(&mut LobbyConfig),
    media: Option<Arc<dyn MediaSource>>,
) -> Member {
    let mut config = member_config(relay, id);
    adjust(&mut config);
    let store = Arc::new(MemoryFileStore::new());
    let (gated, gate) = GatedStore::new(store.clone());
    let lobby = Lobby::join(config, Arc::new(network.clone()), Arc::new(gated), media)
        .await
        .unwrap();
    Member { lobby, store, gate }
}

fn connected(member: &Member, peer: &str) -> bool {
    member.lobby.sessions().session_state(peer) == Some(SessionState::Connected)
        && member.lobby.sessions().transport(peer).is_some()
}

/// Descriptor for `name` shared by `owner` under `share_id`
pub fn descriptor(share_id: &str, owner: &str, name: &str, size: u64) -> FileDescriptor {
    FileDescriptor {
        share_id: share_id.to_string(),
        owner_id: owner.to_string(),
        path: name.to_string(),
        name: name.to_string(),
        size,
        password: None,
    }
}

// ============ Engine pair ============

#[derive(Default)]
struct StaticTransports(DashMap<String, DataChannelTransport>);

impl TransportProvider for StaticTransports {
    fn transport(&self, peer_id: &str) -> Option<DataChannelTransport> {
        self.0.get(peer_id).map(|t| t.value().clone())
    }
}

/// Two transfer engines joined by one negotiated in-memory link
pub struct EnginePair {
    /// Downloading side (`requester`)
    pub requester: Arc<ChunkedTransferEngine>,
    /// Serving side (`owner`)
    pub owner: Arc<ChunkedTransferEngine>,
    /// Requester's file store
    pub requester_store: Arc<MemoryFileStore>,
    /// Owner's file store, shared as `share-1` rooted at [`SHARE_ROOT`]
    pub owner_store: Arc<MemoryFileStore>,
    _network: MemoryNetwork,
    _silenced: Option<mpsc::UnboundedReceiver<LinkEvent>>,
}

impl EnginePair {
    /// Requester and owner that both process their inbound traffic
    pub async fn new(config: TransferConfig) -> Self {
        Self::build(config, true).await
    }

    /// Owner never sees the requests, so admitted downloads stay in flight
    pub async fn stalled(config: TransferConfig) -> Self {
        Self::build(config, false).await
    }

    async fn build(config: TransferConfig, serve: bool) -> Self {
        let network = MemoryNetwork::new();
        let (requester_tx, requester_rx) = mpsc::unbounded_channel();
        let (owner_tx, owner_rx) = mpsc::unbounded_channel();
        let requester_link = network
            .create_link("requester", "owner", requester_tx)
            .await
            .unwrap();
        let owner_link = network
            .create_link("owner", "requester", owner_tx)
            .await
            .unwrap();

        let offer = requester_link.create_offer(false).await.unwrap();
        owner_link
            .set_remote_description(SdpKind::Offer, &offer)
            .await
            .unwrap();
        let answer = owner_link.create_answer().await.unwrap();
        requester_link
            .set_remote_description(SdpKind::Answer, &answer)
            .await
            .unwrap();

        let requester_transports = Arc::new(StaticTransports::default());
        requester_transports.0.insert(
            "owner".to_string(),
            DataChannelTransport::new(
                "owner",
                requester_link.control_channel(),
                requester_link.transfer_channel(),
                ChannelConfig::default(),
            ),
        );
        let owner_transports = Arc::new(StaticTransports::default());
        owner_transports.0.insert(
            "requester".to_string(),
            DataChannelTransport::new(
                "requester",
                owner_link.control_channel(),
                owner_link.transfer_channel(),
                ChannelConfig::default(),
            ),
        );

        let requester_store = Arc::new(MemoryFileStore::new());
        let owner_store = Arc::new(MemoryFileStore::new());
        let requester = ChunkedTransferEngine::new(
            "requester",
            config.clone(),
            requester_transports,
            requester_store.clone(),
        );
        let owner = ChunkedTransferEngine::new(
            "owner",
            config,
            owner_transports,
            owner_store.clone(),
        );
        owner.share_directory("share-1", SHARE_ROOT);

        pump(Arc::clone(&requester), "owner", requester_rx);
        let silenced = if serve {
            pump(Arc::clone(&owner), "requester", owner_rx);
            None
        } else {
            Some(owner_rx)
        };

        Self {
            requester,
            owner,
            requester_store,
            owner_store,
            _network: network,
            _silenced: silenced,
        }
    }

    /// Wait for `request_id` to reach a terminal status
    pub async fn wait_terminal(&self, request_id: &str) -> TransferProgress {
        let requester = &self.requester;
        wait_until("transfer to finish", Duration::from_secs(10), || {
            requester
                .progress(request_id)
                .is_some_and(|p| p.status.is_terminal())
        })
        .await;
        self.requester.progress(request_id).unwrap()
    }
}

fn pump(
    engine: Arc<ChunkedTransferEngine>,
    from: &'static str,
    mut rx: mpsc::UnboundedReceiver<LinkEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                LinkEvent::ControlMessage(bytes) => {
                    if let Ok(message) = ControlMessage::from_bytes(&bytes) {
                        engine.handle_control(from, message);
                    }
                }
                LinkEvent::TransferFrame(data) => engine.handle_frame(from, &data),
                _ => {}
            }
        }
    });
}
