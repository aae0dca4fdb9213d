//! In-process peer link backend.
//!
//! [`MemoryNetwork`] pairs links by `(local, remote)` id so two session
//! managers in the same process can negotiate and exchange data channel
//! traffic without sockets. A link reports `connected` once it holds both a
//! local and a remote description. Failures can be injected per link.
//!
//! Used by the integration tests and the `loopback` CLI command.

use crate::error::{ChannelError, Error, Result};
use crate::link::{
    CONTROL_CHANNEL_LABEL, ChannelState, DataChannel, LinkEvent, LinkState, PeerConnector,
    PeerLink, SdpKind, TRANSFER_CHANNEL_LABEL,
};
use crate::media::AudioTrack;
use async_trait::async_trait;
use dashmap::DashMap;
use huddle_signaling::IceCandidateInit;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type LinkKey = (String, String);

struct NetworkInner {
    links: DashMap<LinkKey, Arc<LinkCore>>,
    auto_connect: AtomicBool,
    links_created: AtomicUsize,
    next_port: AtomicU32,
}

struct LinkCore {
    network: Weak<NetworkInner>,
    local: String,
    remote: String,
    events: mpsc::UnboundedSender<LinkEvent>,
    state: Mutex<LinkState>,
    has_local: AtomicBool,
    has_remote: AtomicBool,
    sdp_version: AtomicU64,
    offers: AtomicUsize,
    ice_restarts: AtomicUsize,
    applied_candidates: Mutex<Vec<String>>,
    remote_descriptions: Mutex<Vec<(SdpKind, String)>>,
    track: Mutex<Option<Arc<dyn AudioTrack>>>,
}

impl LinkCore {
    fn state(&self) -> LinkState {
        *lock(&self.state)
    }

    fn set_state(&self, state: LinkState) {
        let changed = {
            let mut current = lock(&self.state);
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            let _ = self.events.send(LinkEvent::StateChanged(state));
        }
    }

    fn peer(&self) -> Option<Arc<LinkCore>> {
        let network = self.network.upgrade()?;
        let key = (self.remote.clone(), self.local.clone());
        network.links.get(&key).map(|l| Arc::clone(l.value()))
    }

    fn emit_local_candidate(&self) {
        let Some(network) = self.network.upgrade() else {
            return;
        };
        let port = network.next_port.fetch_add(1, Ordering::Relaxed);
        let candidate = IceCandidateInit {
            candidate: format!("candidate:{port} 1 udp 2122260223 127.0.0.1 {port} typ host"),
            sdp_m_line_index: Some(0),
            sdp_mid: Some("0".to_string()),
        };
        let _ = self.events.send(LinkEvent::LocalCandidate(candidate));
    }

    fn maybe_connect(&self) {
        let auto_connect = self
            .network
            .upgrade()
            .is_some_and(|n| n.auto_connect.load(Ordering::SeqCst));
        let ready = self.has_local.load(Ordering::SeqCst) && self.has_remote.load(Ordering::SeqCst);

        if ready && matches!(self.state(), LinkState::New | LinkState::Connecting) {
            self.set_state(LinkState::Connecting);
            if auto_connect {
                self.set_state(LinkState::Connected);
            }
        }
    }

    fn description(&self, kind: SdpKind, ice_restart: bool) -> String {
        let version = self.sdp_version.fetch_add(1, Ordering::Relaxed);
        let kind = match kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        };
        format!(
            "v=0\r\no=- 0 {version} IN IP4 127.0.0.1\r\ns={local}\r\na=type:{kind}\r\na=ice-restart:{ice_restart}\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n",
            local = self.local,
        )
    }

    fn deliver(&self, kind: ChannelKind, data: Vec<u8>) -> std::result::Result<(), ChannelError> {
        let peer = self
            .peer()
            .ok_or_else(|| ChannelError::Send(format!("{} is unreachable", self.remote)))?;
        if matches!(peer.state(), LinkState::Closed | LinkState::Failed) {
            return Err(ChannelError::Send(format!("{} link is down", self.remote)));
        }
        let event = match kind {
            ChannelKind::Control => LinkEvent::ControlMessage(data),
            ChannelKind::Transfer => LinkEvent::TransferFrame(data),
        };
        peer.events
            .send(event)
            .map_err(|_| ChannelError::Send(format!("{} stopped listening", self.remote)))
    }
}

#[derive(Debug, Clone, Copy)]
enum ChannelKind {
    Control,
    Transfer,
}

struct MemoryChannel {
    core: Arc<LinkCore>,
    kind: ChannelKind,
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        match self.kind {
            ChannelKind::Control => CONTROL_CHANNEL_LABEL,
            ChannelKind::Transfer => TRANSFER_CHANNEL_LABEL,
        }
    }

    fn ready_state(&self) -> ChannelState {
        match self.core.state() {
            LinkState::Connected => ChannelState::Open,
            LinkState::New | LinkState::Connecting | LinkState::Disconnected => {
                ChannelState::Connecting
            }
            LinkState::Failed | LinkState::Closed => ChannelState::Closed,
        }
    }

    fn buffered_amount(&self) -> usize {
        0
    }

    async fn send(&self, data: Vec<u8>) -> std::result::Result<(), ChannelError> {
        if self.ready_state() != ChannelState::Open {
            return Err(ChannelError::NotOpen(self.label().to_string()));
        }
        self.core.deliver(self.kind, data)
    }
}

struct MemoryLink {
    core: Arc<LinkCore>,
    control: Arc<MemoryChannel>,
    transfer: Arc<MemoryChannel>,
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        if self.core.state() == LinkState::Closed {
            return Err(Error::negotiation("link is closed"));
        }
        self.core.offers.fetch_add(1, Ordering::SeqCst);
        if ice_restart {
            self.core.ice_restarts.fetch_add(1, Ordering::SeqCst);
        }
        let sdp = self.core.description(SdpKind::Offer, ice_restart);
        self.core.has_local.store(true, Ordering::SeqCst);
        self.core.emit_local_candidate();
        self.core.maybe_connect();
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String> {
        if !self.core.has_remote.load(Ordering::SeqCst) {
            return Err(Error::negotiation("no remote offer to answer"));
        }
        let sdp = self.core.description(SdpKind::Answer, false);
        self.core.has_local.store(true, Ordering::SeqCst);
        self.core.emit_local_candidate();
        self.core.maybe_connect();
        Ok(sdp)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<()> {
        if self.core.state() == LinkState::Closed {
            return Err(Error::negotiation("link is closed"));
        }
        if kind == SdpKind::Answer && !self.core.has_local.load(Ordering::SeqCst) {
            return Err(Error::negotiation("answer without a local offer"));
        }
        lock(&self.core.remote_descriptions).push((kind, sdp.to_string()));
        self.core.has_remote.store(true, Ordering::SeqCst);

        let remote_track = self.core.peer().and_then(|peer| lock(&peer.track).clone());
        if let Some(track) = remote_track {
            let _ = self.core.events.send(LinkEvent::RemoteTrack(track));
        }

        self.core.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        if !self.core.has_remote.load(Ordering::SeqCst) {
            return Err(Error::negotiation("candidate before remote description"));
        }
        lock(&self.core.applied_candidates).push(candidate.candidate);
        Ok(())
    }

    async fn replace_audio_track(&self, track: Option<Arc<dyn AudioTrack>>) -> Result<()> {
        *lock(&self.core.track) = track;
        Ok(())
    }

    fn control_channel(&self) -> Arc<dyn DataChannel> {
        self.control.clone()
    }

    fn transfer_channel(&self) -> Arc<dyn DataChannel> {
        self.transfer.clone()
    }

    fn state(&self) -> LinkState {
        self.core.state()
    }

    async fn close(&self) {
        self.core.set_state(LinkState::Closed);
        if let Some(network) = self.core.network.upgrade() {
            let key = (self.core.local.clone(), self.core.remote.clone());
            network
                .links
                .remove_if(&key, |_, current| Arc::ptr_eq(current, &self.core));
        }
    }
}

/// In-process network of peer links
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Create an empty network where links connect as soon as negotiated
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                links: DashMap::new(),
                auto_connect: AtomicBool::new(true),
                links_created: AtomicUsize::new(0),
                next_port: AtomicU32::new(50_000),
            }),
        }
    }

    /// Hold newly negotiated links in `connecting` (`false`) or let them connect
    pub fn set_auto_connect(&self, enabled: bool) {
        self.inner.auto_connect.store(enabled, Ordering::SeqCst);
    }

    fn core(&self, local: &str, remote: &str) -> Option<Arc<LinkCore>> {
        let key = (local.to_string(), remote.to_string());
        self.inner.links.get(&key).map(|l| Arc::clone(l.value()))
    }

    /// Total links ever created
    pub fn links_created(&self) -> usize {
        self.inner.links_created.load(Ordering::SeqCst)
    }

    /// State of the current `local → remote` link
    pub fn link_state(&self, local: &str, remote: &str) -> Option<LinkState> {
        self.core(local, remote).map(|c| c.state())
    }

    /// Candidates applied on the `local → remote` link, in order
    pub fn applied_candidates(&self, local: &str, remote: &str) -> Vec<String> {
        self.core(local, remote)
            .map(|c| lock(&c.applied_candidates).clone())
            .unwrap_or_default()
    }

    /// Remote descriptions applied on the `local → remote` link, in order
    pub fn remote_descriptions(&self, local: &str, remote: &str) -> Vec<(SdpKind, String)> {
        self.core(local, remote)
            .map(|c| lock(&c.remote_descriptions).clone())
            .unwrap_or_default()
    }

    /// Offers created by the `local → remote` link
    pub fn offers_created(&self, local: &str, remote: &str) -> usize {
        self.core(local, remote)
            .map_or(0, |c| c.offers.load(Ordering::SeqCst))
    }

    /// Offers requesting an ICE restart created by the `local → remote` link
    pub fn ice_restarts(&self, local: &str, remote: &str) -> usize {
        self.core(local, remote)
            .map_or(0, |c| c.ice_restarts.load(Ordering::SeqCst))
    }

    /// Id of the outgoing track on the `local → remote` link
    pub fn sender_track(&self, local: &str, remote: &str) -> Option<String> {
        self.core(local, remote)
            .and_then(|c| lock(&c.track).as_ref().map(|t| t.id().to_string()))
    }

    /// Force the `local → remote` link into `state`
    ///
    /// Returns `false` if no such link exists.
    pub fn inject_state(&self, local: &str, remote: &str, state: LinkState) -> bool {
        match self.core(local, remote) {
            Some(core) => {
                core.set_state(state);
                true
            }
            None => false,
        }
    }

    /// Report both directions of a pair as failed
    pub fn fail_pair(&self, a: &str, b: &str) {
        self.inject_state(a, b, LinkState::Failed);
        self.inject_state(b, a, LinkState::Failed);
    }
}

#[async_trait]
impl PeerConnector for MemoryNetwork {
    async fn create_link(
        &self,
        local: &str,
        remote: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>> {
        let core = Arc::new(LinkCore {
            network: Arc::downgrade(&self.inner),
            local: local.to_string(),
            remote: remote.to_string(),
            events,
            state: Mutex::new(LinkState::New),
            has_local: AtomicBool::new(false),
            has_remote: AtomicBool::new(false),
            sdp_version: AtomicU64::new(1),
            offers: AtomicUsize::new(0),
            ice_restarts: AtomicUsize::new(0),
            applied_candidates: Mutex::new(Vec::new()),
            remote_descriptions: Mutex::new(Vec::new()),
            track: Mutex::new(None),
        });

        self.inner
            .links
            .insert((local.to_string(), remote.to_string()), Arc::clone(&core));
        self.inner.links_created.fetch_add(1, Ordering::SeqCst);
        tracing::trace!("Memory link {} -> {} created", local, remote);

        Ok(Arc::new(MemoryLink {
            control: Arc::new(MemoryChannel {
                core: Arc::clone(&core),
                kind: ChannelKind::Control,
            }),
            transfer: Arc::new(MemoryChannel {
                core: Arc::clone(&core),
                kind: ChannelKind::Transfer,
            }),
            core,
        }))
    }
}
