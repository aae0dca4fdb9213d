//! Lobby relay server.
//!
//! Accepts WebSocket members of a single lobby, validates their
//! registration, keeps the roster and routes peer-addressed messages. It
//! never sees media or file bytes.

use crate::error::{Result, SignalingError};
use crate::protocol::{PeerInfo, SignalMessage, compare_versions};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::cmp::Ordering as CmpOrdering;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Name of the lobby this relay serves
    pub lobby_name: String,
    /// Lobby password, if protected
    pub password: Option<String>,
    /// Oldest client build accepted
    pub minimum_version: String,
    /// Upgrade location reported to rejected clients
    pub download_url: Option<String>,
    /// Maximum number of registered members
    pub max_clients: usize,
}

impl RelayConfig {
    /// Create a configuration for an open lobby
    pub fn new(lobby_name: impl Into<String>) -> Self {
        Self {
            lobby_name: lobby_name.into(),
            password: None,
            minimum_version: "0.0.0".to_string(),
            download_url: None,
            max_clients: 64,
        }
    }

    /// Require a password to join
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Reject clients older than `version`
    pub fn with_minimum_version(mut self, version: impl Into<String>) -> Self {
        self.minimum_version = version.into();
        self
    }
}

/// Registered member
#[derive(Debug, Clone)]
struct Member {
    /// Connection serial, distinguishes a stale socket from its replacement
    conn_id: u64,
    info: PeerInfo,
    tx: mpsc::UnboundedSender<Message>,
}

struct RelayState {
    config: RelayConfig,
    members: DashMap<String, Member>,
    next_conn: AtomicU64,
}

impl RelayState {
    fn send_to(&self, id: &str, message: &SignalMessage) -> bool {
        let Some(member) = self.members.get(id) else {
            return false;
        };
        match message.to_json() {
            Ok(text) => member.tx.send(Message::Text(text)).is_ok(),
            Err(e) => {
                tracing::warn!("Failed to encode {}: {}", message.message_type(), e);
                false
            }
        }
    }

    fn broadcast_except(&self, except: &str, message: &SignalMessage) {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Failed to encode {}: {}", message.message_type(), e);
                return;
            }
        };
        for member in self.members.iter() {
            if member.key() != except {
                let _ = member.tx.send(Message::Text(text.clone()));
            }
        }
    }
}

/// WebSocket lobby relay
pub struct RelayServer {
    local_addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown: CancellationToken,
}

impl RelayServer {
    /// Bind a listener and start accepting members
    ///
    /// # Arguments
    ///
    /// * `addr` - Address to listen on (`"0.0.0.0:8787"`, `"127.0.0.1:0"`, ...)
    /// * `config` - Lobby rules
    ///
    /// # Errors
    ///
    /// Returns error if the listener cannot be bound.
    pub async fn bind(addr: &str, config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let state = Arc::new(RelayState {
            config,
            members: DashMap::new(),
            next_conn: AtomicU64::new(1),
        });
        let shutdown = CancellationToken::new();

        tracing::info!(
            "Relay for lobby '{}' listening on {}",
            state.config.lobby_name,
            local_addr
        );

        tokio::spawn(accept_loop(listener, Arc::clone(&state), shutdown.clone()));

        Ok(Self {
            local_addr,
            state,
            shutdown,
        })
    }

    /// Address the relay is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of registered members
    pub fn client_count(&self) -> usize {
        self.state.members.len()
    }

    /// Snapshot of the roster
    pub fn roster(&self) -> Vec<PeerInfo> {
        self.state.members.iter().map(|m| m.info.clone()).collect()
    }

    /// Stop accepting and drop every member
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait until the relay is shut down
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<RelayState>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Relay shutting down");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let state = Arc::clone(&state);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve(stream, peer, state, shutdown).await {
                            tracing::debug!("Connection {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => tracing::warn!("Accept failed: {}", e),
            },
        }
    }
}

async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<RelayState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn_id = state.next_conn.fetch_add(1, Ordering::Relaxed);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let hello = SignalMessage::Hello {
        server_version: crate::CLIENT_VERSION.to_string(),
    };
    tx.send(Message::Text(hello.to_json()?))
        .map_err(|_| SignalingError::Closed)?;
    tracing::debug!("Accepted connection {} from {}", conn_id, peer);

    let mut registered: Option<String> = None;

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = source.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!("Read error on connection {}: {}", conn_id, e);
                break;
            }
        };

        let message = match SignalMessage::from_json(&text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Ignoring malformed frame from {}: {}", peer, e);
                continue;
            }
        };

        if let SignalMessage::Register { id, name, metadata } = message {
            let verdict = admit(
                &state,
                conn_id,
                &id,
                &metadata.lobby_name,
                metadata.lobby_password.as_deref(),
                &metadata.client_version,
            );
            match verdict {
                Admission::Accepted => {
                    let info = PeerInfo {
                        id: id.clone(),
                        name,
                        mic_enabled: false,
                        virtual_ip: metadata.virtual_ip,
                        client_version: Some(metadata.client_version),
                    };
                    let others: Vec<PeerInfo> = state
                        .members
                        .iter()
                        .filter(|m| m.key() != &id)
                        .map(|m| m.info.clone())
                        .collect();

                    state.members.insert(
                        id.clone(),
                        Member {
                            conn_id,
                            info: info.clone(),
                            tx: tx.clone(),
                        },
                    );
                    registered = Some(id.clone());

                    state.send_to(&id, &SignalMessage::RegisterSuccess);
                    state.send_to(&id, &SignalMessage::PlayersList { players: others });
                    state.broadcast_except(&id, &SignalMessage::PlayerJoined { player: info });
                    tracing::info!("{} joined lobby '{}'", id, state.config.lobby_name);
                }
                Admission::Rejected(reason) => {
                    tracing::info!("Rejected registration of {}: {}", id, reason);
                    let reply = SignalMessage::RegisterError { message: reason };
                    let _ = tx.send(Message::Text(reply.to_json()?));
                }
                Admission::TooOld => {
                    let reply = SignalMessage::VersionTooOld {
                        current_version: metadata.client_version,
                        minimum_version: state.config.minimum_version.clone(),
                        download_url: state.config.download_url.clone(),
                    };
                    let _ = tx.send(Message::Text(reply.to_json()?));
                    let _ = tx.send(Message::Close(None));
                    break;
                }
            }
            continue;
        }

        let Some(sender) = registered.as_deref() else {
            tracing::debug!("Dropping {} from unregistered connection", message.message_type());
            continue;
        };
        route(&state, sender, message);
    }

    if let Some(id) = registered {
        let removed = state
            .members
            .remove_if(&id, |_, member| member.conn_id == conn_id)
            .is_some();
        if removed {
            state.broadcast_except(&id, &SignalMessage::PlayerLeft { id: id.clone() });
            tracing::info!("{} left lobby '{}'", id, state.config.lobby_name);
        }
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}

enum Admission {
    Accepted,
    Rejected(String),
    TooOld,
}

fn admit(
    state: &RelayState,
    conn_id: u64,
    id: &str,
    lobby: &str,
    password: Option<&str>,
    version: &str,
) -> Admission {
    let config = &state.config;

    if compare_versions(version, &config.minimum_version) == CmpOrdering::Less {
        return Admission::TooOld;
    }
    if id.is_empty() {
        return Admission::Rejected("Missing player id".to_string());
    }
    if lobby != config.lobby_name {
        return Admission::Rejected(format!("Unknown lobby '{lobby}'"));
    }
    if let Some(expected) = &config.password {
        if password != Some(expected.as_str()) {
            return Admission::Rejected("Invalid lobby password".to_string());
        }
    }
    if let Some(existing) = state.members.get(id) {
        if existing.conn_id != conn_id {
            return Admission::Rejected(format!("Id '{id}' is already in use"));
        }
    } else if state.members.len() >= config.max_clients {
        return Admission::Rejected("Lobby is full".to_string());
    }
    Admission::Accepted
}

fn route(state: &RelayState, sender: &str, mut message: SignalMessage) {
    message.set_sender(sender);

    match &mut message {
        SignalMessage::Offer { to, .. }
        | SignalMessage::Answer { to, .. }
        | SignalMessage::IceCandidate { to, .. } => {
            let to = to.clone();
            if !state.send_to(&to, &message) {
                tracing::debug!("{} from {} to unknown peer {}", message.message_type(), sender, to);
            }
        }
        SignalMessage::StatusUpdate { mic_enabled, .. } => {
            if let Some(mut member) = state.members.get_mut(sender) {
                member.info.mic_enabled = *mic_enabled;
            }
            state.broadcast_except(sender, &message);
        }
        SignalMessage::ShareAdded { share }
        | SignalMessage::ShareRemoved { share }
        | SignalMessage::ShareUpdated { share } => {
            share.owner_id = sender.to_string();
            state.broadcast_except(sender, &message);
        }
        SignalMessage::ChatMessage(_) => state.broadcast_except(sender, &message),
        other => tracing::debug!("Ignoring {} from {}", other.message_type(), sender),
    }
}
