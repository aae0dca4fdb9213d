//! Persistent signaling client with backoff-gated reconnection.
//!
//! One background task owns the WebSocket for the lifetime of the client.
//! Outbound messages are queued on an unbounded channel and survive a
//! reconnect; inbound messages are fanned out to every subscriber as
//! [`SignalingEvent::Message`].
//!
//! ```text
//!  send() / register() ──▶ outbound queue ──▶ ┌──────────────┐ ──▶ socket
//!                                             │ session task │
//!  subscribe() ◀──── broadcast<SignalingEvent> ◀─┤ (reconnect)  │ ◀── socket
//!                                             └──────────────┘
//! ```

use crate::backoff::ReconnectPolicy;
use crate::error::{Result, SignalingError};
use crate::protocol::{Identity, RegisterMetadata, SignalMessage};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Signaling client configuration
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Bound on opening the socket and receiving `hello`
    pub connect_timeout: Duration,
    /// Bound on request/response exchanges such as registration
    pub request_timeout: Duration,
    /// Reconnection schedule after an unexpected close
    pub reconnect: ReconnectPolicy,
    /// Capacity of the subscriber broadcast channel
    pub event_capacity: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            event_capacity: 256,
        }
    }
}

/// Connection state of the signaling client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket open and acknowledged by the server
    Connected,
    /// Waiting to retry after an unexpected close
    Reconnecting,
    /// Closed, either on request or after the server went away
    Disconnected,
    /// Stopped for good (fatal version notice or retries exhausted)
    Failed,
}

/// Event delivered to signaling subscribers
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Inbound protocol message
    Message(SignalMessage),
    /// A reconnection attempt is scheduled
    Reconnecting {
        /// Attempt number (1-based)
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
    /// Connection re-established (registration is re-sent automatically)
    Reconnected,
    /// Connection closed
    Disconnected {
        /// Whether the close was requested locally
        intentional: bool,
    },
    /// Terminal failure, no further reconnection will happen
    Fatal(SignalingError),
}

/// Outbound signaling capability
///
/// Implemented by [`SignalingClient`]; the session layer only depends on this.
pub trait SignalSink: Send + Sync {
    /// Queue a message for delivery to the server
    fn send_signal(&self, message: SignalMessage) -> Result<()>;
}

enum Outbound {
    Message(SignalMessage),
    Close,
}

enum Exit {
    Local,
    Remote,
    Dropped,
}

struct Shared {
    url: String,
    config: SignalingConfig,
    events: broadcast::Sender<SignalingEvent>,
    state: watch::Sender<ConnectionState>,
    intentional: AtomicBool,
    fatal: AtomicBool,
    registered: AtomicBool,
    registration: Mutex<Option<SignalMessage>>,
    pending_register: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl Shared {
    fn emit(&self, event: SignalingEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn resolve_register(&self, outcome: Result<()>) {
        let pending = self.pending_register.lock().ok().and_then(|mut p| p.take());
        if let Some(tx) = pending {
            let _ = tx.send(outcome);
        }
    }

    fn dispatch(&self, text: &str) {
        let message = match SignalMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping malformed signaling frame: {}", e);
                return;
            }
        };

        tracing::trace!("Signaling <- {}", message.message_type());

        match &message {
            SignalMessage::RegisterSuccess => {
                self.registered.store(true, Ordering::SeqCst);
                self.resolve_register(Ok(()));
            }
            SignalMessage::RegisterError { message } => {
                tracing::warn!("Registration rejected: {}", message);
                self.resolve_register(Err(SignalingError::Registration(message.clone())));
            }
            SignalMessage::VersionTooOld {
                current_version,
                minimum_version,
                download_url,
            } => {
                let err = SignalingError::VersionTooOld {
                    current: current_version.clone(),
                    minimum: minimum_version.clone(),
                    download_url: download_url.clone(),
                };
                tracing::error!("{}", err);
                self.fatal.store(true, Ordering::SeqCst);
                self.resolve_register(Err(err.clone()));
                self.emit(SignalingEvent::Fatal(err));
            }
            _ => {}
        }

        self.emit(SignalingEvent::Message(message));
    }
}

/// Persistent signaling connection
///
/// Cloning is cheap; all clones share the same socket. The background task
/// shuts down once every clone is dropped or [`SignalingClient::disconnect`]
/// is called.
#[derive(Clone)]
pub struct SignalingClient {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl SignalingClient {
    /// Connect to a signaling server
    ///
    /// Resolves once the server has acknowledged the socket with `hello`.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::InvalidUrl`] for a malformed address,
    /// [`SignalingError::Timeout`] if no acknowledgement arrives within
    /// `connect_timeout`, or a connect/IO error from the socket.
    pub async fn connect(url: &str, config: SignalingConfig) -> Result<Self> {
        let parsed = url::Url::parse(url)?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }

        let (ws, server_version) = open(parsed.as_str(), config.connect_timeout).await?;
        tracing::info!("Connected to signaling server {} (v{})", url, server_version);

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Connected);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            url: parsed.to_string(),
            config,
            events,
            state,
            intentional: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            registration: Mutex::new(None),
            pending_register: Mutex::new(None),
        });

        tokio::spawn(run(Arc::clone(&shared), ws, outbound_rx));

        Ok(Self { shared, outbound })
    }

    /// Subscribe to inbound messages and connection events
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.shared.events.subscribe()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch connection state changes
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Whether the last registration was accepted
    pub fn is_registered(&self) -> bool {
        self.shared.registered.load(Ordering::SeqCst)
    }

    /// Id used in the last registration, if any
    pub fn local_id(&self) -> Option<String> {
        let guard = self.shared.registration.lock().ok()?;
        match guard.as_ref() {
            Some(SignalMessage::Register { id, .. }) => Some(id.clone()),
            _ => None,
        }
    }

    /// Join the lobby
    ///
    /// The identity is remembered and re-sent automatically after a
    /// reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Registration`] if the server refused the
    /// request (the connection stays open), [`SignalingError::VersionTooOld`]
    /// if the build is rejected, or [`SignalingError::Timeout`] if no answer
    /// arrives within `request_timeout`.
    pub async fn register(&self, identity: &Identity, metadata: RegisterMetadata) -> Result<()> {
        if self.shared.fatal.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }

        let message = SignalMessage::Register {
            id: identity.id.clone(),
            name: identity.name.clone(),
            metadata,
        };

        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.shared.pending_register.lock() {
            *pending = Some(tx);
        }
        if let Ok(mut registration) = self.shared.registration.lock() {
            *registration = Some(message.clone());
        }
        self.shared.registered.store(false, Ordering::SeqCst);

        self.send(message)?;
        tracing::debug!("Registering as {} ({})", identity.id, identity.name);

        match time::timeout(self.shared.config.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SignalingError::Closed),
            Err(_) => Err(SignalingError::timeout("registration")),
        }
    }

    /// Queue an arbitrary outbound message
    ///
    /// Messages sent while reconnecting are held and flushed once the socket
    /// is back.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Closed`] if the client has shut down.
    pub fn send(&self, message: SignalMessage) -> Result<()> {
        if self.state() == ConnectionState::Failed {
            return Err(SignalingError::Closed);
        }
        self.outbound
            .send(Outbound::Message(message))
            .map_err(|_| SignalingError::Closed)
    }

    /// Close the connection without triggering reconnection
    pub fn disconnect(&self) {
        // Flag first so the session task never mistakes this close for a drop
        self.shared.intentional.store(true, Ordering::SeqCst);
        self.shared.registered.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Outbound::Close);
        tracing::info!("Disconnecting from signaling server");
    }
}

impl SignalSink for SignalingClient {
    fn send_signal(&self, message: SignalMessage) -> Result<()> {
        self.send(message)
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("url", &self.shared.url)
            .field("state", &self.state())
            .finish()
    }
}

/// Open a socket and wait for the server acknowledgement
async fn open(url: &str, timeout: Duration) -> Result<(WsStream, String)> {
    let (mut ws, _) = time::timeout(timeout, connect_async(url))
        .await
        .map_err(|_| SignalingError::timeout("connect"))??;

    let hello = time::timeout(timeout, await_hello(&mut ws))
        .await
        .map_err(|_| SignalingError::timeout("hello"))??;

    Ok((ws, hello))
}

async fn await_hello(ws: &mut WsStream) -> Result<String> {
    while let Some(frame) = ws.next().await {
        match frame? {
            Message::Text(text) => match SignalMessage::from_json(&text) {
                Ok(SignalMessage::Hello { server_version }) => return Ok(server_version),
                Ok(other) => tracing::debug!("Ignoring {} before hello", other.message_type()),
                Err(e) => tracing::warn!("Malformed frame before hello: {}", e),
            },
            Message::Close(_) => return Err(SignalingError::Closed),
            _ => {}
        }
    }
    Err(SignalingError::Closed)
}

async fn run(shared: Arc<Shared>, mut ws: WsStream, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    loop {
        match drive(&shared, &mut ws, &mut outbound).await {
            Exit::Dropped => {
                shared.set_state(ConnectionState::Disconnected);
                return;
            }
            Exit::Local => {
                shared.set_state(ConnectionState::Disconnected);
                shared.emit(SignalingEvent::Disconnected { intentional: true });
                return;
            }
            Exit::Remote => {
                shared.registered.store(false, Ordering::SeqCst);
                shared.resolve_register(Err(SignalingError::Closed));

                if shared.fatal.load(Ordering::SeqCst) {
                    shared.set_state(ConnectionState::Failed);
                    return;
                }
                if shared.intentional.load(Ordering::SeqCst) {
                    shared.set_state(ConnectionState::Disconnected);
                    shared.emit(SignalingEvent::Disconnected { intentional: true });
                    return;
                }

                tracing::warn!("Signaling connection lost");
                shared.emit(SignalingEvent::Disconnected { intentional: false });

                match reconnect(&shared).await {
                    Some(fresh) => ws = fresh,
                    None => return,
                }
            }
        }
    }
}

async fn drive(
    shared: &Shared,
    ws: &mut WsStream,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> Exit {
    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Message(message)) => {
                    let text = match message.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!("Failed to encode {}: {}", message.message_type(), e);
                            continue;
                        }
                    };
                    tracing::trace!("Signaling -> {}", message.message_type());
                    if let Err(e) = ws.send(Message::Text(text)).await {
                        tracing::debug!("Signaling write failed: {}", e);
                        return Exit::Remote;
                    }
                }
                Some(Outbound::Close) => {
                    let _ = ws.close(None).await;
                    return Exit::Local;
                }
                None => {
                    let _ = ws.close(None).await;
                    return Exit::Dropped;
                }
            },
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.dispatch(&text),
                Some(Ok(Message::Close(_))) | None => return Exit::Remote,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("Signaling read failed: {}", e);
                    return Exit::Remote;
                }
            },
        }
    }
}

/// Retry the connection along the backoff schedule
///
/// Returns `None` when reconnection is abandoned (exhausted, fatal or
/// cancelled by an intentional disconnect).
async fn reconnect(shared: &Shared) -> Option<WsStream> {
    let policy = &shared.config.reconnect;
    let mut attempt = 0u32;

    while policy.allows(attempt) {
        attempt += 1;
        let delay = policy.delay_for(attempt);

        shared.set_state(ConnectionState::Reconnecting);
        shared.emit(SignalingEvent::Reconnecting { attempt, delay });
        tracing::info!(
            "Reconnecting to signaling server in {:?} (attempt {}/{})",
            delay,
            attempt,
            policy.max_attempts
        );

        time::sleep(delay).await;

        if shared.intentional.load(Ordering::SeqCst) {
            shared.set_state(ConnectionState::Disconnected);
            shared.emit(SignalingEvent::Disconnected { intentional: true });
            return None;
        }

        match open(&shared.url, shared.config.connect_timeout).await {
            Ok((mut ws, _)) => {
                if shared.intentional.load(Ordering::SeqCst) {
                    let _ = ws.close(None).await;
                    shared.set_state(ConnectionState::Disconnected);
                    shared.emit(SignalingEvent::Disconnected { intentional: true });
                    return None;
                }

                shared.intentional.store(false, Ordering::SeqCst);
                shared.set_state(ConnectionState::Connected);
                tracing::info!("Reconnected to signaling server after {} attempt(s)", attempt);

                let registration = shared.registration.lock().ok().and_then(|r| r.clone());
                if let Some(message) = registration {
                    match message.to_json() {
                        Ok(text) => {
                            if let Err(e) = ws.send(Message::Text(text)).await {
                                tracing::warn!("Re-registration failed: {}", e);
                                continue;
                            }
                        }
                        Err(e) => tracing::warn!("Failed to encode registration: {}", e),
                    }
                }

                shared.emit(SignalingEvent::Reconnected);
                return Some(ws);
            }
            Err(e) if e.is_fatal() => {
                shared.set_state(ConnectionState::Failed);
                shared.emit(SignalingEvent::Fatal(e));
                return None;
            }
            Err(e) => tracing::debug!("Reconnect attempt {} failed: {}", attempt, e),
        }
    }

    tracing::error!("Giving up on signaling server after {} attempts", attempt);
    shared.set_state(ConnectionState::Failed);
    shared.emit(SignalingEvent::Fatal(SignalingError::ReconnectExhausted(attempt)));
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{RelayConfig, RelayServer};

    fn metadata(lobby: &str) -> RegisterMetadata {
        RegisterMetadata {
            lobby_name: lobby.to_string(),
            lobby_password: None,
            client_version: crate::CLIENT_VERSION.to_string(),
            virtual_ip: None,
        }
    }

    async fn start_relay() -> RelayServer {
        RelayServer::bind("127.0.0.1:0", RelayConfig::new("friday"))
            .await
            .unwrap()
    }

    fn fast_reconnect() -> SignalingConfig {
        SignalingConfig {
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(200),
                max_attempts: 40,
                multiplier: 2.0,
            },
            ..Default::default()
        }
    }

    async fn wait_state(client: &SignalingClient, wanted: ConnectionState) {
        let mut states = client.state_changes();
        time::timeout(Duration::from_secs(3), async {
            while *states.borrow_and_update() != wanted {
                states.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("client never reached {wanted:?}"));
    }

    #[tokio::test]
    async fn test_rejects_non_websocket_url() {
        let err = SignalingClient::connect("http://127.0.0.1:1", SignalingConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = SignalingConfig {
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let err = SignalingClient::connect(&format!("ws://{addr}"), config)
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_register_and_roster() {
        let relay = start_relay().await;
        let url = format!("ws://{}", relay.local_addr());

        let client = SignalingClient::connect(&url, SignalingConfig::default())
            .await
            .unwrap();
        let mut events = client.subscribe();

        client
            .register(&Identity::new("player-100", "Alice"), metadata("friday"))
            .await
            .unwrap();
        assert!(client.is_registered());
        assert_eq!(client.local_id().as_deref(), Some("player-100"));

        let roster = time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(SignalingEvent::Message(SignalMessage::PlayersList { players })) =
                    events.recv().await
                {
                    return players;
                }
            }
        })
        .await
        .unwrap();
        assert!(roster.is_empty());

        client.disconnect();
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_reconnects_and_registers_again() {
        let relay = start_relay().await;
        let addr = relay.local_addr();
        let client = SignalingClient::connect(&format!("ws://{addr}"), fast_reconnect())
            .await
            .unwrap();
        let mut events = client.subscribe();
        client
            .register(&Identity::new("player-100", "Alice"), metadata("friday"))
            .await
            .unwrap();

        relay.shutdown();
        drop(relay);

        let first_attempt = time::timeout(Duration::from_secs(3), async {
            loop {
                if let Ok(SignalingEvent::Reconnecting { attempt, .. }) = events.recv().await {
                    return attempt;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(first_attempt, 1);

        // the server comes back on the same address
        let relay = time::timeout(Duration::from_secs(3), async {
            loop {
                match RelayServer::bind(&addr.to_string(), RelayConfig::new("friday")).await {
                    Ok(relay) => return relay,
                    Err(_) => time::sleep(Duration::from_millis(20)).await,
                }
            }
        })
        .await
        .unwrap();

        time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SignalingEvent::Reconnected) = events.recv().await {
                    return;
                }
            }
        })
        .await
        .unwrap();
        time::timeout(Duration::from_secs(3), async {
            while !(client.is_registered() && relay.client_count() == 1) {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.local_id().as_deref(), Some("player-100"));
        assert_eq!(relay.roster()[0].id, "player-100");

        client.disconnect();
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_version_notice_stops_reconnection() {
        let config = RelayConfig::new("friday").with_minimum_version("99.0.0");
        let relay = RelayServer::bind("127.0.0.1:0", config).await.unwrap();
        let url = format!("ws://{}", relay.local_addr());
        let client = SignalingClient::connect(&url, fast_reconnect()).await.unwrap();
        let mut events = client.subscribe();

        let err = client
            .register(&Identity::new("player-100", "Alice"), metadata("friday"))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::VersionTooOld { .. }));

        wait_state(&client, ConnectionState::Failed).await;
        // several backoff steps would have elapsed by now
        time::sleep(Duration::from_millis(300)).await;
        assert_eq!(client.state(), ConnectionState::Failed);

        let mut notices = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                SignalingEvent::Reconnecting { attempt, .. } => {
                    panic!("reconnect attempt {attempt} after a version notice")
                }
                SignalingEvent::Fatal(SignalingError::VersionTooOld { minimum, .. }) => {
                    assert_eq!(minimum, "99.0.0");
                    notices += 1;
                }
                _ => {}
            }
        }
        assert_eq!(notices, 1);

        let again = client
            .register(&Identity::new("player-100", "Alice"), metadata("friday"))
            .await;
        assert!(matches!(again, Err(SignalingError::Closed)));
        assert_eq!(relay.client_count(), 0);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_is_not_followed_by_reconnect() {
        let relay = start_relay().await;
        let url = format!("ws://{}", relay.local_addr());

        let client = SignalingClient::connect(&url, SignalingConfig::default())
            .await
            .unwrap();
        let mut states = client.state_changes();

        client.disconnect();

        time::timeout(Duration::from_secs(2), async {
            while *states.borrow_and_update() != ConnectionState::Disconnected {
                states.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        relay.shutdown();
    }
}
