//! WebSocket sync server: binds connections to boards, reconciles their
//! mutations, and fans canonical events back out.
//!
//! ```text
//! Client A ──┐
//!             ├── Board (board_id) ── Reconciler ── RecordStore
//! Client B ──┘          │
//!                 SessionRegistry (presence, editing, typing)
//!                       │
//!                 BoardChannel (fan-out, publish order = delivery order)
//!                       │
//!            ┌──────────┼───────────┐
//!            ▼          ▼           ▼
//!         Client A   Client B    Client C
//! ```
//!
//! Each connection walks `Connecting -> Joined -> Left`. The first frame
//! must be a join; the authenticator supplies a verified user id and the
//! membership check happens before anything reaches the reconciler. `Left`
//! is terminal and its cleanup runs exactly once, whether the trigger was a
//! clean leave, a socket error, or a missed heartbeat window — a
//! double-disconnect signal cannot double-announce the departure.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use quadro_core::model::{BoardId, UserId};
use quadro_core::store::{MemoryStore, RecordStore};

use crate::broadcast::{ChannelMap, EventFrame};
use crate::protocol::{ClientFrame, ConnectionId, ServerEvent, ServerFrame, WireError};
use crate::reconciler::Reconciler;
use crate::registry::SessionRegistry;

/// Supplies the verified identity for each connection. The engine trusts
/// the returned user id; credential checking lives with the embedder.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<UserId>;
    fn is_member(&self, user_id: UserId, board_id: BoardId) -> bool;
}

/// Accepts any token that parses as a user id. Test and demo use.
pub struct OpenAccess;

impl Authenticator for OpenAccess {
    fn authenticate(&self, token: &str) -> Option<UserId> {
        Uuid::parse_str(token).ok()
    }

    fn is_member(&self, _user_id: UserId, _board_id: BoardId) -> bool {
        true
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Fan-out buffer per subscriber, per board
    pub channel_capacity: usize,
    /// Expected client heartbeat cadence
    pub heartbeat_interval: Duration,
    /// Heartbeats a connection may miss before it is forced out
    pub missed_heartbeats: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9091".to_string(),
            channel_capacity: 256,
            heartbeat_interval: Duration::from_secs(15),
            missed_heartbeats: 2,
        }
    }
}

/// Server-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_boards: usize,
}

/// Per-connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionPhase {
    Connecting,
    Joined,
    Left,
}

/// Everything a joined connection holds; taken exactly once on exit.
struct JoinedSession {
    board_id: BoardId,
    user_id: UserId,
    rx: broadcast::Receiver<EventFrame>,
}

/// The collaborative board server.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<Mutex<SessionRegistry>>,
    channels: Arc<ChannelMap>,
    reconciler: Arc<Reconciler>,
    auth: Arc<dyn Authenticator>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn RecordStore>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let registry = Arc::new(Mutex::new(SessionRegistry::new()));
        let channels = Arc::new(ChannelMap::new(config.channel_capacity));
        let reconciler = Arc::new(Reconciler::new(store, channels.clone(), registry.clone()));
        Self {
            config,
            registry,
            channels,
            reconciler,
            auth,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// In-memory store, open access: the setup used by tests and demos.
    pub fn in_memory(config: ServerConfig) -> (Self, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let server = Self::new(config, store.clone(), Arc::new(OpenAccess));
        (server, store)
    }

    /// The reconciler, for embedders whose CRUD layer also mutates boards
    /// (board renames/deletes fan out through the same channels).
    pub fn reconciler(&self) -> Arc<Reconciler> {
        self.reconciler.clone()
    }

    pub fn registry(&self) -> Arc<Mutex<SessionRegistry>> {
        self.registry.clone()
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Accept connections forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("board sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let config = self.config.clone();
            let registry = self.registry.clone();
            let channels = self.channels.clone();
            let reconciler = self.reconciler.clone();
            let auth = self.auth.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(
                    stream, addr, config, registry, channels, reconciler, auth, stats,
                )
                .await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<TcpStream>,
    Message,
>;

/// Send a frame, reporting failure instead of propagating it so the caller
/// can fall through to the exactly-once cleanup path.
async fn send_frame(sender: &mut WsSink, frame: &ServerFrame) -> bool {
    match frame.encode() {
        Ok(encoded) => sender.send(Message::Binary(encoded.into())).await.is_ok(),
        Err(e) => {
            log::error!("failed to encode server frame: {e}");
            true
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: ServerConfig,
    registry: Arc<Mutex<SessionRegistry>>,
    channels: Arc<ChannelMap>,
    reconciler: Arc<Reconciler>,
    auth: Arc<dyn Authenticator>,
    stats: Arc<RwLock<ServerStats>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let connection_id: ConnectionId = Uuid::new_v4();
    log::info!("connection {connection_id} established from {addr}");

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut phase = ConnectionPhase::Connecting;
    let mut session: Option<JoinedSession> = None;

    // Any inbound frame proves liveness; the interval only checks the gap.
    let liveness_window = config.heartbeat_interval * config.missed_heartbeats;
    let mut last_seen = Instant::now();
    let mut liveness = tokio::time::interval(config.heartbeat_interval);

    loop {
        tokio::select! {
            // Inbound WebSocket traffic
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        last_seen = Instant::now();
                        {
                            let mut s = stats.write().await;
                            s.total_frames += 1;
                            s.total_bytes += bytes.len() as u64;
                        }

                        let frame = match ClientFrame::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("undecodable frame from {addr}: {e}");
                                continue;
                            }
                        };

                        match frame {
                            ClientFrame::JoinBoard { board_id, token } => {
                                if phase != ConnectionPhase::Connecting {
                                    log::warn!("connection {connection_id} sent a second join; ignoring");
                                    continue;
                                }
                                let user_id = match auth.authenticate(&token) {
                                    Some(user) if auth.is_member(user, board_id) => user,
                                    _ => {
                                        // Rejected at join time; never reaches the reconciler.
                                        let _ = send_frame(&mut ws_sender, &ServerFrame::Error {
                                            intent_id: None,
                                            error: WireError::Unauthorized,
                                        }).await;
                                        log::info!("connection {connection_id} rejected at join");
                                        break;
                                    }
                                };

                                let channel = channels.get_or_create(board_id).await;
                                let rx = channel.subscribe();
                                let (delta, roster) = {
                                    let mut reg = registry.lock().await;
                                    let delta = reg.join(board_id, connection_id, user_id);
                                    (delta, reg.list_active(board_id))
                                };

                                if !send_frame(&mut ws_sender, &ServerFrame::Welcome {
                                    connection_id,
                                    roster,
                                }).await {
                                    break;
                                }
                                if let Err(e) = channel.publish(
                                    Some(connection_id),
                                    &ServerEvent::Presence(delta),
                                ) {
                                    log::error!("failed to announce join: {e}");
                                }

                                session = Some(JoinedSession { board_id, user_id, rx });
                                phase = ConnectionPhase::Joined;
                                {
                                    let mut s = stats.write().await;
                                    s.active_boards = channels.board_count().await;
                                }
                                log::info!("user {user_id} joined board {board_id} ({connection_id})");
                            }

                            ClientFrame::Heartbeat => {
                                if !send_frame(&mut ws_sender, &ServerFrame::HeartbeatAck).await {
                                    break;
                                }
                            }

                            ClientFrame::LeaveBoard => {
                                log::debug!("connection {connection_id} left cleanly");
                                break;
                            }

                            ClientFrame::Mutate { intent_id, intent } => {
                                let Some(sess) = session.as_ref() else {
                                    let _ = send_frame(&mut ws_sender, &ServerFrame::Error {
                                        intent_id: Some(intent_id),
                                        error: WireError::Unauthorized,
                                    }).await;
                                    continue;
                                };
                                match reconciler
                                    .apply(sess.board_id, sess.user_id, Some(connection_id), intent)
                                    .await
                                {
                                    Ok(event) => {
                                        if !send_frame(&mut ws_sender, &ServerFrame::Ack {
                                            intent_id,
                                            event,
                                        }).await {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        // Only the originator learns of the rejection.
                                        log::debug!("intent {intent_id} rejected: {e}");
                                        if !send_frame(&mut ws_sender, &ServerFrame::Error {
                                            intent_id: Some(intent_id),
                                            error: e.to_wire(),
                                        }).await {
                                            break;
                                        }
                                    }
                                }
                            }

                            ClientFrame::Typing { on } => {
                                if session.is_none() {
                                    continue;
                                }
                                let delta = registry.lock().await.set_typing(connection_id, on);
                                if let Some(delta) = delta {
                                    publish_presence(&channels, connection_id, delta).await;
                                }
                            }

                            ClientFrame::Editing { entity } => {
                                if session.is_none() {
                                    continue;
                                }
                                let deltas = registry.lock().await.set_editing(connection_id, entity);
                                for delta in deltas {
                                    publish_presence(&channels, connection_id, delta).await;
                                }
                            }

                            ClientFrame::SetPresence { status } => {
                                if session.is_none() {
                                    continue;
                                }
                                let delta = registry.lock().await.set_presence(connection_id, status);
                                if let Some(delta) = delta {
                                    publish_presence(&channels, connection_id, delta).await;
                                }
                            }
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("connection {connection_id} closed ({addr})");
                        break;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }

                    Some(Err(e)) => {
                        log::error!("websocket error from {addr}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            // Outbound fan-out traffic for the joined board
            frame = async {
                match session.as_mut() {
                    Some(sess) => sess.rx.recv().await,
                    // Not joined yet — wait forever.
                    None => std::future::pending().await,
                }
            } => {
                match frame {
                    Ok(frame) => {
                        // The originator already got a direct Ack.
                        if frame.origin == Some(connection_id) {
                            continue;
                        }
                        if ws_sender
                            .send(Message::Binary(frame.bytes.to_vec().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("connection {connection_id} lagged by {n} events");
                    }
                    Err(_) => break,
                }
            }

            // Heartbeat-based liveness
            _ = liveness.tick() => {
                if last_seen.elapsed() > liveness_window {
                    log::info!(
                        "connection {connection_id} missed the heartbeat window; forcing leave"
                    );
                    break;
                }
            }
        }
    }

    // Left is terminal. `session.take()` guarantees the registry cleanup
    // and departure announcement happen at most once per connection.
    phase = ConnectionPhase::Left;
    log::debug!("connection {connection_id} entered {phase:?}");
    if let Some(JoinedSession { board_id, rx, user_id }) = session.take() {
        let deltas = registry.lock().await.leave(connection_id);
        if !deltas.is_empty() {
            if let Some(channel) = channels.get(board_id).await {
                for delta in deltas {
                    if let Err(e) =
                        channel.publish(Some(connection_id), &ServerEvent::Presence(delta))
                    {
                        log::error!("failed to announce departure: {e}");
                    }
                }
            }
        }
        drop(rx);
        channels.remove_if_empty(board_id).await;
        log::info!("user {user_id} left board {board_id} ({connection_id})");
    }

    {
        let mut s = stats.write().await;
        s.active_connections -= 1;
        s.active_boards = channels.board_count().await;
    }

    Ok(())
}

async fn publish_presence(
    channels: &ChannelMap,
    origin: ConnectionId,
    delta: crate::protocol::PresenceDelta,
) {
    let board_id = delta.board_id();
    if let Some(channel) = channels.get(board_id).await {
        if let Err(e) = channel.publish(Some(origin), &ServerEvent::Presence(delta)) {
            log::error!("failed to publish presence delta: {e}");
        }
    }
}
