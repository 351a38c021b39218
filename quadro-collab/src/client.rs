//! WebSocket board client.
//!
//! Thin wrapper used by integration tests and UI host processes:
//! - Connection lifecycle (connect, join, leave)
//! - Typed mutation intents with intent-id correlation
//! - Presence updates (typing, editing target, activity status)
//! - Heartbeats on a background task
//!
//! Decoded server frames arrive on an `mpsc` event stream. There is no
//! offline queue: sending while disconnected is an error — cross-partition
//! merge is out of scope for the engine, and the UI layer owns optimistic
//! state while a reconnect is in flight.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use quadro_core::model::BoardId;

use crate::protocol::{
    ClientFrame, ConnectionId, MutationIntent, Participant, Presence, ProtocolError, ServerEvent,
    ServerFrame, WireError,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connection established and join sent.
    Connected,
    /// Connection lost.
    Disconnected,
    /// Join accepted; carries our connection id and the roster in join order.
    Welcome {
        connection_id: ConnectionId,
        roster: Vec<Participant>,
    },
    /// Canonical fan-out event from another participant (or the CRUD layer).
    Event(ServerEvent),
    /// Our own intent was accepted; `event` is its canonical result.
    Ack { intent_id: Uuid, event: ServerEvent },
    /// Our own intent was rejected. Nobody else saw it.
    Rejected {
        intent_id: Option<Uuid>,
        error: WireError,
    },
    HeartbeatAck,
}

/// A client connection to one board.
pub struct BoardClient {
    board_id: BoardId,
    token: String,
    server_url: String,
    state: Arc<RwLock<ClientState>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
    heartbeat_interval: Duration,
}

impl BoardClient {
    /// `token` is whatever the server's authenticator expects; with
    /// `OpenAccess` that is the user id in string form.
    pub fn new(
        server_url: impl Into<String>,
        board_id: BoardId,
        token: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            board_id,
            token: token.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            heartbeat_interval: Duration::from_secs(10),
        }
    }

    /// Override the heartbeat cadence (tests use short intervals).
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect, join the board, and spawn the reader/writer/heartbeat tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ClientState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(pair) => pair,
            Err(_) => {
                *self.state.write().await = ClientState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx.clone());
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        // Join must be the first frame on the wire.
        let join = ClientFrame::JoinBoard {
            board_id: self.board_id,
            token: self.token.clone(),
        };
        out_tx
            .send(join.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        // Heartbeat task: stops once the writer channel closes.
        let heartbeat_tx = out_tx.clone();
        let heartbeat_interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                let Ok(encoded) = ClientFrame::Heartbeat.encode() else {
                    break;
                };
                if heartbeat_tx.send(encoded).await.is_err() {
                    break;
                }
            }
        });

        *self.state.write().await = ClientState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: decode server frames into client events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let event = match ServerFrame::decode(&bytes) {
                            Ok(ServerFrame::Welcome {
                                connection_id,
                                roster,
                            }) => ClientEvent::Welcome {
                                connection_id,
                                roster,
                            },
                            Ok(ServerFrame::Event { event }) => ClientEvent::Event(event),
                            Ok(ServerFrame::Ack { intent_id, event }) => {
                                ClientEvent::Ack { intent_id, event }
                            }
                            Ok(ServerFrame::Error { intent_id, error }) => {
                                ClientEvent::Rejected { intent_id, error }
                            }
                            Ok(ServerFrame::HeartbeatAck) => ClientEvent::HeartbeatAck,
                            Err(e) => {
                                log::warn!("undecodable server frame: {e}");
                                continue;
                            }
                        };
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ClientState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    async fn send(&self, frame: &ClientFrame) -> Result<(), ProtocolError> {
        if *self.state.read().await != ClientState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let encoded = frame.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Submit a mutation intent. Returns the intent id to correlate the
    /// eventual `Ack` or `Rejected` event.
    pub async fn mutate(&self, intent: MutationIntent) -> Result<Uuid, ProtocolError> {
        let intent_id = Uuid::new_v4();
        self.send(&ClientFrame::Mutate { intent_id, intent }).await?;
        Ok(intent_id)
    }

    pub async fn set_typing(&self, on: bool) -> Result<(), ProtocolError> {
        self.send(&ClientFrame::Typing { on }).await
    }

    pub async fn set_editing(&self, entity: Option<Uuid>) -> Result<(), ProtocolError> {
        self.send(&ClientFrame::Editing { entity }).await
    }

    pub async fn set_presence(&self, status: Presence) -> Result<(), ProtocolError> {
        self.send(&ClientFrame::SetPresence { status }).await
    }

    /// Clean leave. The server announces the departure to the board.
    pub async fn leave(&self) -> Result<(), ProtocolError> {
        self.send(&ClientFrame::LeaveBoard).await
    }

    pub async fn send_heartbeat(&self) -> Result<(), ProtocolError> {
        self.send(&ClientFrame::Heartbeat).await
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    pub fn board_id(&self) -> BoardId {
        self.board_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
