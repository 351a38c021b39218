//! Binary wire protocol between board clients and the sync server.
//!
//! Frames are bincode-encoded tagged enums — a closed variant set, one
//! variant per operation, rather than string-keyed dispatch. Every
//! structural event a client receives carries the full entity snapshot
//! (position key and version included) plus the acting user, so optimistic
//! local state can always be reconciled against the canonical result.
//!
//! ```text
//! client ──ClientFrame──►  server
//! client ◄──ServerFrame──  server   (direct: Welcome / Ack / Error)
//! client ◄──ServerFrame──  fan-out  (Event, same order for every client)
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use quadro_core::model::{Board, BoardId, Card, CardId, List, ListId, UserId};
use quadro_core::position::PositionKey;

/// Stable identity of one websocket connection.
pub type ConnectionId = Uuid;

/// Coarse participant activity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Presence {
    Active,
    Idle,
}

/// One participant as seen in rosters and presence deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub board_id: BoardId,
    pub status: Presence,
    /// Entity (card or list) this participant is currently editing.
    pub editing: Option<Uuid>,
    pub typing: bool,
}

impl Participant {
    pub fn new(connection_id: ConnectionId, user_id: UserId, board_id: BoardId) -> Self {
        Self {
            connection_id,
            user_id,
            board_id,
            status: Presence::Active,
            editing: None,
            typing: false,
        }
    }
}

/// A structural mutation a client intends to make.
///
/// Intents are transient: validated, reconciled, fanned out as a canonical
/// event, then discarded. `after`/`before` name the intended neighbors at
/// the time the client acted; the reconciler resolves them against current
/// authoritative state, so a concurrently deleted neighbor degrades
/// gracefully instead of failing the intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationIntent {
    CreateList {
        board_id: BoardId,
        title: String,
        after: Option<ListId>,
    },
    UpdateList {
        list_id: ListId,
        title: String,
        client_version: u64,
    },
    DeleteList {
        list_id: ListId,
    },
    ReorderLists {
        board_id: BoardId,
        ordered: Vec<ListId>,
    },
    CreateCard {
        list_id: ListId,
        title: String,
        description: String,
        after: Option<CardId>,
    },
    UpdateCard {
        card_id: CardId,
        title: Option<String>,
        description: Option<String>,
        client_version: u64,
    },
    DeleteCard {
        card_id: CardId,
    },
    MoveCard {
        card_id: CardId,
        to_list: ListId,
        after: Option<CardId>,
        before: Option<CardId>,
        client_version: u64,
    },
    ReorderCards {
        list_id: ListId,
        ordered: Vec<CardId>,
    },
}

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Must be the first frame on a connection.
    JoinBoard { board_id: BoardId, token: String },
    LeaveBoard,
    Heartbeat,
    Mutate {
        /// Correlates the eventual Ack/Error back to this intent.
        intent_id: Uuid,
        intent: MutationIntent,
    },
    Typing { on: bool },
    Editing { entity: Option<Uuid> },
    SetPresence { status: Presence },
}

/// Presence change fanned out to a board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceDelta {
    Joined {
        participant: Participant,
    },
    Left {
        board_id: BoardId,
        connection_id: ConnectionId,
        user_id: UserId,
    },
    StatusChanged {
        board_id: BoardId,
        connection_id: ConnectionId,
        user_id: UserId,
        status: Presence,
    },
    EditingStarted {
        board_id: BoardId,
        connection_id: ConnectionId,
        user_id: UserId,
        entity: Uuid,
    },
    EditingStopped {
        board_id: BoardId,
        connection_id: ConnectionId,
        user_id: UserId,
        entity: Uuid,
    },
    Typing {
        board_id: BoardId,
        connection_id: ConnectionId,
        user_id: UserId,
        on: bool,
    },
}

impl PresenceDelta {
    /// Board this delta belongs to.
    pub fn board_id(&self) -> BoardId {
        match self {
            Self::Joined { participant } => participant.board_id,
            Self::Left { board_id, .. }
            | Self::StatusChanged { board_id, .. }
            | Self::EditingStarted { board_id, .. }
            | Self::EditingStopped { board_id, .. }
            | Self::Typing { board_id, .. } => *board_id,
        }
    }
}

/// Canonical, server-accepted result of a mutation, fanned out in
/// acceptance order to every connection on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerEvent {
    ListCreated {
        list: List,
        actor: UserId,
    },
    ListUpdated {
        list: List,
        actor: UserId,
    },
    ListDeleted {
        list_id: ListId,
        board_id: BoardId,
        actor: UserId,
    },
    ListsReordered {
        board_id: BoardId,
        /// Final (id, key, version) per surviving list, in display order.
        keys: Vec<(ListId, PositionKey, u64)>,
        /// Ids from the intent that no longer existed.
        dropped: Vec<ListId>,
        actor: UserId,
    },
    CardCreated {
        card: Card,
        actor: UserId,
    },
    CardUpdated {
        card: Card,
        actor: UserId,
    },
    CardDeleted {
        card_id: CardId,
        list_id: ListId,
        actor: UserId,
    },
    CardMoved {
        card: Card,
        from_list: ListId,
        actor: UserId,
    },
    CardsReordered {
        list_id: ListId,
        keys: Vec<(CardId, PositionKey, u64)>,
        dropped: Vec<CardId>,
        actor: UserId,
    },
    BoardUpdated {
        board: Board,
        actor: UserId,
    },
    BoardDeleted {
        board_id: BoardId,
        actor: UserId,
    },
    Presence(PresenceDelta),
}

/// Generic canonical snapshot, attached to conflict errors so the
/// originating client can rebase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntitySnapshot {
    Board(Board),
    List(List),
    Card(Card),
}

/// Errors surfaced to the originating client. Other clients never see them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireError {
    /// Stale field edit; `current` is the canonical entity to rebase onto.
    Conflict { current: EntitySnapshot },
    NotFound { entity: Uuid },
    Unauthorized,
    Ordering { detail: String },
    Internal { detail: String },
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Join accepted: the connection's identity plus the active roster in
    /// join order.
    Welcome {
        connection_id: ConnectionId,
        roster: Vec<Participant>,
    },
    /// Fan-out event (structural or presence).
    Event { event: ServerEvent },
    /// Direct response to the originator: the intent was accepted and this
    /// is its canonical result.
    Ack { intent_id: Uuid, event: ServerEvent },
    /// Direct response to the originator: the intent was rejected.
    Error {
        intent_id: Option<Uuid>,
        error: WireError,
    },
    HeartbeatAck,
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl ClientFrame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}
