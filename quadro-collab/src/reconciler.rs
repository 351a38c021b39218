//! Mutation reconciler: turns client intents into accepted, ordered,
//! conflict-resolved state changes.
//!
//! All mutations for one board flow through that board's mutex, in arrival
//! order (tokio mutexes are FIFO-fair), so there is no read-modify-write
//! race on a board's lists and cards; different boards proceed fully in
//! parallel. Awaiting the record store is the only suspension point inside
//! the critical section.
//!
//! Conflict policy:
//! - **Structural moves** are last-intent-wins: a stale `client_version` is
//!   logged, not rejected.
//! - **Field edits** (titles, descriptions) reject stale versions with
//!   [`SyncError::Conflict`] carrying the canonical snapshot for the
//!   originator to rebase onto.
//!
//! Every accepted mutation increments the entity's version and publishes
//! exactly one canonical event to the board's fan-out channel before the
//! caller sees success.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use quadro_core::model::{BoardId, Card, CardId, List, ListId, UserId};
use quadro_core::position::{OrderingViolation, PositionKey};
use quadro_core::store::{RecordStore, StoreError};

use crate::broadcast::ChannelMap;
use crate::protocol::{
    ConnectionId, EntitySnapshot, MutationIntent, ServerEvent, WireError,
};
use crate::registry::SessionRegistry;

/// Reconciliation failures. Only the offending intent is affected; the
/// board's queue and every other session continue untouched.
#[derive(Debug)]
pub enum SyncError {
    /// Stale field edit. `current` is the canonical entity so the client
    /// can rebase; never retried automatically.
    Conflict { current: EntitySnapshot },
    /// Entity vanished (deleted concurrently).
    NotFound(Uuid),
    /// The intent touches a board the connection did not join.
    Unauthorized,
    /// Neighbor bounds were invalid even after a re-fetch.
    Ordering(OrderingViolation),
    Store(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict { .. } => write!(f, "stale version: entity changed concurrently"),
            Self::NotFound(id) => write!(f, "entity not found: {id}"),
            Self::Unauthorized => write!(f, "not a participant of this board"),
            Self::Ordering(v) => write!(f, "ordering violation: {v}"),
            Self::Store(detail) => write!(f, "record store failure: {detail}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::Backend(detail) => Self::Store(detail),
        }
    }
}

impl From<OrderingViolation> for SyncError {
    fn from(err: OrderingViolation) -> Self {
        Self::Ordering(err)
    }
}

impl SyncError {
    /// Wire representation surfaced to the originating client.
    pub fn to_wire(&self) -> WireError {
        match self {
            Self::Conflict { current } => WireError::Conflict {
                current: current.clone(),
            },
            Self::NotFound(id) => WireError::NotFound { entity: *id },
            Self::Unauthorized => WireError::Unauthorized,
            Self::Ordering(v) => WireError::Ordering {
                detail: v.to_string(),
            },
            Self::Store(detail) => WireError::Internal {
                detail: detail.clone(),
            },
        }
    }
}

/// The authoritative mutation path for every board this process hosts.
pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    channels: Arc<ChannelMap>,
    registry: Arc<Mutex<SessionRegistry>>,
    board_locks: Mutex<HashMap<BoardId, Arc<Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        channels: Arc<ChannelMap>,
        registry: Arc<Mutex<SessionRegistry>>,
    ) -> Self {
        Self {
            store,
            channels,
            registry,
            board_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The per-board serialization point.
    async fn lock_board(&self, board_id: BoardId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.board_locks.lock().await;
            locks
                .entry(board_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn publish(&self, board_id: BoardId, origin: Option<ConnectionId>, event: &ServerEvent) {
        let channel = self.channels.get_or_create(board_id).await;
        if let Err(e) = channel.publish(origin, event) {
            log::error!("failed to encode fan-out event for board {board_id}: {e}");
        }
    }

    async fn publish_presence(&self, deltas: Vec<crate::protocol::PresenceDelta>) {
        for delta in deltas {
            let board_id = delta.board_id();
            self.publish(board_id, None, &ServerEvent::Presence(delta))
                .await;
        }
    }

    /// Board an intent targets, resolved through current state. A card or
    /// list never changes board, so the binding is stable even across
    /// concurrent moves.
    pub async fn board_of_intent(&self, intent: &MutationIntent) -> Result<BoardId, SyncError> {
        match intent {
            MutationIntent::CreateList { board_id, .. }
            | MutationIntent::ReorderLists { board_id, .. } => Ok(*board_id),
            MutationIntent::UpdateList { list_id, .. }
            | MutationIntent::DeleteList { list_id } => {
                Ok(self.store.list(*list_id).await?.board_id)
            }
            MutationIntent::CreateCard { list_id, .. }
            | MutationIntent::ReorderCards { list_id, .. } => {
                Ok(self.store.list(*list_id).await?.board_id)
            }
            MutationIntent::UpdateCard { card_id, .. }
            | MutationIntent::DeleteCard { card_id }
            | MutationIntent::MoveCard { card_id, .. } => {
                let card = self.store.card(*card_id).await?;
                Ok(self.store.list(card.list_id).await?.board_id)
            }
        }
    }

    /// Validate and execute one intent on behalf of a connection joined to
    /// `joined_board`. Returns the canonical event (already fanned out).
    pub async fn apply(
        &self,
        joined_board: BoardId,
        actor: UserId,
        origin: Option<ConnectionId>,
        intent: MutationIntent,
    ) -> Result<ServerEvent, SyncError> {
        let board_id = self.board_of_intent(&intent).await?;
        if board_id != joined_board {
            return Err(SyncError::Unauthorized);
        }

        match intent {
            MutationIntent::CreateList {
                board_id,
                title,
                after,
            } => self.create_list(actor, origin, board_id, title, after).await,
            MutationIntent::UpdateList {
                list_id,
                title,
                client_version,
            } => {
                self.update_list(actor, origin, board_id, list_id, title, client_version)
                    .await
            }
            MutationIntent::DeleteList { list_id } => {
                self.delete_list(actor, origin, board_id, list_id).await
            }
            MutationIntent::ReorderLists { board_id, ordered } => {
                self.reorder_lists(actor, origin, board_id, ordered).await
            }
            MutationIntent::CreateCard {
                list_id,
                title,
                description,
                after,
            } => {
                self.create_card(actor, origin, board_id, list_id, title, description, after)
                    .await
            }
            MutationIntent::UpdateCard {
                card_id,
                title,
                description,
                client_version,
            } => {
                self.update_card(
                    actor,
                    origin,
                    board_id,
                    card_id,
                    title,
                    description,
                    client_version,
                )
                .await
            }
            MutationIntent::DeleteCard { card_id } => {
                self.delete_card(actor, origin, board_id, card_id).await
            }
            MutationIntent::MoveCard {
                card_id,
                to_list,
                after,
                before,
                client_version,
            } => {
                self.move_card(
                    actor,
                    origin,
                    board_id,
                    card_id,
                    to_list,
                    after,
                    before,
                    client_version,
                )
                .await
            }
            MutationIntent::ReorderCards { list_id, ordered } => {
                self.reorder_cards(actor, origin, board_id, list_id, ordered)
                    .await
            }
        }
    }

    // ─── List operations ─────────────────────────────────────────────

    pub async fn create_list(
        &self,
        actor: UserId,
        origin: Option<ConnectionId>,
        board_id: BoardId,
        title: String,
        after: Option<ListId>,
    ) -> Result<ServerEvent, SyncError> {
        let _guard = self.lock_board(board_id).await;
        self.store.board(board_id).await?;

        let position = self
            .allocate_list_key(board_id, after, None, None)
            .await?;
        let list = List::new(board_id, title, position);
        self.store.insert_list(list.clone()).await?;

        let event = ServerEvent::ListCreated { list, actor };
        self.publish(board_id, origin, &event).await;
        Ok(event)
    }

    pub async fn update_list(
        &self,
        actor: UserId,
        origin: Option<ConnectionId>,
        board_id: BoardId,
        list_id: ListId,
        title: String,
        client_version: u64,
    ) -> Result<ServerEvent, SyncError> {
        let _guard = self.lock_board(board_id).await;
        let mut list = self.store.list(list_id).await?;
        if client_version != list.version {
            return Err(SyncError::Conflict {
                current: EntitySnapshot::List(list),
            });
        }
        list.title = title;
        list.version += 1;
        self.store.update_list(list.clone()).await?;

        let event = ServerEvent::ListUpdated { list, actor };
        self.publish(board_id, origin, &event).await;
        Ok(event)
    }

    pub async fn delete_list(
        &self,
        actor: UserId,
        origin: Option<ConnectionId>,
        board_id: BoardId,
        list_id: ListId,
    ) -> Result<ServerEvent, SyncError> {
        let _guard = self.lock_board(board_id).await;
        let list = self.store.list(list_id).await?;

        // Cascade: a list takes its cards with it.
        let cards = self.store.cards_of_list(list_id).await?;
        let mut released = Vec::new();
        for card in &cards {
            self.store.delete_card(card.id).await?;
            released.extend(self.registry.lock().await.release_editors_of(card.id));
        }
        self.store.delete_list(list_id).await?;
        released.extend(self.registry.lock().await.release_editors_of(list_id));

        let event = ServerEvent::ListDeleted {
            list_id,
            board_id: list.board_id,
            actor,
        };
        self.publish(board_id, origin, &event).await;
        self.publish_presence(released).await;
        Ok(event)
    }

    pub async fn reorder_lists(
        &self,
        actor: UserId,
        origin: Option<ConnectionId>,
        board_id: BoardId,
        ordered: Vec<ListId>,
    ) -> Result<ServerEvent, SyncError> {
        let _guard = self.lock_board(board_id).await;
        self.store.board(board_id).await?;

        let current: HashMap<ListId, List> = self
            .store
            .lists_of_board(board_id)
            .await?
            .into_iter()
            .map(|l| (l.id, l))
            .collect();

        let mut keys = Vec::with_capacity(ordered.len());
        let mut dropped = Vec::new();
        let mut previous: Option<PositionKey> = None;
        for id in ordered {
            let Some(mut list) = current.get(&id).cloned() else {
                dropped.push(id);
                continue;
            };
            let key = PositionKey::between(previous.as_ref(), None)?;
            list.position = key.clone();
            list.version += 1;
            match self.store.update_list(list.clone()).await {
                Ok(()) => {
                    keys.push((id, key.clone(), list.version));
                    previous = Some(key);
                }
                Err(StoreError::NotFound(_)) => dropped.push(id),
                Err(e) => return Err(e.into()),
            }
        }
        if !dropped.is_empty() {
            log::debug!("reorder on board {board_id} dropped {} stale ids", dropped.len());
        }

        let event = ServerEvent::ListsReordered {
            board_id,
            keys,
            dropped,
            actor,
        };
        self.publish(board_id, origin, &event).await;
        Ok(event)
    }

    // ─── Card operations ─────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_card(
        &self,
        actor: UserId,
        origin: Option<ConnectionId>,
        board_id: BoardId,
        list_id: ListId,
        title: String,
        description: String,
        after: Option<CardId>,
    ) -> Result<ServerEvent, SyncError> {
        let _guard = self.lock_board(board_id).await;
        self.store.list(list_id).await?;

        let position = self
            .allocate_card_key(list_id, after, None, None)
            .await?;
        let card = Card::new(list_id, title, description, position);
        self.store.insert_card(card.clone()).await?;

        let event = ServerEvent::CardCreated { card, actor };
        self.publish(board_id, origin, &event).await;
        Ok(event)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_card(
        &self,
        actor: UserId,
        origin: Option<ConnectionId>,
        board_id: BoardId,
        card_id: CardId,
        title: Option<String>,
        description: Option<String>,
        client_version: u64,
    ) -> Result<ServerEvent, SyncError> {
        let _guard = self.lock_board(board_id).await;
        let mut card = self.store.card(card_id).await?;
        if client_version != card.version {
            return Err(SyncError::Conflict {
                current: EntitySnapshot::Card(card),
            });
        }
        if let Some(title) = title {
            card.title = title;
        }
        if let Some(description) = description {
            card.description = description;
        }
        card.version += 1;
        self.store.update_card(card.clone()).await?;

        let event = ServerEvent::CardUpdated { card, actor };
        self.publish(board_id, origin, &event).await;
        Ok(event)
    }

    pub async fn delete_card(
        &self,
        actor: UserId,
        origin: Option<ConnectionId>,
        board_id: BoardId,
        card_id: CardId,
    ) -> Result<ServerEvent, SyncError> {
        let _guard = self.lock_board(board_id).await;
        let card = self.store.card(card_id).await?;
        self.store.delete_card(card_id).await?;
        let released = self.registry.lock().await.release_editors_of(card_id);

        let event = ServerEvent::CardDeleted {
            card_id,
            list_id: card.list_id,
            actor,
        };
        self.publish(board_id, origin, &event).await;
        self.publish_presence(released).await;
        Ok(event)
    }

    /// Move a card to `to_list`, landing between the intended neighbors.
    /// Stale `client_version` proceeds (last-intent-wins); a neighbor that
    /// was deleted concurrently degrades to the nearest surviving gap.
    #[allow(clippy::too_many_arguments)]
    pub async fn move_card(
        &self,
        actor: UserId,
        origin: Option<ConnectionId>,
        board_id: BoardId,
        card_id: CardId,
        to_list: ListId,
        after: Option<CardId>,
        before: Option<CardId>,
        client_version: u64,
    ) -> Result<ServerEvent, SyncError> {
        let _guard = self.lock_board(board_id).await;
        let mut card = self.store.card(card_id).await?;
        let dest = self.store.list(to_list).await?;
        if dest.board_id != board_id {
            // Cards only move between lists of their own board.
            return Err(SyncError::Unauthorized);
        }
        if client_version != card.version {
            log::debug!(
                "stale move of card {card_id} (client v{client_version}, current v{}); \
                 proceeding last-intent-wins",
                card.version
            );
        }

        let position = self
            .allocate_card_key(to_list, after, before, Some(card_id))
            .await?;
        let from_list = card.list_id;
        card.list_id = to_list;
        card.position = position;
        card.version += 1;
        self.store.update_card(card.clone()).await?;

        let event = ServerEvent::CardMoved {
            card,
            from_list,
            actor,
        };
        self.publish(board_id, origin, &event).await;
        Ok(event)
    }

    pub async fn reorder_cards(
        &self,
        actor: UserId,
        origin: Option<ConnectionId>,
        board_id: BoardId,
        list_id: ListId,
        ordered: Vec<CardId>,
    ) -> Result<ServerEvent, SyncError> {
        let _guard = self.lock_board(board_id).await;
        self.store.list(list_id).await?;

        let current: HashMap<CardId, Card> = self
            .store
            .cards_of_list(list_id)
            .await?
            .into_iter()
            .map(|c| (c.id, c))
            .collect();

        let mut keys = Vec::with_capacity(ordered.len());
        let mut dropped = Vec::new();
        let mut previous: Option<PositionKey> = None;
        for id in ordered {
            let Some(mut card) = current.get(&id).cloned() else {
                dropped.push(id);
                continue;
            };
            let key = PositionKey::between(previous.as_ref(), None)?;
            card.position = key.clone();
            card.version += 1;
            match self.store.update_card(card.clone()).await {
                Ok(()) => {
                    keys.push((id, key.clone(), card.version));
                    previous = Some(key);
                }
                Err(StoreError::NotFound(_)) => dropped.push(id),
                Err(e) => return Err(e.into()),
            }
        }
        if !dropped.is_empty() {
            log::debug!("reorder on list {list_id} dropped {} stale ids", dropped.len());
        }

        let event = ServerEvent::CardsReordered {
            list_id,
            keys,
            dropped,
            actor,
        };
        self.publish(board_id, origin, &event).await;
        Ok(event)
    }

    // ─── Board operations (driven by the embedding app's CRUD layer) ──

    pub async fn update_board(
        &self,
        actor: UserId,
        board_id: BoardId,
        title: String,
        client_version: u64,
    ) -> Result<ServerEvent, SyncError> {
        let _guard = self.lock_board(board_id).await;
        let mut board = self.store.board(board_id).await?;
        if client_version != board.version {
            return Err(SyncError::Conflict {
                current: EntitySnapshot::Board(board),
            });
        }
        board.title = title;
        board.version += 1;
        self.store.update_board(board.clone()).await?;

        let event = ServerEvent::BoardUpdated { board, actor };
        self.publish(board_id, None, &event).await;
        Ok(event)
    }

    pub async fn delete_board(
        &self,
        actor: UserId,
        board_id: BoardId,
    ) -> Result<ServerEvent, SyncError> {
        let _guard = self.lock_board(board_id).await;
        self.store.board(board_id).await?;

        let mut released = Vec::new();
        for list in self.store.lists_of_board(board_id).await? {
            for card in self.store.cards_of_list(list.id).await? {
                self.store.delete_card(card.id).await?;
                released.extend(self.registry.lock().await.release_editors_of(card.id));
            }
            self.store.delete_list(list.id).await?;
            released.extend(self.registry.lock().await.release_editors_of(list.id));
        }
        self.store.delete_board(board_id).await?;

        let event = ServerEvent::BoardDeleted { board_id, actor };
        self.publish(board_id, None, &event).await;
        self.publish_presence(released).await;
        Ok(event)
    }

    // ─── Position allocation ─────────────────────────────────────────

    /// Allocate a card key between the intended neighbors, re-fetching and
    /// retrying once if the first attempt reports an ordering violation.
    async fn allocate_card_key(
        &self,
        list_id: ListId,
        after: Option<CardId>,
        before: Option<CardId>,
        exclude: Option<CardId>,
    ) -> Result<PositionKey, SyncError> {
        let mut attempt = 0;
        loop {
            let siblings: Vec<(Uuid, PositionKey)> = self
                .store
                .cards_of_list(list_id)
                .await?
                .into_iter()
                .filter(|c| Some(c.id) != exclude)
                .map(|c| (c.id, c.position))
                .collect();
            match allocate_in_gap(&siblings, after, before) {
                Ok(key) => return Ok(key),
                Err(violation) if attempt == 0 => {
                    log::warn!(
                        "ordering violation on list {list_id} ({violation}); \
                         re-fetching neighbors and retrying"
                    );
                    attempt += 1;
                }
                Err(violation) => return Err(violation.into()),
            }
        }
    }

    async fn allocate_list_key(
        &self,
        board_id: BoardId,
        after: Option<ListId>,
        before: Option<ListId>,
        exclude: Option<ListId>,
    ) -> Result<PositionKey, SyncError> {
        let mut attempt = 0;
        loop {
            let siblings: Vec<(Uuid, PositionKey)> = self
                .store
                .lists_of_board(board_id)
                .await?
                .into_iter()
                .filter(|l| Some(l.id) != exclude)
                .map(|l| (l.id, l.position))
                .collect();
            match allocate_in_gap(&siblings, after, before) {
                Ok(key) => return Ok(key),
                Err(violation) if attempt == 0 => {
                    log::warn!(
                        "ordering violation on board {board_id} ({violation}); \
                         re-fetching neighbors and retrying"
                    );
                    attempt += 1;
                }
                Err(violation) => return Err(violation.into()),
            }
        }
    }
}

/// Resolve the intended gap against current siblings (ascending by key) and
/// mint a key inside it.
///
/// `after` anchors first; if it survived, the gap is (after, its successor).
/// If `after` is gone but `before` survived, the gap closes up against
/// `before` — this is what lands a card adjacent to its intended right-hand
/// neighbor when the left-hand one was deleted mid-drag. With no surviving
/// anchor the item appends at the end.
fn allocate_in_gap(
    siblings: &[(Uuid, PositionKey)],
    after: Option<Uuid>,
    before: Option<Uuid>,
) -> Result<PositionKey, OrderingViolation> {
    if let Some(anchor) = after {
        if let Some(idx) = siblings.iter().position(|(id, _)| *id == anchor) {
            let lower = Some(&siblings[idx].1);
            let upper = siblings.get(idx + 1).map(|(_, k)| k);
            return PositionKey::between(lower, upper);
        }
        log::debug!("after-neighbor {anchor} vanished; falling back to before-neighbor");
    }
    if let Some(anchor) = before {
        if let Some(idx) = siblings.iter().position(|(id, _)| *id == anchor) {
            let lower = idx.checked_sub(1).map(|i| &siblings[i].1);
            let upper = Some(&siblings[idx].1);
            return PositionKey::between(lower, upper);
        }
    }
    // No surviving anchor (or none given): append at the end.
    PositionKey::between(siblings.last().map(|(_, k)| k), None)
}
