//! Record store seam.
//!
//! The sync engine treats persistence as an external collaborator: plain
//! CRUD by id plus "children of a parent, ascending by position key".
//! Single-record writes are atomic. [`MemoryStore`] is the in-process
//! implementation used by tests and single-node deployments; a disk-backed
//! store slots in behind the same trait.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::{Board, BoardId, Card, CardId, List, ListId};

/// Store errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    NotFound(Uuid),
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "record not found: {id}"),
            Self::Backend(detail) => write!(f, "store backend error: {detail}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_board(&self, board: Board) -> Result<(), StoreError>;
    async fn board(&self, id: BoardId) -> Result<Board, StoreError>;
    async fn update_board(&self, board: Board) -> Result<(), StoreError>;
    async fn delete_board(&self, id: BoardId) -> Result<(), StoreError>;

    async fn insert_list(&self, list: List) -> Result<(), StoreError>;
    async fn list(&self, id: ListId) -> Result<List, StoreError>;
    async fn update_list(&self, list: List) -> Result<(), StoreError>;
    async fn delete_list(&self, id: ListId) -> Result<(), StoreError>;
    /// Lists of a board, ascending by position key.
    async fn lists_of_board(&self, board_id: BoardId) -> Result<Vec<List>, StoreError>;

    async fn insert_card(&self, card: Card) -> Result<(), StoreError>;
    async fn card(&self, id: CardId) -> Result<Card, StoreError>;
    async fn update_card(&self, card: Card) -> Result<(), StoreError>;
    async fn delete_card(&self, id: CardId) -> Result<(), StoreError>;
    /// Cards of a list, ascending by position key.
    async fn cards_of_list(&self, list_id: ListId) -> Result<Vec<Card>, StoreError>;
}

#[derive(Default)]
struct Tables {
    boards: HashMap<BoardId, Board>,
    lists: HashMap<ListId, List>,
    cards: HashMap<CardId, Card>,
}

/// In-memory record store.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_board(&self, board: Board) -> Result<(), StoreError> {
        self.tables.write().await.boards.insert(board.id, board);
        Ok(())
    }

    async fn board(&self, id: BoardId) -> Result<Board, StoreError> {
        self.tables
            .read()
            .await
            .boards
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_board(&self, board: Board) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.boards.contains_key(&board.id) {
            return Err(StoreError::NotFound(board.id));
        }
        tables.boards.insert(board.id, board);
        Ok(())
    }

    async fn delete_board(&self, id: BoardId) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .boards
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn insert_list(&self, list: List) -> Result<(), StoreError> {
        self.tables.write().await.lists.insert(list.id, list);
        Ok(())
    }

    async fn list(&self, id: ListId) -> Result<List, StoreError> {
        self.tables
            .read()
            .await
            .lists
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_list(&self, list: List) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.lists.contains_key(&list.id) {
            return Err(StoreError::NotFound(list.id));
        }
        tables.lists.insert(list.id, list);
        Ok(())
    }

    async fn delete_list(&self, id: ListId) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .lists
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn lists_of_board(&self, board_id: BoardId) -> Result<Vec<List>, StoreError> {
        let tables = self.tables.read().await;
        let mut lists: Vec<List> = tables
            .lists
            .values()
            .filter(|l| l.board_id == board_id)
            .cloned()
            .collect();
        lists.sort_by(|a, b| a.position.cmp(&b.position));
        Ok(lists)
    }

    async fn insert_card(&self, card: Card) -> Result<(), StoreError> {
        self.tables.write().await.cards.insert(card.id, card);
        Ok(())
    }

    async fn card(&self, id: CardId) -> Result<Card, StoreError> {
        self.tables
            .read()
            .await
            .cards
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_card(&self, card: Card) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.cards.contains_key(&card.id) {
            return Err(StoreError::NotFound(card.id));
        }
        tables.cards.insert(card.id, card);
        Ok(())
    }

    async fn delete_card(&self, id: CardId) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .cards
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn cards_of_list(&self, list_id: ListId) -> Result<Vec<Card>, StoreError> {
        let tables = self.tables.read().await;
        let mut cards: Vec<Card> = tables
            .cards
            .values()
            .filter(|c| c.list_id == list_id)
            .cloned()
            .collect();
        cards.sort_by(|a, b| a.position.cmp(&b.position));
        Ok(cards)
    }
}
