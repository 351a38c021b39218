//! Board / List / Card records.
//!
//! Children never know their index — order within a parent is defined
//! entirely by ascending [`PositionKey`]. Every record carries a `version`
//! counter bumped on each accepted mutation, which the reconciler uses to
//! detect stale field edits.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::position::PositionKey;

pub type BoardId = Uuid;
pub type ListId = Uuid;
pub type CardId = Uuid;
pub type UserId = Uuid;

/// A shared task board. Lists hang off it by back-reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub id: BoardId,
    pub title: String,
    pub owner: UserId,
    pub version: u64,
}

impl Board {
    pub fn new(title: impl Into<String>, owner: UserId) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            owner,
            version: 1,
        }
    }
}

/// A column on a board, ordered among its siblings by position key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct List {
    pub id: ListId,
    pub board_id: BoardId,
    pub title: String,
    pub position: PositionKey,
    pub version: u64,
}

impl List {
    pub fn new(board_id: BoardId, title: impl Into<String>, position: PositionKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            board_id,
            title: title.into(),
            position,
            version: 1,
        }
    }
}

/// A task card inside a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub list_id: ListId,
    pub title: String,
    pub description: String,
    pub position: PositionKey,
    pub version: u64,
}

impl Card {
    pub fn new(
        list_id: ListId,
        title: impl Into<String>,
        description: impl Into<String>,
        position: PositionKey,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            list_id,
            title: title.into(),
            description: description.into(),
            position,
            version: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_records_start_at_version_one() {
        let owner = Uuid::new_v4();
        let board = Board::new("Roadmap", owner);
        assert_eq!(board.version, 1);

        let position = PositionKey::between(None, None).unwrap();
        let list = List::new(board.id, "Backlog", position.clone());
        assert_eq!(list.version, 1);
        assert_eq!(list.board_id, board.id);

        let card = Card::new(list.id, "Ship it", "", position);
        assert_eq!(card.version, 1);
        assert_eq!(card.list_id, list.id);
    }

    #[test]
    fn test_ids_are_unique() {
        let owner = Uuid::new_v4();
        let a = Board::new("A", owner);
        let b = Board::new("B", owner);
        assert_ne!(a.id, b.id);
    }
}
