//! Per-board session registry: who is connected, what they are editing.
//!
//! The registry is entirely process-resident — there is no persistence and
//! nothing to recover. A process restart is equivalent to every participant
//! leaving; state rebuilds as clients reconnect.
//!
//! Every state transition returns the [`PresenceDelta`]s the caller must
//! fan out, so presence announcements can never drift from registry state.
//! `leave` is idempotent: the second signal for a connection returns no
//! deltas and therefore emits nothing.

use std::collections::HashMap;

use quadro_core::model::{BoardId, UserId};
use uuid::Uuid;

use crate::protocol::{ConnectionId, Participant, Presence, PresenceDelta};

/// Tracks participants of all boards hosted by this process.
///
/// Lookup is O(1) by connection and by board; the per-board connection list
/// keeps join order so "active users" renders stably.
#[derive(Default)]
pub struct SessionRegistry {
    participants: HashMap<ConnectionId, Participant>,
    boards: HashMap<BoardId, Vec<ConnectionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection on a board. Returns the delta to announce.
    pub fn join(
        &mut self,
        board_id: BoardId,
        connection_id: ConnectionId,
        user_id: UserId,
    ) -> PresenceDelta {
        let participant = Participant::new(connection_id, user_id, board_id);
        self.participants.insert(connection_id, participant.clone());
        self.boards.entry(board_id).or_default().push(connection_id);
        log::debug!("participant {user_id} joined board {board_id} ({connection_id})");
        PresenceDelta::Joined { participant }
    }

    /// Remove a connection, releasing any editing lock and typing flag it
    /// held. Idempotent: a connection that already left yields no deltas.
    pub fn leave(&mut self, connection_id: ConnectionId) -> Vec<PresenceDelta> {
        let Some(participant) = self.participants.remove(&connection_id) else {
            return Vec::new();
        };
        if let Some(connections) = self.boards.get_mut(&participant.board_id) {
            connections.retain(|c| *c != connection_id);
            if connections.is_empty() {
                self.boards.remove(&participant.board_id);
            }
        }

        let mut deltas = Vec::with_capacity(2);
        if let Some(entity) = participant.editing {
            deltas.push(PresenceDelta::EditingStopped {
                board_id: participant.board_id,
                connection_id,
                user_id: participant.user_id,
                entity,
            });
        }
        deltas.push(PresenceDelta::Left {
            board_id: participant.board_id,
            connection_id,
            user_id: participant.user_id,
        });
        log::debug!(
            "participant {} left board {} ({connection_id})",
            participant.user_id,
            participant.board_id
        );
        deltas
    }

    /// Update activity status. No-op (and no announcement) if unchanged.
    pub fn set_presence(
        &mut self,
        connection_id: ConnectionId,
        status: Presence,
    ) -> Option<PresenceDelta> {
        let participant = self.participants.get_mut(&connection_id)?;
        if participant.status == status {
            return None;
        }
        participant.status = status;
        Some(PresenceDelta::StatusChanged {
            board_id: participant.board_id,
            connection_id,
            user_id: participant.user_id,
            status,
        })
    }

    /// Point the connection's editing lock at an entity (or clear it).
    /// Switching targets announces the stop before the start.
    pub fn set_editing(
        &mut self,
        connection_id: ConnectionId,
        entity: Option<Uuid>,
    ) -> Vec<PresenceDelta> {
        let Some(participant) = self.participants.get_mut(&connection_id) else {
            return Vec::new();
        };
        if participant.editing == entity {
            return Vec::new();
        }

        let board_id = participant.board_id;
        let user_id = participant.user_id;
        let mut deltas = Vec::with_capacity(2);
        if let Some(previous) = participant.editing.take() {
            deltas.push(PresenceDelta::EditingStopped {
                board_id,
                connection_id,
                user_id,
                entity: previous,
            });
        }
        if let Some(next) = entity {
            participant.editing = Some(next);
            deltas.push(PresenceDelta::EditingStarted {
                board_id,
                connection_id,
                user_id,
                entity: next,
            });
        }
        deltas
    }

    /// Flip the typing flag. No-op if unchanged.
    pub fn set_typing(&mut self, connection_id: ConnectionId, on: bool) -> Option<PresenceDelta> {
        let participant = self.participants.get_mut(&connection_id)?;
        if participant.typing == on {
            return None;
        }
        participant.typing = on;
        Some(PresenceDelta::Typing {
            board_id: participant.board_id,
            connection_id,
            user_id: participant.user_id,
            on,
        })
    }

    /// Participants of a board, in join order.
    pub fn list_active(&self, board_id: BoardId) -> Vec<Participant> {
        self.boards
            .get(&board_id)
            .map(|connections| {
                connections
                    .iter()
                    .filter_map(|c| self.participants.get(c))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Users currently holding an editing lock on the given entity.
    pub fn list_editors(&self, entity: Uuid) -> Vec<UserId> {
        self.participants
            .values()
            .filter(|p| p.editing == Some(entity))
            .map(|p| p.user_id)
            .collect()
    }

    /// Release every editing lock pointing at a deleted entity, announcing
    /// each release. Typing flags of the affected connections clear too.
    pub fn release_editors_of(&mut self, entity: Uuid) -> Vec<PresenceDelta> {
        let mut deltas = Vec::new();
        for participant in self.participants.values_mut() {
            if participant.editing == Some(entity) {
                participant.editing = None;
                deltas.push(PresenceDelta::EditingStopped {
                    board_id: participant.board_id,
                    connection_id: participant.connection_id,
                    user_id: participant.user_id,
                    entity,
                });
                if participant.typing {
                    participant.typing = false;
                    deltas.push(PresenceDelta::Typing {
                        board_id: participant.board_id,
                        connection_id: participant.connection_id,
                        user_id: participant.user_id,
                        on: false,
                    });
                }
            }
        }
        deltas
    }

    pub fn participant(&self, connection_id: ConnectionId) -> Option<&Participant> {
        self.participants.get(&connection_id)
    }

    pub fn board_of(&self, connection_id: ConnectionId) -> Option<BoardId> {
        self.participants.get(&connection_id).map(|p| p.board_id)
    }

    pub fn connection_count(&self) -> usize {
        self.participants.len()
    }

    pub fn board_count(&self) -> usize {
        self.boards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (BoardId, ConnectionId, UserId) {
        (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn test_join_announces_participant() {
        let mut registry = SessionRegistry::new();
        let (board, conn, user) = ids();

        match registry.join(board, conn, user) {
            PresenceDelta::Joined { participant } => {
                assert_eq!(participant.user_id, user);
                assert_eq!(participant.board_id, board);
                assert_eq!(participant.status, Presence::Active);
            }
            other => panic!("unexpected delta: {other:?}"),
        }
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.board_count(), 1);
    }

    #[test]
    fn test_leave_is_idempotent() {
        let mut registry = SessionRegistry::new();
        let (board, conn, user) = ids();
        registry.join(board, conn, user);

        let first = registry.leave(conn);
        assert_eq!(first.len(), 1);
        assert!(matches!(first[0], PresenceDelta::Left { .. }));

        // Double-disconnect signal: nothing to announce the second time.
        let second = registry.leave(conn);
        assert!(second.is_empty());
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.board_count(), 0);
    }

    #[test]
    fn test_leave_releases_editing_lock() {
        let mut registry = SessionRegistry::new();
        let (board, conn, user) = ids();
        registry.join(board, conn, user);

        let card = Uuid::new_v4();
        registry.set_editing(conn, Some(card));

        let deltas = registry.leave(conn);
        assert_eq!(deltas.len(), 2);
        assert!(matches!(
            deltas[0],
            PresenceDelta::EditingStopped { entity, .. } if entity == card
        ));
        assert!(matches!(deltas[1], PresenceDelta::Left { .. }));
    }

    #[test]
    fn test_list_active_keeps_join_order() {
        let mut registry = SessionRegistry::new();
        let board = Uuid::new_v4();
        let users: Vec<UserId> = (0..4).map(|_| Uuid::new_v4()).collect();
        let conns: Vec<ConnectionId> = (0..4).map(|_| Uuid::new_v4()).collect();
        for (conn, user) in conns.iter().zip(&users) {
            registry.join(board, *conn, *user);
        }

        // Someone in the middle leaves; order of the rest is preserved.
        registry.leave(conns[1]);
        let active: Vec<UserId> = registry
            .list_active(board)
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        assert_eq!(active, vec![users[0], users[2], users[3]]);
    }

    #[test]
    fn test_editing_switch_announces_stop_then_start() {
        let mut registry = SessionRegistry::new();
        let (board, conn, user) = ids();
        registry.join(board, conn, user);

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        registry.set_editing(conn, Some(first));
        let deltas = registry.set_editing(conn, Some(second));

        assert_eq!(deltas.len(), 2);
        assert!(matches!(
            deltas[0],
            PresenceDelta::EditingStopped { entity, .. } if entity == first
        ));
        assert!(matches!(
            deltas[1],
            PresenceDelta::EditingStarted { entity, .. } if entity == second
        ));
    }

    #[test]
    fn test_set_editing_same_target_is_silent() {
        let mut registry = SessionRegistry::new();
        let (board, conn, user) = ids();
        registry.join(board, conn, user);

        let card = Uuid::new_v4();
        registry.set_editing(conn, Some(card));
        assert!(registry.set_editing(conn, Some(card)).is_empty());
    }

    #[test]
    fn test_list_editors() {
        let mut registry = SessionRegistry::new();
        let board = Uuid::new_v4();
        let card = Uuid::new_v4();

        let (conn_a, user_a) = (Uuid::new_v4(), Uuid::new_v4());
        let (conn_b, user_b) = (Uuid::new_v4(), Uuid::new_v4());
        registry.join(board, conn_a, user_a);
        registry.join(board, conn_b, user_b);
        registry.set_editing(conn_a, Some(card));
        registry.set_editing(conn_b, Some(card));

        let mut editors = registry.list_editors(card);
        editors.sort();
        let mut expected = vec![user_a, user_b];
        expected.sort();
        assert_eq!(editors, expected);
    }

    #[test]
    fn test_release_editors_of_deleted_entity() {
        let mut registry = SessionRegistry::new();
        let (board, conn, user) = ids();
        registry.join(board, conn, user);

        let card = Uuid::new_v4();
        registry.set_editing(conn, Some(card));
        registry.set_typing(conn, true);

        let deltas = registry.release_editors_of(card);
        assert_eq!(deltas.len(), 2);
        assert!(matches!(deltas[0], PresenceDelta::EditingStopped { .. }));
        assert!(matches!(deltas[1], PresenceDelta::Typing { on: false, .. }));
        assert!(registry.list_editors(card).is_empty());
    }

    #[test]
    fn test_typing_toggle_and_noop() {
        let mut registry = SessionRegistry::new();
        let (board, conn, user) = ids();
        registry.join(board, conn, user);

        assert!(registry.set_typing(conn, true).is_some());
        assert!(registry.set_typing(conn, true).is_none());
        assert!(registry.set_typing(conn, false).is_some());
    }

    #[test]
    fn test_presence_status_change() {
        let mut registry = SessionRegistry::new();
        let (board, conn, user) = ids();
        registry.join(board, conn, user);

        assert!(registry.set_presence(conn, Presence::Active).is_none());
        let delta = registry.set_presence(conn, Presence::Idle).unwrap();
        assert!(matches!(
            delta,
            PresenceDelta::StatusChanged {
                status: Presence::Idle,
                ..
            }
        ));
    }

    #[test]
    fn test_boards_are_isolated() {
        let mut registry = SessionRegistry::new();
        let board_a = Uuid::new_v4();
        let board_b = Uuid::new_v4();
        registry.join(board_a, Uuid::new_v4(), Uuid::new_v4());
        registry.join(board_b, Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(registry.list_active(board_a).len(), 1);
        assert_eq!(registry.list_active(board_b).len(), 1);
        assert_eq!(registry.board_count(), 2);
    }

    #[test]
    fn test_unknown_connection_is_silent() {
        let mut registry = SessionRegistry::new();
        let conn = Uuid::new_v4();
        assert!(registry.leave(conn).is_empty());
        assert!(registry.set_typing(conn, true).is_none());
        assert!(registry.set_editing(conn, Some(Uuid::new_v4())).is_empty());
        assert!(registry.set_presence(conn, Presence::Idle).is_none());
    }
}
