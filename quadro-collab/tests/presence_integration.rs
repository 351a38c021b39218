//! Presence lifecycle over real connections: join/leave announcements,
//! typing indicators, editing locks, and exactly-once departure on both
//! clean and abrupt disconnects.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use quadro_collab::client::{BoardClient, ClientEvent};
use quadro_collab::protocol::{ClientFrame, PresenceDelta, ServerEvent};
use quadro_collab::server::{CollabServer, ServerConfig};
use quadro_core::model::{Board, BoardId, UserId};
use quadro_core::store::{MemoryStore, RecordStore};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Short heartbeat window so liveness tests finish quickly.
async fn start_test_server() -> (String, BoardId, Arc<MemoryStore>) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        channel_capacity: 64,
        heartbeat_interval: Duration::from_millis(200),
        missed_heartbeats: 2,
    };
    let (server, store) = CollabServer::in_memory(config);

    let board = Board::new("Presence board", Uuid::new_v4());
    store.insert_board(board.clone()).await.unwrap();

    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (format!("ws://127.0.0.1:{port}"), board.id, store)
}

async fn connect_client(
    url: &str,
    board_id: BoardId,
    user: UserId,
) -> (BoardClient, mpsc::Receiver<ClientEvent>) {
    let mut client = BoardClient::new(url, board_id, user.to_string())
        .with_heartbeat_interval(Duration::from_millis(100));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    loop {
        match timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for Welcome")
            .expect("event stream closed")
        {
            ClientEvent::Welcome { .. } => break,
            _ => continue,
        }
    }
    (client, events)
}

async fn await_presence<T>(
    events: &mut mpsc::Receiver<ClientEvent>,
    mut pick: impl FnMut(&PresenceDelta) -> Option<T>,
) -> T {
    loop {
        let event = timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("timed out waiting for presence delta")
            .expect("event stream closed");
        if let ClientEvent::Event(ServerEvent::Presence(delta)) = &event {
            if let Some(value) = pick(delta) {
                return value;
            }
        }
    }
}

/// Count `Left` announcements for `user` over a fixed observation window.
/// Deadline-based: heartbeat acks keep the stream busy, so a per-receive
/// timeout would never expire.
async fn count_left_events(events: &mut mpsc::Receiver<ClientEvent>, user: UserId) -> usize {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut count = 0;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, events.recv()).await {
            Ok(Some(ClientEvent::Event(ServerEvent::Presence(PresenceDelta::Left {
                user_id,
                ..
            })))) if user_id == user => count += 1,
            Ok(Some(_)) => {}
            _ => break,
        }
    }
    count
}

#[tokio::test]
async fn test_join_is_announced_to_existing_participants() {
    let (url, board_id, _store) = start_test_server().await;
    let user_a = Uuid::new_v4();
    let user_b = Uuid::new_v4();
    let (_client_a, mut events_a) = connect_client(&url, board_id, user_a).await;
    let (_client_b, _events_b) = connect_client(&url, board_id, user_b).await;

    let joined = await_presence(&mut events_a, |delta| match delta {
        PresenceDelta::Joined { participant } => Some(participant.clone()),
        _ => None,
    })
    .await;
    assert_eq!(joined.user_id, user_b);
    assert_eq!(joined.board_id, board_id);
}

#[tokio::test]
async fn test_welcome_roster_in_join_order() {
    let (url, board_id, _store) = start_test_server().await;
    let users: Vec<UserId> = (0..3).map(|_| Uuid::new_v4()).collect();

    let (_c0, _e0) = connect_client(&url, board_id, users[0]).await;
    let (_c1, _e1) = connect_client(&url, board_id, users[1]).await;

    // The third client's Welcome must list all three, in join order.
    let mut client = BoardClient::new(&url, board_id, users[2].to_string());
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    let roster = loop {
        match timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out")
            .expect("stream closed")
        {
            ClientEvent::Welcome { roster, .. } => break roster,
            _ => continue,
        }
    };
    let roster_users: Vec<UserId> = roster.into_iter().map(|p| p.user_id).collect();
    assert_eq!(roster_users, users);
}

#[tokio::test]
async fn test_clean_leave_announced_exactly_once() {
    let (url, board_id, _store) = start_test_server().await;
    let user_b = Uuid::new_v4();
    let (_client_a, mut events_a) = connect_client(&url, board_id, Uuid::new_v4()).await;
    let (client_b, _events_b) = connect_client(&url, board_id, user_b).await;

    client_b.leave().await.unwrap();

    assert_eq!(count_left_events(&mut events_a, user_b).await, 1);
}

#[tokio::test]
async fn test_typing_indicator_reaches_other_participants() {
    let (url, board_id, _store) = start_test_server().await;
    let user_b = Uuid::new_v4();
    let (_client_a, mut events_a) = connect_client(&url, board_id, Uuid::new_v4()).await;
    let (client_b, _events_b) = connect_client(&url, board_id, user_b).await;

    client_b.set_typing(true).await.unwrap();

    let (typing_user, on) = await_presence(&mut events_a, |delta| match delta {
        PresenceDelta::Typing { user_id, on, .. } => Some((*user_id, *on)),
        _ => None,
    })
    .await;
    assert_eq!(typing_user, user_b);
    assert!(on);
}

#[tokio::test]
async fn test_abrupt_disconnect_mid_typing_announces_left_once() {
    // Raw socket client: joins, starts typing, then the process "crashes"
    // (TCP drops with no LeaveBoard). Everyone else must see exactly one
    // departure, after which the typing indicator is gone for good.
    let (url, board_id, _store) = start_test_server().await;
    let user_b = Uuid::new_v4();
    let (_client_a, mut events_a) = connect_client(&url, board_id, Uuid::new_v4()).await;

    let (mut raw, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let join = ClientFrame::JoinBoard {
        board_id,
        token: user_b.to_string(),
    };
    raw.send(Message::Binary(join.encode().unwrap().into()))
        .await
        .unwrap();
    let _welcome = raw.next().await.unwrap().unwrap();

    raw.send(Message::Binary(
        ClientFrame::Typing { on: true }.encode().unwrap().into(),
    ))
    .await
    .unwrap();

    // A sees the typing indicator come on...
    await_presence(&mut events_a, |delta| match delta {
        PresenceDelta::Typing { user_id, on: true, .. } if *user_id == user_b => Some(()),
        _ => None,
    })
    .await;

    // ...then B's connection dies without ceremony.
    drop(raw);

    assert_eq!(count_left_events(&mut events_a, user_b).await, 1);
}

#[tokio::test]
async fn test_heartbeat_timeout_forces_leave() {
    // A raw client that joins and then goes silent — no heartbeats, socket
    // held open. The server must force the departure within the window.
    let (url, board_id, _store) = start_test_server().await;
    let user_b = Uuid::new_v4();
    let (_client_a, mut events_a) = connect_client(&url, board_id, Uuid::new_v4()).await;

    let (mut raw, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let join = ClientFrame::JoinBoard {
        board_id,
        token: user_b.to_string(),
    };
    raw.send(Message::Binary(join.encode().unwrap().into()))
        .await
        .unwrap();
    let _welcome = raw.next().await.unwrap().unwrap();

    // Window is 200ms × 2; the silent client gets forced out while the
    // socket object stays alive in this test.
    let left = timeout(
        Duration::from_secs(3),
        await_presence(&mut events_a, |delta| match delta {
            PresenceDelta::Left { user_id, .. } if *user_id == user_b => Some(()),
            _ => None,
        }),
    )
    .await;
    assert!(left.is_ok(), "server never forced the silent client out");
    drop(raw);
}

#[tokio::test]
async fn test_editing_lock_released_on_leave() {
    let (url, board_id, _store) = start_test_server().await;
    let user_b = Uuid::new_v4();
    let (_client_a, mut events_a) = connect_client(&url, board_id, Uuid::new_v4()).await;
    let (client_b, _events_b) = connect_client(&url, board_id, user_b).await;

    let card = Uuid::new_v4();
    client_b.set_editing(Some(card)).await.unwrap();
    await_presence(&mut events_a, |delta| match delta {
        PresenceDelta::EditingStarted { entity, .. } if *entity == card => Some(()),
        _ => None,
    })
    .await;

    client_b.leave().await.unwrap();

    // The lock release is announced before the departure.
    await_presence(&mut events_a, |delta| match delta {
        PresenceDelta::EditingStopped { entity, .. } if *entity == card => Some(()),
        _ => None,
    })
    .await;
    await_presence(&mut events_a, |delta| match delta {
        PresenceDelta::Left { user_id, .. } if *user_id == user_b => Some(()),
        _ => None,
    })
    .await;
}
