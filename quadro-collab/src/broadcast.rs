//! Per-board fan-out with backpressure.
//!
//! One tokio broadcast channel per board: publish order equals delivery
//! order for every subscriber, so all clients of a board observe the same
//! event sequence. Events are encoded once and shared as `Arc<Vec<u8>>`;
//! each frame carries the originating connection so receivers can skip
//! echoing a client's own mutation back at it without decoding.
//!
//! A slow consumer lags and drops frames from its own buffer — it never
//! delays other consumers or the reconciler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use quadro_core::model::BoardId;

use crate::protocol::{ConnectionId, ProtocolError, ServerEvent, ServerFrame};

/// One encoded server frame in flight to a board's subscribers.
#[derive(Debug, Clone)]
pub struct EventFrame {
    /// Connection whose intent produced this event; receivers with the same
    /// id skip it (they already got a direct Ack).
    pub origin: Option<ConnectionId>,
    pub bytes: Arc<Vec<u8>>,
}

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub frames_published: u64,
    pub subscribers: usize,
}

struct AtomicChannelStats {
    frames_published: AtomicU64,
}

/// Broadcast group for a single board.
pub struct BoardChannel {
    sender: broadcast::Sender<EventFrame>,
    capacity: usize,
    stats: AtomicChannelStats,
}

impl BoardChannel {
    /// `capacity` bounds how many frames a lagging subscriber may buffer
    /// before it starts dropping.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: AtomicChannelStats {
                frames_published: AtomicU64::new(0),
            },
        }
    }

    /// Subscribe a connection to this board's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EventFrame> {
        self.sender.subscribe()
    }

    /// Encode the event once and fan it out. Returns the number of
    /// subscribers the frame reached. Never blocks.
    pub fn publish(
        &self,
        origin: Option<ConnectionId>,
        event: &ServerEvent,
    ) -> Result<usize, ProtocolError> {
        let encoded = ServerFrame::Event {
            event: event.clone(),
        }
        .encode()?;
        Ok(self.publish_frame(EventFrame {
            origin,
            bytes: Arc::new(encoded),
        }))
    }

    /// Fan out a pre-encoded frame (zero-copy fast path).
    pub fn publish_frame(&self, frame: EventFrame) -> usize {
        let reached = self.sender.send(frame).unwrap_or(0);
        self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
        reached
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            frames_published: self.stats.frames_published.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

/// Maps board ids to their broadcast channels so events stay isolated
/// between boards.
pub struct ChannelMap {
    channels: RwLock<HashMap<BoardId, Arc<BoardChannel>>>,
    default_capacity: usize,
}

impl ChannelMap {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the channel for a board.
    pub async fn get_or_create(&self, board_id: BoardId) -> Arc<BoardChannel> {
        // Fast path: read lock
        {
            let channels = self.channels.read().await;
            if let Some(channel) = channels.get(&board_id) {
                return channel.clone();
            }
        }

        // Slow path: write lock, double-checked
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(&board_id) {
            return channel.clone();
        }
        let channel = Arc::new(BoardChannel::new(self.default_capacity));
        channels.insert(board_id, channel.clone());
        channel
    }

    /// Channel for a board, if one exists.
    pub async fn get(&self, board_id: BoardId) -> Option<Arc<BoardChannel>> {
        self.channels.read().await.get(&board_id).cloned()
    }

    /// Drop a board's channel once nobody is subscribed.
    pub async fn remove_if_empty(&self, board_id: BoardId) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(&board_id) {
            if channel.subscriber_count() == 0 {
                channels.remove(&board_id);
                return true;
            }
        }
        false
    }

    pub async fn board_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn active_boards(&self) -> Vec<BoardId> {
        self.channels.read().await.keys().cloned().collect()
    }
}
