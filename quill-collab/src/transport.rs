//! Pub/sub channel bus for document rooms.
//!
//! Each `(document, file)` pair maps to one channel; all subscribers of a
//! channel share a tokio broadcast fan-out. Frames reach *every* current
//! subscriber, sender included — self-suppression is done by the sync
//! provider via sender-id comparison, so the same logic keeps working on
//! transports without a no-self-delivery guarantee.
//!
//! ```text
//! ┌────────────┐  subscribe   ┌───────────────────────────┐
//! │ ChannelBus │ ───────────► │ Room "doc:{id}:{path}"    │
//! │ (explicit  │              │  broadcast::Sender<Frame> │
//! │  handle)   │              │  presence member set      │
//! └────────────┘              └───────────────────────────┘
//! ```
//!
//! Membership: `track()` announces the joiner to the room, replays the
//! current member list to the joiner, then delivers `MembershipSynced`
//! exactly once. Leaving (explicit or on drop) emits `PeerLeft`.
//!
//! Per-sender delivery order is FIFO (broadcast channel guarantee);
//! cross-sender ordering is unspecified — the CRDT merge does not need it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::ChannelMessage;

/// Default per-receiver frame buffer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Build the canonical channel name for a document scope.
pub fn channel_name(document_id: &str, file_path: &str) -> String {
    format!("doc:{document_id}:{file_path}")
}

/// Transport errors.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The sender already left the channel.
    Closed,
    /// The outgoing message failed to serialize.
    Encode(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Channel closed"),
            Self::Encode(e) => write!(f, "Message encode failed: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Events delivered to a channel subscriber.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// An encoded [`ChannelMessage`] from some subscriber (possibly self).
    Message(Arc<Vec<u8>>),
    PeerJoined { peer_id: Uuid },
    PeerLeft { peer_id: Uuid },
    /// Initial membership settled; fired once per subscription.
    MembershipSynced,
}

/// Internal fan-out frame: broadcast to everyone or targeted at one peer.
#[derive(Clone)]
enum ChannelFrame {
    Broadcast(ChannelEvent),
    Targeted { to: Uuid, event: ChannelEvent },
}

/// One document room: fan-out channel plus presence set.
struct Room {
    frames: broadcast::Sender<ChannelFrame>,
    members: std::sync::RwLock<HashSet<Uuid>>,
    messages_sent: AtomicU64,
}

impl Room {
    fn new(capacity: usize) -> Self {
        let (frames, _) = broadcast::channel(capacity);
        Self {
            frames,
            members: std::sync::RwLock::new(HashSet::new()),
            messages_sent: AtomicU64::new(0),
        }
    }

    fn member_count(&self) -> usize {
        self.members.read().map(|m| m.len()).unwrap_or(0)
    }
}

/// Explicit handle to the pub/sub bus.
///
/// Passed into each sync provider as a dependency — never a process-wide
/// singleton. Rooms are created lazily and isolated per channel name.
pub struct ChannelBus {
    rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
    capacity: usize,
}

impl ChannelBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Subscribe a peer to a channel, opening the room if needed.
    pub async fn subscribe(&self, channel: &str, peer_id: Uuid) -> DocChannel {
        let room = self.get_or_create(channel).await;
        let rx = room.frames.subscribe();
        DocChannel {
            sender: ChannelSender {
                room,
                peer_id,
                left: AtomicBool::new(false),
            },
            events: Some(ChannelReceiver { rx, peer_id }),
        }
    }

    async fn get_or_create(&self, channel: &str) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(channel) {
                return room.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(channel) {
            return room.clone();
        }

        let room = Arc::new(Room::new(self.capacity));
        rooms.insert(channel.to_string(), room.clone());
        room
    }

    /// Number of tracked members in a channel.
    pub async fn member_count(&self, channel: &str) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(channel).map(|r| r.member_count()).unwrap_or(0)
    }

    /// Messages broadcast on a channel so far.
    pub async fn messages_sent(&self, channel: &str) -> u64 {
        let rooms = self.rooms.read().await;
        rooms
            .get(channel)
            .map(|r| r.messages_sent.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Drop a room with no tracked members. Returns whether it was removed.
    pub async fn remove_if_empty(&self, channel: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(channel) {
            if room.member_count() == 0 {
                rooms.remove(channel);
                return true;
            }
        }
        false
    }

    /// Number of open rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

/// A subscription to one document channel.
pub struct DocChannel {
    sender: ChannelSender,
    events: Option<ChannelReceiver>,
}

impl DocChannel {
    /// Take the event receiver (can only be taken once).
    pub fn take_events(&mut self) -> Option<ChannelReceiver> {
        self.events.take()
    }

    pub fn sender(&self) -> &ChannelSender {
        &self.sender
    }

    /// Split into independent send and receive halves.
    pub fn split(mut self) -> (ChannelSender, ChannelReceiver) {
        let events = self
            .events
            .take()
            .unwrap_or_else(|| ChannelReceiver {
                rx: self.sender.room.frames.subscribe(),
                peer_id: self.sender.peer_id,
            });
        (self.sender, events)
    }
}

/// Send half of a channel subscription.
///
/// Leaves the room when dropped, so a crashed provider still produces a
/// `PeerLeft` for its peers.
pub struct ChannelSender {
    room: Arc<Room>,
    peer_id: Uuid,
    left: AtomicBool,
}

impl ChannelSender {
    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    /// Broadcast a message to all current subscribers (sender included).
    ///
    /// Returns the number of receivers the frame reached.
    pub fn send(&self, message: &ChannelMessage) -> Result<usize, TransportError> {
        if self.left.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let encoded = message
            .encode()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        let count = self
            .room
            .frames
            .send(ChannelFrame::Broadcast(ChannelEvent::Message(Arc::new(
                encoded,
            ))))
            .unwrap_or(0);
        self.room.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    /// Register presence in the room.
    ///
    /// Announces this peer to existing subscribers, replays the current
    /// member list back to this peer, then delivers `MembershipSynced`.
    pub fn track(&self) -> Result<(), TransportError> {
        if self.left.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let existing: Vec<Uuid> = {
            let mut members = match self.room.members.write() {
                Ok(members) => members,
                Err(_) => return Err(TransportError::Closed),
            };
            let existing = members
                .iter()
                .copied()
                .filter(|p| *p != self.peer_id)
                .collect();
            members.insert(self.peer_id);
            existing
        };

        let _ = self
            .room
            .frames
            .send(ChannelFrame::Broadcast(ChannelEvent::PeerJoined {
                peer_id: self.peer_id,
            }));
        for peer in existing {
            let _ = self.room.frames.send(ChannelFrame::Targeted {
                to: self.peer_id,
                event: ChannelEvent::PeerJoined { peer_id: peer },
            });
        }
        let _ = self.room.frames.send(ChannelFrame::Targeted {
            to: self.peer_id,
            event: ChannelEvent::MembershipSynced,
        });
        Ok(())
    }

    /// Leave the room, emitting `PeerLeft` to remaining subscribers.
    ///
    /// Idempotent; also runs on drop.
    pub fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        let was_member = self
            .room
            .members
            .write()
            .map(|mut members| members.remove(&self.peer_id))
            .unwrap_or(false);
        if was_member {
            let _ = self
                .room
                .frames
                .send(ChannelFrame::Broadcast(ChannelEvent::PeerLeft {
                    peer_id: self.peer_id,
                }));
        }
    }
}

impl Drop for ChannelSender {
    fn drop(&mut self) {
        self.leave();
    }
}

/// Receive half of a channel subscription.
pub struct ChannelReceiver {
    rx: broadcast::Receiver<ChannelFrame>,
    peer_id: Uuid,
}

impl ChannelReceiver {
    /// Next event, or `None` once the room is gone.
    ///
    /// Membership frames about this peer itself are filtered out; message
    /// frames pass through untouched (sender filtering is the consumer's
    /// job). A lagged receiver logs and keeps going — dropped frames are
    /// tolerable because CRDT state self-heals on the next exchange and
    /// the durable log covers bootstrap.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ChannelFrame::Broadcast(event)) => match event {
                    ChannelEvent::PeerJoined { peer_id } | ChannelEvent::PeerLeft { peer_id }
                        if peer_id == self.peer_id =>
                    {
                        continue;
                    }
                    other => return Some(other),
                },
                Ok(ChannelFrame::Targeted { to, event }) => {
                    if to == self.peer_id {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("channel receiver lagged, skipped {skipped} frames");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
