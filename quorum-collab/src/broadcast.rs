//! Fan-out of encoded frames to every session in a document room.
//!
//! Uses a tokio broadcast channel so one send reaches all subscribers.
//! Each session gets an independent receiver that buffers up to
//! `capacity` frames; a session that falls further behind observes a
//! lag and must resynchronize.
//!
//! Delivery includes the sender. Filtering its own frames is the
//! session's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::presence::ClientId;
use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Frame shared between all receivers without copying.
pub type Frame = Arc<Vec<u8>>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Frames skipped by lagging receivers.
    pub messages_lagged: u64,
    pub active_peers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_lagged: AtomicU64::new(0),
        }
    }
}

/// Broadcast group for a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    peers: Arc<RwLock<HashMap<ClientId, PeerInfo>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per receiver before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Register a session and hand back its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Frame> {
        let mut peers = self.peers.write().await;
        log::debug!("Peer {} ({}) joined the room", info.client_id, info.display_name);
        peers.insert(info.client_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, client_id: &ClientId) -> Option<PeerInfo> {
        let mut peers = self.peers.write().await;
        peers.remove(client_id)
    }

    /// Unregister a session and tell the room it left.
    pub async fn leave(&self, client_id: ClientId, doc_id: Uuid) -> Option<PeerInfo> {
        let removed = self.remove_peer(&client_id).await;
        self.announce_departure(client_id, doc_id);
        removed
    }

    /// [`leave`](Self::leave) for callers that cannot await, such as `Drop`.
    ///
    /// If the peer map is busy the removal is finished on the runtime.
    /// `PeerLeft` goes out immediately either way.
    pub fn leave_now(&self, client_id: ClientId, doc_id: Uuid) {
        match self.peers.try_write() {
            Ok(mut peers) => {
                peers.remove(&client_id);
            }
            Err(_) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let peers = self.peers.clone();
                    handle.spawn(async move {
                        peers.write().await.remove(&client_id);
                    });
                }
                Err(_) => log::warn!("Peer {client_id} left while the peer map was locked"),
            },
        }
        self.announce_departure(client_id, doc_id);
    }

    fn announce_departure(&self, client_id: ClientId, doc_id: Uuid) {
        log::debug!("Peer {client_id} left the room");
        if let Err(e) = self.broadcast(&SyncMessage::peer_left(client_id, doc_id)) {
            log::warn!("Could not announce departure of {client_id}: {e}");
        }
    }

    /// Encode and send to every receiver. Returns how many got it.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Send pre-encoded bytes. Lock-free.
    pub fn broadcast_raw(&self, encoded: Frame) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a receiver skipped because it fell behind.
    pub fn record_lagged(&self, skipped: u64) {
        self.atomic_stats
            .messages_lagged
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, client_id: &ClientId) -> bool {
        self.peers.read().await.contains_key(client_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.atomic_stats.messages_lagged.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw receiver that is not tracked as a peer (observers, tests).
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastGroup {
    fn default() -> Self {
        Self::new(256)
    }
}
