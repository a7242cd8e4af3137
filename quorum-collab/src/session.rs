//! Collaboration session: the single entry point for one replica.
//!
//! Provides:
//! - Connection lifecycle on a [`BroadcastGroup`] (connect, disconnect)
//! - The sync handshake (`SyncStep1` → `SyncStep2`) that moves the engine
//!   out of its not-yet-synced state
//! - The Mutation API, forwarding every local op batch to the sync channel
//! - Awareness updates on the presence channel
//! - Offline queue for edits made while disconnected
//!
//! ```text
//!   connect()
//!     ├─► SyncStep1 ───────────► synced peers
//!     ├─► Awareness(full)        │
//!     └─► replay offline queue   │
//!                                ▼
//!   handle_frame() ◄──────── SyncStep2(history) ──► mark_synced()
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use uuid::Uuid;

use quorum_core::{
    DocOp, DocumentEngine, DocumentSnapshot, EngineConfig, EngineError, Identity, Subscription,
    SuggestionId, Transaction, UserId, WordId,
};

use crate::broadcast::{BroadcastGroup, Frame};
use crate::presence::{AwarenessMessage, AwarenessRegistry, ClientId, Presence, PresenceUpdate};
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Errors surfaced by the Mutation API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollabError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub engine: EngineConfig,
    /// Batches kept while disconnected before falling back to a full resend.
    pub offline_queue_capacity: usize,
    /// Overrides the identity's default display name.
    pub display_name: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            offline_queue_capacity: 10_000,
            display_name: None,
        }
    }
}

impl SessionConfig {
    pub fn for_testing() -> Self {
        Self {
            engine: EngineConfig::for_testing(),
            offline_queue_capacity: 4,
            display_name: None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Offline queue
// ───────────────────────────────────────────────────────────────────

/// Encoded op batches made while disconnected, replayed in order on connect.
pub struct OfflineQueue {
    queue: VecDeque<QueuedBatch>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedBatch {
    clock: u64,
    payload: Vec<u8>,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns `false` when the queue is full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedBatch { clock, payload });
        true
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue
            .drain(..)
            .map(|b| (b.clock, b.payload))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|b| b.payload.len()).sum()
    }
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

/// One replica of one document, attached to a broadcast hub.
pub struct CollabSession {
    identity: Identity,
    client_id: ClientId,
    doc_id: Uuid,
    engine: DocumentEngine,
    awareness: AwarenessRegistry,
    hub: Arc<BroadcastGroup>,
    inbox: Option<broadcast::Receiver<Frame>>,
    state: ConnectionState,
    offline_queue: OfflineQueue,
    /// Set when the offline queue overflowed; the next connect sends the
    /// whole history instead of the queue.
    resend_history: bool,
}

impl CollabSession {
    pub fn new(
        identity: Identity,
        doc_id: Uuid,
        hub: Arc<BroadcastGroup>,
        config: SessionConfig,
    ) -> Self {
        let identity = match config.display_name {
            Some(name) => identity.with_display_name(name),
            None => identity,
        };
        let client_id = ClientId::new();

        Self {
            awareness: AwarenessRegistry::new(client_id, &identity),
            engine: DocumentEngine::new(config.engine),
            offline_queue: OfflineQueue::new(config.offline_queue_capacity),
            identity,
            client_id,
            doc_id,
            hub,
            inbox: None,
            state: ConnectionState::Disconnected,
            resend_history: false,
        }
    }

    // ── Connection lifecycle ─────────────────────────────────────

    /// Join the hub, request state, announce presence and replay offline edits.
    pub async fn connect(&mut self) -> Result<(), CollabError> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        let info = PeerInfo {
            client_id: self.client_id,
            user_id: self.identity.user_id.clone(),
            display_name: self.awareness.local().user.display_name.clone(),
        };
        self.inbox = Some(self.hub.add_peer(info).await);
        self.state = ConnectionState::Connected;
        log::info!("Session {} connected to document {}", self.client_id, self.doc_id);

        self.send(&SyncMessage::sync_step1(self.client_id, self.doc_id))?;
        self.broadcast_presence()?;
        self.replay_offline()
    }

    /// Announce departure and leave the hub. Remote presences are forgotten.
    pub async fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }

        let leave = self.awareness.leave_message();
        let sent = SyncMessage::awareness(self.client_id, self.doc_id, self.engine.clock(), &leave)
            .and_then(|msg| self.hub.broadcast(&msg));
        if let Err(e) = sent {
            log::warn!("Session {} could not announce departure: {e}", self.client_id);
        }
        self.hub.leave(self.client_id, self.doc_id).await;
        self.inbox = None;
        self.state = ConnectionState::Disconnected;
        self.awareness.clear_remote();
        log::info!("Session {} disconnected from document {}", self.client_id, self.doc_id);
    }

    /// Disconnect and tear down; subscribers see end-of-stream.
    pub async fn dispose(&mut self) {
        self.disconnect().await;
        self.engine.dispose();
        self.awareness.close();
    }

    /// Declare the session synced without a handshake (first peer in a room).
    pub fn mark_synced(&mut self) -> Result<(), CollabError> {
        Ok(self.engine.mark_synced()?)
    }

    fn replay_offline(&mut self) -> Result<(), CollabError> {
        if self.resend_history {
            let history = self.engine.history();
            let frame = DocOp::encode_batch(history)?;
            log::info!(
                "Session {} offline queue overflowed; resending full history ({} ops)",
                self.client_id,
                history.len()
            );
            self.offline_queue.clear();
            self.resend_history = false;
            let msg = SyncMessage::delta(self.client_id, self.doc_id, self.engine.clock(), frame);
            self.send(&msg)?;
            return Ok(());
        }

        let queued = self.offline_queue.drain();
        if !queued.is_empty() {
            log::info!("Session {} replaying {} queued batches", self.client_id, queued.len());
            for (clock, payload) in queued {
                self.send(&SyncMessage::delta(self.client_id, self.doc_id, clock, payload))?;
            }
        }
        Ok(())
    }

    fn send(&self, msg: &SyncMessage) -> Result<usize, CollabError> {
        Ok(self.hub.broadcast(msg)?)
    }

    // ── Mutation API ─────────────────────────────────────────────

    /// Populate the document unless some replica already did.
    pub fn initialize<S: AsRef<str>>(&mut self, words: &[S]) -> Result<bool, CollabError> {
        let result = self.engine.initialize(words);
        self.flush_outbound()?;
        Ok(result?)
    }

    pub fn initialize_text(&mut self, text: &str) -> Result<bool, CollabError> {
        let words: Vec<&str> = text.split_whitespace().collect();
        self.initialize(&words)
    }

    /// Propose `text` for a word, authored and endorsed by this session's user.
    pub fn add_suggestion(&mut self, word_id: WordId, text: &str) -> Result<SuggestionId, CollabError> {
        let result = self.engine.add_suggestion(word_id, text, &self.identity.user_id);
        self.flush_outbound()?;
        Ok(result?)
    }

    /// Flip this session's user's vote. Returns the new membership.
    pub fn toggle_vote(&mut self, suggestion_id: SuggestionId) -> Result<bool, CollabError> {
        let result = self.engine.toggle_vote(suggestion_id, &self.identity.user_id);
        self.flush_outbound()?;
        Ok(result?)
    }

    /// Several mutations, one notification and one outbound frame.
    ///
    /// If `f` fails nothing is applied or sent.
    pub fn batch<R>(
        &mut self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, EngineError>,
    ) -> Result<R, CollabError> {
        let result = self.engine.batch(f);
        self.flush_outbound()?;
        Ok(result?)
    }

    fn flush_outbound(&mut self) -> Result<(), CollabError> {
        let ops = self.engine.drain_outbound();
        if ops.is_empty() {
            return Ok(());
        }
        let frame = DocOp::encode_batch(&ops)?;
        let clock = self.engine.clock();

        if self.state == ConnectionState::Connected {
            self.send(&SyncMessage::delta(self.client_id, self.doc_id, clock, frame))?;
        } else if !self.resend_history && !self.offline_queue.enqueue(clock, frame) {
            log::warn!(
                "Session {} offline queue full; {} ops will go out with the full history on reconnect",
                self.client_id,
                ops.len()
            );
            self.resend_history = true;
        }
        Ok(())
    }

    /// Merge fields into the local presence and broadcast the full object.
    ///
    /// Dropped silently while disconnected; the next connect sends it.
    pub fn set_local_awareness(&mut self, update: PresenceUpdate) -> Result<(), CollabError> {
        self.awareness.set_local(update);
        self.broadcast_presence()
    }

    pub fn select_word(&mut self, index: Option<usize>) -> Result<(), CollabError> {
        self.set_local_awareness(PresenceUpdate::select(index))
    }

    /// Select a word, or clear the selection if it is already selected.
    pub fn toggle_word_selection(&mut self, index: usize) -> Result<(), CollabError> {
        self.awareness.toggle_selection(index);
        self.broadcast_presence()
    }

    fn broadcast_presence(&self) -> Result<(), CollabError> {
        if self.state != ConnectionState::Connected {
            return Ok(());
        }
        let message = AwarenessMessage::Update(self.awareness.local().clone());
        let msg = SyncMessage::awareness(self.client_id, self.doc_id, self.engine.clock(), &message)?;
        self.send(&msg)?;
        Ok(())
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Handle every frame already delivered. Returns how many were read.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let Some(inbox) = self.inbox.as_mut() else {
                break;
            };
            match inbox.try_recv() {
                Ok(frame) => {
                    self.dispatch(&frame);
                    handled += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Lagged(skipped)) => self.on_lagged(skipped),
                Err(TryRecvError::Closed) => {
                    self.on_closed();
                    break;
                }
            }
        }
        handled
    }

    /// Wait for the next frame, then handle it and everything queued behind it.
    pub async fn recv(&mut self) -> Result<usize, CollabError> {
        let Some(inbox) = self.inbox.as_mut() else {
            return Err(ProtocolError::ConnectionClosed.into());
        };
        match inbox.recv().await {
            Ok(frame) => {
                self.dispatch(&frame);
                Ok(1 + self.pump())
            }
            Err(RecvError::Lagged(skipped)) => {
                self.on_lagged(skipped);
                Ok(self.pump())
            }
            Err(RecvError::Closed) => {
                self.on_closed();
                Err(ProtocolError::ConnectionClosed.into())
            }
        }
    }

    fn dispatch(&mut self, frame: &[u8]) {
        if let Err(e) = self.handle_frame(frame) {
            log::warn!("Session {} ignoring inbound frame: {e}", self.client_id);
        }
    }

    /// Decode one frame from the channel and act on it.
    ///
    /// Our own frames and frames for other documents are ignored.
    pub fn handle_frame(&mut self, bytes: &[u8]) -> Result<(), CollabError> {
        let msg = SyncMessage::decode(bytes)?;
        if msg.peer_id == self.client_id || msg.doc_id != self.doc_id {
            return Ok(());
        }

        match msg.msg_type {
            MessageType::SyncStep1 => self.answer_state_request(&msg),
            MessageType::SyncStep2 => {
                let ops = msg.ops()?;
                let count = ops.len();
                self.engine.apply_remote_batch(ops)?;
                if !self.engine.is_synced() {
                    self.engine.mark_synced()?;
                    log::info!(
                        "Session {} synced from {} ({} ops)",
                        self.client_id,
                        msg.peer_id,
                        count
                    );
                }
                Ok(())
            }
            MessageType::Delta => {
                self.engine.apply_remote_batch(msg.ops()?)?;
                Ok(())
            }
            MessageType::Awareness => {
                self.awareness.handle_message(msg.awareness_message()?);
                Ok(())
            }
            MessageType::PeerLeft => {
                self.awareness.on_disconnect(&msg.peer_id);
                Ok(())
            }
        }
    }

    /// A peer joined: show it our presence and, if we can vouch for our
    /// state, our full history.
    fn answer_state_request(&mut self, request: &SyncMessage) -> Result<(), CollabError> {
        if self.state != ConnectionState::Connected {
            return Ok(());
        }
        self.broadcast_presence()?;

        if !self.engine.is_synced() {
            log::debug!(
                "Session {} not synced; leaving state request from {} to others",
                self.client_id,
                request.peer_id
            );
            return Ok(());
        }
        let frame = DocOp::encode_batch(self.engine.history())?;
        let reply = SyncMessage::sync_step2(self.client_id, self.doc_id, self.engine.clock(), frame);
        self.send(&reply)?;
        Ok(())
    }

    fn on_lagged(&mut self, skipped: u64) {
        log::warn!(
            "Session {} missed {} frames; requesting full state",
            self.client_id,
            skipped
        );
        self.hub.record_lagged(skipped);
        if let Err(e) = self.send(&SyncMessage::sync_step1(self.client_id, self.doc_id)) {
            log::warn!("Session {} could not request state: {e}", self.client_id);
        }
    }

    fn on_closed(&mut self) {
        log::warn!("Session {} lost its channel", self.client_id);
        self.inbox = None;
        self.state = ConnectionState::Disconnected;
        self.awareness.clear_remote();
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Arc<DocumentSnapshot> {
        self.engine.snapshot()
    }

    pub fn presences(&self) -> Vec<Presence> {
        self.awareness.list()
    }

    pub fn local_presence(&self) -> &Presence {
        self.awareness.local()
    }

    /// Unique users currently present, this one included.
    pub fn distinct_users(&self) -> usize {
        self.awareness.distinct_users()
    }

    pub fn subscribe_document(&self) -> Result<Subscription<Arc<DocumentSnapshot>>, CollabError> {
        Ok(self.engine.subscribe()?)
    }

    pub fn subscribe_presence(&self) -> Subscription<Arc<Vec<Presence>>> {
        self.awareness.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.engine.is_synced()
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.identity.user_id
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn engine(&self) -> &DocumentEngine {
        &self.engine
    }

    pub fn offline_queue_len(&self) -> usize {
        self.offline_queue.len()
    }
}

impl Drop for CollabSession {
    /// A session dropped while connected still leaves the room, so peers
    /// purge its presence.
    fn drop(&mut self) {
        if self.state == ConnectionState::Connected {
            log::info!("Session {} dropped while connected", self.client_id);
            self.hub.leave_now(self.client_id, self.doc_id);
        }
    }
}
