//! Document engine: the single owner of one replica's state.
//!
//! All mutations, local or remote, run inside a [`Transaction`]. When the
//! transaction exits and something visible changed, the engine rebuilds the
//! snapshot and publishes it exactly once. Observers therefore never see a
//! half-applied batch (for example an initialized flag with no words).
//!
//! Lifecycle:
//!
//! ```text
//!   Init ──mark_synced()──► Synced ──dispose()──► Disposed
//!    │                                              ▲
//!    └──────────────────dispose()───────────────────┘
//! ```
//!
//! Remote operations are accepted in `Init` and `Synced`; local mutations
//! require `Synced` and fail with [`EngineError::NotSyncedYet`] before that.

use std::mem;
use std::sync::Arc;
use uuid::Uuid;

use crate::bus::{NotificationBus, Subscription};
use crate::clock::{LamportClock, ReplicaId};
use crate::config::EngineConfig;
use crate::error::{EngineError, InvalidMutation};
use crate::identity::UserId;
use crate::ops::{AddSuggestionOp, DocOp, InitOp, ToggleVoteOp, WordSeed};
use crate::store::{Applied, ReplicatedStore};
use crate::{normalize_text, DocumentSnapshot, SuggestionId, WordId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Waiting for initial sync; local mutations are rejected.
    Init,
    Synced,
    Disposed,
}

/// Main entry point for one replica of the document.
pub struct DocumentEngine {
    replica: ReplicaId,
    state: EngineState,
    clock: LamportClock,
    store: ReplicatedStore,
    /// Local ops not yet handed to the sync channel.
    outbound: Vec<DocOp>,
    snapshot: Arc<DocumentSnapshot>,
    version: u64,
    bus: NotificationBus<Arc<DocumentSnapshot>>,
}

impl DocumentEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_replica(Uuid::new_v4(), config)
    }

    pub fn with_replica(replica: ReplicaId, config: EngineConfig) -> Self {
        Self {
            replica,
            state: EngineState::Init,
            clock: LamportClock::new(replica),
            store: ReplicatedStore::new(config),
            outbound: Vec::new(),
            snapshot: Arc::new(DocumentSnapshot::empty()),
            version: 0,
            bus: NotificationBus::new(),
        }
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == EngineState::Synced
    }

    /// Current Lamport counter.
    pub fn clock(&self) -> u64 {
        self.clock.counter()
    }

    /// Initial sync finished; local mutations are allowed from now on.
    pub fn mark_synced(&mut self) -> Result<(), EngineError> {
        match self.state {
            EngineState::Disposed => Err(EngineError::Disposed),
            _ => {
                self.state = EngineState::Synced;
                Ok(())
            }
        }
    }

    /// Tear down: subscribers see end-of-stream, every later call fails.
    pub fn dispose(&mut self) {
        if self.state != EngineState::Disposed {
            self.state = EngineState::Disposed;
            self.bus.close();
            self.outbound.clear();
            log::debug!("Engine {} disposed", self.replica);
        }
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        match self.state {
            EngineState::Disposed => Err(EngineError::Disposed),
            _ => Ok(()),
        }
    }

    fn ensure_synced(&self) -> Result<(), EngineError> {
        match self.state {
            EngineState::Init => Err(EngineError::NotSyncedYet),
            EngineState::Synced => Ok(()),
            EngineState::Disposed => Err(EngineError::Disposed),
        }
    }

    // ── Transactions ─────────────────────────────────────────────

    fn transact<R>(
        &mut self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let mut txn = Transaction {
            store: &mut self.store,
            clock: &mut self.clock,
            outbound: &mut self.outbound,
            changed: false,
        };
        let result = f(&mut txn);
        let changed = txn.changed;

        if changed && result.is_ok() {
            self.version += 1;
            self.snapshot = Arc::new(self.store.build_snapshot(self.version));
            self.bus.publish(self.snapshot.clone());
        }
        result
    }

    /// Run several local mutations as one batch with a single notification.
    ///
    /// All or nothing: if `f` fails, the store and the outbox are restored
    /// and no notification fires.
    pub fn batch<R>(
        &mut self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        self.ensure_synced()?;
        let checkpoint = self.store.clone();
        let queued = self.outbound.len();

        let result = self.transact(f);
        if result.is_err() {
            self.store = checkpoint;
            self.outbound.truncate(queued);
            log::debug!("Batch on engine {} failed; rolled back", self.replica);
        }
        result
    }

    /// A single mutation validates before it commits, so it needs no checkpoint.
    fn mutate<R>(
        &mut self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        self.ensure_synced()?;
        self.transact(f)
    }

    // ── Mutation API ─────────────────────────────────────────────

    /// Populate the word sequence unless the document is already initialized.
    ///
    /// Returns `false` when initialization had already happened.
    pub fn initialize<S: AsRef<str>>(&mut self, words: &[S]) -> Result<bool, EngineError> {
        self.mutate(|txn| txn.initialize(words))
    }

    /// Split `text` on whitespace and initialize with the resulting words.
    pub fn initialize_text(&mut self, text: &str) -> Result<bool, EngineError> {
        let words: Vec<&str> = text.split_whitespace().collect();
        self.initialize(&words)
    }

    pub fn add_suggestion(
        &mut self,
        word_id: WordId,
        text: &str,
        author: &UserId,
    ) -> Result<SuggestionId, EngineError> {
        self.mutate(|txn| txn.add_suggestion(word_id, text, author))
    }

    /// Flip `user`'s endorsement. Returns the new membership.
    pub fn toggle_vote(
        &mut self,
        suggestion_id: SuggestionId,
        user: &UserId,
    ) -> Result<bool, EngineError> {
        self.mutate(|txn| txn.toggle_vote(suggestion_id, user))
    }

    // ── Remote operations ────────────────────────────────────────

    pub fn apply_remote(&mut self, op: DocOp) -> Result<(), EngineError> {
        self.apply_remote_batch(vec![op])
    }

    /// Merge a batch of remote ops with one notification for the whole batch.
    pub fn apply_remote_batch(&mut self, ops: Vec<DocOp>) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.transact(|txn| {
            txn.apply_remote_batch(ops);
            Ok(())
        })
    }

    /// Decode a frame from the sync channel and merge it.
    pub fn apply_remote_bytes(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        self.ensure_live()?;
        let ops = DocOp::decode_batch(bytes).inspect_err(|e| {
            log::warn!("Dropping undecodable sync frame ({} bytes): {e}", bytes.len());
        })?;
        self.apply_remote_batch(ops)
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Local ops produced since the last drain, in program order.
    pub fn drain_outbound(&mut self) -> Vec<DocOp> {
        mem::take(&mut self.outbound)
    }

    pub fn snapshot(&self) -> Arc<DocumentSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> Result<Subscription<Arc<DocumentSnapshot>>, EngineError> {
        self.ensure_live()?;
        Ok(self.bus.subscribe())
    }

    /// Every op this replica has applied, for answering state requests.
    pub fn history(&self) -> &[DocOp] {
        self.store.history()
    }

    pub fn pending_len(&self) -> usize {
        self.store.pending_len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.store.dropped_count()
    }
}

/// Scoped group of mutations. Notifications fire when it ends.
pub struct Transaction<'a> {
    store: &'a mut ReplicatedStore,
    clock: &'a mut LamportClock,
    outbound: &'a mut Vec<DocOp>,
    changed: bool,
}

impl Transaction<'_> {
    fn commit_local(&mut self, op: DocOp) {
        if self.store.apply_local(op.clone()) == Applied::Visible {
            self.changed = true;
        }
        self.outbound.push(op);
    }

    pub(crate) fn apply_remote_batch(&mut self, ops: Vec<DocOp>) {
        for op in &ops {
            self.clock.observe(&op.stamp());
        }
        if self.store.apply_remote_batch(ops) {
            self.changed = true;
        }
    }

    /// Check-and-set on the initialized flag, populating in the same step.
    pub fn initialize<S: AsRef<str>>(&mut self, words: &[S]) -> Result<bool, EngineError> {
        if self.store.is_initialized() {
            log::debug!("Document already initialized; ignoring duplicate initialization");
            return Ok(false);
        }

        let seeds: Vec<WordSeed> = words
            .iter()
            .map(|w| w.as_ref().trim())
            .filter(|w| !w.is_empty())
            .map(|text| WordSeed {
                id: WordId::new(),
                text: text.to_string(),
            })
            .collect();
        if seeds.is_empty() {
            return Err(InvalidMutation::EmptyWordList.into());
        }

        let op = DocOp::Init(InitOp {
            stamp: self.clock.tick(),
            words: seeds,
        });
        self.commit_local(op);
        Ok(true)
    }

    /// Add a suggestion, or return the existing one with the same
    /// case-insensitive text on that word.
    pub fn add_suggestion(
        &mut self,
        word_id: WordId,
        text: &str,
        author: &UserId,
    ) -> Result<SuggestionId, EngineError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(InvalidMutation::EmptyText.into());
        }

        let index = self
            .store
            .visible_index(&word_id)
            .ok_or(EngineError::UnknownWord(word_id))?;
        if let Some(existing) = self.store.find_duplicate(index, &normalize_text(trimmed)) {
            return Ok(existing);
        }
        let visible_word = self
            .store
            .visible_word_id(index)
            .ok_or(EngineError::UnknownWord(word_id))?;

        let suggestion_id = SuggestionId::new();
        let op = DocOp::AddSuggestion(AddSuggestionOp {
            stamp: self.clock.tick(),
            word_id: visible_word,
            suggestion_id,
            text: trimmed.to_string(),
            author_id: author.clone(),
        });
        self.commit_local(op);
        Ok(suggestion_id)
    }

    pub fn toggle_vote(
        &mut self,
        suggestion_id: SuggestionId,
        user: &UserId,
    ) -> Result<bool, EngineError> {
        let present = !self
            .store
            .has_vote(&suggestion_id, user)
            .ok_or(EngineError::UnknownSuggestion(suggestion_id))?;

        let op = DocOp::ToggleVote(ToggleVoteOp {
            stamp: self.clock.tick(),
            suggestion_id,
            user_id: user.clone(),
            present,
        });
        self.commit_local(op);
        Ok(present)
    }
}
