//! # quorum-core: Replicated word-suggestion document engine
//!
//! A document is an ordered sequence of words. Every word carries a set of
//! alternative suggestions, and every suggestion carries the set of users
//! endorsing it. Replicas exchange operations over an unordered,
//! at-least-once channel and converge to the same state regardless of
//! delivery order or duplication.
//!
//! ## Architecture
//!
//! ```text
//!  local mutation ──► Transaction ──► ReplicatedStore ◄── remote DocOp
//!                          │                │
//!                          ▼                ▼
//!                   outbound DocOp    DocumentSnapshot
//!                   (sync channel)          │
//!                                           ▼
//!                                   NotificationBus ──► subscribers
//! ```
//!
//! ## Modules
//!
//! - [`clock`]: Lamport clock and write stamps
//! - [`identity`]: durable user identity
//! - [`ops`]: tagged operations and their wire codec
//! - [`store`]: the convergent state and merge rules
//! - [`engine`]: lifecycle, transactions, outbox, snapshots
//! - [`bus`]: snapshot subscriptions with cancellation handles

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

pub mod bus;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod ops;
pub mod store;

pub use bus::{NotificationBus, Subscription};
pub use clock::{LamportClock, ReplicaId, Stamp};
pub use config::EngineConfig;
pub use engine::{DocumentEngine, EngineState, Transaction};
pub use error::{EngineError, InvalidMutation};
pub use identity::{Identity, IdentityError, UserId};
pub use ops::{AddSuggestionOp, DocOp, InitOp, ToggleVoteOp, WordSeed};
pub use store::ReplicatedStore;

/// Globally unique word identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WordId(pub Uuid);

impl WordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "word-{}", self.0)
    }
}

/// Globally unique suggestion identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SuggestionId(pub Uuid);

impl SuggestionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SuggestionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SuggestionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sugg-{}", self.0)
    }
}

/// Comparison key for duplicate suppression: trimmed and case-folded.
pub fn normalize_text(text: &str) -> String {
    text.trim().to_lowercase()
}

/// A proposal for replacing a word.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: SuggestionId,
    pub text: String,
    pub author_id: UserId,
    pub voted_by: BTreeSet<UserId>,
}

impl Suggestion {
    /// Vote count, always derived from `voted_by`.
    pub fn votes(&self) -> usize {
        self.voted_by.len()
    }

    pub fn has_vote(&self, user: &UserId) -> bool {
        self.voted_by.contains(user)
    }
}

/// An editable unit of the document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Word {
    pub id: WordId,
    pub text: String,
    /// In creation order. Use [`Word::ranked_suggestions`] for display order.
    pub suggestions: Vec<Suggestion>,
}

impl Word {
    /// Suggestions by vote count, highest first; ties keep creation order.
    pub fn ranked_suggestions(&self) -> Vec<&Suggestion> {
        let mut ranked: Vec<&Suggestion> = self.suggestions.iter().collect();
        ranked.sort_by(|a, b| b.votes().cmp(&a.votes()));
        ranked
    }

    /// The leading suggestion, if it has more than one supporter.
    pub fn top_suggestion(&self) -> Option<&Suggestion> {
        self.ranked_suggestions()
            .into_iter()
            .next()
            .filter(|s| s.votes() > 1)
    }
}

/// Immutable point-in-time view of the document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    /// Local change counter. Not part of the convergent state.
    pub version: u64,
    pub initialized: bool,
    pub words: Vec<Word>,
}

impl DocumentSnapshot {
    pub fn empty() -> Self {
        Self {
            version: 0,
            initialized: false,
            words: Vec::new(),
        }
    }

    pub fn word(&self, id: &WordId) -> Option<&Word> {
        self.words.iter().find(|w| w.id == *id)
    }

    pub fn word_at(&self, index: usize) -> Option<&Word> {
        self.words.get(index)
    }

    pub fn suggestion(&self, id: &SuggestionId) -> Option<(&Word, &Suggestion)> {
        self.words.iter().find_map(|w| {
            w.suggestions.iter().find(|s| s.id == *id).map(|s| (w, s))
        })
    }

    /// Compare the replicated content, ignoring the local version counter.
    pub fn same_content(&self, other: &DocumentSnapshot) -> bool {
        self.initialized == other.initialized && self.words == other.words
    }

    /// The sentence as currently written (original word texts).
    pub fn text(&self) -> String {
        self.words
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Render for UI consumers, including the derived vote counts.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let words: Vec<serde_json::Value> = self
            .words
            .iter()
            .map(|w| {
                let suggestions: Vec<serde_json::Value> = w
                    .ranked_suggestions()
                    .into_iter()
                    .map(|s| {
                        serde_json::json!({
                            "id": s.id.to_string(),
                            "text": s.text,
                            "authorId": s.author_id,
                            "votes": s.votes(),
                            "votedBy": s.voted_by,
                        })
                    })
                    .collect();
                serde_json::json!({
                    "id": w.id.to_string(),
                    "text": w.text,
                    "suggestions": suggestions,
                })
            })
            .collect();

        serde_json::to_string_pretty(&serde_json::json!({
            "version": self.version,
            "initialized": self.initialized,
            "words": words,
        }))
    }
}

impl Default for DocumentSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}
