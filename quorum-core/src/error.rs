use thiserror::Error;

use crate::{SuggestionId, WordId};

/// Local input that can never become a valid operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidMutation {
    #[error("Suggestion text is empty after trimming")]
    EmptyText,
    #[error("Initialization needs at least one non-empty word")]
    EmptyWordList,
}

/// Errors surfaced by the document engine.
///
/// Out-of-order remote operations are not errors: they are buffered and
/// retried inside the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Document is not synced yet; defer the mutation")]
    NotSyncedYet,
    #[error("Engine has been disposed")]
    Disposed,
    #[error("Invalid mutation: {0}")]
    InvalidInput(#[from] InvalidMutation),
    #[error("Word not found: {0}")]
    UnknownWord(WordId),
    #[error("Suggestion not found: {0}")]
    UnknownSuggestion(SuggestionId),
    #[error("Codec error: {0}")]
    Codec(String),
}
