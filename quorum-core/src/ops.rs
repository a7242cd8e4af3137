//! Replicated operations and their wire codec.
//!
//! Every local mutation becomes exactly one [`DocOp`]. Operations are
//! designed so that applying them in any order, any number of times,
//! yields the same state:
//!
//! | Op | Identity | Merge rule |
//! |----|----------|------------|
//! | `Init` | stamp | smallest stamp wins the visible word sequence |
//! | `AddSuggestion` | suggestion id | insert-once |
//! | `ToggleVote` | (suggestion, user) | last stamp wins per pair |
//!
//! Wire format: bincode (standard config) over `Vec<DocOp>`.

use serde::{Deserialize, Serialize};

use crate::clock::Stamp;
use crate::error::EngineError;
use crate::identity::UserId;
use crate::{SuggestionId, WordId};

/// One word of an initialization batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordSeed {
    pub id: WordId,
    pub text: String,
}

/// Populate the word sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitOp {
    pub stamp: Stamp,
    pub words: Vec<WordSeed>,
}

/// Propose a replacement for a word. The author endorses it on creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddSuggestionOp {
    pub stamp: Stamp,
    pub word_id: WordId,
    pub suggestion_id: SuggestionId,
    pub text: String,
    pub author_id: UserId,
}

/// Set one user's membership in a suggestion's `voted_by` set.
///
/// The toggle is resolved at the issuing replica: `present` is the
/// resulting membership, so redelivery cannot flip it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleVoteOp {
    pub stamp: Stamp,
    pub suggestion_id: SuggestionId,
    pub user_id: UserId,
    pub present: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocOp {
    Init(InitOp),
    AddSuggestion(AddSuggestionOp),
    ToggleVote(ToggleVoteOp),
}

impl DocOp {
    pub fn stamp(&self) -> Stamp {
        match self {
            DocOp::Init(op) => op.stamp,
            DocOp::AddSuggestion(op) => op.stamp,
            DocOp::ToggleVote(op) => op.stamp,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DocOp::Init(_) => "init",
            DocOp::AddSuggestion(_) => "add-suggestion",
            DocOp::ToggleVote(_) => "toggle-vote",
        }
    }

    /// Encode a single operation.
    #[inline(always)]
    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| EngineError::Codec(e.to_string()))
    }

    /// Decode a single operation.
    #[inline(always)]
    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        let (op, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| EngineError::Codec(e.to_string()))?;
        Ok(op)
    }

    /// Encode a batch of operations as one frame.
    pub fn encode_batch(ops: &[DocOp]) -> Result<Vec<u8>, EngineError> {
        bincode::serde::encode_to_vec(ops, bincode::config::standard())
            .map_err(|e| EngineError::Codec(e.to_string()))
    }

    /// Decode a frame produced by [`DocOp::encode_batch`].
    pub fn decode_batch(bytes: &[u8]) -> Result<Vec<DocOp>, EngineError> {
        let (ops, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| EngineError::Codec(e.to_string()))?;
        Ok(ops)
    }
}
