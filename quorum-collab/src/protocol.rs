//! Binary envelope for the sync and presence channels.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! | Type | Payload |
//! |------|---------|
//! | `SyncStep1` | empty (state request) |
//! | `SyncStep2` | `Vec<DocOp>` frame: the sender's full history |
//! | `Delta` | `Vec<DocOp>` frame: new local ops |
//! | `Awareness` | `AwarenessMessage` |
//! | `PeerLeft` | empty |
//!
//! `peer_id` is the sender's transport client id, never the user id.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use quorum_core::{DocOp, UserId};

use crate::presence::{AwarenessMessage, ClientId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Request for the full op history of any synced peer
    SyncStep1 = 1,
    /// Full op history, answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental batch of ops
    Delta = 3,
    /// Presence update or leave
    Awareness = 4,
    /// Sender is disconnecting
    PeerLeft = 5,
}

/// Hub-side record of a connected session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub client_id: ClientId,
    pub user_id: UserId,
    pub display_name: String,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: ClientId,
    pub doc_id: Uuid,
    /// Sender's Lamport counter when the frame was built
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create a delta message from an encoded op batch.
    pub fn delta(peer_id: ClientId, doc_id: Uuid, clock: u64, ops_frame: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Delta,
            peer_id,
            doc_id,
            clock,
            payload: ops_frame,
        }
    }

    pub fn sync_step1(peer_id: ClientId, doc_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            peer_id,
            doc_id,
            clock: 0,
            payload: Vec::new(),
        }
    }

    pub fn sync_step2(peer_id: ClientId, doc_id: Uuid, clock: u64, history_frame: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            peer_id,
            doc_id,
            clock,
            payload: history_frame,
        }
    }

    pub fn awareness(
        peer_id: ClientId,
        doc_id: Uuid,
        clock: u64,
        message: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Awareness,
            peer_id,
            doc_id,
            clock,
            payload: message.encode()?,
        })
    }

    pub fn peer_left(peer_id: ClientId, doc_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::PeerLeft,
            peer_id,
            doc_id,
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the op batch carried by a `Delta` or `SyncStep2`.
    pub fn ops(&self) -> Result<Vec<DocOp>, ProtocolError> {
        match self.msg_type {
            MessageType::Delta | MessageType::SyncStep2 => DocOp::decode_batch(&self.payload)
                .map_err(|e| ProtocolError::DeserializationError(e.to_string())),
            _ => Err(ProtocolError::InvalidMessageType),
        }
    }

    /// Parse the awareness payload.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        AwarenessMessage::decode(&self.payload)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
}
