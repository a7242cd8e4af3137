//! Awareness: who is connected and which word they have selected.
//!
//! Presence is ephemeral. It is never part of the replicated document,
//! never persisted, and is removed the moment a client disconnects.
//!
//! ## Architecture
//!
//! ```text
//! Local selection change
//!       │
//!       ▼
//! AwarenessRegistry::set_local()   (merge fields)
//!       │
//!       ▼
//! AwarenessMessage::Update(full Presence)
//!       │
//!       ▼   (presence channel)
//! Remote AwarenessRegistry::on_remote_update()   (replace)
//!       │
//!       ▼
//! presence subscribers (full list, never a delta)
//! ```
//!
//! Entries are keyed by [`ClientId`], so one user with two tabs shows up
//! twice in [`AwarenessRegistry::list`] but once in
//! [`AwarenessRegistry::distinct_users`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use quorum_core::{Identity, NotificationBus, Subscription, UserId};

use crate::protocol::ProtocolError;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Transport-session identifier. A fresh one per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", &self.0.to_string()[..8])
    }
}

/// Display color for a user's selection highlight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresenceColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl PresenceColor {
    /// Stable, vivid color derived from the user id.
    ///
    /// Every tab of the same user gets the same color. Ids minted by
    /// [`Identity`] are UUIDs and use [`from_uuid`](Self::from_uuid); any
    /// other id is hashed with FNV-1a so it is still stable across builds.
    pub fn from_user(user: &UserId) -> Self {
        match Uuid::parse_str(user.as_str()) {
            Ok(id) => Self::from_uuid(id),
            Err(_) => Self::from_hash(u128::from(fnv1a(user.as_str().as_bytes()))),
        }
    }

    /// Hue from the UUID bits, fixed saturation and lightness.
    pub fn from_uuid(id: Uuid) -> Self {
        Self::from_hash(id.as_u128())
    }

    fn from_hash(hash: u128) -> Self {
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self {
            r: to_channel(r),
            g: to_channel(g),
            b: to_channel(b),
        }
    }

    /// `#rrggbb`
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl fmt::Display for PresenceColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

fn to_channel(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// HSL to RGB conversion helper.
fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 {
        l * (1.0 + s)
    } else {
        l + s - l * s
    };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub id: UserId,
    pub display_name: String,
    pub color: PresenceColor,
}

/// One client's presence entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub client_id: ClientId,
    pub user: PresenceUser,
    /// Index into the word sequence.
    pub selected_word_index: Option<usize>,
}

impl Presence {
    pub fn for_identity(client_id: ClientId, identity: &Identity) -> Self {
        Self {
            client_id,
            user: PresenceUser {
                id: identity.user_id.clone(),
                display_name: identity.display_name.clone(),
                color: PresenceColor::from_user(&identity.user_id),
            },
            selected_word_index: None,
        }
    }
}

/// Fields to merge into the local presence. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub display_name: Option<String>,
    pub selected_word_index: Option<Option<usize>>,
}

impl PresenceUpdate {
    pub fn select(index: Option<usize>) -> Self {
        Self {
            selected_word_index: Some(index),
            ..Self::default()
        }
    }

    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            display_name: Some(name.into()),
            ..Self::default()
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire protocol messages
// ───────────────────────────────────────────────────────────────────

/// Serialized inside `SyncMessage::Awareness` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Full presence object; replaces whatever the receiver holds.
    Update(Presence),
    /// Clean disconnect.
    Leave { client_id: ClientId },
}

impl AwarenessMessage {
    #[inline(always)]
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    #[inline(always)]
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    pub fn client_id(&self) -> ClientId {
        match self {
            AwarenessMessage::Update(presence) => presence.client_id,
            AwarenessMessage::Leave { client_id } => *client_id,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

/// Presence state for the local client and every remote one.
pub struct AwarenessRegistry {
    local: Presence,
    remote: HashMap<ClientId, Presence>,
    bus: NotificationBus<Arc<Vec<Presence>>>,
}

impl AwarenessRegistry {
    pub fn new(client_id: ClientId, identity: &Identity) -> Self {
        Self {
            local: Presence::for_identity(client_id, identity),
            remote: HashMap::new(),
            bus: NotificationBus::new(),
        }
    }

    /// Merge `update` into the local presence.
    ///
    /// Returns the full presence to broadcast, whether or not anything changed.
    pub fn set_local(&mut self, update: PresenceUpdate) -> AwarenessMessage {
        let before = self.local.clone();
        if let Some(name) = update.display_name {
            self.local.user.display_name = name;
        }
        if let Some(index) = update.selected_word_index {
            self.local.selected_word_index = index;
        }
        if self.local != before {
            self.publish();
        }
        AwarenessMessage::Update(self.local.clone())
    }

    /// Select `index`, or clear the selection if it is already selected.
    pub fn toggle_selection(&mut self, index: usize) -> AwarenessMessage {
        let next = match self.local.selected_word_index {
            Some(current) if current == index => None,
            _ => Some(index),
        };
        self.set_local(PresenceUpdate::select(next))
    }

    /// Replace the stored presence for a remote client.
    ///
    /// Returns `true` if the registry changed. Our own id is ignored.
    pub fn on_remote_update(&mut self, presence: Presence) -> bool {
        if presence.client_id == self.local.client_id {
            return false;
        }
        if self.remote.get(&presence.client_id) == Some(&presence) {
            return false;
        }
        self.remote.insert(presence.client_id, presence);
        self.publish();
        true
    }

    /// Remove a remote client immediately.
    pub fn on_disconnect(&mut self, client_id: &ClientId) -> Option<Presence> {
        let removed = self.remote.remove(client_id);
        if removed.is_some() {
            log::debug!("Presence for {client_id} removed");
            self.publish();
        }
        removed
    }

    /// Message announcing that this client is leaving.
    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            client_id: self.local.client_id,
        }
    }

    /// Dispatch an inbound awareness message.
    pub fn handle_message(&mut self, msg: AwarenessMessage) -> bool {
        match msg {
            AwarenessMessage::Update(presence) => self.on_remote_update(presence),
            AwarenessMessage::Leave { client_id } => self.on_disconnect(&client_id).is_some(),
        }
    }

    /// Forget every remote client (e.g. after our own disconnect).
    pub fn clear_remote(&mut self) {
        if !self.remote.is_empty() {
            self.remote.clear();
            self.publish();
        }
    }

    /// Local presence first, then remote clients ordered by client id.
    pub fn list(&self) -> Vec<Presence> {
        let mut remote: Vec<&Presence> = self.remote.values().collect();
        remote.sort_by_key(|p| p.client_id);
        std::iter::once(&self.local)
            .chain(remote)
            .cloned()
            .collect()
    }

    /// Number of unique users across all clients, local included.
    pub fn distinct_users(&self) -> usize {
        std::iter::once(&self.local)
            .chain(self.remote.values())
            .map(|p| &p.user.id)
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn local(&self) -> &Presence {
        &self.local
    }

    pub fn remote(&self, client_id: &ClientId) -> Option<&Presence> {
        self.remote.get(client_id)
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    pub fn subscribe(&self) -> Subscription<Arc<Vec<Presence>>> {
        self.bus.subscribe()
    }

    pub fn close(&self) {
        self.bus.close();
    }

    fn publish(&self) {
        self.bus.publish(Arc::new(self.list()));
    }
}
