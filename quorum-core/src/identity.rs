//! Durable user identity.
//!
//! A user id is created once per machine profile and reused across
//! sessions, so authorship and votes stay attributed to the same person
//! after a restart. The engine only consumes the id; this module is the
//! one place that creates and persists it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

/// Durable identity of a user. Distinct from a transport session id:
/// one user may have several sessions open at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Identity I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Identity file {0} is empty")]
    Empty(String),
}

/// A user identity plus the name shown to other participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: UserId) -> Self {
        let display_name = default_display_name(&user_id);
        Self { user_id, display_name }
    }

    /// Fresh random identity that is never persisted.
    pub fn ephemeral() -> Self {
        Self::new(UserId::new(Uuid::new_v4().to_string()))
    }

    /// Load the identity stored at `path`, creating it on first use.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref();

        if path.exists() {
            let raw = fs::read_to_string(path)?;
            let id = raw.trim();
            if id.is_empty() {
                return Err(IdentityError::Empty(path.display().to_string()));
            }
            return Ok(Self::new(UserId::new(id)));
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let id = Uuid::new_v4().to_string();
        fs::write(path, &id)?;
        log::info!("Created new user identity at {}", path.display());
        Ok(Self::new(UserId::new(id)))
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }
}

/// `User-xxxx`, built from the first four characters of the id.
pub fn default_display_name(user_id: &UserId) -> String {
    let prefix: String = user_id.as_str().chars().take(4).collect();
    format!("User-{prefix}")
}
