//! Opaque pagination tokens.
//!
//! A token is `base64(json({timestamp, id}))`. Only this module looks inside it;
//! everybody else passes [`CursorToken`]s around untouched.

use std::{cmp::Ordering, fmt};

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{errors::TimelineError, item::Item};

/// A decoded resume point: "strictly older than this item, excluding it".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub timestamp: DateTime<Utc>,
    pub id: String,
}

impl Cursor {
    pub fn new(timestamp: DateTime<Utc>, id: impl Into<String>) -> Self {
        Self {
            timestamp,
            id: id.into(),
        }
    }

    /// Whether `item` comes after this point in a descending walk:
    /// `createdAt < timestamp OR (createdAt = timestamp AND id < cursor.id)`.
    pub fn admits(&self, item: &Item) -> bool {
        item.created_at < self.timestamp
            || (item.created_at == self.timestamp && item.effective_id() < self.id.as_str())
    }

    /// Whether this cursor denotes a point strictly older than `other`.
    pub fn is_older_than(&self, other: &Cursor) -> bool {
        self.position_cmp(other) == Ordering::Less
    }

    fn position_cmp(&self, other: &Cursor) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }

    pub fn encode(&self) -> CursorToken {
        encode(self.timestamp, &self.id)
    }
}

/// The opaque string form of a [`Cursor`], as exchanged with sources and the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CursorToken(String);

impl CursorToken {
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CursorToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn encode(timestamp: DateTime<Utc>, id: &str) -> CursorToken {
    let cursor = Cursor::new(timestamp, id);
    // Serializing a struct of a timestamp and a string can't fail.
    let json = serde_json::to_vec(&cursor).unwrap_or_default();
    CursorToken(B64.encode(json))
}

pub fn decode(token: &CursorToken) -> Result<Cursor, TimelineError> {
    let bytes = B64
        .decode(token.as_str())
        .map_err(|e| TimelineError::InvalidCursor(format!("not base64: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| TimelineError::InvalidCursor(format!("bad cursor payload: {e}")))
}
