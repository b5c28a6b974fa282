use std::{cmp::Ordering, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer, ser::SerializeMap};
use serde_json::Value;

use crate::cursor::Cursor;

/// Prefix of every locally generated id. The backing store never issues ids in this format.
pub const TEMP_ID_PREFIX: &str = "optimistic_";

/// A locally generated identifier for an item that the backing store hasn't confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TempId(String);

impl TempId {
    pub(crate) fn from_sequence(seq: u64) -> Self {
        Self(format!("{TEMP_ID_PREFIX}{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identity of an item in the timeline: either provisional or confirmed, never both.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemId {
    /// Created locally, waiting for the backing store.
    Provisional(TempId),
    /// Issued by the backing store.
    Confirmed(String),
}

impl ItemId {
    /// The id used for deduplication and tie-breaking.
    pub fn as_str(&self) -> &str {
        match self {
            ItemId::Provisional(temp_id) => temp_id.as_str(),
            ItemId::Confirmed(id) => id,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, ItemId::Provisional(_))
    }
}

impl Serialize for ItemId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_map(Some(2))?;
        state.serialize_entry("id", self.as_str())?;
        state.serialize_entry("isOptimistic", &self.is_provisional())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;

        let id = value
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| serde::de::Error::missing_field("id"))?;

        // Items coming from the backing store don't carry the flag at all.
        let is_optimistic = value
            .get("isOptimistic")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if is_optimistic {
            Ok(ItemId::Provisional(TempId(id.to_owned())))
        } else {
            Ok(ItemId::Confirmed(id.to_owned()))
        }
    }
}

/// A content unit of the timeline.
///
/// `payload` is opaque to the engine and forwarded as-is to the front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    #[serde(flatten)]
    pub id: ItemId,
    pub author_ref: String,
    #[serde(default)]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community_ref: Option<String>,
}

impl Item {
    pub fn confirmed(
        id: impl Into<String>,
        author_ref: impl Into<String>,
        payload: Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ItemId::Confirmed(id.into()),
            author_ref: author_ref.into(),
            payload,
            created_at,
            community_ref: None,
        }
    }

    pub fn effective_id(&self) -> &str {
        self.id.as_str()
    }

    pub fn is_optimistic(&self) -> bool {
        self.id.is_provisional()
    }

    /// The resume point just past this item, if it is confirmed.
    pub fn cursor(&self) -> Option<Cursor> {
        match &self.id {
            ItemId::Confirmed(id) => Some(Cursor::new(self.created_at, id.clone())),
            ItemId::Provisional(_) => None,
        }
    }
}

/// Display order: newest first, ties broken by id descending.
pub fn display_order(a: &Item, b: &Item) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.effective_id().cmp(a.effective_id()))
}

/// What the viewer submitted, before the backing store turns it into an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftPayload {
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community_ref: Option<String>,
}

impl DraftPayload {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            community_ref: None,
        }
    }
}
