use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    cursor::{self, CursorToken},
    models::{errors::TimelineError, item::Item},
};

/// Sent once per connection, including every reconnection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeHandshake {
    pub auth_token: String,
    /// Newest confirmed item the viewer already has, `None` for an empty timeline.
    pub cursor: Option<CursorToken>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItemsPayload {
    pub items: Vec<Item>,
    pub head_cursor: CursorToken,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemovedItemsPayload {
    pub ids: Vec<String>,
}

/// A push frame the engine understands.
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    NewItems(NewItemsPayload),
    RemovedItems(RemovedItemsPayload),
    /// A `type` this engine doesn't know, to be ignored.
    Unrecognized(String),
}

impl PushMessage {
    /// Parses one text frame of the shape `{ "type": ..., "payload": ... }`.
    pub fn parse(frame: &str) -> Result<Self, TimelineError> {
        let malformed = |e: serde_json::Error| TimelineError::MalformedPushMessage(e.to_string());

        // First deserialize into a generic Value to inspect the structure
        let value: Value = serde_json::from_str(frame).map_err(malformed)?;

        let kind = value
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TimelineError::MalformedPushMessage("missing `type`".to_owned()))?;

        let payload = value.get("payload").cloned().unwrap_or(Value::Null);

        match kind {
            "new_items" => {
                let payload: NewItemsPayload = serde_json::from_value(payload).map_err(malformed)?;
                // The head cursor has to be readable even though only the reducer keeps it.
                cursor::decode(&payload.head_cursor).map_err(|e| {
                    TimelineError::MalformedPushMessage(format!("bad head cursor: {e}"))
                })?;
                if let Some(item) = payload.items.iter().find(|i| i.is_optimistic()) {
                    return Err(TimelineError::MalformedPushMessage(format!(
                        "provisional item {} in push batch",
                        item.effective_id()
                    )));
                }
                Ok(PushMessage::NewItems(payload))
            }
            "removed_items" => Ok(PushMessage::RemovedItems(
                serde_json::from_value(payload).map_err(malformed)?,
            )),
            other => Ok(PushMessage::Unrecognized(other.to_owned())),
        }
    }
}
