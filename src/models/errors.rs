use serde::{Serialize, ser::Serializer};

/// The ways the timeline engine can fail.
///
/// None of these are thrown at the viewer: they are stored as the single `error`
/// field of [`TimelineState`](crate::TimelineState), last error wins.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimelineError {
    /// A page fetch from one of the sources failed. Transient, retried only on request.
    #[error("failed to fetch a page from source `{source_name}`: {reason}")]
    FetchFailed { source_name: String, reason: String },
    /// A cursor token could not be decoded. Fatal for the request that carried it.
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    /// The backing store rejected or timed out a local write.
    #[error("couldn't publish your item: {reason}")]
    OptimisticWriteFailed { temp_id: String, reason: String },
    /// The push connection was lost; it is being re-established.
    #[error("live updates disconnected: {0}")]
    PushChannelDropped(String),
    /// A push frame that could not be understood. Logged and dropped, never stored.
    #[error("malformed push message: {0}")]
    MalformedPushMessage(String),
}

impl Serialize for TimelineError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.to_string().as_ref())
    }
}
