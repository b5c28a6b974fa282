use tokio::sync::mpsc::UnboundedSender;
use tracing::error;

use crate::{
    cursor::CursorToken,
    models::item::{DraftPayload, TempId},
};

/// The set of requests for async work that can be made to the worker task.
#[derive(Debug)]
pub enum TimelineRequest {
    /// Request to load the page right after `cursor` (`None` for the newest page).
    LoadPage { cursor: Option<CursorToken> },
    /// Request to warm the prefetch cache with the page after `cursor`.
    ///
    /// This request does not notify the timeline, failures are only logged.
    PrefetchPage { cursor: CursorToken },
    /// Request to persist a local write at the backing store.
    ///
    /// The outcome comes back as an `OptimisticReconciled` or `OptimisticRolledBack` event.
    ConfirmWrite { temp_id: TempId, draft: DraftPayload },
}

/// Sender half used by the [`Timeline`](crate::Timeline) to hand work to the async worker.
#[derive(Debug, Clone)]
pub struct RequestSender(UnboundedSender<TimelineRequest>);

impl RequestSender {
    pub(crate) fn new(sender: UnboundedSender<TimelineRequest>) -> Self {
        Self(sender)
    }

    /// Submits a request to the worker task to be executed asynchronously.
    ///
    /// Returns `false` if the worker is gone, in which case the request is dropped.
    pub(crate) fn submit(&self, req: TimelineRequest) -> bool {
        match self.0.send(req) {
            Ok(()) => true,
            Err(e) => {
                error!("BUG: async worker task receiver has died, dropping {:?}", e.0);
                false
            }
        }
    }
}
