use std::sync::Arc;

use crossbeam_channel::Receiver;
use eyeball::Subscriber;
use tokio::sync::watch;
use tracing::{debug, error, trace};

use crate::{
    cursor::CursorToken,
    models::{
        async_requests::{RequestSender, TimelineRequest},
        errors::TimelineError,
        event_bridge::EventBridge,
        events::{EmitEvent, ToastNotificationRequest, ToastNotificationVariant},
        item::{DraftPayload, ItemId, TempId},
        state_updater::StateUpdater,
    },
    push::PushConnectionState,
    timeline::{
        optimistic::OptimisticWriteManager,
        reducer::{Reducer, TimelineEvent, TimelineState},
    },
};

/// Channels connecting a [`Timeline`] to its background work.
pub(crate) struct TimelineEndpoints {
    pub update_receiver: Receiver<TimelineEvent>,
    pub request_sender: RequestSender,
    pub head_cursor: watch::Sender<Option<CursorToken>>,
    pub shutdown: watch::Sender<bool>,
    pub connection_state: Subscriber<PushConnectionState>,
}

/// The timeline of one viewer: the ordered, deduplicated item sequence plus its pending
/// buffer, kept in sync by pagination, the push channel and local writes.
///
/// Background work only queues [`TimelineEvent`]s; they are applied on
/// [`process_timeline_updates`](Self::process_timeline_updates), which the owner calls
/// whenever an [`EmitEvent::TimelineUpdatesPending`] is received.
pub struct Timeline {
    reducer: Reducer,
    writes: OptimisticWriteManager,
    endpoints: TimelineEndpoints,
    prefetch_next_page: bool,
    /// The state updater passed by the adapter
    state_updaters: Arc<Box<dyn StateUpdater>>,
    event_bridge: EventBridge,
    torn_down: bool,
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeline")
            .field("state", self.reducer.state())
            .field("torn_down", &self.torn_down)
            .finish_non_exhaustive()
    }
}

impl Drop for Timeline {
    fn drop(&mut self) {
        // Background tasks must never outlive the timeline they feed.
        self.teardown();
    }
}

impl Timeline {
    pub(crate) fn new(
        reducer: Reducer,
        writes: OptimisticWriteManager,
        endpoints: TimelineEndpoints,
        prefetch_next_page: bool,
        state_updaters: Arc<Box<dyn StateUpdater>>,
        event_bridge: EventBridge,
    ) -> Self {
        Self {
            reducer,
            writes,
            endpoints,
            prefetch_next_page,
            state_updaters,
            event_bridge,
            torn_down: false,
        }
    }

    pub fn state(&self) -> &TimelineState {
        self.reducer.state()
    }

    pub fn push_connection_state(&self) -> PushConnectionState {
        self.endpoints.connection_state.get()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Asks for the page after the current cursor.
    ///
    /// Returns `false` without doing anything while a page is loading, once
    /// pagination is exhausted, or after teardown.
    pub fn load_next_page(&mut self) -> bool {
        let state = self.reducer.state();
        if self.torn_down || state.loading() || !state.has_more() {
            trace!("Skipping page request");
            return false;
        }
        let cursor = state.next_cursor().cloned();

        self.reducer.apply(TimelineEvent::PaginationStarted);
        if !self
            .endpoints
            .request_sender
            .submit(TimelineRequest::LoadPage { cursor })
        {
            self.reducer.apply(TimelineEvent::PaginationFailed(TimelineError::FetchFailed {
                source_name: "worker".to_owned(),
                reason: "async worker is gone".to_owned(),
            }));
        }
        self.update_frontend_state();
        true
    }

    /// Shows `draft` at the head right away and asks the backing store to persist it.
    ///
    /// Returns the temp id of the provisional item, `None` after teardown.
    pub fn create_local(&mut self, draft: DraftPayload) -> Option<TempId> {
        if self.torn_down {
            return None;
        }
        let item = self.writes.create_local(draft.clone());
        let ItemId::Provisional(temp_id) = item.id.clone() else {
            error!("BUG: optimistic write manager created a confirmed item");
            return None;
        };
        self.reducer.apply(TimelineEvent::OptimisticCreated(item));

        let submitted = self
            .endpoints
            .request_sender
            .submit(TimelineRequest::ConfirmWrite {
                temp_id: temp_id.clone(),
                draft,
            });
        if !submitted {
            self.writes.rollback(&temp_id);
            self.reducer.apply(TimelineEvent::OptimisticRolledBack {
                temp_id: temp_id.clone(),
                reason: "async worker is gone".to_owned(),
            });
        }
        self.publish_head_cursor();
        self.update_frontend_state();
        Some(temp_id)
    }

    /// Records the viewer's scroll offset. Coming back to the top flushes the pending buffer.
    pub fn update_scroll_offset(&mut self, offset: f64) {
        if self.reducer.apply(TimelineEvent::ScrollUpdated { offset }) {
            self.publish_head_cursor();
            self.update_frontend_state();
        }
    }

    /// Moves every buffered push item into the timeline, wherever the viewer is.
    pub fn flush_pending(&mut self) -> usize {
        let flushed = self.reducer.flush_pending();
        if flushed > 0 {
            self.publish_head_cursor();
            self.update_frontend_state();
        }
        flushed
    }

    pub fn clear_error(&mut self) {
        if self.reducer.clear_error() {
            self.update_frontend_state();
        }
    }

    /// Applies every event queued by background work, then notifies the front end once.
    pub fn process_timeline_updates(&mut self) {
        if self.torn_down {
            return;
        }

        let mut num_updates = 0;
        let mut new_errors = Vec::new();
        while let Ok(event) = self.endpoints.update_receiver.try_recv() {
            let prefetch_candidate = match &event {
                TimelineEvent::OptimisticReconciled { temp_id, .. } => {
                    self.writes.reconcile(temp_id);
                    None
                }
                TimelineEvent::OptimisticRolledBack { temp_id, .. } => {
                    self.writes.rollback(temp_id);
                    None
                }
                TimelineEvent::PageLoaded { page, .. } if page.has_more => page.next_cursor.clone(),
                _ => None,
            };
            let sets_error = matches!(
                event,
                TimelineEvent::PaginationFailed(_)
                    | TimelineEvent::OptimisticRolledBack { .. }
                    | TimelineEvent::PushDropped(_)
            );

            if self.reducer.apply(event) {
                num_updates += 1;
                if sets_error && let Some(error) = self.reducer.state().error() {
                    new_errors.push(error.clone());
                }
            }

            // Only warm the cache for the page that is now next in line.
            if self.prefetch_next_page
                && let Some(cursor) = prefetch_candidate
                && self.reducer.state().next_cursor() == Some(&cursor)
            {
                self.endpoints
                    .request_sender
                    .submit(TimelineRequest::PrefetchPage { cursor });
            }
        }

        for error in new_errors {
            self.event_bridge
                .emit(EmitEvent::ToastNotification(ToastNotificationRequest::new(
                    error.to_string(),
                    None,
                    ToastNotificationVariant::Error,
                )));
        }

        if num_updates > 0 {
            debug!("Applied {num_updates} timeline updates");
            self.publish_head_cursor();
            self.update_frontend_state();
        }
    }

    /// Stops background work and closes the timeline: every later event is a no-op.
    ///
    /// Writes still in flight are abandoned. Called on drop.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.reducer.close();

        // The worker and the push listener both stop on this, the worker aborting its tasks.
        let _ = self.endpoints.shutdown.send(true);

        let abandoned = self.writes.abandon_all();
        let discarded = self.endpoints.update_receiver.try_iter().count();
        debug!("Timeline torn down, abandoned {abandoned} writes and discarded {discarded} events");
    }

    fn publish_head_cursor(&self) {
        let head = self.reducer.state().head_cursor();
        self.endpoints.head_cursor.send_if_modified(|current| {
            if current.as_ref() == head {
                return false;
            }
            *current = head.cloned();
            true
        });
    }

    fn update_frontend_state(&self) {
        if let Err(e) = self.state_updaters.update_timeline(self.reducer.state()) {
            error!("Couldn't update frontend timeline store: {e}");
        }
    }
}
