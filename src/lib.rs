use std::sync::Arc;

use anyhow::anyhow;
use serde::{Serialize, ser::Serializer};
use tokio::{
    runtime::Handle,
    sync::{broadcast, mpsc::unbounded_channel, watch},
};
use tracing::{debug, error, info};

use crate::{
    init::workers::{WorkerContext, async_worker},
    models::{
        async_requests::RequestSender, event_bridge::EventBridge, events::EmitEvent,
        settings::TimelineSettings,
    },
    push::{Backoff, PushListener, PushTransport},
    sources::{ItemWriter, SourceFetcher},
    timeline::{
        optimistic::OptimisticWriteManager,
        paginator::{MergePaginator, PageCache},
        reducer::Reducer,
        scroll::ScrollTracker,
        view::TimelineEndpoints,
    },
};

pub mod cache;
pub mod cursor;
pub(crate) mod init;
pub mod models;
pub mod push;
pub mod sources;
pub mod timeline;

pub type Result<T> = std::result::Result<T, Error>;

/// timeline-sync Error enum
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Timeline(#[from] models::errors::TimelineError),
}

impl Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.to_string().as_ref())
    }
}

/// The required configuration for this lib. Adapters must implement updaters and the collaborators.
pub struct LibConfig {
    /// The functions that will be in charge of updating the frontend states / stores
    /// from the engine state
    updaters: Box<dyn StateUpdater>,
    /// Every source merged into the timeline, fetched concurrently for each page.
    sources: Vec<Arc<dyn SourceFetcher>>,
    /// Persists local writes at the backing store.
    writer: Arc<dyn ItemWriter>,
    push_transport: Arc<dyn PushTransport>,
    /// Sent in every push handshake.
    auth_token: String,
    /// Sent with every page request.
    viewer_ref: String,
    /// Author of the optimistic items created locally.
    author_ref: String,
    settings: TimelineSettings,
}

impl LibConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        updaters: Box<dyn StateUpdater>,
        sources: Vec<Arc<dyn SourceFetcher>>,
        writer: Arc<dyn ItemWriter>,
        push_transport: Arc<dyn PushTransport>,
        auth_token: String,
        viewer_ref: String,
        author_ref: String,
        settings: TimelineSettings,
    ) -> Self {
        Self {
            updaters,
            sources,
            writer,
            push_transport,
            auth_token,
            viewer_ref,
            author_ref,
            settings,
        }
    }
}

/// Function to be called from within a Tokio runtime to start a timeline.
/// This will start the workers and return the [`Timeline`] along with a `Receiver`
/// to forward outgoing events.
///
/// The timeline starts empty: call [`Timeline::load_next_page`] to fetch the first page.
pub fn init(config: LibConfig) -> Result<(Timeline, broadcast::Receiver<EmitEvent>)> {
    let LibConfig {
        updaters,
        sources,
        writer,
        push_transport,
        auth_token,
        viewer_ref,
        author_ref,
        settings,
    } = config;

    if sources.is_empty() {
        return Err(anyhow!("a timeline needs at least one source").into());
    }
    if settings.page_limit == 0 {
        return Err(anyhow!("page limit must be positive").into());
    }
    let handle = Handle::try_current().map_err(anyhow::Error::new)?;

    // Lib -> adapter events
    let (event_bridge, broadcast_receiver) = EventBridge::new();
    let updaters = Arc::new(updaters);

    // Worker/listener -> timeline events, drained by `process_timeline_updates`.
    let (update_sender, update_receiver) = crossbeam_channel::unbounded();
    // Timeline -> worker requests.
    let (request_sender, request_receiver) = unbounded_channel();
    let (head_cursor, head_cursor_receiver) = watch::channel(None);
    let (shutdown, shutdown_receiver) = watch::channel(false);

    let mut paginator = MergePaginator::new(sources, &settings, viewer_ref);
    if settings.prefetch_next_page {
        paginator = paginator.with_cache(Arc::new(PageCache::new(settings.prefetch_ttl())));
    }

    // Spawn the actual async worker task.
    let worker_shutdown = shutdown_receiver.clone();
    let worker_context = WorkerContext {
        paginator: Arc::new(paginator),
        writer,
        update_sender: update_sender.clone(),
        event_bridge: event_bridge.clone(),
        write_timeout: settings.write_timeout(),
    };
    handle.spawn(async move {
        match async_worker(request_receiver, worker_shutdown, worker_context).await {
            Ok(()) => debug!("Async worker task ended."),
            Err(e) => error!("Error: async worker task ended:\n\t{e:?}"),
        }
    });

    let listener = PushListener::new(
        push_transport,
        auth_token,
        head_cursor_receiver,
        update_sender,
        event_bridge.clone(),
        Backoff::from_settings(&settings),
    );
    let connection_state = listener.connection_state();
    let mut connection_subscriber = listener.connection_state();
    handle.spawn(listener.run(shutdown_receiver));

    let connection_updaters = updaters.clone();
    handle.spawn(async move {
        // Ends once the listener is gone.
        while let Some(state) = connection_subscriber.next().await {
            if let Err(e) = connection_updaters.update_push_connection(state) {
                error!("Cannot update push connection state. Error: {e}");
            }
        }
    });

    let timeline = Timeline::new(
        Reducer::new(ScrollTracker::new(settings.near_top_threshold)),
        OptimisticWriteManager::new(author_ref),
        TimelineEndpoints {
            update_receiver,
            request_sender: RequestSender::new(request_sender),
            head_cursor,
            shutdown,
            connection_state,
        },
        settings.prefetch_next_page,
        updaters,
        event_bridge,
    );
    info!("Timeline started");

    // Return broadcast receiver for the adapter to forward outgoing events
    Ok((timeline, broadcast_receiver))
}

// Re-exports

pub use cursor::{Cursor, CursorToken};
pub use models::errors::TimelineError;
pub use models::events::{ToastNotificationRequest, ToastNotificationVariant};
pub use models::item::{DraftPayload, Item, ItemId, TempId};
pub use models::state_updater::{StateUpdater, StateUpdaterFunctions};
pub use push::PushConnectionState;
pub use timeline::reducer::TimelineState;
pub use timeline::view::Timeline;
