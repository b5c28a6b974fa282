use std::{sync::Arc, time::Duration};

use crossbeam_channel::Sender;
use tokio::{
    runtime::Handle,
    sync::{mpsc::UnboundedReceiver, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    models::{
        async_requests::TimelineRequest,
        event_bridge::EventBridge,
        events::EmitEvent,
        item::{Item, TempId},
    },
    sources::ItemWriter,
    timeline::{paginator::MergePaginator, reducer::TimelineEvent},
};

/// Everything the worker needs to serve [`TimelineRequest`]s.
pub(crate) struct WorkerContext {
    pub paginator: Arc<MergePaginator>,
    pub writer: Arc<dyn ItemWriter>,
    pub update_sender: Sender<TimelineEvent>,
    pub event_bridge: EventBridge,
    pub write_timeout: Duration,
}

impl WorkerContext {
    /// Hands `event` to the timeline. Returns `false` once the timeline is gone.
    fn send(&self, event: TimelineEvent) -> bool {
        if self.update_sender.send(event).is_err() {
            return false;
        }
        self.event_bridge.emit(EmitEvent::TimelineUpdatesPending);
        true
    }
}

/// The entry point for the async worker task.
///
/// All this task does is wait for [`TimelineRequest`]s from the [`Timeline`](crate::Timeline)
/// and run each of them in its own task. Those tasks are aborted when `shutdown` fires.
pub(crate) async fn async_worker(
    mut request_receiver: UnboundedReceiver<TimelineRequest>,
    mut shutdown: watch::Receiver<bool>,
    context: WorkerContext,
) -> anyhow::Result<()> {
    debug!("Started async_worker task.");
    let context = Arc::new(context);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    loop {
        let request = tokio::select! {
            request = request_receiver.recv() => match request {
                Some(request) => request,
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        tasks.retain(|task| !task.is_finished());

        let context = context.clone();
        let task = match request {
            TimelineRequest::LoadPage { cursor } => Handle::current().spawn(async move {
                debug!("Loading page after {cursor:?}...");
                let event = match context.paginator.load_next_page(cursor.as_ref()).await {
                    Ok(page) => {
                        debug!(
                            "Loaded {} items, more: {}",
                            page.items.len(),
                            page.has_more
                        );
                        TimelineEvent::PageLoaded {
                            requested: cursor,
                            page,
                        }
                    }
                    Err(error) => {
                        warn!("Error loading page after {cursor:?}: {error}");
                        TimelineEvent::PaginationFailed(error)
                    }
                };
                context.send(event);
            }),
            TimelineRequest::PrefetchPage { cursor } => Handle::current().spawn(async move {
                if let Err(error) = context.paginator.prefetch(&cursor).await {
                    debug!("Prefetch after {cursor} failed: {error}");
                }
            }),
            TimelineRequest::ConfirmWrite { temp_id, draft } => {
                Handle::current().spawn(async move {
                    debug!("Persisting optimistic item {temp_id}...");
                    let outcome =
                        tokio::time::timeout(context.write_timeout, context.writer.create_item(&draft))
                            .await;
                    let event = match outcome {
                        Ok(Ok(item)) if !item.is_optimistic() => {
                            TimelineEvent::OptimisticReconciled { temp_id, item }
                        }
                        Ok(Ok(item)) => rejected(temp_id, provisional_reason(&item)),
                        Ok(Err(reason)) => rejected(temp_id, reason),
                        Err(_) => rejected(
                            temp_id,
                            format!("no answer within {:?}", context.write_timeout),
                        ),
                    };
                    context.send(event);
                })
            }
        };
        tasks.push(task);
    }

    debug!("Stopping async_worker task, aborting {} tasks.", tasks.len());
    for task in tasks {
        task.abort();
    }
    Ok(())
}

fn rejected(temp_id: TempId, reason: String) -> TimelineEvent {
    warn!("Write of optimistic item {temp_id} failed: {reason}");
    TimelineEvent::OptimisticRolledBack { temp_id, reason }
}

fn provisional_reason(item: &Item) -> String {
    format!(
        "backing store answered with provisional item {}",
        item.effective_id()
    )
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::{Value, json};
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::{
        models::{async_requests::RequestSender, item::DraftPayload, settings::TimelineSettings},
        sources::{
            SourceFetcher,
            memory::{InMemorySource, InMemoryWriter},
        },
    };

    struct NeverAnswers;

    #[async_trait]
    impl ItemWriter for NeverAnswers {
        async fn create_item(&self, _draft: &DraftPayload) -> Result<Item, String> {
            std::future::pending().await
        }
    }

    fn start(
        writer: Arc<dyn ItemWriter>,
    ) -> (
        RequestSender,
        crossbeam_channel::Receiver<TimelineEvent>,
        watch::Sender<bool>,
        JoinHandle<anyhow::Result<()>>,
    ) {
        let items = (1..=3)
            .map(|n| Item::confirmed(format!("i{n}"), "a", Value::Null, Utc.timestamp_opt(n, 0).unwrap()))
            .collect();
        let source: Arc<dyn SourceFetcher> = Arc::new(InMemorySource::new("text", items));
        let paginator = MergePaginator::new(vec![source], &TimelineSettings::default(), "viewer");
        let (update_sender, update_receiver) = crossbeam_channel::unbounded();
        let (event_bridge, _) = EventBridge::new();
        let (request_sender, request_receiver) = unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let worker = tokio::spawn(async_worker(
            request_receiver,
            shutdown_rx,
            WorkerContext {
                paginator: Arc::new(paginator),
                writer,
                update_sender,
                event_bridge,
                write_timeout: Duration::from_millis(50),
            },
        ));
        (
            RequestSender::new(request_sender),
            update_receiver,
            shutdown,
            worker,
        )
    }

    async fn next_event(events: &crossbeam_channel::Receiver<TimelineEvent>) -> TimelineEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(event) = events.try_recv() {
                    return event;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker should answer")
    }

    #[tokio::test]
    async fn load_page_reports_the_requested_cursor() {
        let (requests, events, shutdown, worker) =
            start(Arc::new(InMemoryWriter::new("me", 1)));
        assert!(requests.submit(TimelineRequest::LoadPage { cursor: None }));

        match next_event(&events).await {
            TimelineEvent::PageLoaded { requested, page } => {
                assert_eq!(requested, None);
                assert_eq!(page.items.len(), 3);
                assert!(!page.has_more);
            }
            other => panic!("unexpected {other:?}"),
        }

        shutdown.send(true).unwrap();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn confirm_write_reconciles_or_rolls_back() {
        let writer = Arc::new(InMemoryWriter::new("me", 42));
        let (requests, events, _shutdown, _worker) = start(writer.clone());

        requests.submit(TimelineRequest::ConfirmWrite {
            temp_id: TempId::from_sequence(1),
            draft: DraftPayload::new(json!({ "content": "hi" })),
        });
        match next_event(&events).await {
            TimelineEvent::OptimisticReconciled { temp_id, item } => {
                assert_eq!(temp_id, TempId::from_sequence(1));
                assert_eq!(item.effective_id(), "srv_42");
            }
            other => panic!("unexpected {other:?}"),
        }

        writer.set_rejection(Some("quota exceeded".into()));
        requests.submit(TimelineRequest::ConfirmWrite {
            temp_id: TempId::from_sequence(2),
            draft: DraftPayload::new(json!({ "content": "yo" })),
        });
        assert!(matches!(
            next_event(&events).await,
            TimelineEvent::OptimisticRolledBack { reason, .. } if reason == "quota exceeded"
        ));
    }

    #[tokio::test]
    async fn write_times_out() {
        let (requests, events, _shutdown, _worker) = start(Arc::new(NeverAnswers));
        requests.submit(TimelineRequest::ConfirmWrite {
            temp_id: TempId::from_sequence(7),
            draft: DraftPayload::new(Value::Null),
        });
        assert!(matches!(
            next_event(&events).await,
            TimelineEvent::OptimisticRolledBack { temp_id, .. } if temp_id == TempId::from_sequence(7)
        ));
    }

    #[tokio::test]
    async fn shutdown_aborts_in_flight_writes() {
        let (requests, events, shutdown, worker) = start(Arc::new(NeverAnswers));
        requests.submit(TimelineRequest::ConfirmWrite {
            temp_id: TempId::from_sequence(1),
            draft: DraftPayload::new(Value::Null),
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        shutdown.send(true).unwrap();
        worker.await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());
        assert!(!requests.submit(TimelineRequest::LoadPage { cursor: None }));
    }
}
