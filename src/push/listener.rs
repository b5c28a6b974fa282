use std::sync::Arc;

use crossbeam_channel::Sender;
use eyeball::{SharedObservable, Subscriber};
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::{Backoff, PushConnectionState, PushMessage, PushTransport, SubscribeHandshake};
use crate::{
    cursor::CursorToken,
    models::{event_bridge::EventBridge, events::EmitEvent},
    timeline::reducer::TimelineEvent,
};

/// Keeps a push subscription alive and turns its frames into [`TimelineEvent`]s.
///
/// Every (re)connection subscribes from the timeline's current head cursor, so
/// nothing created during an outage is missed.
pub struct PushListener {
    transport: Arc<dyn PushTransport>,
    auth_token: String,
    head_cursor: watch::Receiver<Option<CursorToken>>,
    update_sender: Sender<TimelineEvent>,
    event_bridge: EventBridge,
    backoff: Backoff,
    connection_state: SharedObservable<PushConnectionState>,
}

/// Why a single connection ended.
enum Disconnect {
    Dropped(String),
    Shutdown,
}

impl PushListener {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        auth_token: String,
        head_cursor: watch::Receiver<Option<CursorToken>>,
        update_sender: Sender<TimelineEvent>,
        event_bridge: EventBridge,
        backoff: Backoff,
    ) -> Self {
        Self {
            transport,
            auth_token,
            head_cursor,
            update_sender,
            event_bridge,
            backoff,
            connection_state: SharedObservable::new(PushConnectionState::Disconnected),
        }
    }

    pub fn connection_state(&self) -> Subscriber<PushConnectionState> {
        self.connection_state.subscribe()
    }

    /// Runs until `shutdown` flips to `true`, its sender is dropped, or the timeline stops listening.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            let reason = match self.connect_once(&mut shutdown).await {
                Disconnect::Shutdown => break,
                Disconnect::Dropped(reason) => reason,
            };

            warn!("Push channel dropped: {reason}");
            self.connection_state.set(PushConnectionState::Disconnected);
            if !self.forward(TimelineEvent::PushDropped(reason)) {
                break;
            }

            let delay = self.backoff.next_delay();
            debug!("Reconnecting push channel in {delay:?}");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("Push listener stopped");
        self.connection_state.set(PushConnectionState::Closed);
    }

    async fn connect_once(&mut self, shutdown: &mut watch::Receiver<bool>) -> Disconnect {
        self.connection_state.set(PushConnectionState::Connecting);
        let handshake = SubscribeHandshake {
            auth_token: self.auth_token.clone(),
            cursor: self.head_cursor.borrow().clone(),
        };
        debug!("Subscribing to push channel from {:?}", handshake.cursor);

        let subscribed = tokio::select! {
            subscribed = self.transport.subscribe(handshake) => subscribed,
            _ = shutdown.changed() => return Disconnect::Shutdown,
        };
        let mut frames = match subscribed {
            Ok(frames) => frames,
            Err(e) => return Disconnect::Dropped(format!("{e:#}")),
        };

        info!("Push channel connected");
        self.connection_state.set(PushConnectionState::Connected);
        self.backoff.reset();

        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(text)) => {
                        if !self.handle_frame(&text) {
                            return Disconnect::Shutdown;
                        }
                    }
                    Some(Err(e)) => return Disconnect::Dropped(format!("{e:#}")),
                    None => return Disconnect::Dropped("connection closed".to_owned()),
                },
                _ = shutdown.changed() => return Disconnect::Shutdown,
            }
        }
    }

    /// Returns `false` once the timeline is gone.
    fn handle_frame(&self, text: &str) -> bool {
        match PushMessage::parse(text) {
            Ok(PushMessage::NewItems(payload)) => {
                debug!("Push delivered {} items", payload.items.len());
                self.forward(TimelineEvent::PushBatch {
                    items: payload.items,
                    head_cursor: Some(payload.head_cursor),
                })
            }
            Ok(PushMessage::RemovedItems(payload)) => {
                self.forward(TimelineEvent::ItemsRemoved(payload.ids))
            }
            Ok(PushMessage::Unrecognized(kind)) => {
                trace!("Ignoring push message of type {kind}");
                true
            }
            Err(e) => {
                warn!("Discarding push frame: {e}");
                true
            }
        }
    }

    fn forward(&self, event: TimelineEvent) -> bool {
        if self.update_sender.send(event).is_err() {
            debug!("Timeline dropped, stopping push listener");
            return false;
        }
        self.event_bridge.emit(EmitEvent::TimelineUpdatesPending);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use crossbeam_channel::Receiver;
    use serde_json::json;

    use super::*;
    use crate::{
        cursor,
        push::channel::{ChannelConnection, ChannelTransport, ChannelTransportServer},
    };

    struct Harness {
        server: ChannelTransportServer,
        events: Receiver<TimelineEvent>,
        head: watch::Sender<Option<CursorToken>>,
        shutdown: watch::Sender<bool>,
        state: Subscriber<PushConnectionState>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start() -> Harness {
        let (transport, server) = ChannelTransport::new();
        let (sender, events) = crossbeam_channel::unbounded();
        let (head, head_rx) = watch::channel(None);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (bridge, _) = EventBridge::new();
        let listener = PushListener::new(
            Arc::new(transport),
            "token".into(),
            head_rx,
            sender,
            bridge,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(5), 0.0),
        );
        let state = listener.connection_state();
        let task = tokio::spawn(listener.run(shutdown_rx));
        Harness {
            server,
            events,
            head,
            shutdown,
            state,
            task,
        }
    }

    async fn accept(server: &mut ChannelTransportServer) -> ChannelConnection {
        tokio::time::timeout(Duration::from_secs(2), server.accept())
            .await
            .expect("listener should subscribe")
            .expect("transport alive")
    }

    async fn next_event(events: &Receiver<TimelineEvent>) -> TimelineEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(event) = events.try_recv() {
                    return event;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener should forward an event")
    }

    fn new_items_frame(id: &str, secs: i64) -> String {
        json!({
            "type": "new_items",
            "payload": {
                "items": [{
                    "id": id,
                    "authorRef": "bob",
                    "createdAt": Utc.timestamp_opt(secs, 0).unwrap(),
                }],
                "headCursor": cursor::encode(Utc.timestamp_opt(secs, 0).unwrap(), id),
            },
        })
        .to_string()
    }

    #[tokio::test]
    async fn forwards_batches_and_skips_bad_frames() {
        let mut harness = start();
        let connection = accept(&mut harness.server).await;
        assert_eq!(connection.handshake.auth_token, "token");
        assert_eq!(connection.handshake.cursor, None);

        assert!(connection.send("garbage"));
        assert!(connection.send(json!({ "type": "presence" }).to_string()));
        assert!(connection.send(new_items_frame("srv_1", 1)));
        assert!(connection.send(
            json!({ "type": "removed_items", "payload": { "ids": ["srv_0"] } }).to_string()
        ));

        match next_event(&harness.events).await {
            TimelineEvent::PushBatch { items, head_cursor } => {
                assert_eq!(items[0].effective_id(), "srv_1");
                assert!(head_cursor.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            next_event(&harness.events).await,
            TimelineEvent::ItemsRemoved(ids) if ids == ["srv_0"]
        ));
        assert_eq!(harness.state.get(), PushConnectionState::Connected);

        harness.shutdown.send(true).unwrap();
        harness.task.await.unwrap();
        assert_eq!(harness.state.get(), PushConnectionState::Closed);
    }

    #[tokio::test]
    async fn reconnects_from_current_head_cursor() {
        let mut harness = start();
        let first = accept(&mut harness.server).await;

        let head = cursor::encode(Utc.timestamp_opt(7, 0).unwrap(), "srv_7");
        harness.head.send(Some(head.clone())).unwrap();
        first.fail("reset by peer");

        assert!(matches!(
            next_event(&harness.events).await,
            TimelineEvent::PushDropped(reason) if reason.contains("reset by peer")
        ));

        let second = accept(&mut harness.server).await;
        assert_eq!(second.handshake.cursor, Some(head));

        drop(second);
        assert!(matches!(
            next_event(&harness.events).await,
            TimelineEvent::PushDropped(_)
        ));
        let _third = accept(&mut harness.server).await;

        harness.shutdown.send(true).unwrap();
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn stops_when_timeline_is_gone() {
        let mut harness = start();
        let connection = accept(&mut harness.server).await;
        drop(harness.events);

        connection.send(new_items_frame("srv_1", 1));
        tokio::time::timeout(Duration::from_secs(2), harness.task)
            .await
            .expect("listener should stop")
            .unwrap();
        assert_eq!(harness.state.get(), PushConnectionState::Closed);
    }
}
