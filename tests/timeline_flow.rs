use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};
use timeline_sync::{
    DraftPayload, Item, LibConfig, PushConnectionState, StateUpdater, StateUpdaterFunctions,
    Timeline, TimelineError, TimelineState, cursor,
    models::{events::EmitEvent, settings::TimelineSettings},
    push::channel::{ChannelConnection, ChannelTransport, ChannelTransportServer},
    sources::{
        SourceFetcher,
        memory::{InMemorySource, InMemoryWriter},
    },
};
use tokio::sync::broadcast;

#[derive(Debug, Default)]
struct Recorded {
    timeline_updates: usize,
    connection_states: Vec<PushConnectionState>,
}

#[derive(Debug, Clone, Default)]
struct Recorder(Arc<Mutex<Recorded>>);

impl StateUpdaterFunctions for Recorder {
    fn update_timeline(&self, _state: &TimelineState) -> anyhow::Result<()> {
        self.0.lock().unwrap().timeline_updates += 1;
        Ok(())
    }

    fn update_push_connection(&self, state: PushConnectionState) -> anyhow::Result<()> {
        self.0.lock().unwrap().connection_states.push(state);
        Ok(())
    }
}

impl StateUpdater for Recorder {}

struct Harness {
    timeline: Timeline,
    events: broadcast::Receiver<EmitEvent>,
    server: ChannelTransportServer,
    text: Arc<InMemorySource>,
    writer: Arc<InMemoryWriter>,
    recorder: Recorder,
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn item(id: &str, secs: i64) -> Item {
    Item::confirmed(id, "author", json!({ "title": id }), at(secs))
}

fn ids(state: &TimelineState) -> Vec<&str> {
    state.items().iter().map(Item::effective_id).collect()
}

fn start() -> Harness {
    start_with(TimelineSettings::default())
}

/// Text items on even seconds 100..=86, media items on odd seconds 99..=85.
fn start_with(settings: TimelineSettings) -> Harness {
    let text = Arc::new(InMemorySource::new(
        "text",
        (0..8).map(|k| item(&format!("t{}", 100 - 2 * k), 100 - 2 * k)).collect(),
    ));
    let media = (0..8).map(|k| item(&format!("m{}", 99 - 2 * k), 99 - 2 * k)).collect();
    let sources: Vec<Arc<dyn SourceFetcher>> = vec![
        text.clone(),
        Arc::new(InMemorySource::new("media", media)),
    ];
    let writer = Arc::new(InMemoryWriter::new("me", 42));
    let (transport, server) = ChannelTransport::new();
    let recorder = Recorder::default();
    let settings = TimelineSettings {
        page_limit: 5,
        write_timeout_ms: 1_000,
        reconnect_base_delay_ms: 1,
        reconnect_max_delay_ms: 10,
        reconnect_jitter: 0.0,
        ..settings
    };

    let (timeline, events) = timeline_sync::init(LibConfig::new(
        Box::new(recorder.clone()),
        sources,
        writer.clone(),
        Arc::new(transport),
        "token".into(),
        "viewer".into(),
        "me".into(),
        settings,
    ))
    .unwrap();

    Harness {
        timeline,
        events,
        server,
        text,
        writer,
        recorder,
    }
}

/// Applies background updates until `done` holds.
async fn pump(timeline: &mut Timeline, done: impl Fn(&TimelineState) -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            timeline.process_timeline_updates();
            if done(timeline.state()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timeline should reach the expected state");
}

async fn accept(server: &mut ChannelTransportServer) -> ChannelConnection {
    tokio::time::timeout(Duration::from_secs(2), server.accept())
        .await
        .expect("listener should subscribe")
        .expect("transport alive")
}

fn new_items_frame(items: &[Item]) -> String {
    let head = items
        .iter()
        .filter_map(Item::cursor)
        .reduce(|a, b| if a.is_older_than(&b) { b } else { a });
    json!({
        "type": "new_items",
        "payload": {
            "items": items,
            "headCursor": head.map(|c| c.encode()),
        },
    })
    .to_string()
}

#[tokio::test]
async fn pages_through_both_sources() {
    let mut h = start();

    assert!(h.timeline.load_next_page());
    assert!(h.timeline.state().loading());
    // A second request while one is loading is skipped.
    assert!(!h.timeline.load_next_page());
    pump(&mut h.timeline, |s| !s.loading()).await;

    let state = h.timeline.state();
    assert_eq!(
        ids(state),
        ["t100", "m99", "t98", "m97", "t96", "m95", "t94", "m93", "t92", "m91"]
    );
    assert!(state.has_more());
    assert_eq!(
        cursor::decode(state.next_cursor().unwrap()).unwrap(),
        timeline_sync::Cursor::new(at(91), "m91")
    );

    assert!(h.timeline.load_next_page());
    pump(&mut h.timeline, |s| !s.loading()).await;

    let state = h.timeline.state();
    assert_eq!(state.items().len(), 16);
    assert_eq!(ids(state)[10..], ["t90", "m89", "t88", "m87", "t86", "m85"]);
    assert!(!state.has_more());
    assert!(!h.timeline.load_next_page());
    assert!(h.recorder.0.lock().unwrap().timeline_updates > 0);
}

#[tokio::test]
async fn push_is_buffered_away_from_top_and_flushed_on_return() {
    let mut h = start();
    let connection = accept(&mut h.server).await;
    h.timeline.load_next_page();
    pump(&mut h.timeline, |s| !s.loading()).await;
    let loaded = h.timeline.state().items().len();

    h.timeline.update_scroll_offset(800.0);
    assert!(!h.timeline.state().is_near_top());

    let fresh = [item("p200", 200), item("p201", 201), item("p202", 202)];
    assert!(connection.send(new_items_frame(&fresh)));
    pump(&mut h.timeline, |s| s.pending_count() == 3).await;
    assert_eq!(h.timeline.state().items().len(), loaded);

    h.timeline.update_scroll_offset(0.0);
    let state = h.timeline.state();
    assert_eq!(state.pending_count(), 0);
    assert_eq!(state.items().len(), loaded + 3);
    assert_eq!(ids(state)[..3], ["p202", "p201", "p200"]);
    assert_eq!(
        cursor::decode(state.head_cursor().unwrap()).unwrap(),
        timeline_sync::Cursor::new(at(202), "p202")
    );
}

#[tokio::test]
async fn optimistic_write_is_reconciled_and_its_echo_ignored() {
    let mut h = start();
    let connection = accept(&mut h.server).await;
    h.timeline.load_next_page();
    pump(&mut h.timeline, |s| !s.loading()).await;
    let loaded = h.timeline.state().items().len();

    let temp_id = h
        .timeline
        .create_local(DraftPayload::new(json!({ "content": "hi" })))
        .unwrap();
    assert_eq!(temp_id.as_str(), "optimistic_1");
    assert_eq!(h.timeline.state().items()[0].effective_id(), "optimistic_1");
    assert!(h.timeline.state().items()[0].is_optimistic());

    pump(&mut h.timeline, |s| s.items()[0].effective_id() == "srv_42").await;
    let confirmed = h.timeline.state().items()[0].clone();
    assert!(!confirmed.is_optimistic());
    assert_eq!(confirmed.payload, json!({ "content": "hi" }));
    assert_eq!(h.timeline.state().items().len(), loaded + 1);

    // The push channel re-broadcasts the author's own item, then something new.
    connection.send(new_items_frame(std::slice::from_ref(&confirmed)));
    connection.send(new_items_frame(&[item("later", 4_000_000_000)]));
    pump(&mut h.timeline, |s| s.items()[0].effective_id() == "later").await;

    let state = h.timeline.state();
    assert_eq!(state.items().len(), loaded + 2);
    assert_eq!(ids(state).iter().filter(|id| **id == "srv_42").count(), 1);
    assert!(!ids(state).contains(&"optimistic_1"));
}

#[tokio::test]
async fn rejected_write_rolls_back_with_an_error() {
    let mut h = start();
    h.writer.set_rejection(Some("quota exceeded".into()));

    let temp_id = h.timeline.create_local(DraftPayload::new(Value::Null)).unwrap();
    assert_eq!(h.timeline.state().items().len(), 1);
    pump(&mut h.timeline, |s| s.error().is_some()).await;

    let state = h.timeline.state();
    assert!(state.items().is_empty());
    assert_eq!(
        state.error(),
        Some(&TimelineError::OptimisticWriteFailed {
            temp_id: temp_id.to_string(),
            reason: "quota exceeded".into(),
        })
    );

    let toast = loop {
        match h.events.try_recv() {
            Ok(EmitEvent::ToastNotification(toast)) => break toast,
            Ok(EmitEvent::TimelineUpdatesPending) => continue,
            Err(e) => panic!("expected a toast, got {e:?}"),
        }
    };
    assert!(toast.message().contains("quota exceeded"));

    h.timeline.clear_error();
    assert!(h.timeline.state().error().is_none());
}

#[tokio::test]
async fn reconnect_resubscribes_from_head_cursor() {
    let mut h = start();
    let first = accept(&mut h.server).await;
    assert_eq!(first.handshake.auth_token, "token");

    h.timeline.load_next_page();
    pump(&mut h.timeline, |s| !s.loading()).await;
    let head = h.timeline.state().head_cursor().cloned();
    assert!(head.is_some());

    first.fail("connection reset");
    let second = accept(&mut h.server).await;
    assert_eq!(second.handshake.cursor, head);

    pump(&mut h.timeline, |s| {
        matches!(s.error(), Some(TimelineError::PushChannelDropped(_)))
    })
    .await;
    // Items survive the outage.
    assert_eq!(h.timeline.state().items().len(), 10);

    second.send(new_items_frame(&[item("after", 300)]));
    pump(&mut h.timeline, |s| s.items()[0].effective_id() == "after").await;
    assert_eq!(h.timeline.push_connection_state(), PushConnectionState::Connected);

    // The adapter sees the latest connection state.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let last = h.recorder.0.lock().unwrap().connection_states.last().copied();
            if last == Some(PushConnectionState::Connected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("adapter should be told about the connection");
}

#[tokio::test]
async fn teardown_turns_later_events_into_no_ops() {
    let mut h = start();
    let connection = accept(&mut h.server).await;
    h.timeline.load_next_page();
    pump(&mut h.timeline, |s| !s.loading()).await;
    h.writer.set_rejection(Some("too late".into()));
    h.timeline.create_local(DraftPayload::new(Value::Null));
    let before = ids(h.timeline.state())
        .into_iter()
        .map(str::to_owned)
        .collect::<Vec<_>>();

    h.timeline.teardown();
    assert!(h.timeline.is_torn_down());

    connection.send(new_items_frame(&[item("ghost", 500)]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.timeline.process_timeline_updates();
    h.timeline.update_scroll_offset(900.0);

    assert_eq!(ids(h.timeline.state()), before);
    assert!(h.timeline.state().error().is_none());
    assert!(!h.timeline.load_next_page());
    assert!(h.timeline.create_local(DraftPayload::new(Value::Null)).is_none());

    tokio::time::timeout(Duration::from_secs(2), async {
        while h.timeline.push_connection_state() != PushConnectionState::Closed {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("push listener should close");
}

#[tokio::test]
async fn next_page_is_prefetched_and_served_from_cache() {
    let mut h = start_with(TimelineSettings {
        prefetch_next_page: true,
        ..Default::default()
    });
    h.timeline.load_next_page();
    pump(&mut h.timeline, |s| !s.loading()).await;

    // First page, then the prefetch of the second one.
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.text.fetch_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("second page should be prefetched");

    h.timeline.load_next_page();
    pump(&mut h.timeline, |s| !s.loading()).await;
    assert_eq!(h.timeline.state().items().len(), 16);
    assert_eq!(h.text.fetch_count(), 2);
}

#[tokio::test]
async fn failing_source_surfaces_error_and_keeps_has_more() {
    let mut h = start();
    h.text.set_failure(Some("text index offline".into()));

    h.timeline.load_next_page();
    pump(&mut h.timeline, |s| !s.loading()).await;

    let state = h.timeline.state();
    assert!(state.items().is_empty());
    assert!(state.has_more());
    assert!(matches!(
        state.error(),
        Some(TimelineError::FetchFailed { source_name, .. }) if source_name == "text"
    ));

    // Retrying is up to the caller.
    h.text.set_failure(None);
    h.timeline.clear_error();
    h.timeline.load_next_page();
    pump(&mut h.timeline, |s| !s.loading()).await;
    assert_eq!(h.timeline.state().items().len(), 10);
    assert!(h.timeline.state().error().is_none());
}
