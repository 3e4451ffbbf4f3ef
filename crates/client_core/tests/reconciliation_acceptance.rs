use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use client_core::{
    decoder::CHANNEL_LIST_UPDATED, message_cache::is_sorted, rpc, ChannelListCache,
    ChatSession, ClientResult, CoalescingScheduler, MessageWindow, PageSource, Pager,
    RawEnvelope, RealtimeDelta, SessionEvent, Settings,
};
use serde_json::{json, Map, Value};
use shared::{
    domain::{ChannelId, ChannelType, MessageId, MessageType, SortDirection, UserId},
    protocol::{ChannelListItem, Message, MessagePage, MessagePatch},
};
use tokio::{net::TcpListener, time::Instant};

fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap() + ChronoDuration::minutes(minute)
}

fn message(id: &str, minute: i64) -> Message {
    Message {
        name: MessageId::new(id),
        channel_id: ChannelId::new("general"),
        creation: at(minute),
        owner: UserId::new("alice"),
        text: Some(id.to_string()),
        content: Some(id.to_string()),
        message_type: MessageType::Text,
        file: None,
        is_edited: false,
        message_reactions: Vec::new(),
        liked_by: Vec::new(),
        is_retracted: false,
        extra: Map::new(),
    }
}

fn window_with(direction: SortDirection, messages: Vec<Message>) -> MessageWindow {
    let mut window = MessageWindow::new(direction, 50);
    let ticket = window.begin_initial(ChannelId::new("general"));
    assert!(window.complete(
        &ticket,
        MessagePage {
            messages,
            has_old_messages: Some(false),
            has_new_messages: Some(false),
        }
    ));
    window
}

fn created(message: Message) -> RealtimeDelta {
    RealtimeDelta::MessageCreated {
        channel_id: message.channel_id.clone(),
        message: Box::new(message),
    }
}

#[test]
fn creation_applied_twice_equals_once() {
    let mut once = window_with(SortDirection::NewestFirst, vec![message("a", 1)]);
    let mut twice = window_with(SortDirection::NewestFirst, vec![message("a", 1)]);
    let delta = created(message("b", 2));

    once.apply_delta(&delta);
    twice.apply_delta(&delta);
    twice.apply_delta(&delta);

    assert_eq!(*once.snapshot(), *twice.snapshot());
}

#[test]
fn windows_stay_sorted_in_both_directions() {
    for direction in [SortDirection::NewestFirst, SortDirection::OldestFirst] {
        let mut window = window_with(direction, vec![message("a", 5), message("b", 10)]);
        for (index, minute) in [7, 1, 12, 3, 9].into_iter().enumerate() {
            window.apply_delta(&created(message(&format!("n{index}"), minute)));
            window.apply_delta(&RealtimeDelta::MessageEdited {
                channel_id: None,
                message_id: MessageId::new("a"),
                patch: MessagePatch {
                    content: Some(format!("edit {index}")),
                    ..MessagePatch::default()
                },
            });
            assert!(is_sorted(direction, &window.snapshot()));
        }
        assert_eq!(window.len(), 7);
    }
}

#[test]
fn unknown_ids_leave_the_snapshot_untouched() {
    let mut window = window_with(SortDirection::NewestFirst, vec![message("a", 1)]);
    let before = window.snapshot();

    assert!(!window.apply_delta(&RealtimeDelta::MessageDeleted {
        channel_id: None,
        message_id: MessageId::new("nope"),
    }));
    assert!(!window.apply_delta(&RealtimeDelta::MessageRetracted {
        channel_id: None,
        message_id: MessageId::new("nope"),
        is_last_message: false,
    }));

    assert!(Arc::ptr_eq(&before, &window.snapshot()));
}

#[test]
fn deletion_removes_one_and_keeps_the_rest() {
    let mut window = window_with(
        SortDirection::OldestFirst,
        vec![message("a", 1), message("b", 2), message("c", 3)],
    );
    window.apply_delta(&RealtimeDelta::MessageDeleted {
        channel_id: None,
        message_id: MessageId::new("a"),
    });
    let remaining: Vec<String> = window
        .snapshot()
        .iter()
        .map(|m| m.name.to_string())
        .collect();
    assert_eq!(remaining, vec!["b", "c"]);
    assert!(!window.contains(&MessageId::new("a")));
}

#[test]
fn ten_events_inside_the_window_fire_one_refetch() {
    let start = Instant::now();
    let mut scheduler = CoalescingScheduler::new(Duration::from_secs(1));
    let mut fired = 0;

    for offset in 0..10u64 {
        let now = start + Duration::from_millis(offset * 90);
        scheduler.record_event(now);
        if scheduler.poll(now).is_some() {
            fired += 1;
        }
    }
    let quiet = start + Duration::from_millis(900 + 1000);
    if scheduler.poll(quiet).is_some() {
        fired += 1;
    }
    scheduler.fetch_settled(quiet);
    assert_eq!(scheduler.poll(quiet + Duration::from_secs(60)), None);
    assert_eq!(fired, 1);
}

struct SevenItems;

#[async_trait]
impl PageSource<u32> for SevenItems {
    async fn fetch_page(&self, start: u32, limit: u32) -> ClientResult<Vec<u32>> {
        Ok((start..7u32.min(start + limit)).collect())
    }
}

#[tokio::test]
async fn short_page_exhausts_pager() {
    let mut pager: Pager<u32> = Pager::new(10);
    assert!(pager.load_more(&SevenItems).await.expect("page"));
    assert!(pager.is_exhausted());
    assert!(pager.begin_load_more().is_none());
    assert!(!pager.load_more(&SevenItems).await.expect("no-op"));
    assert_eq!(pager.len(), 7);
}

#[test]
fn activity_moves_channel_to_top() {
    let item = |id: &str, minute: i64| ChannelListItem {
        name: ChannelId::new(id),
        channel_name: id.into(),
        channel_type: ChannelType::Public,
        is_archived: false,
        last_message_timestamp: Some(at(minute)),
        last_message_details: None,
        unread_count: 0,
        pinned: false,
        starred: false,
    };
    let mut cache = ChannelListCache::new();
    cache.initialize(vec![item("A", 1), item("B", 2)], Vec::new());

    cache.apply_message_activity(&ChannelId::new("A"), at(3), None);

    let order: Vec<String> = cache.snapshot().iter().map(|e| e.id.to_string()).collect();
    assert_eq!(order, vec!["A", "B"]);
    assert_eq!(cache.len(), 2);
}

#[derive(Clone, Default)]
struct ServerState {
    channel_list_calls: Arc<AtomicUsize>,
}

async fn channel_list(State(state): State<ServerState>) -> Json<Value> {
    state.channel_list_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "message": {
            "channels": [
                {"name": "general", "channel_name": "General", "type": "Public",
                 "last_message_timestamp": "2024-05-01 09:00:00"}
            ],
            "dm_channels": []
        }
    }))
}

async fn unread_counts() -> Json<Value> {
    Json(json!({"message": [{"name": "general", "unread_count": 3}]}))
}

#[tokio::test]
async fn realtime_burst_refetches_channel_list_once_over_http() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let state = ServerState::default();
    let app = Router::new()
        .route(
            &format!("/api/method/{}", rpc::GET_CHANNEL_LIST),
            get(channel_list),
        )
        .route(
            &format!("/api/method/{}", rpc::GET_UNREAD_COUNTS),
            get(unread_counts),
        )
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let settings = Settings {
        server_url: format!("http://{addr}"),
        channel_list_debounce_ms: 100,
        ..Settings::default()
    };
    let session = ChatSession::from_settings(&settings);
    let mut events = session.subscribe_events();
    let coalescer = session.spawn_coalescer();

    for _ in 0..6 {
        session
            .handle_envelope(&RawEnvelope::new(CHANNEL_LIST_UPDATED, Value::Null))
            .await;
    }
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("refetch within timeout")
            .expect("event"),
        SessionEvent::ChannelListChanged
    );
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(state.channel_list_calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.total_unread().await, 3);
    coalescer.abort();
}
