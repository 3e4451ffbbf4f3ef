use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
};

use super::*;
use crate::{
    decoder::{CHANNEL_LIST_UPDATED, MESSAGE_CREATED, MESSAGE_RETRACTED},
    error::{ClientError, ClientResult},
    rpc::{MessageCursor, MessagePageRequest, MissingChatBackend},
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::{json, Map, Value};
use shared::{
    domain::{ChannelType, MemberType, MessageId, MessageType},
    error::{ApiError, ErrorCode},
    protocol::{
        ChannelListItem, ChannelListResponse, ChannelMembersResponse, MessagePage, UnreadCount,
    },
};

fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap() + ChronoDuration::minutes(minute)
}

fn message(id: &str, channel: &str, minute: i64, owner: &str) -> Message {
    Message {
        name: MessageId::new(id),
        channel_id: ChannelId::new(channel),
        creation: at(minute),
        owner: UserId::new(owner),
        text: Some(format!("body {id}")),
        content: Some(format!("body {id}")),
        message_type: MessageType::Text,
        file: None,
        is_edited: false,
        message_reactions: Vec::new(),
        liked_by: Vec::new(),
        is_retracted: false,
        extra: Map::new(),
    }
}

fn channel(id: &str, minute: i64) -> ChannelListItem {
    ChannelListItem {
        name: ChannelId::new(id),
        channel_name: id.into(),
        channel_type: ChannelType::Public,
        is_archived: false,
        last_message_timestamp: Some(at(minute)),
        last_message_details: None,
        unread_count: 0,
        pinned: false,
        starred: false,
    }
}

fn mention(id: &str) -> Mention {
    Mention {
        name: MentionId::new(id),
        message_id: MessageId::new(format!("msg-{id}")),
        channel_id: ChannelId::new("general"),
        channel_name: None,
        creation: at(1),
        owner: UserId::new("bob"),
        text: None,
        is_read: false,
        is_hidden: false,
    }
}

#[derive(Default)]
struct FakeBackend {
    channels: StdMutex<Vec<ChannelListItem>>,
    unread: StdMutex<Vec<UnreadCount>>,
    pages: StdMutex<HashMap<ChannelId, Vec<Message>>>,
    mentions: StdMutex<Vec<Mention>>,
    members: StdMutex<ChannelMembersResponse>,
    reject_mention_flags: bool,
    channel_list_calls: AtomicUsize,
    message_requests: StdMutex<Vec<MessagePageRequest>>,
}

fn forbidden(method: &str) -> ClientError {
    ClientError::Api {
        method: method.into(),
        status: 403,
        error: ApiError::new(ErrorCode::Forbidden, "not permitted"),
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn channel_list(&self, _hide_archived: bool) -> ClientResult<ChannelListResponse> {
        self.channel_list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ChannelListResponse {
            channels: self.channels.lock().expect("channels").clone(),
            dm_channels: Vec::new(),
        })
    }

    async fn unread_counts(&self) -> ClientResult<Vec<UnreadCount>> {
        Ok(self.unread.lock().expect("unread").clone())
    }

    async fn messages(&self, request: &MessagePageRequest) -> ClientResult<MessagePage> {
        self.message_requests
            .lock()
            .expect("requests")
            .push(request.clone());
        let messages = match request.cursor {
            MessageCursor::Latest => self
                .pages
                .lock()
                .expect("pages")
                .get(&request.channel_id)
                .cloned()
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        Ok(MessagePage {
            messages,
            has_old_messages: Some(false),
            has_new_messages: Some(false),
        })
    }

    async fn mentions(&self, start: u32, limit: u32) -> ClientResult<Vec<Mention>> {
        Ok(self
            .mentions
            .lock()
            .expect("mentions")
            .iter()
            .skip(start as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn set_mention_flag(&self, _mention_id: &MentionId, _flag: MentionFlag) -> ClientResult<()> {
        if self.reject_mention_flags {
            return Err(forbidden("mentions"));
        }
        Ok(())
    }

    async fn channel_members(&self, _channel_id: &ChannelId) -> ClientResult<ChannelMembersResponse> {
        Ok(self.members.lock().expect("members").clone())
    }

    async fn search(&self, _query: &SearchQuery, _start: u32, _limit: u32) -> ClientResult<Vec<Message>> {
        Ok(Vec::new())
    }
}

fn options() -> SessionOptions {
    SessionOptions {
        current_user: Some(UserId::new("me")),
        ..SessionOptions::default()
    }
}

fn created_envelope(message: &Message) -> RawEnvelope {
    RawEnvelope::new(
        MESSAGE_CREATED,
        json!({
            "channel_id": message.channel_id,
            "message_details": message,
        }),
    )
}

fn channel_ids(entries: &[ChannelEntry]) -> Vec<&str> {
    entries.iter().map(|entry| entry.id.as_str()).collect()
}

#[tokio::test]
async fn load_channel_list_applies_unread_counts_once() {
    let backend = Arc::new(FakeBackend::default());
    *backend.channels.lock().expect("channels") = vec![channel("a", 1), channel("b", 2)];
    *backend.unread.lock().expect("unread") = vec![UnreadCount {
        name: ChannelId::new("a"),
        unread_count: 4,
    }];
    let session = ChatSession::new(backend.clone(), options());

    let entries = session.load_channel_list().await.expect("channel list");
    assert_eq!(channel_ids(&entries), vec!["b", "a"]);
    assert_eq!(session.total_unread().await, 4);

    session.load_channel_list().await.expect("cached list");
    assert_eq!(backend.channel_list_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn created_message_reaches_window_and_channel_list() {
    let backend = Arc::new(FakeBackend::default());
    *backend.channels.lock().expect("channels") = vec![channel("a", 1), channel("b", 2)];
    backend
        .pages
        .lock()
        .expect("pages")
        .insert(ChannelId::new("a"), vec![message("m1", "a", 1, "bob")]);
    let session = ChatSession::new(backend.clone(), options());
    session.load_channel_list().await.expect("channel list");
    session
        .open_channel(ChannelId::new("a"))
        .await
        .expect("open channel");
    let mut events = session.subscribe_events();

    let incoming = message("m2", "a", 3, "bob");
    session.handle_envelope(&created_envelope(&incoming)).await;
    session.handle_envelope(&created_envelope(&incoming)).await;

    let messages = session.messages().await;
    assert_eq!(
        messages.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
        vec!["m2", "m1"]
    );
    let entries = session.channels().await;
    assert_eq!(channel_ids(&entries), vec!["a", "b"]);
    assert_eq!(entries[0].unread_count, 0, "active channel stays read");
    assert_eq!(
        entries[0].last_message.as_ref().map(|s| s.message_id.as_str()),
        Some("m2")
    );
    assert_eq!(
        events.recv().await.expect("event"),
        SessionEvent::MessagesChanged {
            channel_id: ChannelId::new("a")
        }
    );
}

#[tokio::test]
async fn message_in_background_channel_counts_as_unread() {
    let backend = Arc::new(FakeBackend::default());
    *backend.channels.lock().expect("channels") = vec![channel("a", 1), channel("b", 2)];
    let session = ChatSession::new(backend, options());
    session.load_channel_list().await.expect("channel list");
    session
        .open_channel(ChannelId::new("b"))
        .await
        .expect("open channel");

    session
        .handle_envelope(&created_envelope(&message("x", "a", 5, "bob")))
        .await;
    session
        .handle_envelope(&created_envelope(&message("y", "a", 6, "me")))
        .await;

    let entries = session.channels().await;
    assert_eq!(channel_ids(&entries), vec!["a", "b"]);
    assert_eq!(entries[0].unread_count, 1, "own messages are not unread");
}

#[tokio::test]
async fn retraction_of_last_message_rewrites_summary() {
    let backend = Arc::new(FakeBackend::default());
    *backend.channels.lock().expect("channels") = vec![channel("a", 1)];
    backend
        .pages
        .lock()
        .expect("pages")
        .insert(ChannelId::new("a"), Vec::new());
    let session = ChatSession::new(backend, options());
    session.load_channel_list().await.expect("channel list");
    session
        .open_channel(ChannelId::new("a"))
        .await
        .expect("open channel");
    session
        .handle_envelope(&created_envelope(&message("m1", "a", 2, "bob")))
        .await;

    session
        .handle_envelope(&RawEnvelope::new(
            MESSAGE_RETRACTED,
            json!({"message_id": "m1", "is_last_message": 1}),
        ))
        .await;

    let entries = session.channels().await;
    assert_eq!(
        entries[0].last_message.as_ref().map(|s| s.content.as_str()),
        Some(RETRACTED_PLACEHOLDER)
    );
    let messages = session.messages().await;
    assert!(messages[0].is_retracted);
}

#[tokio::test]
async fn malformed_envelope_changes_nothing() {
    let backend = Arc::new(FakeBackend::default());
    *backend.channels.lock().expect("channels") = vec![channel("a", 1)];
    let session = ChatSession::new(backend, options());
    session.load_channel_list().await.expect("channel list");
    let before = session.channels().await;

    session
        .handle_envelope(&RawEnvelope::new(MESSAGE_CREATED, Value::String("junk".into())))
        .await;

    assert!(Arc::ptr_eq(&before, &session.channels().await));
}

#[tokio::test]
async fn rejected_mention_change_rolls_back() {
    let backend = Arc::new(FakeBackend {
        reject_mention_flags: true,
        ..FakeBackend::default()
    });
    *backend.mentions.lock().expect("mentions") = vec![mention("a"), mention("b")];
    let session = ChatSession::new(backend, options());
    assert!(session.load_more_mentions().await.expect("mentions"));
    let mut events = session.subscribe_events();

    let err = session
        .hide_mention(&MentionId::new("a"))
        .await
        .expect_err("server rejects");
    assert!(err.to_string().contains("failed to update mention a"));
    assert_eq!(session.mentions().await.len(), 2);
    assert_eq!(session.mention_unread_count().await, 2);

    assert_eq!(events.recv().await.expect("staged"), SessionEvent::MentionsChanged);
    assert_eq!(events.recv().await.expect("rolled back"), SessionEvent::MentionsChanged);
    assert!(matches!(events.recv().await.expect("banner"), SessionEvent::Error(_)));
}

#[tokio::test]
async fn confirmed_mention_read_sticks() {
    let backend = Arc::new(FakeBackend::default());
    *backend.mentions.lock().expect("mentions") = vec![mention("a")];
    let session = ChatSession::new(backend, options());
    session.load_more_mentions().await.expect("mentions");

    assert!(session
        .mark_mention_read(&MentionId::new("a"))
        .await
        .expect("mark read"));
    assert_eq!(session.mention_unread_count().await, 0);
    assert!(!session
        .mark_mention_read(&MentionId::new("a"))
        .await
        .expect("second mark is a no-op"));
}

#[tokio::test]
async fn members_are_cached_sorted() {
    let backend = Arc::new(FakeBackend::default());
    {
        let mut members = backend.members.lock().expect("members");
        for (id, name) in [("u2", "bea"), ("u1", "Abe")] {
            members.insert(
                UserId::new(id),
                Member {
                    name: UserId::new(id),
                    full_name: name.into(),
                    user_image: None,
                    member_type: MemberType::User,
                    is_admin: false,
                },
            );
        }
    }
    let session = ChatSession::new(backend, options());
    let general = ChannelId::new("general");

    let sorted = session.fetch_members(&general).await.expect("members");
    assert_eq!(
        sorted.iter().map(|m| m.full_name.as_str()).collect::<Vec<_>>(),
        vec!["Abe", "bea"]
    );
    assert_eq!(session.members(&general).await, sorted);
}

#[tokio::test(start_paused = true)]
async fn update_burst_triggers_one_refetch() {
    let backend = Arc::new(FakeBackend::default());
    *backend.channels.lock().expect("channels") = vec![channel("a", 1)];
    let session = ChatSession::new(backend.clone(), options());
    let coalescer = session.spawn_coalescer();

    for _ in 0..5 {
        session
            .handle_envelope(&RawEnvelope::new(CHANNEL_LIST_UPDATED, Value::Null))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(backend.channel_list_calls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(backend.channel_list_calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.channels().await.len(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(backend.channel_list_calls.load(Ordering::SeqCst), 1);
    coalescer.abort();
}

#[tokio::test]
async fn failed_page_load_reports_banner_and_keeps_window() {
    struct OfflineBackend;

    #[async_trait]
    impl ChatBackend for OfflineBackend {
        async fn channel_list(&self, _hide_archived: bool) -> ClientResult<ChannelListResponse> {
            Err(ClientError::Realtime("offline".into()))
        }
        async fn unread_counts(&self) -> ClientResult<Vec<UnreadCount>> {
            Ok(Vec::new())
        }
        async fn messages(&self, _request: &MessagePageRequest) -> ClientResult<MessagePage> {
            Err(ClientError::Realtime("offline".into()))
        }
        async fn mentions(&self, _start: u32, _limit: u32) -> ClientResult<Vec<Mention>> {
            Ok(Vec::new())
        }
        async fn set_mention_flag(&self, _id: &MentionId, _flag: MentionFlag) -> ClientResult<()> {
            Ok(())
        }
        async fn channel_members(&self, _id: &ChannelId) -> ClientResult<ChannelMembersResponse> {
            Ok(ChannelMembersResponse::new())
        }
        async fn search(&self, _q: &SearchQuery, _s: u32, _l: u32) -> ClientResult<Vec<Message>> {
            Ok(Vec::new())
        }
    }

    let session = ChatSession::new(Arc::new(OfflineBackend), options());
    let mut events = session.subscribe_events();

    assert!(session.open_channel(ChannelId::new("a")).await.is_err());
    assert!(session.messages().await.is_empty());
    assert_eq!(
        events.recv().await.expect("opened"),
        SessionEvent::MessagesChanged {
            channel_id: ChannelId::new("a")
        }
    );
    assert!(matches!(events.recv().await.expect("banner"), SessionEvent::Error(_)));
    assert!(session.load_channel_list().await.is_err());
}

#[tokio::test]
async fn redelivered_or_older_creation_does_not_count_again() {
    let backend = Arc::new(FakeBackend::default());
    *backend.channels.lock().expect("channels") = vec![channel("a", 1), channel("b", 2)];
    let session = ChatSession::new(backend, options());
    session.load_channel_list().await.expect("channel list");
    session
        .open_channel(ChannelId::new("b"))
        .await
        .expect("open channel");

    let fresh = message("x", "a", 5, "bob");
    session.handle_envelope(&created_envelope(&fresh)).await;
    let after_once = session.channels().await;
    session.handle_envelope(&created_envelope(&fresh)).await;
    session
        .handle_envelope(&created_envelope(&message("old", "a", 2, "bob")))
        .await;

    assert_eq!(session.total_unread().await, 1);
    assert!(Arc::ptr_eq(&after_once, &session.channels().await));
}

#[tokio::test]
async fn refresh_mentions_starts_from_the_first_page() {
    let backend = Arc::new(FakeBackend::default());
    *backend.mentions.lock().expect("mentions") = vec![mention("a")];
    let session = ChatSession::new(backend.clone(), options());
    assert!(session.load_more_mentions().await.expect("first page"));
    assert!(!session.load_more_mentions().await.expect("exhausted"));

    backend.mentions.lock().expect("mentions").push(mention("b"));
    assert!(session.refresh_mentions().await.expect("refresh"));

    let ids: Vec<String> = session
        .mentions()
        .await
        .iter()
        .map(|m| m.name.to_string())
        .collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn slower_earlier_listing_never_overwrites_a_newer_one() {
    struct SlowFirstBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatBackend for SlowFirstBackend {
        async fn channel_list(&self, _hide_archived: bool) -> ClientResult<ChannelListResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let (delay, id) = if call == 0 { (500, "stale") } else { (10, "fresh") };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(ChannelListResponse {
                channels: vec![channel(id, 1)],
                dm_channels: Vec::new(),
            })
        }
        async fn unread_counts(&self) -> ClientResult<Vec<UnreadCount>> {
            Ok(Vec::new())
        }
        async fn messages(&self, request: &MessagePageRequest) -> ClientResult<MessagePage> {
            MissingChatBackend.messages(request).await
        }
        async fn mentions(&self, start: u32, limit: u32) -> ClientResult<Vec<Mention>> {
            MissingChatBackend.mentions(start, limit).await
        }
        async fn set_mention_flag(&self, id: &MentionId, flag: MentionFlag) -> ClientResult<()> {
            MissingChatBackend.set_mention_flag(id, flag).await
        }
        async fn channel_members(&self, id: &ChannelId) -> ClientResult<ChannelMembersResponse> {
            MissingChatBackend.channel_members(id).await
        }
        async fn search(&self, q: &SearchQuery, s: u32, l: u32) -> ClientResult<Vec<Message>> {
            MissingChatBackend.search(q, s, l).await
        }
    }

    let session = ChatSession::new(
        Arc::new(SlowFirstBackend {
            calls: AtomicUsize::new(0),
        }),
        options(),
    );

    let (first, second) = tokio::join!(
        session.refetch_channel_list(),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            session.refetch_channel_list().await
        }
    );
    first.expect("first listing");
    second.expect("second listing");

    assert_eq!(channel_ids(&session.channels().await), vec!["fresh"]);
}
