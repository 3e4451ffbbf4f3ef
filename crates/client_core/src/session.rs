use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use shared::{
    domain::{ChannelId, MentionId, SortDirection, UserId},
    protocol::{LastMessageSummary, Member, Mention, Message},
};
use tokio::{
    sync::{broadcast, watch, Mutex, Notify},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    channel_list::{ChannelEntry, ChannelListCache},
    config::Settings,
    decoder::{self, RawEnvelope, RealtimeDelta},
    members::ChannelMembers,
    mentions::MentionFeed,
    message_cache::{FetchTicket, MessageWindow, RETRACTED_PLACEHOLDER},
    rpc::{ChatBackend, HttpChatBackend, MentionFlag, SearchQuery},
    scheduler::CoalescingScheduler,
    search::{SearchResults, SearchSource},
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ChannelListChanged,
    MessagesChanged { channel_id: ChannelId },
    MentionsChanged,
    MembersChanged { channel_id: ChannelId },
    Error(String),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub current_user: Option<UserId>,
    pub hide_archived: bool,
    pub direction: SortDirection,
    pub message_page_size: u32,
    pub mentions_page_size: u32,
    pub search_page_size: u32,
    pub channel_list_debounce: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SessionOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            current_user: settings.current_user(),
            hide_archived: settings.hide_archived,
            direction: SortDirection::NewestFirst,
            message_page_size: settings.message_page_size,
            mentions_page_size: settings.mentions_page_size,
            search_page_size: settings.search_page_size,
            channel_list_debounce: settings.channel_list_debounce(),
        }
    }
}

/// Owns every cache for one signed-in user and routes realtime deltas and RPC
/// results into them.
pub struct ChatSession {
    backend: Arc<dyn ChatBackend>,
    options: SessionOptions,
    inner: Mutex<SessionState>,
    coalescer_wake: Notify,
    events: broadcast::Sender<SessionEvent>,
    active_channel: watch::Sender<Option<ChannelId>>,
}

struct SessionState {
    channels: ChannelListCache,
    window: MessageWindow,
    scheduler: CoalescingScheduler,
    mentions: MentionFeed,
    members: ChannelMembers,
}

impl ChatSession {
    pub fn new(backend: Arc<dyn ChatBackend>, options: SessionOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (active_channel, _) = watch::channel(None);
        Arc::new(Self {
            inner: Mutex::new(SessionState {
                channels: ChannelListCache::new(),
                window: MessageWindow::new(options.direction, options.message_page_size),
                scheduler: CoalescingScheduler::new(options.channel_list_debounce),
                mentions: MentionFeed::new(options.mentions_page_size),
                members: ChannelMembers::new(),
            }),
            backend,
            options,
            coalescer_wake: Notify::new(),
            events,
            active_channel,
        })
    }

    pub fn from_settings(settings: &Settings) -> Arc<Self> {
        Self::new(
            Arc::new(HttpChatBackend::from_settings(settings)),
            SessionOptions::from(settings),
        )
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn watch_active_channel(&self) -> watch::Receiver<Option<ChannelId>> {
        self.active_channel.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn emit_error(&self, message: String) {
        warn!("session: {message}");
        self.emit(SessionEvent::Error(message));
    }

    pub async fn channels(&self) -> Arc<Vec<ChannelEntry>> {
        self.inner.lock().await.channels.snapshot()
    }

    pub async fn total_unread(&self) -> u32 {
        self.inner.lock().await.channels.total_unread()
    }

    pub async fn load_channel_list(&self) -> Result<Arc<Vec<ChannelEntry>>> {
        {
            let guard = self.inner.lock().await;
            if guard.channels.is_initialized() {
                return Ok(guard.channels.snapshot());
            }
        }
        self.refetch_channel_list().await?;
        Ok(self.channels().await)
    }

    /// Explicit reload. Update events that land meanwhile are served by one
    /// debounced refetch afterwards.
    pub async fn refetch_channel_list(&self) -> Result<()> {
        {
            let mut guard = self.inner.lock().await;
            guard.scheduler.fetch_started();
        }
        let result = self.fetch_channel_list().await;
        {
            let mut guard = self.inner.lock().await;
            guard.scheduler.fetch_settled(Instant::now());
        }
        self.coalescer_wake.notify_one();
        result
    }

    async fn fetch_channel_list(&self) -> Result<()> {
        let ticket = { self.inner.lock().await.channels.begin_refresh() };
        let listing = match self.backend.channel_list(self.options.hide_archived).await {
            Ok(listing) => listing,
            Err(err) => {
                self.emit_error(format!("failed to load channel list: {err}"));
                return Err(err).context("failed to load channel list");
            }
        };
        let unread = match self.backend.unread_counts().await {
            Ok(counts) => counts,
            Err(err) => {
                warn!("channels: unread counts unavailable: {err}");
                Vec::new()
            }
        };
        let applied = {
            let mut guard = self.inner.lock().await;
            let applied = guard.channels.complete_refresh(
                ticket,
                listing.channels,
                listing.dm_channels,
            );
            if applied {
                guard.channels.apply_unread_counts(&unread);
                info!(
                    channels = guard.channels.len(),
                    unread = guard.channels.total_unread(),
                    "channels: list refreshed"
                );
            }
            applied
        };
        if applied {
            self.emit(SessionEvent::ChannelListChanged);
        }
        Ok(())
    }

    /// Starts the task that turns bursts of `channel_list_updated` into one
    /// refetch. Abort the handle to stop it.
    pub fn spawn_coalescer(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let deadline = { session.inner.lock().await.scheduler.deadline() };
                match deadline {
                    Some(deadline) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline) => {}
                            _ = session.coalescer_wake.notified() => continue,
                        }
                    }
                    None => {
                        session.coalescer_wake.notified().await;
                        continue;
                    }
                }

                let due = { session.inner.lock().await.scheduler.poll(Instant::now()) };
                let Some(absorbed) = due else {
                    continue;
                };
                info!(absorbed, "channels: refetching after update events");
                // Failures are already reported; retries belong to the RPC client.
                let _ = session.fetch_channel_list().await;
                {
                    let mut guard = session.inner.lock().await;
                    guard.scheduler.fetch_settled(Instant::now());
                }
            }
        })
    }

    pub async fn open_channel(&self, channel_id: ChannelId) -> Result<Arc<Vec<Message>>> {
        let (ticket, unread_cleared) = {
            let mut guard = self.inner.lock().await;
            let ticket = guard.window.begin_initial(channel_id.clone());
            (ticket, guard.channels.mark_read(&channel_id))
        };
        self.active_channel.send_replace(Some(channel_id.clone()));
        if unread_cleared {
            self.emit(SessionEvent::ChannelListChanged);
        }
        self.emit(SessionEvent::MessagesChanged {
            channel_id: channel_id.clone(),
        });
        self.run_message_fetch(ticket).await?;
        Ok(self.messages().await)
    }

    /// Loads one page beyond the oldest loaded message. `false` when there is
    /// nothing to load or a load is already running.
    pub async fn load_older(&self) -> Result<bool> {
        let ticket = { self.inner.lock().await.window.begin_older() };
        match ticket {
            Some(ticket) => self.run_message_fetch(ticket).await,
            None => Ok(false),
        }
    }

    pub async fn load_newer(&self) -> Result<bool> {
        let ticket = { self.inner.lock().await.window.begin_newer() };
        match ticket {
            Some(ticket) => self.run_message_fetch(ticket).await,
            None => Ok(false),
        }
    }

    async fn run_message_fetch(&self, ticket: FetchTicket) -> Result<bool> {
        let channel_id = ticket.request.channel_id.clone();
        let page = match self.backend.messages(&ticket.request).await {
            Ok(page) => page,
            Err(err) => {
                self.inner.lock().await.window.fail(&ticket);
                self.emit_error(format!("failed to load messages for {channel_id}: {err}"));
                return Err(err)
                    .with_context(|| format!("failed to load messages for {channel_id}"));
            }
        };

        let applied = { self.inner.lock().await.window.complete(&ticket, page) };
        if applied {
            self.emit(SessionEvent::MessagesChanged { channel_id });
        }
        Ok(applied)
    }

    pub async fn messages(&self) -> Arc<Vec<Message>> {
        let mut guard = self.inner.lock().await;
        guard.window.settle();
        guard.window.snapshot()
    }

    pub async fn active_channel(&self) -> Option<ChannelId> {
        self.inner.lock().await.window.channel_id().cloned()
    }

    pub async fn handle_envelope(&self, envelope: &RawEnvelope) {
        if let Some(delta) = decoder::decode(envelope) {
            self.apply_delta(delta).await;
        }
    }

    pub async fn apply_delta(&self, delta: RealtimeDelta) {
        match &delta {
            RealtimeDelta::ChannelListUpdated => {
                {
                    let mut guard = self.inner.lock().await;
                    guard.scheduler.record_event(Instant::now());
                }
                self.coalescer_wake.notify_one();
            }
            RealtimeDelta::MessageCreated {
                channel_id,
                message,
            } => {
                let (window_changed, list_changed) = {
                    let mut guard = self.inner.lock().await;
                    let window_changed = guard.window.apply_delta(&delta);
                    let previous_last = guard
                        .channels
                        .get(channel_id)
                        .and_then(|entry| entry.last_message.as_ref())
                        .map(|summary| summary.message_id.clone());
                    let mut list_changed = guard.channels.apply_message_activity(
                        channel_id,
                        message.creation,
                        Some(LastMessageSummary::from_message(message)),
                    );
                    // Re-deliveries and out-of-order creations leave the
                    // activity untouched and must not count again.
                    let is_new_last =
                        list_changed && previous_last.as_ref() != Some(&message.name);
                    let from_other_user =
                        self.options.current_user.as_ref() != Some(&message.owner);
                    let is_active = guard.window.channel_id() == Some(channel_id);
                    if is_new_last && from_other_user && !is_active {
                        list_changed |= guard.channels.increment_unread(channel_id);
                    }
                    (window_changed, list_changed)
                };
                if window_changed {
                    self.emit(SessionEvent::MessagesChanged {
                        channel_id: channel_id.clone(),
                    });
                }
                if list_changed {
                    self.emit(SessionEvent::ChannelListChanged);
                }
            }
            RealtimeDelta::MessageRetracted {
                channel_id,
                message_id,
                is_last_message,
            } => {
                let (window_channel, list_changed) = {
                    let mut guard = self.inner.lock().await;
                    let owning_channel = channel_id.clone().or_else(|| {
                        guard
                            .window
                            .contains(message_id)
                            .then(|| guard.window.channel_id().cloned())
                            .flatten()
                    });
                    let window_changed = guard.window.apply_delta(&delta);
                    let list_changed = match (&owning_channel, is_last_message) {
                        (Some(owner), true) => {
                            guard.channels.update_last_message_summary(owner, |summary| {
                                summary.content = RETRACTED_PLACEHOLDER.to_string();
                            })
                        }
                        _ => false,
                    };
                    let window_channel = window_changed
                        .then(|| guard.window.channel_id().cloned())
                        .flatten();
                    (window_channel, list_changed)
                };
                if let Some(channel_id) = window_channel {
                    self.emit(SessionEvent::MessagesChanged { channel_id });
                }
                if list_changed {
                    self.emit(SessionEvent::ChannelListChanged);
                }
            }
            _ => {
                let changed_channel = {
                    let mut guard = self.inner.lock().await;
                    guard
                        .window
                        .apply_delta(&delta)
                        .then(|| guard.window.channel_id().cloned())
                        .flatten()
                };
                match changed_channel {
                    Some(channel_id) => self.emit(SessionEvent::MessagesChanged { channel_id }),
                    None => debug!(message_id = ?delta.message_id(), "session: delta left caches unchanged"),
                }
            }
        }
    }

    pub async fn load_more_mentions(&self) -> Result<bool> {
        let Some(request) = ({ self.inner.lock().await.mentions.begin_load_more() }) else {
            return Ok(false);
        };
        match self.backend.mentions(request.start, request.limit).await {
            Ok(mentions) => {
                let applied = { self.inner.lock().await.mentions.complete(&request, mentions) };
                if applied {
                    self.emit(SessionEvent::MentionsChanged);
                }
                Ok(applied)
            }
            Err(err) => {
                self.inner.lock().await.mentions.fail(&request);
                self.emit_error(format!("failed to load mentions: {err}"));
                Err(err).context("failed to load mentions")
            }
        }
    }

    /// Drops the loaded pages and fetches the first one again. Pending
    /// read/hide changes stay staged.
    pub async fn refresh_mentions(&self) -> Result<bool> {
        self.inner.lock().await.mentions.reset();
        self.load_more_mentions().await
    }

    pub async fn mentions(&self) -> Vec<Mention> {
        self.inner.lock().await.mentions.view()
    }

    pub async fn mention_unread_count(&self) -> usize {
        self.inner.lock().await.mentions.unread_count()
    }

    pub async fn mark_mention_read(&self, mention_id: &MentionId) -> Result<bool> {
        self.change_mention(mention_id, MentionFlag::Read).await
    }

    pub async fn hide_mention(&self, mention_id: &MentionId) -> Result<bool> {
        self.change_mention(mention_id, MentionFlag::Hidden).await
    }

    /// Shows the change right away, then confirms or rolls it back once the
    /// server answers.
    async fn change_mention(&self, mention_id: &MentionId, flag: MentionFlag) -> Result<bool> {
        let staged = {
            let mut guard = self.inner.lock().await;
            match flag {
                MentionFlag::Read => guard.mentions.mark_read(mention_id),
                MentionFlag::Hidden => guard.mentions.hide(mention_id),
            }
        };
        if !staged {
            return Ok(false);
        }
        self.emit(SessionEvent::MentionsChanged);

        let result = self.backend.set_mention_flag(mention_id, flag).await;
        {
            let mut guard = self.inner.lock().await;
            match &result {
                Ok(()) => guard.mentions.confirm(mention_id, flag),
                Err(_) => guard.mentions.rollback(mention_id, flag),
            }
        }
        self.emit(SessionEvent::MentionsChanged);
        match result {
            Ok(()) => Ok(true),
            Err(err) => {
                self.emit_error(format!("failed to update mention {mention_id}: {err}"));
                Err(err).with_context(|| format!("failed to update mention {mention_id}"))
            }
        }
    }

    pub async fn fetch_members(&self, channel_id: &ChannelId) -> Result<Vec<Member>> {
        let members = match self.backend.channel_members(channel_id).await {
            Ok(members) => members,
            Err(err) => {
                self.emit_error(format!("failed to load members of {channel_id}: {err}"));
                return Err(err).with_context(|| format!("failed to load members of {channel_id}"));
            }
        };
        let (changed, sorted) = {
            let mut guard = self.inner.lock().await;
            let changed = guard.members.set_members(channel_id.clone(), members);
            (changed, guard.members.sorted_members(channel_id))
        };
        if changed {
            self.emit(SessionEvent::MembersChanged {
                channel_id: channel_id.clone(),
            });
        }
        Ok(sorted)
    }

    pub async fn members(&self, channel_id: &ChannelId) -> Vec<Member> {
        self.inner.lock().await.members.sorted_members(channel_id)
    }

    pub fn search(&self, query: SearchQuery) -> SearchResults {
        SearchResults::new(
            SearchSource::new(Arc::clone(&self.backend), query),
            self.options.search_page_size,
        )
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
