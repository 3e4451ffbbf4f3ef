//! One channel's loaded message window.

use std::{cmp::Ordering, collections::HashSet, sync::Arc};

use shared::{
    domain::{ChannelId, MessageId, SortDirection},
    protocol::{Message, MessagePage},
};
use tracing::debug;

use crate::{
    decoder::RealtimeDelta,
    rpc::{MessageCursor, MessagePageRequest},
};

pub const RETRACTED_PLACEHOLDER: &str = "This message was retracted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    Empty,
    LoadingFirstPage,
    Ready,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchEdge {
    Initial,
    Older,
    Newer,
}

/// Issued when a fetch starts; the result is only applied if the ticket still
/// matches the window when it comes back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub edge: FetchEdge,
    pub generation: u64,
    pub request: MessagePageRequest,
}

#[derive(Debug)]
pub struct MessageWindow {
    channel_id: Option<ChannelId>,
    direction: SortDirection,
    page_size: u32,
    messages: Arc<Vec<Message>>,
    phase: WindowPhase,
    has_older: bool,
    has_newer: bool,
    loading_older: bool,
    loading_newer: bool,
    generation: u64,
}

impl MessageWindow {
    pub fn new(direction: SortDirection, page_size: u32) -> Self {
        Self {
            channel_id: None,
            direction,
            page_size: page_size.max(1),
            messages: Arc::new(Vec::new()),
            phase: WindowPhase::Empty,
            has_older: false,
            has_newer: false,
            loading_older: false,
            loading_newer: false,
            generation: 0,
        }
    }

    pub fn channel_id(&self) -> Option<&ChannelId> {
        self.channel_id.as_ref()
    }

    pub fn direction(&self) -> SortDirection {
        self.direction
    }

    pub fn phase(&self) -> WindowPhase {
        self.phase
    }

    pub fn has_older(&self) -> bool {
        self.has_older
    }

    pub fn has_newer(&self) -> bool {
        self.has_newer
    }

    pub fn is_loading(&self, edge: FetchEdge) -> bool {
        match edge {
            FetchEdge::Initial => self.phase == WindowPhase::LoadingFirstPage,
            FetchEdge::Older => self.loading_older,
            FetchEdge::Newer => self.loading_newer,
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<Message>> {
        Arc::clone(&self.messages)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.position(message_id).is_some()
    }

    pub fn get(&self, message_id: &MessageId) -> Option<&Message> {
        self.position(message_id).map(|idx| &self.messages[idx])
    }

    pub fn settle(&mut self) {
        if self.phase == WindowPhase::Stale {
            self.phase = WindowPhase::Ready;
        }
    }

    /// Starts loading the latest page of `channel_id`. Switching channels drops
    /// the current window; reloading the same channel keeps it until the
    /// result arrives.
    pub fn begin_initial(&mut self, channel_id: ChannelId) -> FetchTicket {
        self.generation += 1;
        if self.channel_id.as_ref() != Some(&channel_id) {
            self.messages = Arc::new(Vec::new());
            self.has_older = false;
            self.has_newer = false;
        }
        self.channel_id = Some(channel_id.clone());
        self.loading_older = false;
        self.loading_newer = false;
        self.phase = WindowPhase::LoadingFirstPage;

        FetchTicket {
            edge: FetchEdge::Initial,
            generation: self.generation,
            request: MessagePageRequest {
                channel_id,
                cursor: MessageCursor::Latest,
                limit: self.page_size,
            },
        }
    }

    /// `None` when nothing older remains, a fetch for that edge is already in
    /// flight, or the first page has not landed yet.
    pub fn begin_older(&mut self) -> Option<FetchTicket> {
        if !self.has_older || self.loading_older || !self.is_settled_phase() {
            return None;
        }
        let oldest = self.oldest()?.name.clone();
        let channel_id = self.channel_id.clone()?;
        self.loading_older = true;
        Some(FetchTicket {
            edge: FetchEdge::Older,
            generation: self.generation,
            request: MessagePageRequest {
                channel_id,
                cursor: MessageCursor::OlderThan(oldest),
                limit: self.page_size,
            },
        })
    }

    pub fn begin_newer(&mut self) -> Option<FetchTicket> {
        if !self.has_newer || self.loading_newer || !self.is_settled_phase() {
            return None;
        }
        let newest = self.newest()?.name.clone();
        let channel_id = self.channel_id.clone()?;
        self.loading_newer = true;
        Some(FetchTicket {
            edge: FetchEdge::Newer,
            generation: self.generation,
            request: MessagePageRequest {
                channel_id,
                cursor: MessageCursor::NewerThan(newest),
                limit: self.page_size,
            },
        })
    }

    /// Applies a fetched page. Returns `false` when the ticket was superseded
    /// and the page was discarded.
    pub fn complete(&mut self, ticket: &FetchTicket, page: MessagePage) -> bool {
        if !self.is_current(ticket) {
            debug!(
                channel_id = %ticket.request.channel_id,
                edge = ?ticket.edge,
                "messages: discarding superseded page"
            );
            return false;
        }

        let fetched = page.messages.len() as u32;
        let filled = fetched >= ticket.request.limit;
        match ticket.edge {
            FetchEdge::Initial => {
                let mut seen = HashSet::new();
                let mut messages = page.messages;
                messages.retain(|message| seen.insert(message.name.clone()));
                self.sort(&mut messages);
                self.messages = Arc::new(messages);
                self.has_older = page.has_old_messages.unwrap_or(filled);
                self.has_newer = page.has_new_messages.unwrap_or(false);
                self.phase = WindowPhase::Ready;
            }
            FetchEdge::Older => {
                self.loading_older = false;
                self.has_older = page.has_old_messages.unwrap_or(filled);
                self.extend_edge(page.messages, FetchEdge::Older);
            }
            FetchEdge::Newer => {
                self.loading_newer = false;
                self.has_newer = page.has_new_messages.unwrap_or(filled);
                self.extend_edge(page.messages, FetchEdge::Newer);
            }
        }
        debug!(
            channel_id = %ticket.request.channel_id,
            edge = ?ticket.edge,
            fetched,
            window = self.messages.len(),
            has_older = self.has_older,
            has_newer = self.has_newer,
            "messages: page applied"
        );
        true
    }

    pub fn fail(&mut self, ticket: &FetchTicket) {
        if !self.is_current(ticket) {
            return;
        }
        match ticket.edge {
            FetchEdge::Initial => {
                self.phase = if self.messages.is_empty() {
                    WindowPhase::Empty
                } else {
                    WindowPhase::Ready
                };
            }
            FetchEdge::Older => self.loading_older = false,
            FetchEdge::Newer => self.loading_newer = false,
        }
    }

    /// Applies a realtime delta. Returns whether the window changed; an
    /// unchanged window keeps its snapshot pointer.
    pub fn apply_delta(&mut self, delta: &RealtimeDelta) -> bool {
        let Some(window_channel) = &self.channel_id else {
            return false;
        };
        if let Some(channel_id) = delta.channel_id() {
            if channel_id != window_channel {
                return false;
            }
        }

        let changed = match delta {
            RealtimeDelta::MessageCreated { message, .. } => self.upsert(message),
            RealtimeDelta::MessageEdited {
                message_id, patch, ..
            } => self.update(message_id, |message| message.merge(patch.clone())),
            RealtimeDelta::MessageReacted {
                message_id,
                reactions,
                ..
            } => self.update(message_id, |message| {
                if message.message_reactions == *reactions {
                    return false;
                }
                message.message_reactions = reactions.clone();
                true
            }),
            RealtimeDelta::MessageSaved {
                message_id,
                liked_by,
                ..
            } => self.update(message_id, |message| {
                if message.liked_by == *liked_by {
                    return false;
                }
                message.liked_by = liked_by.clone();
                true
            }),
            RealtimeDelta::MessageRetracted { message_id, .. } => {
                self.update(message_id, retract)
            }
            RealtimeDelta::MessageDeleted { message_id, .. } => match self.position(message_id) {
                Some(idx) => {
                    Arc::make_mut(&mut self.messages).remove(idx);
                    true
                }
                None => false,
            },
            RealtimeDelta::ChannelListUpdated => false,
        };

        if changed && self.phase == WindowPhase::Ready {
            self.phase = WindowPhase::Stale;
        }
        changed
    }

    fn upsert(&mut self, message: &Message) -> bool {
        if let Some(idx) = self.position(&message.name) {
            if self.messages[idx] == *message {
                return false;
            }
            let messages = Arc::make_mut(&mut self.messages);
            let resort = messages[idx].creation != message.creation;
            messages[idx] = message.clone();
            if resort {
                let direction = self.direction;
                messages.sort_by(|a, b| compare(direction, a, b));
            }
            return true;
        }

        if !self.covers(message) {
            debug!(
                message_id = %message.name,
                "messages: created message falls outside the loaded window"
            );
            return false;
        }

        let direction = self.direction;
        let idx = self
            .messages
            .partition_point(|existing| compare(direction, existing, message) != Ordering::Greater);
        Arc::make_mut(&mut self.messages).insert(idx, message.clone());
        true
    }

    fn update(&mut self, message_id: &MessageId, apply: impl FnOnce(&mut Message) -> bool) -> bool {
        let Some(idx) = self.position(message_id) else {
            return false;
        };
        let mut updated = self.messages[idx].clone();
        if !apply(&mut updated) {
            return false;
        }
        Arc::make_mut(&mut self.messages)[idx] = updated;
        true
    }

    /// A message belongs in the window unless it lies beyond an edge that
    /// still has unloaded pages.
    fn covers(&self, message: &Message) -> bool {
        if let Some(newest) = self.newest() {
            if self.has_newer && message.creation > newest.creation {
                return false;
            }
        }
        if let Some(oldest) = self.oldest() {
            if self.has_older && message.creation < oldest.creation {
                return false;
            }
        }
        true
    }

    fn extend_edge(&mut self, fetched: Vec<Message>, edge: FetchEdge) {
        let mut fresh: Vec<Message> = fetched
            .into_iter()
            .filter(|message| !self.contains(&message.name))
            .collect();
        if fresh.is_empty() {
            return;
        }
        self.sort(&mut fresh);

        let at_tail = matches!(
            (edge, self.direction),
            (FetchEdge::Older, SortDirection::NewestFirst)
                | (FetchEdge::Newer, SortDirection::OldestFirst)
        );
        let direction = self.direction;
        let messages = Arc::make_mut(&mut self.messages);
        if at_tail {
            messages.extend(fresh);
        } else {
            fresh.append(messages);
            *messages = fresh;
        }
        if !is_sorted(direction, messages) {
            messages.sort_by(|a, b| compare(direction, a, b));
        }
    }

    fn sort(&self, messages: &mut [Message]) {
        let direction = self.direction;
        messages.sort_by(|a, b| compare(direction, a, b));
    }

    fn position(&self, message_id: &MessageId) -> Option<usize> {
        self.messages
            .iter()
            .position(|message| &message.name == message_id)
    }

    fn oldest(&self) -> Option<&Message> {
        match self.direction {
            SortDirection::NewestFirst => self.messages.last(),
            SortDirection::OldestFirst => self.messages.first(),
        }
    }

    fn newest(&self) -> Option<&Message> {
        match self.direction {
            SortDirection::NewestFirst => self.messages.first(),
            SortDirection::OldestFirst => self.messages.last(),
        }
    }

    fn is_settled_phase(&self) -> bool {
        matches!(self.phase, WindowPhase::Ready | WindowPhase::Stale)
    }

    fn is_current(&self, ticket: &FetchTicket) -> bool {
        ticket.generation == self.generation
            && self.channel_id.as_ref() == Some(&ticket.request.channel_id)
    }
}

fn retract(message: &mut Message) -> bool {
    if message.is_retracted {
        return false;
    }
    message.is_retracted = true;
    message.text = Some(RETRACTED_PLACEHOLDER.to_string());
    message.content = Some(RETRACTED_PLACEHOLDER.to_string());
    true
}

fn compare(direction: SortDirection, a: &Message, b: &Message) -> Ordering {
    match direction {
        SortDirection::NewestFirst => b.creation.cmp(&a.creation),
        SortDirection::OldestFirst => a.creation.cmp(&b.creation),
    }
}

pub fn is_sorted(direction: SortDirection, messages: &[Message]) -> bool {
    messages
        .windows(2)
        .all(|pair| compare(direction, &pair[0], &pair[1]) != Ordering::Greater)
}

#[cfg(test)]
#[path = "tests/message_cache_tests.rs"]
mod tests;
