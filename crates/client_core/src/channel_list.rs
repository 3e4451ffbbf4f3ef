//! Channels and DM channels, most recently active first.

use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChannelId, ChannelType, UserId},
    protocol::{ChannelListItem, DmChannelListItem, LastMessageSummary, UnreadCount},
};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Channel(ChannelType),
    Direct { peer_user_id: UserId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEntry {
    pub id: ChannelId,
    pub display_name: String,
    pub kind: ChannelKind,
    pub archived: bool,
    pub last_message_timestamp: Option<DateTime<Utc>>,
    pub last_message: Option<LastMessageSummary>,
    pub unread_count: u32,
    pub pinned: bool,
    pub starred: bool,
}

impl ChannelEntry {
    pub fn is_direct(&self) -> bool {
        matches!(self.kind, ChannelKind::Direct { .. })
    }

    /// Sort key; a channel without messages counts as active at the epoch.
    fn activity(&self) -> DateTime<Utc> {
        self.last_message_timestamp.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl From<ChannelListItem> for ChannelEntry {
    fn from(item: ChannelListItem) -> Self {
        Self {
            id: item.name,
            display_name: item.channel_name,
            kind: ChannelKind::Channel(item.channel_type),
            archived: item.is_archived,
            last_message_timestamp: item.last_message_timestamp,
            last_message: item.last_message_details,
            unread_count: item.unread_count,
            pinned: item.pinned,
            starred: item.starred,
        }
    }
}

impl From<DmChannelListItem> for ChannelEntry {
    fn from(item: DmChannelListItem) -> Self {
        Self {
            display_name: item
                .full_name
                .unwrap_or_else(|| item.peer_user_id.to_string()),
            id: item.name,
            kind: ChannelKind::Direct {
                peer_user_id: item.peer_user_id,
            },
            archived: item.is_archived,
            last_message_timestamp: item.last_message_timestamp,
            last_message: item.last_message_details,
            unread_count: item.unread_count,
            pinned: item.pinned,
            starred: item.starred,
        }
    }
}

/// Issue order of a full listing fetch. Only a listing newer than the last
/// one applied may replace the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RefreshTicket(u64);

#[derive(Debug, Default)]
pub struct ChannelListCache {
    entries: Arc<Vec<ChannelEntry>>,
    initialized: bool,
    issued_refreshes: u64,
    applied_refresh: u64,
}

impl ChannelListCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Replaces the snapshot with an authoritative server listing. An id that
    /// appears as both channel and DM keeps only the DM representation.
    pub fn initialize(&mut self, channels: Vec<ChannelListItem>, dm_channels: Vec<DmChannelListItem>) {
        let dm_ids: HashSet<ChannelId> = dm_channels.iter().map(|dm| dm.name.clone()).collect();
        let mut entries: Vec<ChannelEntry> = Vec::with_capacity(channels.len() + dm_channels.len());
        for channel in channels {
            if dm_ids.contains(&channel.name) {
                warn!(channel_id = %channel.name, "channels: id listed as channel and DM; keeping DM");
                continue;
            }
            entries.push(channel.into());
        }
        entries.extend(dm_channels.into_iter().map(ChannelEntry::from));

        let mut seen = HashSet::new();
        entries.retain(|entry| seen.insert(entry.id.clone()));
        // Stable: ties keep server order.
        entries.sort_by(|a, b| b.activity().cmp(&a.activity()));

        debug!(count = entries.len(), "channels: snapshot replaced");
        self.entries = Arc::new(entries);
        self.initialized = true;
    }

    pub fn begin_refresh(&mut self) -> RefreshTicket {
        self.issued_refreshes += 1;
        RefreshTicket(self.issued_refreshes)
    }

    /// Applies a listing fetched under `ticket`. A listing issued before the
    /// one already applied is discarded and `false` returned.
    pub fn complete_refresh(
        &mut self,
        ticket: RefreshTicket,
        channels: Vec<ChannelListItem>,
        dm_channels: Vec<DmChannelListItem>,
    ) -> bool {
        if ticket.0 <= self.applied_refresh {
            debug!(
                ticket = ticket.0,
                applied = self.applied_refresh,
                "channels: discarding superseded listing"
            );
            return false;
        }
        self.applied_refresh = ticket.0;
        self.initialize(channels, dm_channels);
        true
    }

    pub fn snapshot(&self) -> Arc<Vec<ChannelEntry>> {
        Arc::clone(&self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, channel_id: &ChannelId) -> Option<&ChannelEntry> {
        self.entries.iter().find(|entry| &entry.id == channel_id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelEntry> {
        self.entries.iter().filter(|entry| !entry.is_direct())
    }

    pub fn dm_channels(&self) -> impl Iterator<Item = &ChannelEntry> {
        self.entries.iter().filter(|entry| entry.is_direct())
    }

    pub fn total_unread(&self) -> u32 {
        self.entries.iter().map(|entry| entry.unread_count).sum()
    }

    /// Records a new message in `channel_id` and moves only that entry to its
    /// new position. Unknown channels and older timestamps change nothing.
    pub fn apply_message_activity(
        &mut self,
        channel_id: &ChannelId,
        timestamp: DateTime<Utc>,
        summary: Option<LastMessageSummary>,
    ) -> bool {
        let Some(idx) = self.position(channel_id) else {
            debug!(%channel_id, "channels: activity for unknown channel");
            return false;
        };
        let current = &self.entries[idx];
        if current.last_message_timestamp.is_some_and(|existing| existing > timestamp) {
            debug!(%channel_id, "channels: ignoring out-of-order activity");
            return false;
        }
        let summary_changes = summary.is_some() && current.last_message != summary;
        if current.last_message_timestamp == Some(timestamp) && !summary_changes {
            return false;
        }

        let entries = Arc::make_mut(&mut self.entries);
        let mut entry = entries.remove(idx);
        entry.last_message_timestamp = Some(timestamp);
        if summary.is_some() {
            entry.last_message = summary;
        }
        let activity = entry.activity();
        let insert_at = entries.partition_point(|other| other.activity() > activity);
        entries.insert(insert_at, entry);
        true
    }

    pub fn update_last_message_summary(
        &mut self,
        channel_id: &ChannelId,
        apply: impl FnOnce(&mut LastMessageSummary),
    ) -> bool {
        let Some(idx) = self.position(channel_id) else {
            return false;
        };
        let Some(mut summary) = self.entries[idx].last_message.clone() else {
            return false;
        };
        apply(&mut summary);
        if self.entries[idx].last_message.as_ref() == Some(&summary) {
            return false;
        }
        Arc::make_mut(&mut self.entries)[idx].last_message = Some(summary);
        true
    }

    pub fn apply_unread_counts(&mut self, counts: &[UnreadCount]) -> bool {
        let mut changed = false;
        for count in counts {
            changed |= self.set_unread(&count.name, count.unread_count);
        }
        changed
    }

    pub fn increment_unread(&mut self, channel_id: &ChannelId) -> bool {
        match self.get(channel_id).map(|entry| entry.unread_count) {
            Some(current) => self.set_unread(channel_id, current.saturating_add(1)),
            None => false,
        }
    }

    pub fn mark_read(&mut self, channel_id: &ChannelId) -> bool {
        self.set_unread(channel_id, 0)
    }

    fn set_unread(&mut self, channel_id: &ChannelId, unread: u32) -> bool {
        let Some(idx) = self.position(channel_id) else {
            return false;
        };
        if self.entries[idx].unread_count == unread {
            return false;
        }
        Arc::make_mut(&mut self.entries)[idx].unread_count = unread;
        true
    }

    fn position(&self, channel_id: &ChannelId) -> Option<usize> {
        self.entries.iter().position(|entry| &entry.id == channel_id)
    }
}

#[cfg(test)]
#[path = "tests/channel_list_tests.rs"]
mod tests;
