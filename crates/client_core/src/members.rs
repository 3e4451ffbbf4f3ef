use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{ChannelId, UserId},
    protocol::{ChannelMembersResponse, Member},
};

/// Per-channel member directories, replaced wholesale on each fetch.
#[derive(Debug, Default)]
pub struct ChannelMembers {
    by_channel: HashMap<ChannelId, Arc<HashMap<UserId, Member>>>,
}

impl ChannelMembers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_members(&mut self, channel_id: ChannelId, members: ChannelMembersResponse) -> bool {
        if self
            .by_channel
            .get(&channel_id)
            .is_some_and(|current| **current == members)
        {
            return false;
        }
        self.by_channel.insert(channel_id, Arc::new(members));
        true
    }

    pub fn members(&self, channel_id: &ChannelId) -> Option<Arc<HashMap<UserId, Member>>> {
        self.by_channel.get(channel_id).cloned()
    }

    pub fn member(&self, channel_id: &ChannelId, user_id: &UserId) -> Option<&Member> {
        self.by_channel.get(channel_id)?.get(user_id)
    }

    /// Members ordered by full name, ignoring case; ids break ties.
    pub fn sorted_members(&self, channel_id: &ChannelId) -> Vec<Member> {
        let Some(members) = self.by_channel.get(channel_id) else {
            return Vec::new();
        };
        let mut sorted: Vec<Member> = members.values().cloned().collect();
        sorted.sort_by_cached_key(|member| (member.full_name.to_lowercase(), member.name.clone()));
        sorted
    }

    pub fn invalidate(&mut self, channel_id: &ChannelId) -> bool {
        self.by_channel.remove(channel_id).is_some()
    }
}

#[cfg(test)]
#[path = "tests/members_tests.rs"]
mod tests;
