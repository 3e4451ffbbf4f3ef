//! Mentions inbox: paged server data plus optimistic read/hide changes.

use std::collections::HashMap;

use shared::{domain::MentionId, protocol::Mention};
use tracing::debug;

use crate::{
    pager::{PageRequest, Pager},
    rpc::MentionFlag,
};

/// Authoritative mention pages with a pending-change overlay on top. The
/// overlay is never written into the pages until the server confirms it.
#[derive(Debug)]
pub struct MentionFeed {
    pager: Pager<Mention>,
    overlay: HashMap<MentionId, MentionFlag>,
}

impl MentionFeed {
    pub fn new(page_size: u32) -> Self {
        Self {
            pager: Pager::new(page_size),
            overlay: HashMap::new(),
        }
    }

    pub fn pager(&self) -> &Pager<Mention> {
        &self.pager
    }

    pub fn begin_load_more(&mut self) -> Option<PageRequest> {
        self.pager.begin_load_more()
    }

    pub fn complete(&mut self, request: &PageRequest, mentions: Vec<Mention>) -> bool {
        self.pager.complete(request, mentions)
    }

    pub fn fail(&mut self, request: &PageRequest) {
        self.pager.fail(request);
    }

    pub fn reset(&mut self) {
        self.pager.reset();
    }

    pub fn pending(&self, mention_id: &MentionId) -> Option<MentionFlag> {
        self.overlay.get(mention_id).copied()
    }

    pub fn view(&self) -> Vec<Mention> {
        self.pager
            .items()
            .filter_map(|mention| {
                let mut mention = mention.clone();
                if let Some(flag) = self.overlay.get(&mention.name) {
                    apply_flag(&mut mention, *flag);
                }
                (!mention.is_hidden).then_some(mention)
            })
            .collect()
    }

    pub fn unread_count(&self) -> usize {
        self.view().iter().filter(|mention| !mention.is_read).count()
    }

    pub fn mark_read(&mut self, mention_id: &MentionId) -> bool {
        let Some(current) = self.effective(mention_id) else {
            return false;
        };
        if current.is_read || current.is_hidden {
            return false;
        }
        self.overlay.insert(mention_id.clone(), MentionFlag::Read);
        true
    }

    pub fn hide(&mut self, mention_id: &MentionId) -> bool {
        let Some(current) = self.effective(mention_id) else {
            return false;
        };
        if current.is_hidden {
            return false;
        }
        self.overlay.insert(mention_id.clone(), MentionFlag::Hidden);
        true
    }

    pub fn confirm(&mut self, mention_id: &MentionId, flag: MentionFlag) {
        if let Some(mention) = self
            .pager
            .items_mut()
            .find(|mention| &mention.name == mention_id)
        {
            apply_flag(mention, flag);
        }
        self.clear_overlay(mention_id, flag);
    }

    /// Drops a change the server rejected. Authoritative data is untouched.
    pub fn rollback(&mut self, mention_id: &MentionId, flag: MentionFlag) {
        debug!(%mention_id, ?flag, "mentions: rolling back pending change");
        self.clear_overlay(mention_id, flag);
    }

    fn clear_overlay(&mut self, mention_id: &MentionId, flag: MentionFlag) {
        // A newer staged change for the same mention stays in place.
        if self.overlay.get(mention_id) == Some(&flag) {
            self.overlay.remove(mention_id);
        }
    }

    fn effective(&self, mention_id: &MentionId) -> Option<Mention> {
        let mut mention = self
            .pager
            .items()
            .find(|mention| &mention.name == mention_id)?
            .clone();
        if let Some(flag) = self.overlay.get(mention_id) {
            apply_flag(&mut mention, *flag);
        }
        Some(mention)
    }
}

fn apply_flag(mention: &mut Mention, flag: MentionFlag) {
    match flag {
        MentionFlag::Read => mention.is_read = true,
        MentionFlag::Hidden => mention.is_hidden = true,
    }
}

#[cfg(test)]
#[path = "tests/mentions_tests.rs"]
mod tests;
