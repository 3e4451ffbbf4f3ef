//! Message search as an infinite-scroll list.

use std::sync::Arc;

use async_trait::async_trait;
use shared::protocol::Message;

use crate::{
    error::ClientResult,
    pager::{PageSource, Pager},
    rpc::{ChatBackend, SearchQuery},
};

pub struct SearchSource {
    backend: Arc<dyn ChatBackend>,
    query: SearchQuery,
}

impl SearchSource {
    pub fn new(backend: Arc<dyn ChatBackend>, query: SearchQuery) -> Self {
        Self { backend, query }
    }

    pub fn query(&self) -> &SearchQuery {
        &self.query
    }
}

#[async_trait]
impl PageSource<Message> for SearchSource {
    async fn fetch_page(&self, start: u32, limit: u32) -> ClientResult<Vec<Message>> {
        self.backend.search(&self.query, start, limit).await
    }
}

/// Results for one query. A new query means a new `SearchResults`.
pub struct SearchResults {
    source: SearchSource,
    pager: Pager<Message>,
}

impl SearchResults {
    pub fn new(source: SearchSource, page_size: u32) -> Self {
        Self {
            source,
            pager: Pager::new(page_size),
        }
    }

    pub fn query(&self) -> &SearchQuery {
        self.source.query()
    }

    pub fn pager(&self) -> &Pager<Message> {
        &self.pager
    }

    pub fn results(&self) -> impl Iterator<Item = &Message> {
        self.pager.items()
    }

    pub async fn load_more(&mut self) -> ClientResult<bool> {
        self.pager.load_more(&self.source).await
    }
}

#[cfg(test)]
#[path = "tests/search_tests.rs"]
mod tests;
