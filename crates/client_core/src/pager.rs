//! Offset pagination for infinite-scroll lists (mentions, search results).

use async_trait::async_trait;
use tracing::debug;

use crate::error::ClientResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub index: u32,
    pub start: u32,
    pub limit: u32,
    generation: u64,
}

#[async_trait]
pub trait PageSource<T: Send>: Send + Sync {
    async fn fetch_page(&self, start: u32, limit: u32) -> ClientResult<Vec<T>>;
}

#[derive(Debug, Clone)]
pub struct Pager<T> {
    page_size: u32,
    pages: Vec<Vec<T>>,
    in_flight: Option<PageRequest>,
    generation: u64,
}

impl<T> Pager<T> {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size: page_size.max(1),
            pages: Vec::new(),
            in_flight: None,
            generation: 0,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.first().is_some_and(Vec::is_empty)
    }

    pub fn is_loading_more(&self) -> bool {
        self.in_flight.is_some()
    }

    /// A full page is never terminal; only a short page ends the list.
    pub fn is_exhausted(&self) -> bool {
        self.is_empty()
            || self
                .pages
                .last()
                .is_some_and(|page| page.len() < self.page_size as usize)
    }

    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.pages.iter().flatten()
    }

    pub fn items_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.pages.iter_mut().flatten()
    }

    pub fn len(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }

    pub fn begin_load_more(&mut self) -> Option<PageRequest> {
        if self.is_exhausted() || self.is_loading_more() {
            return None;
        }
        let index = self.pages.len() as u32;
        let request = PageRequest {
            index,
            start: index.saturating_mul(self.page_size),
            limit: self.page_size,
            generation: self.generation,
        };
        self.in_flight = Some(request);
        Some(request)
    }

    /// Stores the page for `request`. Results for a request that is no longer
    /// in flight are dropped.
    pub fn complete(&mut self, request: &PageRequest, items: Vec<T>) -> bool {
        if self.in_flight.as_ref() != Some(request) {
            debug!(index = request.index, "pager: dropping superseded page");
            return false;
        }
        self.in_flight = None;
        self.pages.push(items);
        true
    }

    pub fn fail(&mut self, request: &PageRequest) {
        if self.in_flight.as_ref() == Some(request) {
            self.in_flight = None;
        }
    }

    pub fn reset(&mut self) {
        self.generation += 1;
        self.pages.clear();
        self.in_flight = None;
    }

    /// Fetches the next page from `source` when one is due. Returns whether a
    /// page was appended.
    pub async fn load_more<S>(&mut self, source: &S) -> ClientResult<bool>
    where
        S: PageSource<T> + ?Sized,
        T: Send,
    {
        let Some(request) = self.begin_load_more() else {
            return Ok(false);
        };
        match source.fetch_page(request.start, request.limit).await {
            Ok(items) => Ok(self.complete(&request, items)),
            Err(err) => {
                self.fail(&request);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/pager_tests.rs"]
mod tests;
