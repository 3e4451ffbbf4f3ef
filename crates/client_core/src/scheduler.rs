//! Debounced refetch trigger for `channel_list_updated` bursts.
//!
//! The scheduler holds no timers of its own. A driver task asks for the
//! current [`CoalescingScheduler::deadline`], sleeps until it, then calls
//! [`CoalescingScheduler::poll`]. Keeping the clock outside makes every
//! transition a plain synchronous call.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct CoalescingScheduler {
    window: Duration,
    pending: u32,
    deadline: Option<Instant>,
    fetches_in_flight: u32,
}

impl Default for CoalescingScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_COALESCE_WINDOW)
    }
}

impl CoalescingScheduler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: 0,
            deadline: None,
            fetches_in_flight: 0,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn pending(&self) -> u32 {
        self.pending
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_fetch_in_flight(&self) -> bool {
        self.fetches_in_flight > 0
    }

    /// While no fetch runs, every event pushes the deadline out to
    /// `now + window`.
    pub fn record_event(&mut self, now: Instant) {
        self.pending = self.pending.saturating_add(1);
        if !self.is_fetch_in_flight() {
            self.deadline = Some(now + self.window);
        }
        debug!(pending = self.pending, "channels: update event coalesced");
    }

    /// Fires once the deadline has passed. Returns how many events the
    /// refetch absorbs, resets the counter and marks the fetch in flight.
    pub fn poll(&mut self, now: Instant) -> Option<u32> {
        match self.deadline {
            Some(deadline) if deadline <= now && !self.is_fetch_in_flight() => {
                let absorbed = std::mem::take(&mut self.pending);
                self.deadline = None;
                self.fetches_in_flight += 1;
                debug!(absorbed, "channels: coalesced refetch due");
                Some(absorbed)
            }
            _ => None,
        }
    }

    /// Marks a refetch started outside the debounce path, such as an explicit
    /// reload. Pending events keep counting and are served after every
    /// running fetch settles.
    pub fn fetch_started(&mut self) {
        self.fetches_in_flight = self.fetches_in_flight.saturating_add(1);
        self.deadline = None;
    }

    /// Events that arrived meanwhile arm a fresh deadline once the last
    /// running fetch settles. A failure is not retried from here.
    pub fn fetch_settled(&mut self, now: Instant) {
        self.fetches_in_flight = self.fetches_in_flight.saturating_sub(1);
        if self.fetches_in_flight == 0 && self.pending > 0 {
            self.deadline = Some(now + self.window);
        }
    }
}

#[cfg(test)]
#[path = "tests/scheduler_tests.rs"]
mod tests;
