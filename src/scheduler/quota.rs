//! Rolling-window quota for expedited starts.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;

use crate::core::clock;

/// Default number of expedited starts per window.
pub const DEFAULT_EXPEDITED_PER_WINDOW: usize = 4;

/// Default quota window.
pub const DEFAULT_EXPEDITED_WINDOW: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub(crate) struct ExpeditedQuota {
    max_per_window: usize,
    window: Duration,
    starts: VecDeque<DateTime<Utc>>,
}

impl ExpeditedQuota {
    pub(crate) fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            starts: VecDeque::new(),
        }
    }

    /// Expedited starts still available at `now`.
    pub(crate) fn remaining(&mut self, now: DateTime<Utc>) -> usize {
        let horizon = clock::sub(now, self.window);
        while self.starts.front().is_some_and(|t| *t <= horizon) {
            self.starts.pop_front();
        }
        self.max_per_window.saturating_sub(self.starts.len())
    }

    pub(crate) fn record(&mut self, now: DateTime<Utc>) {
        self.starts.push_back(now);
    }
}
