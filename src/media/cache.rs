//! Anti-replay guard and bounded progress cache

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Rejects restarting the URL that just finished within a cooldown window
///
/// Breaks loops where an agent re-issues the same play command right after
/// receiving the completion notification.
pub struct AntiReplayGuard {
    window: Duration,
    last: Mutex<Option<(String, Instant)>>,
}

impl AntiReplayGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(None),
        }
    }

    /// `Err(elapsed)` when `url` finished less than the window before `now`
    pub fn check(&self, url: &str, now: Instant) -> Result<(), Duration> {
        let last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match last.as_ref() {
            Some((last_url, finished_at)) if last_url == url => {
                let elapsed = now.saturating_duration_since(*finished_at);
                if elapsed < self.window {
                    Err(elapsed)
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Remember that `url` stopped playing at `now`
    pub fn record(&self, url: &str, now: Instant) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some((url.to_string(), now));
    }
}

/// Last known position of a previously played URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedProgress {
    pub title: String,
    pub position_ms: u64,
    pub total_ms: u64,
}

/// URL → progress map with FIFO eviction
///
/// When full, inserting a new URL drops the oldest inserted entry.
/// Updating a URL that is already cached keeps its slot.
#[derive(Debug)]
pub struct ProgressCache {
    capacity: usize,
    entries: VecDeque<(String, CachedProgress)>,
}

impl ProgressCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Insert or update; returns the evicted URL, if any
    pub fn insert(&mut self, url: &str, progress: CachedProgress) -> Option<String> {
        if let Some((_, existing)) = self.entries.iter_mut().find(|(u, _)| u == url) {
            *existing = progress;
            return None;
        }
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front().map(|(u, _)| u)
        } else {
            None
        };
        self.entries.push_back((url.to_string(), progress));
        evicted
    }

    pub fn get(&self, url: &str) -> Option<&CachedProgress> {
        self.entries.iter().find(|(u, _)| u == url).map(|(_, p)| p)
    }

    /// Entries from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CachedProgress)> {
        self.entries.iter().map(|(u, p)| (u.as_str(), p))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
