use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

/// Playback position published by the worker and read from any thread
#[derive(Debug, Default)]
pub struct PlaybackProgress {
    position_ms: AtomicU64,
    total_ms: AtomicU64,
    playing: AtomicBool,
    stop_requested: AtomicBool,
}

/// Point-in-time copy of [`PlaybackProgress`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub position_ms: u64,
    pub total_ms: u64,
    pub playing: bool,
}

impl PlaybackProgress {
    /// Reset for a new session and mark it playing
    pub fn begin(&self) {
        self.position_ms.store(0, Ordering::Relaxed);
        self.total_ms.store(0, Ordering::Relaxed);
        self.stop_requested.store(false, Ordering::SeqCst);
        self.playing.store(true, Ordering::SeqCst);
    }

    pub fn set_position(&self, position_ms: u64) {
        self.position_ms.store(position_ms, Ordering::Relaxed);
    }

    pub fn set_total(&self, total_ms: u64) {
        self.total_ms.store(total_ms, Ordering::Relaxed);
    }

    pub fn position_ms(&self) -> u64 {
        self.position_ms.load(Ordering::Relaxed)
    }

    pub fn total_ms(&self) -> u64 {
        self.total_ms.load(Ordering::Relaxed)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::SeqCst);
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn clear_stop(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            position_ms: self.position_ms(),
            total_ms: self.total_ms(),
            playing: self.is_playing(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_resets_session() {
        let progress = PlaybackProgress::default();
        progress.set_position(5_000);
        progress.set_total(9_000);
        progress.request_stop();

        progress.begin();
        assert_eq!(
            progress.snapshot(),
            ProgressSnapshot { position_ms: 0, total_ms: 0, playing: true }
        );
        assert!(!progress.stop_requested());
    }
}
