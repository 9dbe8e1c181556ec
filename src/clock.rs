//! Housekeeping clock raising `ClockTick` once per period
//!
//! Runs on a dedicated thread. Ticks are plain flag raises, so a slow
//! orchestrator sees several missed ticks as one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::events::{EventFlag, EventFlagSet};

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("clock already running")]
    AlreadyRunning,

    #[error("failed to spawn clock thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}

pub struct ClockTimer {
    events: Arc<EventFlagSet>,
    period: Duration,
    running: Arc<AtomicBool>,
    // Signalled on stop so the thread does not sleep out its period
    wake: Arc<(Mutex<()>, Condvar)>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ClockTimer {
    pub fn new(events: Arc<EventFlagSet>, period: Duration) -> Self {
        Self {
            events,
            period,
            running: Arc::new(AtomicBool::new(false)),
            wake: Arc::new((Mutex::new(()), Condvar::new())),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<(), ClockError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ClockError::AlreadyRunning);
        }

        let events = Arc::clone(&self.events);
        let running = Arc::clone(&self.running);
        let wake = Arc::clone(&self.wake);
        let period = self.period;

        let handle = thread::Builder::new()
            .name("clock".to_string())
            .spawn(move || {
                info!(period_ms = period.as_millis() as u64, "clock thread started");
                let (lock, cvar) = &*wake;
                let mut guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
                while running.load(Ordering::SeqCst) {
                    let (next, timeout) = cvar
                        .wait_timeout(guard, period)
                        .unwrap_or_else(PoisonError::into_inner);
                    guard = next;
                    if timeout.timed_out() && running.load(Ordering::SeqCst) {
                        events.raise(EventFlag::ClockTick);
                    }
                }
                debug!("clock thread stopped");
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                ClockError::ThreadSpawn(e)
            })?;

        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Stop ticking and wait for the thread to exit
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let (lock, cvar) = &*self.wake;
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            cvar.notify_all();
        }
        if let Some(handle) = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_until_stopped() {
        let events = Arc::new(EventFlagSet::new());
        let clock = ClockTimer::new(Arc::clone(&events), Duration::from_millis(5));
        clock.start().unwrap();
        assert!(matches!(clock.start(), Err(ClockError::AlreadyRunning)));

        let flags = events.wait_timeout(Duration::from_secs(2));
        assert!(flags.contains(EventFlag::ClockTick));

        clock.stop();
        assert!(!clock.is_running());
        events.wait_timeout(Duration::ZERO);
        assert!(events.wait_timeout(Duration::from_millis(30)).is_empty());
    }
}
