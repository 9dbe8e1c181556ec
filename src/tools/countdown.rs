//! Countdown timer with pause/resume
//!
//! The remaining time is derived from a deadline, so pausing and resuming
//! never drifts. A worker thread refreshes the countdown page once per tick
//! and announces the end; every display change is scheduled.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::{object_schema, ToolError, ToolRegistry};
use crate::device::{ChatRole, Services, Sound};
use crate::orchestrator::Scheduler;

const MAX_MINUTES: u64 = 24 * 60;
const DEFAULT_MINUTES: u64 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CountdownState {
    Idle,
    Counting,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CountdownStatus {
    pub state: CountdownState,
    pub remaining_secs: u64,
    pub total_secs: u64,
}

impl CountdownStatus {
    pub fn describe(&self) -> String {
        match self.state {
            CountdownState::Idle => "No countdown running".to_string(),
            CountdownState::Counting => format!("Counting down, {} left", format_mm_ss(self.remaining_secs)),
            CountdownState::Paused => format!("Paused, {} left", format_mm_ss(self.remaining_secs)),
        }
    }
}

/// `MM:SS`; minutes grow past two digits for long countdowns
pub fn format_mm_ss(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

struct Inner {
    state: CountdownState,
    total: Duration,
    /// Time left while paused
    remaining: Duration,
    /// End of the countdown while counting
    deadline: Instant,
    /// Bumped on every start/stop so old workers exit
    generation: u64,
}

impl Inner {
    fn remaining_at(&self, now: Instant) -> Duration {
        match self.state {
            CountdownState::Idle => Duration::ZERO,
            CountdownState::Counting => self.deadline.saturating_duration_since(now),
            CountdownState::Paused => self.remaining,
        }
    }
}

pub struct CountdownTimer {
    inner: Mutex<Inner>,
    wake: Condvar,
    tick: Duration,
    services: Services,
    scheduler: Scheduler,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CountdownTimer {
    pub fn new(services: Services, scheduler: Scheduler, tick: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CountdownState::Idle,
                total: Duration::ZERO,
                remaining: Duration::ZERO,
                deadline: Instant::now(),
                generation: 0,
            }),
            wake: Condvar::new(),
            tick,
            services,
            scheduler,
            worker: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a fresh countdown, replacing a running one
    pub fn start(self: &Arc<Self>, duration: Duration) -> Result<(), ToolError> {
        self.stop();

        let generation = {
            let mut inner = self.lock();
            inner.generation += 1;
            inner.state = CountdownState::Counting;
            inner.total = duration;
            inner.remaining = duration;
            inner.deadline = Instant::now() + duration;
            inner.generation
        };

        let timer = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("countdown".into())
            .spawn(move || timer.run(generation))
            .map_err(|e| {
                self.lock().state = CountdownState::Idle;
                ToolError::Failed(format!("could not start countdown: {e}"))
            })?;
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(secs = duration.as_secs(), "countdown started");
        Ok(())
    }

    /// Cancel the countdown; returns whether one was active
    pub fn stop(&self) -> bool {
        let was_active = {
            let mut inner = self.lock();
            let was_active = inner.state != CountdownState::Idle;
            inner.generation += 1;
            inner.state = CountdownState::Idle;
            inner.remaining = Duration::ZERO;
            inner.total = Duration::ZERO;
            was_active
        };
        self.wake.notify_all();

        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("countdown worker panicked");
            }
        }
        if was_active {
            info!("countdown stopped");
            self.publish(Duration::ZERO, false);
        }
        was_active
    }

    /// Pause a running countdown or resume a paused one
    pub fn toggle_pause(&self) -> CountdownState {
        let (state, remaining) = {
            let mut inner = self.lock();
            let now = Instant::now();
            match inner.state {
                CountdownState::Counting => {
                    inner.remaining = inner.deadline.saturating_duration_since(now);
                    inner.state = CountdownState::Paused;
                }
                CountdownState::Paused => {
                    inner.deadline = now + inner.remaining;
                    inner.state = CountdownState::Counting;
                }
                CountdownState::Idle => {}
            }
            (inner.state, inner.remaining_at(now))
        };
        self.wake.notify_all();

        if state != CountdownState::Idle {
            info!(?state, "countdown toggled");
            self.publish(remaining, state == CountdownState::Counting);
        }
        state
    }

    pub fn status(&self) -> CountdownStatus {
        let inner = self.lock();
        CountdownStatus {
            state: inner.state,
            remaining_secs: ceil_secs(inner.remaining_at(Instant::now())),
            total_secs: inner.total.as_secs(),
        }
    }

    fn run(&self, generation: u64) {
        let mut inner = self.lock();
        loop {
            if inner.generation != generation {
                return;
            }
            match inner.state {
                CountdownState::Idle => return,
                CountdownState::Paused => {
                    inner = self.wake.wait(inner).unwrap_or_else(PoisonError::into_inner);
                }
                CountdownState::Counting => {
                    let remaining = inner.deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        inner.state = CountdownState::Idle;
                        inner.total = Duration::ZERO;
                        drop(inner);
                        self.announce_finished();
                        return;
                    }
                    self.publish(remaining, true);
                    let wait = self.tick.min(remaining);
                    inner = self
                        .wake
                        .wait_timeout(inner, wait)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    fn publish(&self, remaining: Duration, running: bool) {
        let display = Arc::clone(&self.services.display);
        let text = format_mm_ss(ceil_secs(remaining));
        self.scheduler.schedule(move || display.set_countdown(&text, running));
    }

    fn announce_finished(&self) {
        info!("countdown finished");
        let services = self.services.clone();
        self.scheduler.schedule(move || {
            services.display.set_countdown(&format_mm_ss(0), false);
            services
                .display
                .set_chat_message(ChatRole::System, "Time's up! Countdown finished");
            services.display.show_notification("Countdown finished", Duration::from_secs(3));
            services.audio.play_sound(Sound::Vibration);
        });
    }
}

pub(super) fn register(registry: &mut ToolRegistry, timer: Arc<CountdownTimer>) {
    let t = Arc::clone(&timer);
    registry.add(
        "self.countdown.start",
        "Start a countdown timer shown on the countdown page.\n\
         Args:\n  `minutes`: length in minutes (default 25)",
        object_schema(
            json!({"minutes": {"type": "integer", "minimum": 1, "maximum": MAX_MINUTES, "default": DEFAULT_MINUTES}}),
            &[],
        ),
        move |args| {
            let minutes = args.opt_u64("minutes")?.unwrap_or(DEFAULT_MINUTES);
            if !(1..=MAX_MINUTES).contains(&minutes) {
                return Err(ToolError::InvalidArgument {
                    name: "minutes",
                    reason: format!("must be between 1 and {MAX_MINUTES}"),
                });
            }
            t.start(Duration::from_secs(minutes * 60))?;
            Ok(format!("Countdown started: {minutes} minutes"))
        },
    );

    let t = Arc::clone(&timer);
    registry.add(
        "self.countdown.stop",
        "Stop the countdown timer",
        object_schema(json!({}), &[]),
        move |_| {
            Ok(if t.stop() {
                "Countdown stopped".to_string()
            } else {
                "No countdown running".to_string()
            })
        },
    );

    let t = Arc::clone(&timer);
    registry.add(
        "self.countdown.pause",
        "Pause the countdown, or resume it when paused",
        object_schema(json!({}), &[]),
        move |_| {
            let status = match t.toggle_pause() {
                CountdownState::Idle => return Ok("No countdown running".to_string()),
                _ => t.status(),
            };
            Ok(status.describe())
        },
    );

    registry.add(
        "self.countdown.status",
        "Report the countdown state and remaining time",
        object_schema(json!({}), &[]),
        move |_| Ok(timer.status().describe()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fakes;

    fn timer(fakes: &Fakes, tick: Duration) -> Arc<CountdownTimer> {
        Arc::new(CountdownTimer::new(fakes.services(), fakes.scheduler.clone(), tick))
    }

    fn wait_for_idle(timer: &CountdownTimer) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while timer.status().state != CountdownState::Idle {
            assert!(Instant::now() < deadline, "countdown never finished");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_format_mm_ss() {
        assert_eq!(format_mm_ss(0), "00:00");
        assert_eq!(format_mm_ss(65), "01:05");
        assert_eq!(format_mm_ss(25 * 60), "25:00");
        assert_eq!(format_mm_ss(120 * 60), "120:00");
    }

    #[test]
    fn test_countdown_runs_to_completion() {
        let fakes = Fakes::new();
        let t = timer(&fakes, Duration::from_millis(10));

        t.start(Duration::from_millis(50)).unwrap();
        assert_eq!(t.status().state, CountdownState::Counting);
        wait_for_idle(&t);

        fakes.scheduler.run_pending();
        let calls = fakes.display.calls();
        assert!(calls.contains(&"countdown:00:01:true".to_string()));
        assert_eq!(
            calls.iter().filter(|c| c.as_str() == "countdown:00:00:false").count(),
            1
        );
        assert!(fakes.audio.log.contains("sound:Vibration"));
    }

    #[test]
    fn test_pause_freezes_remaining_time() {
        let fakes = Fakes::new();
        let t = timer(&fakes, Duration::from_millis(10));

        t.start(Duration::from_secs(90)).unwrap();
        assert_eq!(t.toggle_pause(), CountdownState::Paused);
        let frozen = t.status();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(t.status(), frozen);
        assert_eq!(frozen.remaining_secs, 90);
        assert_eq!(frozen.describe(), "Paused, 01:30 left");

        assert_eq!(t.toggle_pause(), CountdownState::Counting);
        assert!(t.stop());
        assert!(!t.stop());
        assert_eq!(t.status().state, CountdownState::Idle);
    }

    #[test]
    fn test_restart_replaces_running_countdown() {
        let fakes = Fakes::new();
        let t = timer(&fakes, Duration::from_millis(10));

        t.start(Duration::from_secs(600)).unwrap();
        t.start(Duration::from_secs(120)).unwrap();
        let status = t.status();
        assert_eq!(status.total_secs, 120);
        assert!(status.remaining_secs <= 120);
        t.stop();
    }

    #[test]
    fn test_tools_validate_minutes() {
        let fakes = Fakes::new();
        let mut registry = ToolRegistry::new();
        register(&mut registry, timer(&fakes, Duration::from_millis(10)));

        assert!(registry.call("self.countdown.start", &json!({"minutes": 0})).is_err());
        assert_eq!(
            registry.call("self.countdown.status", &json!({})).unwrap(),
            "No countdown running"
        );
        assert_eq!(
            registry.call("self.countdown.start", &json!({"minutes": 5})).unwrap(),
            "Countdown started: 5 minutes"
        );
        assert_eq!(
            registry.call("self.countdown.pause", &json!({})).unwrap(),
            "Paused, 05:00 left"
        );
        assert_eq!(registry.call("self.countdown.stop", &json!({})).unwrap(), "Countdown stopped");
    }
}
