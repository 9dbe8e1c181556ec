//! Device state machine
//!
//! Holds the single authoritative [`DeviceState`]. Any thread may request
//! a transition and any thread may read the current state without locking.
//!
//! Listeners run synchronously on the thread that requested the
//! transition, which is frequently NOT the orchestrator thread. A listener
//! must do nothing beyond raising a flag or pushing into a non-blocking
//! channel; UI and audio side effects belong in the orchestrator's
//! `StateChanged` handler.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Every state the device can be in; exactly one is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DeviceState {
    Unknown,
    Starting,
    WifiConfiguring,
    Activating,
    Upgrading,
    Idle,
    Connecting,
    Listening,
    Speaking,
    AudioTesting,
    FatalError,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl DeviceState {
    const ALL: [DeviceState; 11] = [
        DeviceState::Unknown,
        DeviceState::Starting,
        DeviceState::WifiConfiguring,
        DeviceState::Activating,
        DeviceState::Upgrading,
        DeviceState::Idle,
        DeviceState::Connecting,
        DeviceState::Listening,
        DeviceState::Speaking,
        DeviceState::AudioTesting,
        DeviceState::FatalError,
    ];

    fn from_u8(raw: u8) -> Self {
        Self::ALL
            .get(usize::from(raw))
            .copied()
            .unwrap_or(DeviceState::Unknown)
    }

    /// True while a voice conversation holds (or is opening) the channel
    pub fn is_in_session(self) -> bool {
        matches!(
            self,
            DeviceState::Connecting | DeviceState::Listening | DeviceState::Speaking
        )
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceState::Unknown => "unknown",
            DeviceState::Starting => "starting",
            DeviceState::WifiConfiguring => "wifi_configuring",
            DeviceState::Activating => "activating",
            DeviceState::Upgrading => "upgrading",
            DeviceState::Idle => "idle",
            DeviceState::Connecting => "connecting",
            DeviceState::Listening => "listening",
            DeviceState::Speaking => "speaking",
            DeviceState::AudioTesting => "audio_testing",
            DeviceState::FatalError => "fatal_error",
        };
        f.write_str(name)
    }
}

/// How a listening session ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListeningMode {
    /// Server-side VAD ends the turn
    AutoStop,
    /// The user ends the turn (push-to-talk)
    ManualStop,
    /// Full duplex; requires echo cancellation
    Realtime,
}

impl Default for ListeningMode {
    fn default() -> Self {
        Self::AutoStop
    }
}

impl ListeningMode {
    /// Value used for the `mode` field of a `listen` control message
    pub fn wire_name(self) -> &'static str {
        match self {
            ListeningMode::AutoStop => "auto",
            ListeningMode::ManualStop => "manual",
            ListeningMode::Realtime => "realtime",
        }
    }
}

type Listener = Box<dyn Fn(DeviceState, DeviceState) + Send + Sync>;

/// The state machine shared by every component
pub struct DeviceStateMachine {
    state: AtomicU8,
    entered_at: Mutex<Instant>,
    listeners: RwLock<Vec<Listener>>,
}

impl Default for DeviceStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStateMachine {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(DeviceState::Unknown as u8),
            entered_at: Mutex::new(Instant::now()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Current state; never blocks
    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Register a listener called as `listener(old, new)` on every transition
    pub fn add_state_change_listener<F>(&self, listener: F)
    where
        F: Fn(DeviceState, DeviceState) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    /// Move to `new_state` and notify listeners in registration order
    ///
    /// Transitions are always permitted. Requesting the current state again
    /// still notifies listeners so handlers can re-assert their side effects.
    /// Returns whether the state actually differed from the previous one.
    pub fn transition_to(&self, new_state: DeviceState) -> bool {
        let old_state = DeviceState::from_u8(self.state.swap(new_state as u8, Ordering::AcqRel));

        let duration_ms = {
            let mut entered_at = self.entered_at.lock().unwrap_or_else(PoisonError::into_inner);
            let elapsed = entered_at.elapsed().as_millis() as u64;
            *entered_at = Instant::now();
            elapsed
        };

        info!(
            from = %old_state,
            to = %new_state,
            duration_ms = duration_ms,
            "state transition"
        );

        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(old_state, new_state);
        }

        old_state != new_state
    }
}
