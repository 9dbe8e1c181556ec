//! Event flags raised towards the orchestrator
//!
//! Any thread may raise flags. Exactly one consumer waits for "any flag
//! set" and takes the whole observed mask at once. Raising a flag that is
//! already pending collapses into the pending observation, so handlers
//! must re-read shared state instead of counting raises.

use std::fmt;
use std::ops::BitOr;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// A single signal understood by the dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventFlag {
    /// Scheduled callbacks are waiting in the task queue
    Schedule,
    /// Encoded microphone packets are ready to be sent
    SendAudio,
    /// The audio service detected a wake word
    WakeWordDetected,
    /// Voice activity started or stopped
    VadChange,
    /// 1 Hz housekeeping tick
    ClockTick,
    /// The protocol reported an error (message stored separately)
    Error,
    /// Network link came up
    NetworkConnected,
    /// Network link went down
    NetworkDisconnected,
    /// User pressed the chat button
    ToggleChat,
    /// User started push-to-talk
    StartListening,
    /// User released push-to-talk
    StopListening,
    /// Activation worker finished
    ActivationDone,
    /// Device state changed
    StateChanged,
    /// Ask the dispatch loop to return
    Exit,
}

impl EventFlag {
    /// Every flag, in declaration order
    pub const ALL: [EventFlag; 14] = [
        EventFlag::Schedule,
        EventFlag::SendAudio,
        EventFlag::WakeWordDetected,
        EventFlag::VadChange,
        EventFlag::ClockTick,
        EventFlag::Error,
        EventFlag::NetworkConnected,
        EventFlag::NetworkDisconnected,
        EventFlag::ToggleChat,
        EventFlag::StartListening,
        EventFlag::StopListening,
        EventFlag::ActivationDone,
        EventFlag::StateChanged,
        EventFlag::Exit,
    ];

    /// Bit used for this flag inside an [`EventFlags`] mask
    pub const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub fn name(self) -> &'static str {
        match self {
            EventFlag::Schedule => "SCHEDULE",
            EventFlag::SendAudio => "SEND_AUDIO",
            EventFlag::WakeWordDetected => "WAKE_WORD_DETECTED",
            EventFlag::VadChange => "VAD_CHANGE",
            EventFlag::ClockTick => "CLOCK_TICK",
            EventFlag::Error => "ERROR",
            EventFlag::NetworkConnected => "NETWORK_CONNECTED",
            EventFlag::NetworkDisconnected => "NETWORK_DISCONNECTED",
            EventFlag::ToggleChat => "TOGGLE_CHAT",
            EventFlag::StartListening => "START_LISTENING",
            EventFlag::StopListening => "STOP_LISTENING",
            EventFlag::ActivationDone => "ACTIVATION_DONE",
            EventFlag::StateChanged => "STATE_CHANGED",
            EventFlag::Exit => "EXIT",
        }
    }
}

impl fmt::Display for EventFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A mask of observed flags
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFlags(u32);

impl EventFlags {
    /// No flags set
    pub const EMPTY: EventFlags = EventFlags(0);

    pub fn contains(self, flag: EventFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, flag: EventFlag) {
        self.0 |= flag.bit();
    }

    /// Flags present in the mask, in declaration order
    pub fn iter(self) -> impl Iterator<Item = EventFlag> {
        EventFlag::ALL.into_iter().filter(move |flag| self.contains(*flag))
    }

    /// Number of distinct flags in the mask
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }
}

impl From<EventFlag> for EventFlags {
    fn from(flag: EventFlag) -> Self {
        EventFlags(flag.bit())
    }
}

impl BitOr<EventFlag> for EventFlags {
    type Output = EventFlags;

    fn bitor(self, rhs: EventFlag) -> EventFlags {
        EventFlags(self.0 | rhs.bit())
    }
}

impl BitOr for EventFlag {
    type Output = EventFlags;

    fn bitor(self, rhs: EventFlag) -> EventFlags {
        EventFlags(self.bit() | rhs.bit())
    }
}

impl fmt::Debug for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(EventFlag::name)).finish()
    }
}

/// Condition-variable guarded flag word with a single consumer
#[derive(Default)]
pub struct EventFlagSet {
    bits: Mutex<u32>,
    ready: Condvar,
}

impl EventFlagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// OR a flag into the set and wake the consumer
    pub fn raise(&self, flag: EventFlag) {
        self.raise_all(flag.into());
    }

    /// OR several flags into the set at once
    pub fn raise_all(&self, flags: EventFlags) {
        if flags.is_empty() {
            return;
        }
        let mut bits = self.bits.lock().unwrap_or_else(PoisonError::into_inner);
        *bits |= flags.0;
        self.ready.notify_one();
    }

    /// Block until at least one flag is set, then fetch-and-clear the mask
    pub fn wait(&self) -> EventFlags {
        let mut bits = self.bits.lock().unwrap_or_else(PoisonError::into_inner);
        while *bits == 0 {
            bits = self
                .ready
                .wait(bits)
                .unwrap_or_else(PoisonError::into_inner);
        }
        EventFlags(std::mem::take(&mut *bits))
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`
    ///
    /// Returns an empty mask on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> EventFlags {
        let bits = self.bits.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut bits, _) = self
            .ready
            .wait_timeout_while(bits, timeout, |bits| *bits == 0)
            .unwrap_or_else(PoisonError::into_inner);
        EventFlags(std::mem::take(&mut *bits))
    }

    /// Currently pending flags, without clearing them
    pub fn pending(&self) -> EventFlags {
        EventFlags(*self.bits.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
