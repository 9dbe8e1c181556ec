//! Board-level controls: power profile, status LED, reboot

use crate::state::DeviceState;

/// Radio/CPU power profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSaveLevel {
    LowPower,
    Balanced,
    Performance,
}

pub trait Board: Send + Sync {
    fn set_power_save_level(&self, level: PowerSaveLevel);
    /// Refresh the status LED for the given state
    fn update_led(&self, state: DeviceState, voice_detected: bool);
    /// Restart the device; hosts may treat this as a process exit request
    fn reboot(&self);
}
