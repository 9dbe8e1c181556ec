use tracing::warn;

use crate::device::{strings, ChatRole, Services, Sound};
use crate::state::DeviceState;

/// Show a status/emotion/message triple and optionally play a prompt sound
///
/// Touches the display, so only call it from the orchestrator thread.
pub fn show_alert(services: &Services, status: &str, message: &str, emotion: &str, sound: Option<Sound>) {
    warn!(status, emotion, message, "alert");
    services.display.set_status(status);
    services.display.set_emotion(emotion);
    services.display.set_chat_message(ChatRole::System, message);
    if let Some(sound) = sound {
        services.audio.play_sound(sound);
    }
}

/// Restore the standby screen if the device is idle
pub fn dismiss_alert(services: &Services, state: DeviceState) {
    if state == DeviceState::Idle {
        services.display.set_status(strings::STANDBY);
        services.display.set_emotion("neutral");
        services.display.set_chat_message(ChatRole::System, "");
    }
}
