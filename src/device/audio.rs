//! Audio collaborators: the capture/encode service and the output codec

use serde::{Deserialize, Serialize};

use super::protocol::AudioPacket;

/// Where acoustic echo cancellation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AecMode {
    Off,
    Device,
    Server,
}

impl Default for AecMode {
    fn default() -> Self {
        Self::Off
    }
}

impl std::str::FromStr for AecMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(AecMode::Off),
            "device" => Ok(AecMode::Device),
            "server" => Ok(AecMode::Server),
            other => Err(format!("unknown AEC mode: {other}")),
        }
    }
}

/// Prompt sounds bundled with the firmware assets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sound {
    Success,
    Exclamation,
    Popup,
    Activation,
    Upgrade,
    Vibration,
    /// Spoken digit 0-9, used to announce activation codes
    Digit(u8),
}

/// Capture, encode and voice-decode pipeline owned by the board
///
/// Mode switches (`enable_*`, `reset_decoder`, `start`/`stop`) may only be
/// called from the orchestrator thread.
pub trait AudioService: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn pop_packet_from_send_queue(&self) -> Option<AudioPacket>;
    fn push_packet_to_decode_queue(&self, packet: AudioPacket);
    fn pop_wake_word_packet(&self) -> Option<AudioPacket>;
    fn encode_wake_word(&self);
    fn last_wake_word(&self) -> String;
    fn enable_wake_word_detection(&self, enable: bool);
    fn enable_voice_processing(&self, enable: bool);
    fn enable_device_aec(&self, enable: bool);
    fn enable_audio_testing(&self, enable: bool);
    fn is_audio_processor_running(&self) -> bool;
    /// Whether wake words are detected by the front-end (usable while speaking)
    fn is_afe_wake_word(&self) -> bool;
    fn wait_for_playback_queue_empty(&self);
    fn reset_decoder(&self);
    /// Claim or release the output device for playback outside the voice path
    fn set_external_playback_active(&self, active: bool);
    fn play_sound(&self, sound: Sound);
    fn is_idle(&self) -> bool;
}

/// Raw PCM output of the board codec
pub trait AudioCodec: Send + Sync {
    fn output_sample_rate(&self) -> u32;
    fn output_channels(&self) -> u16;
    fn output_enabled(&self) -> bool;
    fn enable_output(&self, enable: bool);
    /// Write interleaved 16-bit samples; blocks while the device drains
    fn write(&self, pcm: &[i16]);
}
