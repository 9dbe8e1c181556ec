//! Control protocol collaborator
//!
//! The transport (framing, TLS, MQTT/WebSocket) lives outside this crate.
//! The orchestrator only drives it through [`Protocol`] and receives its
//! callbacks as [`ProtocolEvent`]s, which may arrive on any thread.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::state::ListeningMode;

/// One encoded audio frame travelling to or from the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioPacket {
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    pub timestamp: u32,
    pub payload: Vec<u8>,
}

/// Why the device asks the server to stop speaking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    None,
    WakeWordDetected,
}

/// Callbacks delivered by the transport
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    Connected,
    NetworkError(String),
    IncomingAudio(AudioPacket),
    AudioChannelOpened,
    AudioChannelClosed,
    IncomingJson(Value),
}

/// Receiver of transport callbacks; must not block
pub trait ProtocolEventSink: Send + Sync {
    fn on_protocol_event(&self, event: ProtocolEvent);
}

/// Operations the orchestrator needs from the transport
pub trait Protocol: Send + Sync {
    /// Connect callbacks and start background connection management
    fn start(&self, sink: Arc<dyn ProtocolEventSink>) -> bool;
    /// Open the audio channel; may block for around a second
    fn open_audio_channel(&self) -> bool;
    fn close_audio_channel(&self);
    fn is_audio_channel_opened(&self) -> bool;
    /// Returns `false` when the transport applies backpressure
    fn send_audio(&self, packet: AudioPacket) -> bool;
    fn send_start_listening(&self, mode: ListeningMode);
    fn send_stop_listening(&self);
    fn send_abort_speaking(&self, reason: AbortReason);
    fn send_wake_word_detected(&self, wake_word: &str);
    fn send_mcp_message(&self, payload: &str);
    fn server_sample_rate(&self) -> u32;
}

/// Text-to-speech progress reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    Stop,
    SentenceStart,
    #[serde(other)]
    Other,
}

/// JSON control messages sent by the server, tagged by `type`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Tts {
        state: TtsState,
        #[serde(default)]
        text: Option<String>,
    },
    Stt {
        #[serde(default)]
        text: Option<String>,
    },
    Llm {
        #[serde(default)]
        emotion: Option<String>,
    },
    Mcp {
        #[serde(default)]
        payload: Value,
    },
    System {
        #[serde(default)]
        command: Option<String>,
    },
    Alert {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        emotion: Option<String>,
    },
    Custom {
        #[serde(default)]
        payload: Option<Value>,
    },
}
