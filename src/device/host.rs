//! Host implementations of the board collaborators
//!
//! Used when the daemon runs on a development machine without the device
//! hardware: PCM output is paced and discarded, the protocol keeps channel
//! state locally, and reboot requests ask the dispatch loop to exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::audio::{AudioCodec, AudioService, Sound};
use super::board::{Board, PowerSaveLevel};
use super::protocol::{AbortReason, AudioPacket, Protocol, ProtocolEvent, ProtocolEventSink};
use crate::events::{EventFlag, EventFlagSet};
use crate::state::{DeviceState, ListeningMode};

pub struct HostBoard {
    events: Arc<EventFlagSet>,
}

impl HostBoard {
    pub fn new(events: Arc<EventFlagSet>) -> Self {
        Self { events }
    }
}

impl Board for HostBoard {
    fn set_power_save_level(&self, level: PowerSaveLevel) {
        debug!(?level, "power save level");
    }

    fn update_led(&self, state: DeviceState, voice_detected: bool) {
        debug!(%state, voice_detected, "led");
    }

    fn reboot(&self) {
        warn!("reboot requested, stopping dispatch loop");
        self.events.raise(EventFlag::Exit);
    }
}

/// Codec that consumes PCM at real-time speed and drops it
pub struct HostCodec {
    sample_rate: u32,
    channels: u16,
    enabled: AtomicBool,
}

impl HostCodec {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            enabled: AtomicBool::new(false),
        }
    }
}

impl AudioCodec for HostCodec {
    fn output_sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn output_channels(&self) -> u16 {
        self.channels
    }

    fn output_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn enable_output(&self, enable: bool) {
        self.enabled.store(enable, Ordering::Relaxed);
    }

    fn write(&self, pcm: &[i16]) {
        let frames = pcm.len() as u64 / u64::from(self.channels);
        let micros = frames * 1_000_000 / u64::from(self.sample_rate.max(1));
        std::thread::sleep(Duration::from_micros(micros));
    }
}

/// Audio service without capture hardware
#[derive(Default)]
pub struct HostAudioService {
    running: AtomicBool,
    wake_word: AtomicBool,
    voice_processing: AtomicBool,
    external_playback: AtomicBool,
}

impl HostAudioService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioService for HostAudioService {
    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!("audio service started");
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("audio service stopped");
    }

    fn pop_packet_from_send_queue(&self) -> Option<AudioPacket> {
        None
    }

    fn push_packet_to_decode_queue(&self, packet: AudioPacket) {
        debug!(bytes = packet.payload.len(), "dropping incoming audio");
    }

    fn pop_wake_word_packet(&self) -> Option<AudioPacket> {
        None
    }

    fn encode_wake_word(&self) {}

    fn last_wake_word(&self) -> String {
        String::new()
    }

    fn enable_wake_word_detection(&self, enable: bool) {
        self.wake_word.store(enable, Ordering::SeqCst);
    }

    fn enable_voice_processing(&self, enable: bool) {
        self.voice_processing.store(enable, Ordering::SeqCst);
    }

    fn enable_device_aec(&self, enable: bool) {
        debug!(enable, "device AEC");
    }

    fn enable_audio_testing(&self, enable: bool) {
        debug!(enable, "audio testing");
    }

    fn is_audio_processor_running(&self) -> bool {
        self.voice_processing.load(Ordering::SeqCst)
    }

    fn is_afe_wake_word(&self) -> bool {
        false
    }

    fn wait_for_playback_queue_empty(&self) {}

    fn reset_decoder(&self) {}

    fn set_external_playback_active(&self, active: bool) {
        self.external_playback.store(active, Ordering::SeqCst);
    }

    fn play_sound(&self, sound: Sound) {
        debug!(?sound, "play sound");
    }

    fn is_idle(&self) -> bool {
        !self.external_playback.load(Ordering::SeqCst)
    }
}

/// Protocol that opens channels locally and logs outgoing control messages
#[derive(Default)]
pub struct HostProtocol {
    opened: AtomicBool,
    sink: Mutex<Option<Arc<dyn ProtocolEventSink>>>,
}

impl HostProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&self, event: ProtocolEvent) {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(sink) = sink {
            sink.on_protocol_event(event);
        }
    }
}

impl Protocol for HostProtocol {
    fn start(&self, sink: Arc<dyn ProtocolEventSink>) -> bool {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
        self.emit(ProtocolEvent::Connected);
        true
    }

    fn open_audio_channel(&self) -> bool {
        if !self.opened.swap(true, Ordering::SeqCst) {
            self.emit(ProtocolEvent::AudioChannelOpened);
        }
        true
    }

    fn close_audio_channel(&self) {
        if self.opened.swap(false, Ordering::SeqCst) {
            self.emit(ProtocolEvent::AudioChannelClosed);
        }
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    fn send_audio(&self, _packet: AudioPacket) -> bool {
        self.is_audio_channel_opened()
    }

    fn send_start_listening(&self, mode: ListeningMode) {
        info!(mode = mode.wire_name(), "-> listen start");
    }

    fn send_stop_listening(&self) {
        info!("-> listen stop");
    }

    fn send_abort_speaking(&self, reason: AbortReason) {
        info!(?reason, "-> abort");
    }

    fn send_wake_word_detected(&self, wake_word: &str) {
        info!(wake_word, "-> listen detect");
    }

    fn send_mcp_message(&self, payload: &str) {
        info!(payload, "-> mcp");
    }

    fn server_sample_rate(&self) -> u32 {
        24_000
    }
}
