//! Recording fakes for the device collaborators and the media source

use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::device::{
    AbortReason, ActivationInfo, AudioCodec, AudioPacket, AudioService, Board, ChatRole, Display,
    Ota, OtaError, Page, PowerSaveLevel, ProgressFn, Protocol, ProtocolEvent, ProtocolEventSink,
    Services, Sound, VersionInfo,
};
use crate::events::EventFlagSet;
use crate::media::{
    ChunkReader, Decoder, DecoderFactory, PcmBlock, PlaybackError, StreamInput, StreamSource,
};
use crate::orchestrator::Scheduler;
use crate::state::{DeviceState, DeviceStateMachine, ListeningMode};
use crate::store::{MemoryStore, Reminder};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Append-only log of calls
#[derive(Default)]
pub struct CallLog(Mutex<Vec<String>>);

impl CallLog {
    pub fn push(&self, call: impl Into<String>) {
        lock(&self.0).push(call.into());
    }

    pub fn all(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    pub fn contains(&self, call: &str) -> bool {
        lock(&self.0).iter().any(|c| c == call)
    }

    pub fn clear(&self) {
        lock(&self.0).clear();
    }
}

#[derive(Default)]
pub struct RecordingDisplay {
    pub log: CallLog,
}

impl RecordingDisplay {
    pub fn calls(&self) -> Vec<String> {
        self.log.all()
    }

    pub fn last_status(&self) -> Option<String> {
        self.calls()
            .into_iter()
            .rev()
            .find_map(|c| c.strip_prefix("status:").map(str::to_string))
    }
}

impl Display for RecordingDisplay {
    fn set_status(&self, status: &str) {
        self.log.push(format!("status:{status}"));
    }

    fn set_emotion(&self, emotion: &str) {
        self.log.push(format!("emotion:{emotion}"));
    }

    fn set_chat_message(&self, role: ChatRole, content: &str) {
        self.log.push(format!("chat:{}:{content}", role.as_str()));
    }

    fn clear_chat_messages(&self) {
        self.log.push("clear_chat");
    }

    fn show_notification(&self, message: &str, _duration: Duration) {
        self.log.push(format!("notify:{message}"));
    }

    fn update_status_bar(&self, force: bool) {
        self.log.push(format!("status_bar:{force}"));
    }

    fn set_music_info(&self, title: &str, artist: &str) {
        self.log.push(format!("music:{title}|{artist}"));
    }

    fn set_music_progress(&self, position_ms: u64, total_ms: u64) {
        self.log.push(format!("progress:{position_ms}/{total_ms}"));
    }

    fn set_music_lyric(&self, lyric: &str) {
        self.log.push(format!("lyric:{lyric}"));
    }

    fn switch_page(&self, page: Page) {
        self.log.push(format!("page:{page:?}"));
    }

    fn show_reminders(&self, reminders: &[Reminder]) {
        self.log.push(format!("reminders:{}", reminders.len()));
    }

    fn set_countdown(&self, remaining: &str, running: bool) {
        self.log.push(format!("countdown:{remaining}:{running}"));
    }
}

#[derive(Default)]
pub struct FakeAudio {
    pub log: CallLog,
    pub afe_wake_word: AtomicBool,
    processor_running: AtomicBool,
    external_playback: AtomicBool,
    send_queue: Mutex<VecDeque<AudioPacket>>,
    pub decoded: AtomicUsize,
}

impl FakeAudio {
    pub fn external_playback_active(&self) -> bool {
        self.external_playback.load(Ordering::SeqCst)
    }

    pub fn queue_outgoing(&self, count: usize) {
        let mut queue = lock(&self.send_queue);
        for i in 0..count {
            queue.push_back(AudioPacket {
                timestamp: i as u32,
                ..AudioPacket::default()
            });
        }
    }

    pub fn outgoing_len(&self) -> usize {
        lock(&self.send_queue).len()
    }
}

impl AudioService for FakeAudio {
    fn start(&self) {
        self.log.push("start");
    }

    fn stop(&self) {
        self.log.push("stop");
    }

    fn pop_packet_from_send_queue(&self) -> Option<AudioPacket> {
        lock(&self.send_queue).pop_front()
    }

    fn push_packet_to_decode_queue(&self, _packet: AudioPacket) {
        self.decoded.fetch_add(1, Ordering::SeqCst);
    }

    fn pop_wake_word_packet(&self) -> Option<AudioPacket> {
        None
    }

    fn encode_wake_word(&self) {
        self.log.push("encode_wake_word");
    }

    fn last_wake_word(&self) -> String {
        "hi device".to_string()
    }

    fn enable_wake_word_detection(&self, enable: bool) {
        self.log.push(format!("wake_word:{enable}"));
    }

    fn enable_voice_processing(&self, enable: bool) {
        self.processor_running.store(enable, Ordering::SeqCst);
        self.log.push(format!("voice_processing:{enable}"));
    }

    fn enable_device_aec(&self, enable: bool) {
        self.log.push(format!("device_aec:{enable}"));
    }

    fn enable_audio_testing(&self, enable: bool) {
        self.log.push(format!("audio_testing:{enable}"));
    }

    fn is_audio_processor_running(&self) -> bool {
        self.processor_running.load(Ordering::SeqCst)
    }

    fn is_afe_wake_word(&self) -> bool {
        self.afe_wake_word.load(Ordering::SeqCst)
    }

    fn wait_for_playback_queue_empty(&self) {
        self.log.push("wait_playback_empty");
    }

    fn reset_decoder(&self) {
        self.log.push("reset_decoder");
    }

    fn set_external_playback_active(&self, active: bool) {
        self.external_playback.store(active, Ordering::SeqCst);
        self.log.push(format!("external_playback:{active}"));
    }

    fn play_sound(&self, sound: Sound) {
        self.log.push(format!("sound:{sound:?}"));
    }

    fn is_idle(&self) -> bool {
        !self.external_playback_active()
    }
}

pub struct FakeCodec {
    sample_rate: u32,
    channels: u16,
    enabled: AtomicBool,
    written: AtomicUsize,
}

impl FakeCodec {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            enabled: AtomicBool::new(false),
            written: AtomicUsize::new(0),
        }
    }

    pub fn samples_written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }
}

impl AudioCodec for FakeCodec {
    fn output_sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn output_channels(&self) -> u16 {
        self.channels
    }

    fn output_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn enable_output(&self, enable: bool) {
        self.enabled.store(enable, Ordering::SeqCst);
    }

    fn write(&self, pcm: &[i16]) {
        self.written.fetch_add(pcm.len(), Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeBoard {
    levels: Mutex<Vec<PowerSaveLevel>>,
    pub reboots: AtomicUsize,
    pub leds: AtomicUsize,
}

impl FakeBoard {
    pub fn power_levels(&self) -> Vec<PowerSaveLevel> {
        lock(&self.levels).clone()
    }
}

impl Board for FakeBoard {
    fn set_power_save_level(&self, level: PowerSaveLevel) {
        lock(&self.levels).push(level);
    }

    fn update_led(&self, _state: DeviceState, _voice_detected: bool) {
        self.leds.fetch_add(1, Ordering::SeqCst);
    }

    fn reboot(&self) {
        self.reboots.fetch_add(1, Ordering::SeqCst);
    }
}

/// Protocol that records outgoing messages and reports channel changes
/// synchronously to its sink
pub struct FakeProtocol {
    pub log: CallLog,
    opened: AtomicBool,
    pub open_succeeds: AtomicBool,
    /// Accept this many audio packets before applying backpressure
    pub audio_budget: AtomicUsize,
    sink: Mutex<Option<Arc<dyn ProtocolEventSink>>>,
}

impl Default for FakeProtocol {
    fn default() -> Self {
        Self {
            log: CallLog::default(),
            opened: AtomicBool::new(false),
            open_succeeds: AtomicBool::new(true),
            audio_budget: AtomicUsize::new(usize::MAX),
            sink: Mutex::new(None),
        }
    }
}

impl FakeProtocol {
    pub fn emit(&self, event: ProtocolEvent) {
        let sink = lock(&self.sink).clone();
        if let Some(sink) = sink {
            sink.on_protocol_event(event);
        }
    }

    pub fn force_open(&self) {
        self.opened.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.log.all()
    }
}

impl Protocol for FakeProtocol {
    fn start(&self, sink: Arc<dyn ProtocolEventSink>) -> bool {
        *lock(&self.sink) = Some(sink);
        self.log.push("start");
        true
    }

    fn open_audio_channel(&self) -> bool {
        self.log.push("open");
        if !self.open_succeeds.load(Ordering::SeqCst) {
            return false;
        }
        self.opened.store(true, Ordering::SeqCst);
        self.emit(ProtocolEvent::AudioChannelOpened);
        true
    }

    fn close_audio_channel(&self) {
        self.log.push("close");
        if self.opened.swap(false, Ordering::SeqCst) {
            self.emit(ProtocolEvent::AudioChannelClosed);
        }
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    fn send_audio(&self, _packet: AudioPacket) -> bool {
        let accepted = self
            .audio_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if accepted {
            self.log.push("audio");
        }
        accepted
    }

    fn send_start_listening(&self, mode: ListeningMode) {
        self.log.push(format!("listen_start:{}", mode.wire_name()));
    }

    fn send_stop_listening(&self) {
        self.log.push("listen_stop");
    }

    fn send_abort_speaking(&self, reason: AbortReason) {
        self.log.push(format!("abort:{reason:?}"));
    }

    fn send_wake_word_detected(&self, wake_word: &str) {
        self.log.push(format!("wake_word:{wake_word}"));
    }

    fn send_mcp_message(&self, payload: &str) {
        self.log.push(format!("mcp:{payload}"));
    }

    fn server_sample_rate(&self) -> u32 {
        16_000
    }
}

/// OTA backend answering from scripted queues
///
/// An exhausted check queue answers "up to date, no activation"; an
/// exhausted activation queue answers success.
#[derive(Default)]
pub struct FakeOta {
    checks: Mutex<VecDeque<Result<VersionInfo, OtaError>>>,
    activations: Mutex<VecDeque<Result<(), OtaError>>>,
    pub upgrade_fails: AtomicBool,
    pub check_calls: AtomicUsize,
    pub activate_calls: AtomicUsize,
    pub log: CallLog,
}

impl FakeOta {
    pub fn push_check(&self, result: Result<VersionInfo, OtaError>) {
        lock(&self.checks).push_back(result);
    }

    pub fn push_activation(&self, result: Result<(), OtaError>) {
        lock(&self.activations).push_back(result);
    }
}

impl Ota for FakeOta {
    fn current_version(&self) -> String {
        "1.0.0".to_string()
    }

    fn check_version_url(&self) -> String {
        "http://ota.test/check".to_string()
    }

    fn check_version(&self) -> Result<VersionInfo, OtaError> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.checks)
            .pop_front()
            .unwrap_or_else(|| Ok(VersionInfo::default()))
    }

    fn mark_current_version_valid(&self) {
        self.log.push("mark_valid");
    }

    fn activate(&self, _activation: &ActivationInfo) -> Result<(), OtaError> {
        self.activate_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.activations).pop_front().unwrap_or(Ok(()))
    }

    fn upgrade(&self, url: &str, progress: ProgressFn<'_>) -> Result<(), OtaError> {
        self.log.push(format!("upgrade:{url}"));
        progress(50, 1024);
        if self.upgrade_fails.load(Ordering::SeqCst) {
            return Err(OtaError::Status(500));
        }
        Ok(())
    }

    fn download_assets(&self, url: &str, progress: ProgressFn<'_>) -> Result<(), OtaError> {
        self.log.push(format!("assets:{url}"));
        progress(100, 2048);
        Ok(())
    }
}

/// Every fake plus the shared orchestration handles
pub struct Fakes {
    pub events: Arc<EventFlagSet>,
    pub scheduler: Scheduler,
    pub state: Arc<DeviceStateMachine>,
    pub display: Arc<RecordingDisplay>,
    pub audio: Arc<FakeAudio>,
    pub codec: Arc<FakeCodec>,
    pub board: Arc<FakeBoard>,
    pub protocol: Arc<FakeProtocol>,
    pub ota: Arc<FakeOta>,
    pub settings: Arc<MemoryStore>,
}

impl Fakes {
    pub fn new() -> Self {
        let events = Arc::new(EventFlagSet::new());
        Self {
            scheduler: Scheduler::new(Arc::clone(&events)),
            events,
            state: Arc::new(DeviceStateMachine::new()),
            display: Arc::new(RecordingDisplay::default()),
            audio: Arc::new(FakeAudio::default()),
            codec: Arc::new(FakeCodec::new(16_000, 1)),
            board: Arc::new(FakeBoard::default()),
            protocol: Arc::new(FakeProtocol::default()),
            ota: Arc::new(FakeOta::default()),
            settings: Arc::new(MemoryStore::new()),
        }
    }

    pub fn services(&self) -> Services {
        Services {
            protocol: self.protocol.clone(),
            audio: self.audio.clone(),
            codec: self.codec.clone(),
            display: self.display.clone(),
            board: self.board.clone(),
            ota: self.ota.clone(),
            settings: self.settings.clone(),
        }
    }
}

/// Little-endian bytes of 16-bit samples
pub fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// One scripted reaction of a stream read
#[derive(Debug, Clone)]
pub enum ReadStep {
    /// Bytes handed out over as many reads as the buffer size requires
    Data(Vec<u8>),
    Empty,
    Error,
    /// Sleep, then report an empty read
    Block(Duration),
}

/// Stream source replaying a script for every opened URL
#[derive(Default)]
pub struct ScriptedSource {
    script: Vec<ReadStep>,
    endless: Option<Vec<u8>>,
    open_status: Option<u16>,
    lyrics: Option<String>,
    opened: Mutex<Vec<String>>,
    open_now: Arc<AtomicUsize>,
    max_open: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(script: Vec<ReadStep>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Every read returns `pattern` repeated to fill the buffer
    pub fn endless(pattern: Vec<u8>) -> Self {
        Self {
            endless: Some(pattern),
            ..Self::default()
        }
    }

    /// Opening answers with this HTTP status
    pub fn failing_open(status: u16) -> Self {
        Self {
            open_status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_lyrics(mut self, lyrics: &str) -> Self {
        self.lyrics = Some(lyrics.to_string());
        self
    }

    pub fn opened_urls(&self) -> Vec<String> {
        lock(&self.opened).clone()
    }

    pub fn max_open_readers(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }
}

impl StreamSource for ScriptedSource {
    fn open(&self, url: &str) -> Result<Box<dyn ChunkReader>, PlaybackError> {
        lock(&self.opened).push(url.to_string());
        if let Some(status) = self.open_status {
            return Err(PlaybackError::HttpStatus(status));
        }
        let now = self.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(ScriptedReader {
            steps: self.script.iter().cloned().collect(),
            pending: VecDeque::new(),
            endless: self.endless.clone(),
            open_now: Arc::clone(&self.open_now),
        }))
    }

    fn fetch_text(&self, _url: &str) -> Result<String, PlaybackError> {
        self.lyrics.clone().ok_or(PlaybackError::HttpStatus(404))
    }
}

struct ScriptedReader {
    steps: VecDeque<ReadStep>,
    pending: VecDeque<u8>,
    endless: Option<Vec<u8>>,
    open_now: Arc<AtomicUsize>,
}

impl ChunkReader for ScriptedReader {
    fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if !self.pending.is_empty() {
                let n = buf.len().min(self.pending.len());
                for (dst, src) in buf.iter_mut().zip(self.pending.drain(..n)) {
                    *dst = src;
                }
                return Ok(n);
            }
            if let Some(pattern) = &self.endless {
                let n = buf.len() & !1;
                for (dst, src) in buf[..n].iter_mut().zip(pattern.iter().cycle()) {
                    *dst = *src;
                }
                return Ok(n);
            }
            match self.steps.pop_front() {
                None | Some(ReadStep::Empty) => return Ok(0),
                Some(ReadStep::Data(data)) => self.pending.extend(data),
                Some(ReadStep::Error) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "connection reset",
                    ))
                }
                Some(ReadStep::Block(duration)) => {
                    std::thread::sleep(duration);
                    return Ok(0);
                }
            }
        }
    }
}

impl Drop for ScriptedReader {
    fn drop(&mut self) {
        self.open_now.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Decoder treating the input as raw little-endian PCM
pub struct PcmDecoderFactory {
    sample_rate: u32,
    channels: u16,
}

impl PcmDecoderFactory {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

impl DecoderFactory for PcmDecoderFactory {
    fn create<'a>(&self, input: StreamInput<'a>) -> Result<Box<dyn Decoder + 'a>, PlaybackError> {
        Ok(Box::new(PcmDecoder {
            input,
            carry: Vec::new(),
            sample_rate: self.sample_rate,
            channels: self.channels,
        }))
    }
}

/// One block per read; an odd trailing byte waits for the next read
struct PcmDecoder<'a> {
    input: StreamInput<'a>,
    carry: Vec<u8>,
    sample_rate: u32,
    channels: u16,
}

impl Decoder for PcmDecoder<'_> {
    fn next_block(&mut self) -> Result<Option<PcmBlock>, PlaybackError> {
        let mut buf = [0u8; 4096];
        loop {
            let n = self.input.read(&mut buf).map_err(PlaybackError::Read)?;
            if n == 0 {
                return Ok(None);
            }
            self.carry.extend_from_slice(&buf[..n]);
            let usable = self.carry.len() & !1;
            if usable == 0 {
                continue;
            }
            let samples = self
                .carry
                .drain(..usable)
                .collect::<Vec<u8>>()
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect();
            return Ok(Some(PcmBlock {
                samples,
                sample_rate: self.sample_rate,
                channels: self.channels,
            }));
        }
    }
}

/// Silent MPEG-1 Layer III frames: 128 kbit/s, 44.1 kHz, stereo
pub fn silent_mp3_frames(count: usize) -> Vec<u8> {
    const FRAME_LEN: usize = 417;
    let mut frame = vec![0u8; FRAME_LEN];
    frame[..4].copy_from_slice(&[0xFF, 0xFB, 0x90, 0x00]);
    frame.repeat(count)
}
