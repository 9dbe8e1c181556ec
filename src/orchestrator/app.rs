//! The device application: event dispatch loop and its handlers
//!
//! One thread runs [`Application::run`]. Everything else (protocol
//! callbacks, the clock, workers, tool calls) talks to it by raising event
//! flags or scheduling closures, which are handled in a fixed priority
//! order per wake.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::alert::{dismiss_alert, show_alert};
use super::queue::Scheduler;
use crate::activation::{ActivationPolicy, ActivationResult, ActivationRetryLoop};
use crate::device::{
    strings, AbortReason, AecMode, ChatRole, PowerSaveLevel, ProtocolEvent, ProtocolEventSink,
    ServerMessage, Services, Sound, TtsState,
};
use crate::events::{EventFlag, EventFlags};
use crate::media::{
    DecoderFactory, MusicPlayer, NowPlaying, PlayOutcome, PlayRequest, PlaybackError, PlayerConfig,
    StreamSource,
};
use crate::state::{DeviceState, DeviceStateMachine, ListeningMode};
use crate::tools::McpServer;

/// Diagnostics are logged every this many clock ticks
const DIAGNOSTICS_EVERY: u32 = 10;

/// Startup options of the application
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    pub aec_mode: AecMode,
    pub player: PlayerConfig,
    pub activation: ActivationPolicy,
}

/// Where streamed music comes from and how it is decoded
pub struct MediaBackend {
    pub source: Arc<dyn StreamSource>,
    pub decoders: Arc<dyn DecoderFactory>,
}

/// Snapshot served to local clients
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub version: String,
    pub state: DeviceState,
    pub listening_mode: ListeningMode,
    pub aec_mode: AecMode,
    pub audio_channel_open: bool,
    pub protocol_started: bool,
    pub has_server_time: bool,
    pub music: Option<NowPlaying>,
    pub uptime_secs: u64,
}

pub struct Application {
    services: Services,
    scheduler: Scheduler,
    state: Arc<DeviceStateMachine>,
    player: MusicPlayer,
    activation: Arc<ActivationRetryLoop>,
    activation_running: Arc<AtomicBool>,
    mcp: OnceLock<Arc<McpServer>>,
    aec_mode: Mutex<AecMode>,
    listening_mode: Mutex<ListeningMode>,
    aborted: AtomicBool,
    play_popup_on_listening: AtomicBool,
    voice_detected: AtomicBool,
    protocol_started: AtomicBool,
    has_server_time: AtomicBool,
    clock_ticks: AtomicU32,
    last_error: Mutex<String>,
    started_at: Instant,
    weak: Weak<Application>,
}

impl Application {
    pub fn new(
        services: Services,
        scheduler: Scheduler,
        state: Arc<DeviceStateMachine>,
        options: AppOptions,
        media: MediaBackend,
    ) -> Arc<Self> {
        let events = Arc::clone(scheduler.events());
        state.add_state_change_listener(move |_, _| events.raise(EventFlag::StateChanged));

        let player = MusicPlayer::new(
            options.player,
            services.clone(),
            scheduler.clone(),
            Arc::clone(&state),
            media.source,
            media.decoders,
        );
        let activation = Arc::new(ActivationRetryLoop::new(
            services.clone(),
            scheduler.clone(),
            Arc::clone(&state),
            options.activation,
        ));

        Arc::new_cyclic(|weak| Self {
            services,
            scheduler,
            state,
            player,
            activation,
            activation_running: Arc::new(AtomicBool::new(false)),
            mcp: OnceLock::new(),
            aec_mode: Mutex::new(options.aec_mode),
            listening_mode: Mutex::new(ListeningMode::AutoStop),
            aborted: AtomicBool::new(false),
            play_popup_on_listening: AtomicBool::new(false),
            voice_detected: AtomicBool::new(false),
            protocol_started: AtomicBool::new(false),
            has_server_time: AtomicBool::new(false),
            clock_ticks: AtomicU32::new(0),
            last_error: Mutex::new(String::new()),
            started_at: Instant::now(),
            weak: weak.clone(),
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn state_machine(&self) -> &Arc<DeviceStateMachine> {
        &self.state
    }

    pub fn device_state(&self) -> DeviceState {
        self.state.state()
    }

    pub fn player(&self) -> &MusicPlayer {
        &self.player
    }

    /// Install the tool server answering `mcp` messages; only the first call counts
    pub fn set_tool_server(&self, server: Arc<McpServer>) {
        if self.mcp.set(server).is_err() {
            warn!("tool server already installed");
        }
    }

    pub fn aec_mode(&self) -> AecMode {
        *self.aec_mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listening_mode(&self) -> ListeningMode {
        *self.listening_mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            version: self.services.ota.current_version(),
            state: self.state.state(),
            listening_mode: self.listening_mode(),
            aec_mode: self.aec_mode(),
            audio_channel_open: self.services.protocol.is_audio_channel_opened(),
            protocol_started: self.protocol_started.load(Ordering::SeqCst),
            has_server_time: self.has_server_time.load(Ordering::SeqCst),
            music: self.player.now_playing(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    // Signals from other threads

    pub fn toggle_chat_state(&self) {
        self.scheduler.raise(EventFlag::ToggleChat);
    }

    pub fn start_listening(&self) {
        self.scheduler.raise(EventFlag::StartListening);
    }

    pub fn stop_listening(&self) {
        self.scheduler.raise(EventFlag::StopListening);
    }

    pub fn notify_network_connected(&self) {
        self.scheduler.raise(EventFlag::NetworkConnected);
    }

    pub fn notify_network_disconnected(&self) {
        self.scheduler.raise(EventFlag::NetworkDisconnected);
    }

    pub fn notify_wake_word_detected(&self) {
        self.scheduler.raise(EventFlag::WakeWordDetected);
    }

    pub fn notify_vad_change(&self, speaking: bool) {
        self.voice_detected.store(speaking, Ordering::SeqCst);
        self.scheduler.raise(EventFlag::VadChange);
    }

    pub fn notify_audio_ready(&self) {
        self.scheduler.raise(EventFlag::SendAudio);
    }

    pub fn notify_clock_tick(&self) {
        self.scheduler.raise(EventFlag::ClockTick);
    }

    /// Make [`run`](Self::run) return after the current wake
    pub fn request_exit(&self) {
        self.scheduler.raise(EventFlag::Exit);
    }

    /// Bring the device up; network and activation follow via events
    pub fn start(&self) {
        self.state.transition_to(DeviceState::Starting);
        self.services.audio.start();
        self.services.display.set_status(strings::LOADING_PROTOCOL);
    }

    /// Dispatch loop; must run on its own thread
    pub fn run(&self) {
        self.scheduler.bind_current_thread();
        info!("dispatch loop running");
        loop {
            let flags = self.scheduler.events().wait();
            self.handle_events(flags);
            if flags.contains(EventFlag::Exit) {
                break;
            }
        }
        let dropped = self.scheduler.close();
        info!(dropped, "dispatch loop stopped");
    }

    /// Handle one observed flag mask in priority order
    pub fn handle_events(&self, flags: EventFlags) {
        debug!(?flags, "wake");
        if flags.contains(EventFlag::Error) {
            self.handle_error();
        }
        if flags.contains(EventFlag::NetworkConnected) {
            self.handle_network_connected();
        }
        if flags.contains(EventFlag::NetworkDisconnected) {
            self.handle_network_disconnected();
        }
        if flags.contains(EventFlag::ActivationDone) {
            self.handle_activation_done();
        }
        if flags.contains(EventFlag::StateChanged) {
            self.handle_state_changed();
        }
        if flags.contains(EventFlag::ToggleChat) {
            self.handle_toggle_chat();
        }
        if flags.contains(EventFlag::StartListening) {
            self.handle_start_listening();
        }
        if flags.contains(EventFlag::StopListening) {
            self.handle_stop_listening();
        }
        if flags.contains(EventFlag::SendAudio) {
            self.handle_send_audio();
        }
        if flags.contains(EventFlag::WakeWordDetected) {
            self.handle_wake_word();
        }
        if flags.contains(EventFlag::VadChange) {
            self.handle_vad_change();
        }
        if flags.contains(EventFlag::Schedule) {
            self.scheduler.run_pending();
        }
        if flags.contains(EventFlag::ClockTick) {
            self.handle_clock_tick();
        }
    }

    /// Run `task` with the application on the orchestrator thread
    fn defer<F>(&self, task: F)
    where
        F: FnOnce(&Application) + Send + 'static,
    {
        let weak = self.weak.clone();
        self.scheduler.schedule(move || {
            if let Some(app) = weak.upgrade() {
                task(&app);
            }
        });
    }

    fn alert(&self, status: &str, message: &str, emotion: &str, sound: Option<Sound>) {
        show_alert(&self.services, status, message, emotion, sound);
    }

    fn default_listening_mode(&self) -> ListeningMode {
        match self.aec_mode() {
            AecMode::Off => ListeningMode::AutoStop,
            AecMode::Device | AecMode::Server => ListeningMode::Realtime,
        }
    }

    fn protocol_ready(&self) -> bool {
        let ready = self.protocol_started.load(Ordering::SeqCst);
        if !ready {
            warn!("protocol not started yet, ignoring request");
        }
        ready
    }

    // Flag handlers

    fn handle_error(&self) {
        self.state.transition_to(DeviceState::Idle);
        let message = self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone();
        self.alert(strings::ERROR, &message, "circle_xmark", Some(Sound::Exclamation));
    }

    fn handle_network_connected(&self) {
        if matches!(
            self.state.state(),
            DeviceState::Starting | DeviceState::WifiConfiguring
        ) {
            self.state.transition_to(DeviceState::Activating);
            self.spawn_activation();
        }
        self.services.display.update_status_bar(true);
    }

    fn handle_network_disconnected(&self) {
        if self.state.state().is_in_session() {
            info!("network lost, closing audio channel");
            self.services.protocol.close_audio_channel();
        }
        self.services.display.update_status_bar(true);
    }

    fn handle_activation_done(&self) {
        self.start_protocol();
        self.state.transition_to(DeviceState::Idle);

        let version = format!("{}{}", strings::VERSION, self.services.ota.current_version());
        self.services.display.show_notification(&version, Duration::from_secs(3));
        self.services.display.set_chat_message(ChatRole::System, "");
        self.services.audio.play_sound(Sound::Success);
        self.services.board.set_power_save_level(PowerSaveLevel::LowPower);
    }

    fn handle_state_changed(&self) {
        let state = self.state.state();
        let services = &self.services;
        self.clock_ticks.store(0, Ordering::SeqCst);
        services
            .board
            .update_led(state, self.voice_detected.load(Ordering::SeqCst));

        match state {
            DeviceState::Unknown | DeviceState::Idle => {
                if self.player.is_playing() {
                    services.display.set_status(strings::MUSIC_PLAYING);
                } else {
                    services.display.set_status(strings::STANDBY);
                    services.display.clear_chat_messages();
                    services.display.set_emotion("neutral");
                }
                services.audio.enable_voice_processing(false);
                services.audio.enable_wake_word_detection(true);
            }
            DeviceState::Connecting => {
                services.display.set_status(strings::CONNECTING);
                services.display.set_emotion("neutral");
                services.display.set_chat_message(ChatRole::System, "");
            }
            DeviceState::Listening => {
                services.display.set_status(strings::LISTENING);
                services.display.set_emotion("neutral");
                if !services.audio.is_audio_processor_running() {
                    let mode = self.listening_mode();
                    if mode == ListeningMode::AutoStop {
                        services.audio.wait_for_playback_queue_empty();
                    }
                    services.protocol.send_start_listening(mode);
                    services.audio.enable_voice_processing(true);
                    services.audio.enable_wake_word_detection(false);
                }
                if self.play_popup_on_listening.swap(false, Ordering::SeqCst) {
                    services.audio.play_sound(Sound::Popup);
                }
            }
            DeviceState::Speaking => {
                services.display.set_status(strings::SPEAKING);
                if self.listening_mode() != ListeningMode::Realtime {
                    services.audio.enable_voice_processing(false);
                    services
                        .audio
                        .enable_wake_word_detection(services.audio.is_afe_wake_word());
                }
                services.audio.reset_decoder();
            }
            DeviceState::WifiConfiguring => {
                services.audio.enable_voice_processing(false);
                services.audio.enable_wake_word_detection(false);
            }
            _ => {}
        }
    }

    fn handle_toggle_chat(&self) {
        match self.state.state() {
            DeviceState::Activating => {
                self.state.transition_to(DeviceState::Idle);
                return;
            }
            DeviceState::WifiConfiguring => {
                self.services.audio.enable_audio_testing(true);
                self.state.transition_to(DeviceState::AudioTesting);
                return;
            }
            DeviceState::AudioTesting => {
                self.services.audio.enable_audio_testing(false);
                self.state.transition_to(DeviceState::WifiConfiguring);
                return;
            }
            _ => {}
        }

        self.stop_music_for_voice();
        if !self.protocol_ready() {
            return;
        }

        match self.state.state() {
            DeviceState::Idle => self.begin_listening(self.default_listening_mode()),
            DeviceState::Speaking => self.abort_speaking(AbortReason::None),
            DeviceState::Listening => self.services.protocol.close_audio_channel(),
            _ => {}
        }
    }

    fn handle_start_listening(&self) {
        match self.state.state() {
            DeviceState::Activating => {
                self.state.transition_to(DeviceState::Idle);
                return;
            }
            DeviceState::WifiConfiguring => {
                self.services.audio.enable_audio_testing(true);
                self.state.transition_to(DeviceState::AudioTesting);
                return;
            }
            _ => {}
        }

        self.stop_music_for_voice();
        if !self.protocol_ready() {
            return;
        }

        match self.state.state() {
            DeviceState::Idle => self.begin_listening(ListeningMode::ManualStop),
            DeviceState::Speaking => {
                self.abort_speaking(AbortReason::None);
                self.set_listening_mode(ListeningMode::ManualStop);
            }
            _ => {}
        }
    }

    fn handle_stop_listening(&self) {
        match self.state.state() {
            DeviceState::AudioTesting => {
                self.services.audio.enable_audio_testing(false);
                self.state.transition_to(DeviceState::WifiConfiguring);
            }
            DeviceState::Listening => {
                self.services.protocol.send_stop_listening();
                self.state.transition_to(DeviceState::Idle);
            }
            _ => {}
        }
    }

    fn handle_send_audio(&self) {
        let mut sent = 0usize;
        while let Some(packet) = self.services.audio.pop_packet_from_send_queue() {
            if !self.services.protocol.send_audio(packet) {
                debug!(sent, "transport backpressure, dropping packet");
                break;
            }
            sent += 1;
        }
    }

    fn handle_wake_word(&self) {
        self.stop_music_for_voice();
        if !self.protocol_ready() {
            return;
        }

        match self.state.state() {
            DeviceState::Idle => {
                self.services.audio.encode_wake_word();
                let wake_word = self.services.audio.last_wake_word();
                info!(wake_word, "wake word detected");

                if self.services.protocol.is_audio_channel_opened() {
                    self.invoke_after_wake_word(&wake_word);
                } else {
                    self.state.transition_to(DeviceState::Connecting);
                    self.defer(move |app| app.continue_wake_word_invoke(&wake_word));
                }
            }
            DeviceState::Speaking => self.abort_speaking(AbortReason::WakeWordDetected),
            DeviceState::Activating => {
                // Idle cuts the activation worker's retry sleep short
                self.state.transition_to(DeviceState::Idle);
            }
            _ => {}
        }
    }

    fn handle_vad_change(&self) {
        let state = self.state.state();
        if state == DeviceState::Listening {
            self.services
                .board
                .update_led(state, self.voice_detected.load(Ordering::SeqCst));
        }
    }

    fn handle_clock_tick(&self) {
        let ticks = self.clock_ticks.fetch_add(1, Ordering::SeqCst) + 1;
        self.services.display.update_status_bar(false);
        if ticks % DIAGNOSTICS_EVERY == 0 {
            let progress = self.player.progress();
            info!(
                state = %self.state.state(),
                ticks,
                music_playing = progress.playing,
                music_position_ms = progress.position_ms,
                queued_tasks = self.scheduler.pending(),
                "heartbeat"
            );
        }
    }

    // Conversation steps

    fn begin_listening(&self, mode: ListeningMode) {
        if self.services.protocol.is_audio_channel_opened() {
            self.set_listening_mode(mode);
            return;
        }
        self.state.transition_to(DeviceState::Connecting);
        self.defer(move |app| app.continue_open_audio_channel(mode));
    }

    /// Second half of [`begin_listening`](Self::begin_listening)
    fn continue_open_audio_channel(&self, mode: ListeningMode) {
        if self.state.state() != DeviceState::Connecting {
            debug!(state = %self.state.state(), "stale open-channel step dropped");
            return;
        }
        if !self.services.protocol.open_audio_channel() {
            warn!("failed to open audio channel");
            if self.state.state() == DeviceState::Connecting {
                self.state.transition_to(DeviceState::Idle);
            }
            return;
        }
        self.set_listening_mode(mode);
    }

    fn continue_wake_word_invoke(&self, wake_word: &str) {
        if self.state.state() != DeviceState::Connecting {
            debug!(state = %self.state.state(), "stale wake word step dropped");
            return;
        }
        if !self.services.protocol.open_audio_channel() {
            warn!("failed to open audio channel after wake word");
            self.services.audio.enable_wake_word_detection(true);
            if self.state.state() == DeviceState::Connecting {
                self.state.transition_to(DeviceState::Idle);
            }
            return;
        }
        self.invoke_after_wake_word(wake_word);
    }

    fn invoke_after_wake_word(&self, wake_word: &str) {
        while let Some(packet) = self.services.audio.pop_wake_word_packet() {
            self.services.protocol.send_audio(packet);
        }
        self.services.protocol.send_wake_word_detected(wake_word);
        self.play_popup_on_listening.store(true, Ordering::SeqCst);
        self.set_listening_mode(self.default_listening_mode());
    }

    fn set_listening_mode(&self, mode: ListeningMode) {
        *self.listening_mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
        self.state.transition_to(DeviceState::Listening);
    }

    fn abort_speaking(&self, reason: AbortReason) {
        info!(?reason, "aborting speech");
        self.aborted.store(true, Ordering::SeqCst);
        self.services.protocol.send_abort_speaking(reason);
    }

    fn start_protocol(&self) {
        if self.protocol_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.services.display.set_status(strings::LOADING_PROTOCOL);
        let sink = Arc::new(ProtocolSink {
            app: self.weak.clone(),
        });
        if !self.services.protocol.start(sink) {
            error!("protocol failed to start");
            self.protocol_started.store(false, Ordering::SeqCst);
        }
    }

    fn spawn_activation(&self) {
        if self.activation_running.swap(true, Ordering::SeqCst) {
            debug!("activation already running");
            return;
        }

        let activation = Arc::clone(&self.activation);
        let running = Arc::clone(&self.activation_running);
        let weak = self.weak.clone();
        let spawned = thread::Builder::new()
            .name("activation".into())
            .spawn(move || {
                let result = activation.run();
                running.store(false, Ordering::SeqCst);
                let Some(app) = weak.upgrade() else { return };
                match result {
                    ActivationResult::Completed { has_server_time } => {
                        app.has_server_time.store(has_server_time, Ordering::SeqCst);
                    }
                    ActivationResult::RebootRequired => app.defer(Application::reboot),
                    ActivationResult::Aborted => info!("activation aborted"),
                }
            });
        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn activation worker");
            self.activation_running.store(false, Ordering::SeqCst);
        }
    }

    // Protocol callbacks (any thread)

    fn on_protocol_event(&self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Connected => {
                self.defer(|app| dismiss_alert(&app.services, app.state.state()));
            }
            ProtocolEvent::NetworkError(message) => {
                warn!(message, "protocol network error");
                *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = message;
                self.scheduler.raise(EventFlag::Error);
            }
            ProtocolEvent::IncomingAudio(packet) => {
                if self.state.state() == DeviceState::Speaking {
                    self.services.audio.push_packet_to_decode_queue(packet);
                }
            }
            ProtocolEvent::AudioChannelOpened => {
                self.services.board.set_power_save_level(PowerSaveLevel::Performance);
                let server_rate = self.services.protocol.server_sample_rate();
                let output_rate = self.services.codec.output_sample_rate();
                if server_rate != output_rate {
                    warn!(server_rate, output_rate, "server audio will be resampled");
                }
            }
            ProtocolEvent::AudioChannelClosed => {
                if !self.player.is_playing() {
                    self.services.board.set_power_save_level(PowerSaveLevel::LowPower);
                }
                self.defer(|app| {
                    app.services.display.set_chat_message(ChatRole::System, "");
                    app.state.transition_to(DeviceState::Idle);
                });
            }
            ProtocolEvent::IncomingJson(value) => self.on_incoming_json(value),
        }
    }

    fn on_incoming_json(&self, value: Value) {
        let message: ServerMessage = match serde_json::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "ignoring unrecognised server message");
                return;
            }
        };

        match message {
            ServerMessage::Tts { state: TtsState::Start, .. } => self.defer(|app| {
                app.aborted.store(false, Ordering::SeqCst);
                if matches!(app.state.state(), DeviceState::Idle | DeviceState::Listening) {
                    app.state.transition_to(DeviceState::Speaking);
                }
            }),
            ServerMessage::Tts { state: TtsState::Stop, .. } => self.defer(|app| {
                if app.state.state() == DeviceState::Speaking {
                    let next = match app.listening_mode() {
                        ListeningMode::ManualStop => DeviceState::Idle,
                        _ => DeviceState::Listening,
                    };
                    app.state.transition_to(next);
                }
            }),
            ServerMessage::Tts {
                state: TtsState::SentenceStart,
                text: Some(text),
            } => {
                info!(text, "assistant");
                self.defer(move |app| {
                    app.services.display.set_chat_message(ChatRole::Assistant, &text)
                });
            }
            ServerMessage::Tts { .. } => {}
            ServerMessage::Stt { text: Some(text) } => {
                info!(text, "user");
                self.defer(move |app| app.services.display.set_chat_message(ChatRole::User, &text));
            }
            ServerMessage::Stt { text: None } => {}
            ServerMessage::Llm { emotion: Some(emotion) } => {
                self.defer(move |app| app.services.display.set_emotion(&emotion));
            }
            ServerMessage::Llm { emotion: None } => {}
            ServerMessage::Mcp { payload } => self.handle_mcp(payload),
            ServerMessage::System { command } => match command.as_deref() {
                Some("reboot") => {
                    info!("reboot requested by server");
                    self.defer(Application::reboot);
                }
                other => warn!(command = ?other, "unknown system command"),
            },
            ServerMessage::Alert {
                status: Some(status),
                message: Some(message),
                emotion: Some(emotion),
            } => self.defer(move |app| {
                app.alert(&status, &message, &emotion, Some(Sound::Vibration))
            }),
            ServerMessage::Alert { .. } => warn!("alert message missing status, message or emotion"),
            ServerMessage::Custom { payload } => match payload {
                Some(payload) => {
                    let text = payload.to_string();
                    self.defer(move |app| {
                        app.services.display.set_chat_message(ChatRole::System, &text)
                    });
                }
                None => warn!("custom message without payload"),
            },
        }
    }

    fn handle_mcp(&self, payload: Value) {
        let Some(server) = self.mcp.get().cloned() else {
            warn!("no tool server installed, dropping MCP message");
            return;
        };
        let weak = self.weak.clone();
        let spawned = thread::Builder::new().name("mcp-call".into()).spawn(move || {
            if let Some(reply) = server.handle_message(&payload) {
                if let Some(app) = weak.upgrade() {
                    app.send_mcp_message(reply.to_string());
                }
            }
        });
        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn tool call thread");
        }
    }

    // Public operations

    /// Send a tool-server reply; safe from any thread
    pub fn send_mcp_message(&self, payload: String) {
        self.defer(move |app| {
            if app.protocol_started.load(Ordering::SeqCst) {
                app.services.protocol.send_mcp_message(&payload);
            }
        });
    }

    /// Switch echo cancellation; safe from any thread
    pub fn set_aec_mode(&self, mode: AecMode) {
        self.defer(move |app| {
            *app.aec_mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
            let services = &app.services;
            match mode {
                AecMode::Off => {
                    services.audio.enable_device_aec(false);
                    services.display.show_notification(strings::AEC_OFF, Duration::from_secs(3));
                }
                AecMode::Device => {
                    services.audio.enable_device_aec(true);
                    services.display.show_notification(strings::AEC_ON, Duration::from_secs(3));
                }
                AecMode::Server => {
                    services.audio.enable_device_aec(false);
                    services.display.show_notification(strings::AEC_ON, Duration::from_secs(3));
                }
            }
            info!(?mode, "AEC mode changed");
            // The listening mode is chosen when the channel opens
            if services.protocol.is_audio_channel_opened() {
                services.protocol.close_audio_channel();
            }
        });
    }

    pub fn can_enter_sleep_mode(&self) -> bool {
        self.state.state() == DeviceState::Idle
            && !self.services.protocol.is_audio_channel_opened()
            && self.services.audio.is_idle()
    }

    /// Stop everything and restart the board; orchestrator thread only
    pub fn reboot(&self) {
        info!("rebooting");
        if let Err(e) = self.player.stop() {
            warn!(error = %e, "music did not stop before reboot");
        }
        if self.services.protocol.is_audio_channel_opened() {
            self.services.protocol.close_audio_channel();
        }
        self.services.audio.stop();
        self.services.board.reboot();
    }

    /// Drop the conversation channel; the protocol restarts on the next activation
    pub fn reset_protocol(&self) {
        self.stop_music_for_voice();
        self.defer(|app| {
            if app.services.protocol.is_audio_channel_opened() {
                app.services.protocol.close_audio_channel();
            }
            app.protocol_started.store(false, Ordering::SeqCst);
        });
    }

    /// Stream music, ending any conversation first
    ///
    /// Blocks while a previous session winds down and while the
    /// orchestrator interrupts the conversation, so call it from a worker
    /// (tool) thread.
    pub fn play_music(&self, request: PlayRequest) -> Result<PlayOutcome, PlaybackError> {
        let weak = self.weak.clone();
        let scheduler = self.scheduler.clone();
        self.player.play(request, move || {
            let interrupted = scheduler.invoke(move || {
                if let Some(app) = weak.upgrade() {
                    app.interrupt_conversation();
                }
            });
            if interrupted.is_none() {
                warn!("orchestrator gone, starting playback without interrupting");
            }
        })
    }

    pub fn stop_music(&self) -> Result<(), PlaybackError> {
        self.player.stop()
    }

    fn interrupt_conversation(&self) {
        let state = self.state.state();
        if state == DeviceState::Speaking {
            self.abort_speaking(AbortReason::None);
        }
        if self.services.protocol.is_audio_channel_opened() {
            self.services.protocol.close_audio_channel();
        }
        if state.is_in_session() {
            self.state.transition_to(DeviceState::Idle);
        }
        self.services.audio.reset_decoder();
    }

    fn stop_music_for_voice(&self) {
        if !self.player.is_playing() {
            return;
        }
        info!("stopping music for voice interaction");
        if let Err(e) = self.player.stop() {
            error!(error = %e, "music did not stop");
        }
    }
}

/// Forwards transport callbacks without keeping the application alive
struct ProtocolSink {
    app: Weak<Application>,
}

impl ProtocolEventSink for ProtocolSink {
    fn on_protocol_event(&self, event: ProtocolEvent) {
        if let Some(app) = self.app.upgrade() {
            app.on_protocol_event(event);
        }
    }
}
