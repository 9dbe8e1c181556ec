//! Streamed music playback
//!
//! At most one playback worker is alive. The worker owns every resource of
//! its session and releases them on every exit path, then posts exactly one
//! outcome to the orchestrator queue. UI updates from the worker are always
//! scheduled, never applied directly.

use std::io::{ErrorKind, Read};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::cache::{AntiReplayGuard, CachedProgress, ProgressCache};
use super::convert::{remap_channels, StreamResampler};
use super::decoder::{DecoderFactory, PcmBlock};
use super::lyrics::{parse_lrc, LyricCursor};
use super::progress::{PlaybackProgress, ProgressSnapshot};
use super::source::{ChunkReader, StreamSource};
use crate::device::{strings, ChatRole, Page, PowerSaveLevel, Services};
use crate::orchestrator::Scheduler;
use crate::state::{DeviceState, DeviceStateMachine};

/// Errors from the playback pipeline
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("music URL is empty")]
    EmptyUrl,

    #[error("previous playback did not stop within {0:?}")]
    StuckWorker(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("server responded with HTTP {0}")]
    HttpStatus(u16),

    #[error("stream read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("resampler: {0}")]
    Resample(String),

    #[error("playback worker panicked")]
    Panicked,

    #[error("failed to spawn playback worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Tunables of the playback pipeline
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Bytes requested per stream read
    pub read_chunk_size: usize,
    /// Consecutive empty reads that count as end of stream
    pub empty_read_limit: u32,
    pub empty_read_interval: Duration,
    pub stop_poll_interval: Duration,
    /// Upper bound on waiting for a worker to exit
    pub stop_timeout: Duration,
    pub replay_window: Duration,
    pub cache_capacity: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 2048,
            empty_read_limit: 30,
            empty_read_interval: Duration::from_millis(100),
            stop_poll_interval: Duration::from_millis(20),
            stop_timeout: Duration::from_secs(10),
            replay_window: Duration::from_millis(15_000),
            cache_capacity: 10,
        }
    }
}

/// What to play
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayRequest {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    /// LRC (or plain) lyric text supplied inline
    #[serde(default)]
    pub lyric_text: Option<String>,
    /// LRC file to download before streaming starts
    #[serde(default)]
    pub lyric_url: Option<String>,
}

impl PlayRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Result of an accepted play request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayOutcome {
    Started,
    /// The same URL finished moments ago; nothing was started
    ReplaySuppressed,
}

/// How a session ended
#[derive(Debug)]
pub enum SessionOutcome {
    /// The stream ran dry
    Finished,
    /// The stream could not be opened
    OpenFailed(PlaybackError),
    /// Reading, decoding or conversion failed mid-stream
    Failed(PlaybackError),
    /// A stop was requested
    Stopped,
}

/// [`SessionOutcome`] without the error payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    Finished,
    OpenFailed,
    Failed,
    Stopped,
}

impl SessionOutcome {
    pub fn end(&self) -> SessionEnd {
        match self {
            SessionOutcome::Finished => SessionEnd::Finished,
            SessionOutcome::OpenFailed(_) => SessionEnd::OpenFailed,
            SessionOutcome::Failed(_) => SessionEnd::Failed,
            SessionOutcome::Stopped => SessionEnd::Stopped,
        }
    }
}

/// The session currently playing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NowPlaying {
    pub url: String,
    pub title: String,
    pub artist: String,
    pub position_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone)]
struct Track {
    url: String,
    title: String,
    artist: String,
}

struct Session {
    track: Track,
    lyric_text: Option<String>,
    lyric_url: Option<String>,
    started_at: Instant,
}

struct Shared {
    config: PlayerConfig,
    source: Arc<dyn StreamSource>,
    decoders: Arc<dyn DecoderFactory>,
    services: Services,
    scheduler: Scheduler,
    state: Arc<DeviceStateMachine>,
    progress: PlaybackProgress,
    replay: AntiReplayGuard,
    cache: Mutex<ProgressCache>,
    current: Mutex<Option<Track>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    last_end: Mutex<Option<SessionEnd>>,
}

/// Owner of the playback worker
pub struct MusicPlayer {
    shared: Arc<Shared>,
    play_lock: Mutex<()>,
}

impl MusicPlayer {
    pub fn new(
        config: PlayerConfig,
        services: Services,
        scheduler: Scheduler,
        state: Arc<DeviceStateMachine>,
        source: Arc<dyn StreamSource>,
        decoders: Arc<dyn DecoderFactory>,
    ) -> Self {
        let replay = AntiReplayGuard::new(config.replay_window);
        let cache = Mutex::new(ProgressCache::new(config.cache_capacity));
        Self {
            shared: Arc::new(Shared {
                config,
                source,
                decoders,
                services,
                scheduler,
                state,
                progress: PlaybackProgress::default(),
                replay,
                cache,
                current: Mutex::new(None),
                worker: Mutex::new(None),
                last_end: Mutex::new(None),
            }),
            play_lock: Mutex::new(()),
        }
    }

    /// Start streaming `request.url`, replacing any active session
    ///
    /// Blocks until the previous worker has exited, then runs `interrupt`
    /// (which ends the voice conversation) before the new worker starts.
    pub fn play<F>(&self, request: PlayRequest, interrupt: F) -> Result<PlayOutcome, PlaybackError>
    where
        F: FnOnce(),
    {
        let url = request.url.trim();
        if url.is_empty() {
            return Err(PlaybackError::EmptyUrl);
        }

        let _serial = self.play_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Err(elapsed) = self.shared.replay.check(url, Instant::now()) {
            warn!(
                url,
                elapsed_ms = elapsed.as_millis() as u64,
                "ignoring replay of a track that just ended"
            );
            return Ok(PlayOutcome::ReplaySuppressed);
        }

        self.stop()?;
        interrupt();
        self.start(request)?;
        Ok(PlayOutcome::Started)
    }

    /// Ask the active worker to stop and wait for it to exit
    ///
    /// Returns immediately when nothing is playing. A worker that is still
    /// alive after the configured timeout stays registered, so no new
    /// session can start until it is gone.
    pub fn stop(&self) -> Result<(), PlaybackError> {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.config.stop_timeout;

        loop {
            {
                let mut worker = shared.worker.lock().unwrap_or_else(PoisonError::into_inner);
                let finished = match worker.as_ref() {
                    None => return Ok(()),
                    Some(handle) => handle.is_finished(),
                };
                if finished {
                    if let Some(handle) = worker.take() {
                        // Panics are caught inside the worker
                        let _ = handle.join();
                    }
                    return Ok(());
                }
                shared.progress.request_stop();
            }

            if Instant::now() >= deadline {
                error!(
                    timeout_ms = shared.config.stop_timeout.as_millis() as u64,
                    "playback worker did not stop"
                );
                return Err(PlaybackError::StuckWorker(shared.config.stop_timeout));
            }
            thread::sleep(shared.config.stop_poll_interval);
        }
    }

    pub fn is_playing(&self) -> bool {
        self.shared.progress.is_playing()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.shared.progress.snapshot()
    }

    pub fn now_playing(&self) -> Option<NowPlaying> {
        let current = self.shared.current.lock().unwrap_or_else(PoisonError::into_inner);
        current.as_ref().map(|track| NowPlaying {
            url: track.url.clone(),
            title: track.title.clone(),
            artist: track.artist.clone(),
            position_ms: self.shared.progress.position_ms(),
            total_ms: self.shared.progress.total_ms(),
        })
    }

    /// Cached progress of earlier sessions, oldest first
    pub fn history(&self) -> Vec<(String, CachedProgress)> {
        let cache = self.shared.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.iter().map(|(url, p)| (url.to_string(), p.clone())).collect()
    }

    pub fn last_end(&self) -> Option<SessionEnd> {
        *self.shared.last_end.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self, request: PlayRequest) -> Result<(), PlaybackError> {
        let shared = &self.shared;
        let track = Track {
            url: request.url.trim().to_string(),
            title: non_empty(request.title).unwrap_or_else(|| strings::UNKNOWN_TITLE.to_string()),
            artist: non_empty(request.artist).unwrap_or_else(|| strings::UNKNOWN_ARTIST.to_string()),
        };

        // Held until the handle is stored, so a concurrent stop() never
        // sees a playing session without its worker
        let mut worker = shared.worker.lock().unwrap_or_else(PoisonError::into_inner);

        let claim = OutputClaim::acquire(&shared.services);
        shared.progress.begin();
        *shared.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(track.clone());
        *shared.last_end.lock().unwrap_or_else(PoisonError::into_inner) = None;

        let display = Arc::clone(&shared.services.display);
        let (title, artist) = (track.title.clone(), track.artist.clone());
        shared.scheduler.schedule(move || {
            display.switch_page(Page::Music);
            display.set_status(strings::MUSIC_PLAYING);
            display.set_chat_message(ChatRole::System, &format!("Now playing: {title}"));
            display.set_music_info(&title, &artist);
            display.set_music_progress(0, 0);
            display.set_music_lyric("");
        });

        let session = Session {
            track,
            lyric_text: request.lyric_text,
            lyric_url: request.lyric_url,
            started_at: Instant::now(),
        };
        let worker_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name("music-playback".into())
            .spawn(move || run_session(&worker_shared, session, claim));

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to spawn playback worker");
                shared.progress.set_playing(false);
                *shared.current.lock().unwrap_or_else(PoisonError::into_inner) = None;
                Err(PlaybackError::Spawn(e))
            }
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Exclusive use of the output device at full power, released on drop
struct OutputClaim {
    services: Services,
}

impl OutputClaim {
    fn acquire(services: &Services) -> Self {
        services.audio.set_external_playback_active(true);
        services.board.set_power_save_level(PowerSaveLevel::Performance);
        Self {
            services: services.clone(),
        }
    }
}

impl Drop for OutputClaim {
    fn drop(&mut self) {
        self.services.audio.set_external_playback_active(false);
        self.services.board.set_power_save_level(PowerSaveLevel::LowPower);
    }
}

fn run_session(shared: &Shared, session: Session, claim: OutputClaim) {
    info!(url = %session.track.url, title = %session.track.title, "playback started");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| stream(shared, &session)))
        .unwrap_or(SessionOutcome::Failed(PlaybackError::Panicked));
    drop(claim);

    finish(shared, &session, outcome);
}

/// Stream until end of input, failure or stop request
fn stream(shared: &Shared, session: &Session) -> SessionOutcome {
    let config = &shared.config;
    let progress = &shared.progress;

    let mut lyrics = load_lyrics(shared, session);
    if !lyrics.is_empty() {
        progress.set_total(lyrics.total_ms());
    }

    let reader = match shared.source.open(&session.track.url) {
        Ok(reader) => reader,
        Err(e) => return SessionOutcome::OpenFailed(e),
    };
    let input = StreamReader {
        reader,
        progress,
        config,
    };
    let mut decoder = match shared.decoders.create(Box::new(input)) {
        Ok(decoder) => decoder,
        Err(e) => return SessionOutcome::Failed(e),
    };

    let codec = &shared.services.codec;
    if !codec.output_enabled() {
        codec.enable_output(true);
    }
    let mut sink = PcmSink::new(shared, codec.output_sample_rate(), codec.output_channels());

    loop {
        if progress.stop_requested() {
            return SessionOutcome::Stopped;
        }
        match decoder.next_block() {
            Ok(Some(block)) => {
                if let Err(e) = sink.write_block(block, &mut lyrics) {
                    return SessionOutcome::Failed(e);
                }
            }
            Ok(None) => break,
            Err(e) => return SessionOutcome::Failed(e),
        }
    }
    if progress.stop_requested() {
        return SessionOutcome::Stopped;
    }

    match sink.flush(&mut lyrics) {
        Ok(()) => SessionOutcome::Finished,
        Err(e) => SessionOutcome::Failed(e),
    }
}

/// Blocking view of the stream handed to the decoder
///
/// Empty reads are waited out here. End of input is reported only after
/// `empty_read_limit` of them in a row, or once a stop is requested.
struct StreamReader<'a> {
    reader: Box<dyn ChunkReader>,
    progress: &'a PlaybackProgress,
    config: &'a PlayerConfig,
}

impl Read for StreamReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let len = buf.len().min(self.config.read_chunk_size.max(1));
        if len == 0 {
            return Ok(0);
        }

        let mut empty_reads = 0u32;
        loop {
            if self.progress.stop_requested() {
                return Ok(0);
            }
            match self.reader.read_chunk(&mut buf[..len]) {
                Ok(0) => {}
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            empty_reads += 1;
            if empty_reads >= self.config.empty_read_limit {
                debug!(empty_reads, "stream drained");
                return Ok(0);
            }
            thread::sleep(self.config.empty_read_interval);
        }
    }
}

fn load_lyrics(shared: &Shared, session: &Session) -> LyricCursor {
    let inline = non_empty(session.lyric_text.clone());
    let text = match (inline, non_empty(session.lyric_url.clone())) {
        (Some(text), _) => Some(text),
        (None, Some(url)) => match shared.source.fetch_text(&url) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(url, error = %e, "lyric download failed, playing without lyrics");
                None
            }
        },
        (None, None) => None,
    };
    let Some(text) = text else {
        return LyricCursor::default();
    };

    let lines = parse_lrc(&text);
    if lines.is_empty() {
        // Untimed lyrics are shown as-is
        let display = Arc::clone(&shared.services.display);
        shared.scheduler.schedule(move || display.set_music_lyric(&text));
    } else {
        debug!(lines = lines.len(), "lyrics loaded");
    }
    LyricCursor::new(lines)
}

/// Converts decoded blocks to the codec format and tracks position
struct PcmSink<'a> {
    shared: &'a Shared,
    out_rate: u32,
    out_channels: u16,
    resampler: Option<StreamResampler>,
    written_frames: u64,
    shown_second: Option<u64>,
}

impl<'a> PcmSink<'a> {
    fn new(shared: &'a Shared, out_rate: u32, out_channels: u16) -> Self {
        Self {
            shared,
            out_rate: out_rate.max(1),
            out_channels: out_channels.max(1),
            resampler: None,
            written_frames: 0,
            shown_second: None,
        }
    }

    fn write_block(&mut self, block: PcmBlock, lyrics: &mut LyricCursor) -> Result<(), PlaybackError> {
        let pcm = remap_channels(block.samples, block.channels, self.out_channels);
        if block.sample_rate == 0 || block.sample_rate == self.out_rate {
            self.emit(&pcm, lyrics);
            return Ok(());
        }

        let resampler = match self.resampler.take() {
            Some(r) if r.from_rate() == block.sample_rate => r,
            _ => StreamResampler::new(block.sample_rate, self.out_rate, self.out_channels)?,
        };
        let out = self.resampler.insert(resampler).process(&pcm)?;
        self.emit(&out, lyrics);
        Ok(())
    }

    fn flush(&mut self, lyrics: &mut LyricCursor) -> Result<(), PlaybackError> {
        if let Some(resampler) = self.resampler.as_mut() {
            let tail = resampler.flush()?;
            self.emit(&tail, lyrics);
        }
        Ok(())
    }

    fn emit(&mut self, pcm: &[i16], lyrics: &mut LyricCursor) {
        if pcm.is_empty() {
            return;
        }
        let shared = self.shared;
        shared.services.codec.write(pcm);

        self.written_frames += (pcm.len() / usize::from(self.out_channels)) as u64;
        let position_ms = self.written_frames * 1000 / u64::from(self.out_rate);
        shared.progress.set_position(position_ms);

        if let Some(view) = lyrics.advance(position_ms) {
            let text = view.to_display_text();
            let display = Arc::clone(&shared.services.display);
            shared.scheduler.schedule(move || display.set_music_lyric(&text));
        }

        // Progress bar at one-second granularity
        let second = position_ms / 1000;
        if self.shown_second != Some(second) {
            self.shown_second = Some(second);
            let total_ms = shared.progress.total_ms();
            let display = Arc::clone(&shared.services.display);
            shared
                .scheduler
                .schedule(move || display.set_music_progress(position_ms, total_ms));
        }
    }
}

fn finish(shared: &Shared, session: &Session, outcome: SessionOutcome) {
    let track = &session.track;
    let position_ms = shared.progress.position_ms();
    let total_ms = shared.progress.total_ms();
    let elapsed_ms = session.started_at.elapsed().as_millis() as u64;

    shared.progress.set_playing(false);
    shared.progress.clear_stop();
    shared.replay.record(&track.url, Instant::now());

    if position_ms > 0 {
        let evicted = shared
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                &track.url,
                CachedProgress {
                    title: track.title.clone(),
                    position_ms,
                    total_ms,
                },
            );
        if let Some(evicted) = evicted {
            debug!(url = %evicted, "evicted cached progress");
        }
    }

    match &outcome {
        SessionOutcome::Finished => info!(url = %track.url, position_ms, elapsed_ms, "playback finished"),
        SessionOutcome::Stopped => info!(url = %track.url, position_ms, "playback stopped"),
        SessionOutcome::OpenFailed(e) => warn!(url = %track.url, error = %e, "stream could not be opened"),
        SessionOutcome::Failed(e) => error!(url = %track.url, position_ms, error = %e, "playback failed"),
    }

    *shared.last_end.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome.end());
    *shared.current.lock().unwrap_or_else(PoisonError::into_inner) = None;

    post_outcome(shared, &outcome);
}

/// Message shown for a failed session, `None` for normal endings
fn failure_message(outcome: &SessionOutcome) -> Option<&'static str> {
    match outcome {
        SessionOutcome::OpenFailed(PlaybackError::HttpStatus(_)) => {
            Some("Playback failed: resource unavailable")
        }
        SessionOutcome::OpenFailed(_) => Some("Playback failed: invalid link or network error"),
        SessionOutcome::Failed(_) => Some("Playback failed, please try again later"),
        SessionOutcome::Finished | SessionOutcome::Stopped => None,
    }
}

fn post_outcome(shared: &Shared, outcome: &SessionOutcome) {
    let display = Arc::clone(&shared.services.display);
    let state = Arc::clone(&shared.state);
    let end = outcome.end();
    let failure = failure_message(outcome);

    shared.scheduler.schedule(move || {
        match failure {
            Some(message) => {
                display.set_music_lyric(message);
                display.show_notification(message, Duration::from_secs(3));
            }
            None => {
                display.set_music_lyric("");
                display.set_music_progress(0, 0);
            }
        }
        if end == SessionEnd::Finished {
            display.show_notification("Playback finished", Duration::from_secs(2));
            display.switch_page(Page::Home);
        }
        if state.state() == DeviceState::Idle {
            display.set_status(strings::STANDBY);
        }
    });
}
