//! Configuration loading and management

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::activation::ActivationPolicy;
use crate::device::AecMode;
use crate::media::PlayerConfig;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// Persistent settings (reminders, pending downloads)
    pub settings_path: PathBuf,

    /// Version check endpoint
    pub ota_url: String,

    pub aec_mode: AecMode,

    pub output_sample_rate: u32,
    pub output_channels: u16,

    /// Connect timeout for music streams
    pub stream_connect_timeout: Duration,

    pub player: PlayerConfig,
    pub activation: ActivationPolicy,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = match lookup("VOXCORE_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => {
                let home = lookup("HOME").context("HOME is not set")?;
                PathBuf::from(home).join(".local").join("share").join("voxcore")
            }
        };
        let socket_path = data_dir.join("daemon.sock");
        let settings_path = data_dir.join("settings.json");

        let defaults = PlayerConfig::default();
        let player = PlayerConfig {
            read_chunk_size: parse(&lookup, "VOXCORE_READ_CHUNK_SIZE")?
                .unwrap_or(defaults.read_chunk_size),
            empty_read_limit: parse(&lookup, "VOXCORE_EMPTY_READ_LIMIT")?
                .unwrap_or(defaults.empty_read_limit),
            empty_read_interval: millis(&lookup, "VOXCORE_EMPTY_READ_INTERVAL_MS")?
                .unwrap_or(defaults.empty_read_interval),
            stop_timeout: millis(&lookup, "VOXCORE_STOP_TIMEOUT_MS")?
                .unwrap_or(defaults.stop_timeout),
            replay_window: millis(&lookup, "VOXCORE_REPLAY_WINDOW_MS")?
                .unwrap_or(defaults.replay_window),
            cache_capacity: parse(&lookup, "VOXCORE_CACHE_CAPACITY")?
                .unwrap_or(defaults.cache_capacity),
            ..defaults
        };

        let defaults = ActivationPolicy::default();
        let activation = ActivationPolicy {
            max_check_attempts: parse(&lookup, "VOXCORE_MAX_CHECK_ATTEMPTS")?
                .unwrap_or(defaults.max_check_attempts),
            initial_retry_delay: millis(&lookup, "VOXCORE_RETRY_DELAY_MS")?
                .unwrap_or(defaults.initial_retry_delay),
            max_activation_attempts: parse(&lookup, "VOXCORE_MAX_ACTIVATION_ATTEMPTS")?
                .unwrap_or(defaults.max_activation_attempts),
            ..defaults
        };

        Ok(Self {
            socket_path,
            settings_path,
            data_dir,
            ota_url: lookup("VOXCORE_OTA_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8002/ota/".to_string()),
            aec_mode: parse(&lookup, "VOXCORE_AEC")?.unwrap_or_default(),
            output_sample_rate: parse(&lookup, "VOXCORE_OUTPUT_RATE")?.unwrap_or(24_000),
            output_channels: parse(&lookup, "VOXCORE_OUTPUT_CHANNELS")?.unwrap_or(1),
            stream_connect_timeout: millis(&lookup, "VOXCORE_CONNECT_TIMEOUT_MS")?
                .unwrap_or(Duration::from_secs(10)),
            player,
            activation,
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create {}", self.data_dir.display()))?;
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
    }
}

fn millis<F>(lookup: &F, key: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse::<u64, F>(lookup, key)?.map(Duration::from_millis))
}
