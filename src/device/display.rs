//! Display collaborator
//!
//! Rendering is external. Every method here mutates UI state and must be
//! called from the orchestrator thread (a handler or a scheduled task).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::store::Reminder;

/// User-visible status strings
pub mod strings {
    pub const STANDBY: &str = "Standby";
    pub const CONNECTING: &str = "Connecting...";
    pub const LISTENING: &str = "Listening...";
    pub const SPEAKING: &str = "Speaking...";
    pub const ERROR: &str = "Error";
    pub const ACTIVATION: &str = "Activation";
    pub const CHECKING_NEW_VERSION: &str = "Checking for new version...";
    pub const LOADING_PROTOCOL: &str = "Logging in...";
    pub const LOADING_ASSETS: &str = "Loading assets...";
    pub const OTA_UPGRADE: &str = "Upgrade";
    pub const UPGRADING: &str = "System is upgrading...";
    pub const UPGRADE_FAILED: &str = "Upgrade failed";
    pub const DOWNLOAD_ASSETS_FAILED: &str = "Failed to download assets";
    pub const PLEASE_WAIT: &str = "Please wait...";
    pub const VERSION: &str = "Version ";
    pub const NEW_VERSION: &str = "New version ";
    pub const MUSIC_PLAYING: &str = "Playing music";
    pub const AEC_OFF: &str = "Realtime chat off";
    pub const AEC_ON: &str = "Realtime chat on";
    pub const UNKNOWN_TITLE: &str = "Unknown title";
    pub const UNKNOWN_ARTIST: &str = "Unknown artist";
}

/// Who a chat bubble belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// Screens the device can show
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Page {
    Home,
    Music,
    Countdown,
    Memo,
}

impl std::str::FromStr for Page {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "home" | "weather" => Ok(Page::Home),
            "music" => Ok(Page::Music),
            "countdown" | "pomodoro" => Ok(Page::Countdown),
            "memo" | "reminders" => Ok(Page::Memo),
            other => Err(format!(
                "unknown page '{other}', expected one of: home, music, countdown, memo"
            )),
        }
    }
}

pub trait Display: Send + Sync {
    fn set_status(&self, status: &str);
    fn set_emotion(&self, emotion: &str);
    fn set_chat_message(&self, role: ChatRole, content: &str);
    fn clear_chat_messages(&self);
    fn show_notification(&self, message: &str, duration: Duration);
    fn update_status_bar(&self, force: bool);
    fn set_music_info(&self, title: &str, artist: &str);
    fn set_music_progress(&self, position_ms: u64, total_ms: u64);
    fn set_music_lyric(&self, lyric: &str);
    fn switch_page(&self, page: Page);
    fn show_reminders(&self, reminders: &[Reminder]);
    fn set_countdown(&self, remaining: &str, running: bool);
}

/// Display that writes every UI change to the log (headless hosts)
#[derive(Debug, Default)]
pub struct LogDisplay;

impl Display for LogDisplay {
    fn set_status(&self, status: &str) {
        info!(status, "display status");
    }

    fn set_emotion(&self, emotion: &str) {
        info!(emotion, "display emotion");
    }

    fn set_chat_message(&self, role: ChatRole, content: &str) {
        if !content.is_empty() {
            info!(role = role.as_str(), content, "display chat");
        }
    }

    fn clear_chat_messages(&self) {}

    fn show_notification(&self, message: &str, duration: Duration) {
        info!(message, duration_ms = duration.as_millis() as u64, "display notification");
    }

    fn update_status_bar(&self, _force: bool) {}

    fn set_music_info(&self, title: &str, artist: &str) {
        info!(title, artist, "display now playing");
    }

    fn set_music_progress(&self, _position_ms: u64, _total_ms: u64) {}

    fn set_music_lyric(&self, lyric: &str) {
        if !lyric.is_empty() {
            info!(lyric, "display lyric");
        }
    }

    fn switch_page(&self, page: Page) {
        info!(?page, "display page");
    }

    fn show_reminders(&self, reminders: &[Reminder]) {
        info!(count = reminders.len(), "display reminders");
    }

    fn set_countdown(&self, remaining: &str, running: bool) {
        info!(remaining, running, "display countdown");
    }
}
