//! External collaborators of the runtime core
//!
//! Each collaborator is a trait so the board (or a test) supplies the
//! concrete implementation. [`Services`] bundles them into the context
//! object handed to every component at startup.

mod audio;
mod board;
mod display;
pub mod host;
mod ota;
mod protocol;

use std::sync::Arc;

pub use audio::{AecMode, AudioCodec, AudioService, Sound};
pub use board::{Board, PowerSaveLevel};
pub use display::{strings, ChatRole, Display, LogDisplay, Page};
pub use ota::{ActivationInfo, FirmwareInfo, HttpOta, Ota, OtaError, ProgressFn, VersionInfo};
pub use protocol::{
    AbortReason, AudioPacket, Protocol, ProtocolEvent, ProtocolEventSink, ServerMessage, TtsState,
};

use crate::store::SettingsStore;

/// Collaborators shared by the orchestrator, pipeline and workers
#[derive(Clone)]
pub struct Services {
    pub protocol: Arc<dyn Protocol>,
    pub audio: Arc<dyn AudioService>,
    pub codec: Arc<dyn AudioCodec>,
    pub display: Arc<dyn Display>,
    pub board: Arc<dyn Board>,
    pub ota: Arc<dyn Ota>,
    pub settings: Arc<dyn SettingsStore>,
}
