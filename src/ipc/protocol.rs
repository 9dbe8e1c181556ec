//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::orchestrator::DeviceStatus;
use crate::state::DeviceState;
use crate::tools::ToolInfo;

/// Requests from local clients to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Ping to check connectivity
    Ping,

    /// Request the current device status
    GetStatus,

    /// Same as pressing the chat button
    ToggleChat,

    /// Push-to-talk pressed
    StartListening,

    /// Push-to-talk released
    StopListening,

    /// Describe the available tools
    ListTools,

    /// Run a tool
    CallTool {
        name: String,
        #[serde(default)]
        arguments: Value,
    },

    /// Subscribe to state change notifications
    Subscribe,
}

/// Responses from the daemon
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,

    Status(DeviceStatus),

    /// The intent was queued for the orchestrator
    Accepted,

    Tools { tools: Vec<ToolInfo> },

    ToolResult { text: String, is_error: bool },

    Subscribed,

    Error { code: String, message: String },
}

impl Response {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Response::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Push notification for subscribed clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    StateChanged { from: DeviceState, to: DeviceState },
}
