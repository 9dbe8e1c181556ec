//! Device tools callable by the assistant (and the local IPC socket)
//!
//! Each tool is a name, a description, a JSON schema for its arguments and
//! a handler returning a short human-readable result.

mod countdown;
mod display;
mod mcp;
mod memo;
mod music;

use std::sync::{Arc, Weak};

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub use countdown::{format_mm_ss, CountdownState, CountdownStatus, CountdownTimer};
pub use mcp::McpServer;
pub use memo::{parse_time_label, MemoBook};

use crate::device::Services;
use crate::orchestrator::{Application, Scheduler};

/// Errors returned by tool calls
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("missing argument `{0}`")]
    MissingArgument(&'static str),

    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    #[error("{0}")]
    Failed(String),

    #[error("device is shutting down")]
    Unavailable,
}

/// Typed access to the `arguments` object of a call
pub struct Args<'a> {
    map: Option<&'a Map<String, Value>>,
}

impl<'a> Args<'a> {
    pub fn new(value: &'a Value) -> Self {
        Self {
            map: value.as_object(),
        }
    }

    fn get(&self, name: &str) -> Option<&'a Value> {
        self.map.and_then(|m| m.get(name)).filter(|v| !v.is_null())
    }

    /// Optional string, trimmed; empty strings read as absent
    pub fn opt_str(&self, name: &'static str) -> Result<Option<&'a str>, ToolError> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::String(s)) => {
                let s = s.trim();
                Ok((!s.is_empty()).then_some(s))
            }
            Some(other) => Err(ToolError::InvalidArgument {
                name,
                reason: format!("expected a string, got {other}"),
            }),
        }
    }

    pub fn str(&self, name: &'static str) -> Result<&'a str, ToolError> {
        self.opt_str(name)?.ok_or(ToolError::MissingArgument(name))
    }

    /// Optional integer; numeric strings are accepted
    pub fn opt_u64(&self, name: &'static str) -> Result<Option<u64>, ToolError> {
        let invalid = |value: &Value| ToolError::InvalidArgument {
            name,
            reason: format!("expected a non-negative integer, got {value}"),
        };
        match self.get(name) {
            None => Ok(None),
            Some(value @ Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| invalid(value)),
            Some(value @ Value::String(s)) => {
                s.trim().parse().map(Some).map_err(|_| invalid(value))
            }
            Some(other) => Err(invalid(other)),
        }
    }

    pub fn u64(&self, name: &'static str) -> Result<u64, ToolError> {
        self.opt_u64(name)?.ok_or(ToolError::MissingArgument(name))
    }
}

type Handler = Box<dyn Fn(&Args<'_>) -> Result<String, ToolError> + Send + Sync>;

struct ToolEntry {
    info: ToolInfo,
    handler: Handler,
}

/// Public description of one tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Ordered set of tools
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; a later registration with the same name replaces it
    pub fn add<F>(&mut self, name: &'static str, description: &'static str, input_schema: Value, handler: F)
    where
        F: Fn(&Args<'_>) -> Result<String, ToolError> + Send + Sync + 'static,
    {
        self.tools.retain(|t| t.info.name != name);
        self.tools.push(ToolEntry {
            info: ToolInfo {
                name,
                description,
                input_schema,
            },
            handler: Box::new(handler),
        });
    }

    pub fn list(&self) -> Vec<ToolInfo> {
        self.tools.iter().map(|t| t.info.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.info.name == name)
    }

    /// Run a tool; may block (tools stop playback or touch storage)
    pub fn call(&self, name: &str, arguments: &Value) -> Result<String, ToolError> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.info.name == name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let result = (tool.handler)(&Args::new(arguments));
        match &result {
            Ok(_) => tracing::info!(tool = name, "tool call succeeded"),
            Err(e) => tracing::warn!(tool = name, error = %e, "tool call failed"),
        }
        result
    }
}

/// JSON schema for an object with the given properties
pub(crate) fn object_schema(properties: Value, required: &[&str]) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Build the full tool set of the device
pub fn build_registry(
    app: &Arc<Application>,
    countdown: Arc<CountdownTimer>,
    services: Services,
    scheduler: Scheduler,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let weak: Weak<Application> = Arc::downgrade(app);
    music::register(&mut registry, weak);
    display::register(&mut registry, services.clone(), scheduler.clone());
    countdown::register(&mut registry, countdown);
    memo::register(&mut registry, Arc::new(MemoBook::new(services, scheduler)));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.add(
            "self.echo",
            "Echo the text back",
            object_schema(json!({"text": {"type": "string"}}), &["text"]),
            |args| Ok(args.str("text")?.to_string()),
        );
        registry
    }

    #[test]
    fn test_call_dispatches_by_name() {
        let registry = echo_registry();
        assert_eq!(registry.call("self.echo", &json!({"text": " hi "})).unwrap(), "hi");
        assert!(matches!(
            registry.call("self.nope", &json!({})),
            Err(ToolError::UnknownTool(_))
        ));
    }

    #[test]
    fn test_missing_and_invalid_arguments() {
        let registry = echo_registry();
        assert!(matches!(
            registry.call("self.echo", &json!({})),
            Err(ToolError::MissingArgument("text"))
        ));
        assert!(matches!(
            registry.call("self.echo", &json!({"text": 3})),
            Err(ToolError::InvalidArgument { name: "text", .. })
        ));
    }

    #[test]
    fn test_integer_arguments_accept_numeric_strings() {
        let value = json!({"a": 3, "b": "12", "c": -1, "d": "x"});
        let args = Args::new(&value);
        assert_eq!(args.u64("a").unwrap(), 3);
        assert_eq!(args.u64("b").unwrap(), 12);
        assert!(args.u64("c").is_err());
        assert!(args.u64("d").is_err());
        assert_eq!(args.opt_u64("missing").unwrap(), None);
    }

    #[test]
    fn test_list_serializes_input_schema_key() {
        let registry = echo_registry();
        let listed = serde_json::to_value(registry.list()).unwrap();
        assert_eq!(listed[0]["name"], "self.echo");
        assert_eq!(listed[0]["inputSchema"]["required"][0], "text");
    }
}
