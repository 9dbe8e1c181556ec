//! JSON-RPC front for the tool registry, carried in `mcp` protocol messages

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{ToolError, ToolRegistry};

const PROTOCOL_VERSION: &str = "2024-11-05";

const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

pub struct McpServer {
    registry: Arc<ToolRegistry>,
}

impl McpServer {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Answer one JSON-RPC message; notifications get no reply
    ///
    /// Tool calls may block, so call this off the orchestrator thread.
    pub fn handle_message(&self, message: &Value) -> Option<Value> {
        let request: RpcRequest = match serde_json::from_value(message.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "malformed MCP message");
                return Some(error_reply(Value::Null, INVALID_REQUEST, &e.to_string()));
            }
        };
        let Some(id) = request.id else {
            debug!(method = %request.method, "MCP notification");
            return None;
        };

        let reply = match request.method.as_str() {
            "initialize" => result_reply(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "voxcore", "version": env!("CARGO_PKG_VERSION")},
                }),
            ),
            "tools/list" => result_reply(id, json!({ "tools": self.registry.list() })),
            "tools/call" => self.call_tool(id, request.params),
            other => error_reply(id, METHOD_NOT_FOUND, &format!("method not found: {other}")),
        };
        Some(reply)
    }

    fn call_tool(&self, id: Value, params: Value) -> Value {
        let params: CallParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => return error_reply(id, INVALID_PARAMS, &e.to_string()),
        };

        match self.registry.call(&params.name, &params.arguments) {
            Ok(text) => result_reply(id, tool_result(&text, false)),
            Err(ToolError::UnknownTool(name)) => {
                error_reply(id, INVALID_PARAMS, &format!("unknown tool: {name}"))
            }
            Err(e) => result_reply(id, tool_result(&e.to_string(), true)),
        }
    }
}

fn tool_result(text: &str, is_error: bool) -> Value {
    json!({
        "content": [{"type": "text", "text": text}],
        "isError": is_error,
    })
}

fn result_reply(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error_reply(id: Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}
