use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Immutable, constructed once at process start.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub cp_url: String,
    pub auth_token: String,
    pub runner_name: String,
    pub reconnect_delay_initial: std::time::Duration,
    pub reconnect_delay_max: std::time::Duration,
    pub heartbeat_interval: std::time::Duration,
    pub health_check_interval: std::time::Duration,
}

/// Single-writer connection state machine, owned by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

/// How a tool provider is reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderDefinition {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
    },
}

/// Connection status of a single tool provider, distinct from the
/// engine-level `ConnectionState`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Connecting,
    Connected,
    Failed,
    Disconnected,
}

/// Supervisor-owned record for one configured tool provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub name: String,
    pub definition: ProviderDefinition,
    pub connection_status: ProviderStatus,
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ProviderRecord {
    pub fn new(name: String, definition: ProviderDefinition) -> Self {
        Self {
            name,
            definition,
            connection_status: ProviderStatus::Connecting,
            tools: Vec::new(),
            last_error: None,
            last_checked_at: None,
        }
    }
}

/// Derived view over provider records — never mutated directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolAvailability {
    pub available: HashSet<String>,
    pub unavailable: HashSet<String>,
}

impl ToolAvailability {
    pub fn from_records<'a>(records: impl Iterator<Item = &'a ProviderRecord>) -> Self {
        let mut available = HashSet::new();
        let mut unavailable = HashSet::new();
        for record in records {
            if record.connection_status == ProviderStatus::Connected {
                available.extend(record.tools.iter().cloned());
            } else {
                unavailable.insert(record.name.clone());
            }
        }
        Self {
            available,
            unavailable,
        }
    }
}

/// Free-form JSON-RPC request as received off the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Reserved and custom JSON-RPC error codes used on the wire.
pub mod error_code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub const AUTH_FAILED: i64 = -32000;
    pub const RUNNER_NOT_FOUND: i64 = -32001;
    pub const TOOL_UNAVAILABLE: i64 = -32002;
    pub const WORKFLOW_FAILED: i64 = -32003;
    pub const CONFIG_INVALID: i64 = -32004;

    pub const EXECUTOR_NOT_INITIALIZED: i64 = -32005;
}

/// String error codes used inside the data-shaped `{"status":"error",
/// "error":{"code",...}}` payloads that `workflow/execute` and `tool/call`
/// return as their JSON-RPC `result` (as opposed to `error_code`'s numeric
/// codes, which apply to an actual JSON-RPC-level `error` object). Matches
/// the original runner's executor response shape.
pub mod executor_error_code {
    pub const EXECUTOR_NOT_INITIALIZED: &str = "EXECUTOR_NOT_INITIALIZED";
    pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
    pub const TOOL_UNAVAILABLE: &str = "TOOL_UNAVAILABLE";
    pub const EXECUTION_FAILED: &str = "EXECUTION_FAILED";
}

/// Method name constants for the runner/CP wire protocol.
pub mod method {
    pub const RUNNER_REGISTER: &str = "runner/register";
    pub const RUNNER_HEARTBEAT: &str = "runner/heartbeat";
    pub const RUNNER_AVAILABILITY: &str = "runner/availability";
    pub const TOOL_PROXY: &str = "tool/proxy";
    pub const CONFIG_PUSH: &str = "config/push";
    pub const WORKFLOW_EXECUTE: &str = "workflow/execute";
    pub const TOOL_CALL: &str = "tool/call";
}
