//! Wire protocol envelopes
//!
//! Every frame is a single JSON object tagged by `"type"`. Field names use
//! camelCase on the wire (`correlationId`, `appName`, `inputSchema`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Correlation identifier linking an invocation to its response
pub type CorrelationId = u64;

/// Arguments passed to a tool
pub type ToolArgs = Map<String, Value>;

/// Separator between application name and local tool name
pub const NAMESPACE_SEPARATOR: char = ':';

/// Build `{app}:{tool}`
pub fn namespaced_name(app_name: &str, tool_name: &str) -> String {
    format!("{app_name}{NAMESPACE_SEPARATOR}{tool_name}")
}

/// Split `{app}:{tool}` into its parts
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    let (app, tool) = name.split_once(NAMESPACE_SEPARATOR)?;
    if app.is_empty() || tool.is_empty() {
        return None;
    }
    Some((app, tool))
}

/// Description of a callable tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Namespaced name (`app:tool`)
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

/// Outcome of running a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(payload: Value) -> Self {
        Self {
            success: true,
            result: Some(payload),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(message.into()),
        }
    }

    pub fn not_found(tool: &str) -> Self {
        Self::failure(format!("Tool not found: {tool}"))
    }

    /// Payload of a successful result, `Null` if the tool returned nothing
    pub fn payload(&self) -> &Value {
        self.result.as_ref().unwrap_or(&Value::Null)
    }
}

/// A decoded `invoke` envelope
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub correlation_id: CorrelationId,
    pub tool: String,
    pub parameters: Option<ToolArgs>,
}

/// All envelopes exchanged between handler and proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Handler → proxy, sent after every successful connect
    #[serde(rename = "register", rename_all = "camelCase")]
    Register {
        app_name: String,
        tools: Vec<ToolDefinition>,
    },

    /// Proxy → handler tool call
    #[serde(rename = "invoke", alias = "toolInvocation", rename_all = "camelCase")]
    Invoke {
        correlation_id: CorrelationId,
        tool: String,
        #[serde(default)]
        parameters: Option<ToolArgs>,
    },

    /// Handler → proxy reply, echoing the request's correlation id
    #[serde(rename = "response", alias = "toolResponse", rename_all = "camelCase")]
    Response {
        correlation_id: CorrelationId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Proxy → handler catalog request; answered with a `response` whose
    /// result is the tool list
    #[serde(rename = "discover", rename_all = "camelCase")]
    Discover { correlation_id: CorrelationId },
}

impl Envelope {
    pub fn response(correlation_id: CorrelationId, outcome: ToolResult) -> Self {
        Envelope::Response {
            correlation_id,
            success: outcome.success,
            result: outcome.result,
            error: outcome.error,
        }
    }

    /// Parse a single frame
    pub fn parse(frame: &str) -> serde_json::Result<Self> {
        serde_json::from_str(frame)
    }

    /// Serialize to a single-line frame body (no trailing newline)
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// The `type` tag, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Register { .. } => "register",
            Envelope::Invoke { .. } => "invoke",
            Envelope::Response { .. } => "response",
            Envelope::Discover { .. } => "discover",
        }
    }
}

impl From<ToolInvocation> for Envelope {
    fn from(invocation: ToolInvocation) -> Self {
        Envelope::Invoke {
            correlation_id: invocation.correlation_id,
            tool: invocation.tool,
            parameters: invocation.parameters,
        }
    }
}
