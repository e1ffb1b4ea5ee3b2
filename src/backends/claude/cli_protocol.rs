//! Claude CLI JSON protocol.
//!
//! The CLI is run with `--input-format stream-json --output-format
//! stream-json`, so both directions carry newline-delimited JSON:
//! - `system`, `assistant`, `user`, `result` and `stream_event` records are
//!   application events
//! - `control_request` records are questions for us (`can_use_tool`,
//!   `hook_callback`) and `control_response` records answer the control
//!   requests we sent (`initialize`, `interrupt`, `set_model`, ...)
//!
//! Records are decoded into the serde types below at the boundary and then
//! classified into [`Inbound`] values; the engine never looks at raw JSON.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::tool_utils::tool_target;
use crate::backends::engine::{
    ControlRequest, HookCall, Inbound, PermissionReply, ToolPermissionRequest, WireProtocol,
};
use crate::backends::session::{ContentBlock, HookResponse, SessionEvent, ToolStatus};

// ============================================================================
// Incoming records
// ============================================================================

/// Top-level records emitted by the Claude CLI, tagged by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliEvent {
    System(SystemEvent),
    Assistant(AssistantEvent),
    User(UserEvent),
    Result(ResultEvent),
    /// Raw API stream event, sent with `--include-partial-messages`.
    StreamEvent(StreamEvent),
    ControlRequest(IncomingControlRequest),
    ControlResponse(IncomingControlResponse),
    KeepAlive,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemEvent {
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, rename = "apiKeySource")]
    pub api_key_source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantEvent {
    pub message: AssistantMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<CliContentBlock>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<UsageInfo>,
}

/// Content blocks inside assistant and user messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    Thinking {
        thinking: String,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        is_error: bool,
    },
    /// Keeps one unknown block from dropping the whole message.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEvent {
    #[serde(default)]
    pub message: Option<UserMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserMessage {
    /// Either a plain string or a list of blocks.
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultEvent {
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, alias = "cost_usd")]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamEvent {
    #[serde(default)]
    pub event: Value,
}

/// Token usage for one API call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageInfo {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

/// Control request sent by the CLI. The body is decoded per subtype.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingControlRequest {
    pub request_id: String,
    pub request: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct CanUseTool {
    tool_name: String,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    permission_suggestions: Option<Value>,
    #[serde(default)]
    blocked_path: Option<String>,
    #[serde(default)]
    tool_use_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct HookCallback {
    #[serde(default)]
    callback_id: Option<String>,
    #[serde(default)]
    tool_use_id: Option<String>,
    input: HookCallbackInput,
}

#[derive(Debug, Clone, Deserialize)]
struct HookCallbackInput {
    hook_event_name: String,
    #[serde(default)]
    tool_name: Option<String>,
    #[serde(default)]
    tool_input: Option<Value>,
}

/// Response to one of our control requests.
///
/// The CLI has emitted three layouts across versions:
/// 1. Flat: `{ "subtype": "...", "request_id": "..." }`
/// 2. Nested: `{ "response": { "subtype": "...", "request_id": "...", "response": {...} } }`
/// 3. Direct: `{ "request_id": "...", "response": {...result...} }`
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingControlResponse {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub response: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlResponseBody {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

const ENVELOPE_KEYS: [&str; 4] = ["subtype", "request_id", "response", "error"];

impl ControlResponseBody {
    /// Reads `response` either as an envelope or, when it carries none of
    /// the envelope keys, as the result payload itself.
    fn from_value(value: Value) -> Self {
        let is_envelope = value
            .as_object()
            .is_some_and(|map| ENVELOPE_KEYS.iter().any(|key| map.contains_key(*key)));
        if is_envelope {
            if let Ok(body) = serde_json::from_value::<ControlResponseBody>(value.clone()) {
                return body;
            }
        }
        ControlResponseBody {
            response: Some(value),
            ..Default::default()
        }
    }
}

impl IncomingControlResponse {
    /// Request id and outcome, wherever the CLI put them.
    pub fn into_result(self) -> Option<(String, Result<Value, String>)> {
        let body = self
            .response
            .map(ControlResponseBody::from_value)
            .unwrap_or_default();
        let request_id = body.request_id.or(self.request_id)?;
        let subtype = body
            .subtype
            .or(self.subtype)
            .unwrap_or_else(|| "success".to_string());

        let result = if subtype == "error" {
            Err(body.error.unwrap_or_else(|| "unknown error".to_string()))
        } else {
            Ok(body.response.unwrap_or(Value::Null))
        };
        Some((request_id, result))
    }
}

// ============================================================================
// Event translation
// ============================================================================

fn assistant_events(event: AssistantEvent) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    for block in event.message.content {
        match block {
            CliContentBlock::Text { text } => events.push(SessionEvent::Text { content: text }),
            CliContentBlock::Thinking { thinking } => {
                events.push(SessionEvent::Thinking { content: thinking })
            }
            CliContentBlock::ToolUse { id, name, input } => events.push(SessionEvent::ToolStart {
                target: tool_target(&name, &input),
                tool_use_id: id,
                tool_name: name,
            }),
            CliContentBlock::ToolResult { .. } | CliContentBlock::Unknown => {}
        }
    }
    if let Some(usage) = event.message.usage {
        events.push(SessionEvent::TokenUsage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_input_tokens,
            cache_creation_tokens: usage.cache_creation_input_tokens,
        });
    }
    events
}

fn user_events(event: UserEvent) -> Vec<SessionEvent> {
    let Some(message) = event.message else {
        return Vec::new();
    };
    let Ok(blocks) = serde_json::from_value::<Vec<CliContentBlock>>(message.content) else {
        return Vec::new();
    };
    blocks
        .into_iter()
        .filter_map(|block| match block {
            CliContentBlock::ToolResult { tool_use_id, is_error } => Some(SessionEvent::ToolEnd {
                tool_use_id,
                status: if is_error {
                    ToolStatus::Error
                } else {
                    ToolStatus::Completed
                },
            }),
            _ => None,
        })
        .collect()
}

fn classify_control_request(request: IncomingControlRequest) -> Inbound {
    let subtype = request
        .request
        .get("subtype")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let request_id = request.request_id;

    match subtype.as_str() {
        "can_use_tool" => match serde_json::from_value::<CanUseTool>(request.request) {
            Ok(body) => Inbound::Permission(ToolPermissionRequest {
                request_id,
                tool_name: body.tool_name,
                input: body.input,
                suggestions: body.permission_suggestions,
                tool_use_id: body.tool_use_id,
                blocked_path: body.blocked_path,
            }),
            Err(err) => {
                log::warn!("[claude] Malformed can_use_tool request: {}", err);
                Inbound::UnsupportedControl { request_id, subtype }
            }
        },
        "hook_callback" => match serde_json::from_value::<HookCallback>(request.request) {
            Ok(body) => Inbound::Hook(HookCall {
                request_id,
                callback_id: body.callback_id,
                hook_event_name: body.input.hook_event_name,
                tool_name: body.input.tool_name,
                tool_input: body.input.tool_input,
                tool_use_id: body.tool_use_id,
            }),
            Err(err) => {
                log::warn!("[claude] Malformed hook_callback request: {}", err);
                Inbound::UnsupportedControl { request_id, subtype }
            }
        },
        _ => Inbound::UnsupportedControl { request_id, subtype },
    }
}

// ============================================================================
// Outgoing records
// ============================================================================

fn control_response(request_id: &str, response: Value) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response,
        }
    })
}

fn cli_content(content: &[ContentBlock]) -> Value {
    if let [ContentBlock::Text { text }] = content {
        return Value::String(text.clone());
    }
    content
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => json!({"type": "text", "text": text}),
            ContentBlock::Image { media_type, data } => json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data},
            }),
        })
        .collect()
}

/// [`WireProtocol`] for the Claude CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaudeProtocol;

impl WireProtocol for ClaudeProtocol {
    fn classify(&self, record: Value) -> Inbound {
        let kind = match record.get("type").and_then(Value::as_str) {
            Some(kind) => kind.to_string(),
            None => {
                log::debug!("[claude] Ignoring untyped record: {}", record);
                return Inbound::Ignore;
            }
        };

        let event = match serde_json::from_value::<CliEvent>(record.clone()) {
            Ok(event) => event,
            Err(err) => {
                log::warn!("[claude] Failed to decode `{}` record: {}", kind, err);
                return Inbound::Events(vec![SessionEvent::Other { kind, payload: record }]);
            }
        };

        match event {
            CliEvent::System(system) if system.subtype == "init" => {
                Inbound::Events(vec![SessionEvent::SessionInit {
                    cli_session_id: system.session_id,
                    model: system.model,
                    auth_type: system.api_key_source,
                }])
            }
            CliEvent::System(_) => Inbound::Events(vec![SessionEvent::Other { kind, payload: record }]),
            CliEvent::Assistant(assistant) => Inbound::Events(assistant_events(assistant)),
            CliEvent::User(user) => Inbound::Events(user_events(user)),
            CliEvent::Result(result) => Inbound::Events(vec![SessionEvent::TurnComplete {
                success: result.subtype == "success" && !result.is_error,
                cost_usd: result.total_cost_usd,
                num_turns: result.num_turns,
                duration_ms: result.duration_ms,
                cli_session_id: result.session_id,
            }]),
            CliEvent::StreamEvent(stream) => {
                Inbound::Events(vec![SessionEvent::PartialMessage { payload: stream.event }])
            }
            CliEvent::ControlRequest(request) => classify_control_request(request),
            CliEvent::ControlResponse(response) => match response.into_result() {
                Some((request_id, result)) => Inbound::ControlResponse { request_id, result },
                None => {
                    log::debug!("[claude] Control response without request id");
                    Inbound::Ignore
                }
            },
            CliEvent::KeepAlive => Inbound::Ignore,
            CliEvent::Unknown => Inbound::Events(vec![SessionEvent::Other { kind, payload: record }]),
        }
    }

    fn encode_user_message(&self, session_id: Option<&str>, content: &[ContentBlock]) -> Value {
        json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": cli_content(content),
            },
            "parent_tool_use_id": null,
            "session_id": session_id.unwrap_or("default"),
        })
    }

    fn encode_control_request(&self, request_id: &str, request: &ControlRequest) -> Value {
        let mut body = Map::new();
        body.insert("subtype".to_string(), Value::from(request.subtype()));
        match request {
            ControlRequest::Initialize { hooks } => {
                if let Some(hooks) = hooks {
                    body.insert("hooks".to_string(), hooks.clone());
                }
            }
            ControlRequest::Interrupt => {}
            ControlRequest::SetModel(model) => {
                body.insert("model".to_string(), Value::from(model.as_str()));
            }
            ControlRequest::SetPermissionMode(mode) => {
                body.insert("mode".to_string(), Value::from(mode.as_str()));
            }
            ControlRequest::SetMaxThinkingTokens(tokens) => {
                body.insert("max_thinking_tokens".to_string(), json!(tokens));
            }
            ControlRequest::Custom { payload, .. } => {
                if let Value::Object(fields) = payload {
                    for (key, value) in fields {
                        if key != "subtype" {
                            body.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
        }
        json!({
            "type": "control_request",
            "request_id": request_id,
            "request": body,
        })
    }

    fn encode_permission_reply(&self, request: &ToolPermissionRequest, reply: &PermissionReply) -> Value {
        let response = match reply {
            PermissionReply::Allow {
                updated_input,
                updated_permissions,
            } => {
                // The CLI expects the input echoed back when it is not modified.
                let mut response = json!({
                    "behavior": "allow",
                    "updatedInput": updated_input.as_ref().unwrap_or(&request.input),
                });
                if let Some(permissions) = updated_permissions {
                    response["updatedPermissions"] = permissions.clone();
                }
                response
            }
            PermissionReply::Deny { message, interrupt } => json!({
                "behavior": "deny",
                "message": message,
                "interrupt": interrupt,
            }),
        };
        control_response(&request.request_id, response)
    }

    fn encode_hook_reply(&self, request_id: &str, response: &HookResponse) -> Value {
        let payload = serde_json::to_value(response).unwrap_or_else(|_| json!({"continue": true}));
        control_response(request_id, payload)
    }

    fn encode_control_error(&self, request_id: &str, message: &str) -> Value {
        json!({
            "type": "control_response",
            "response": {
                "subtype": "error",
                "request_id": request_id,
                "error": message,
            }
        })
    }

    fn config_option_request(&self, key: &str, value: &Value) -> Option<ControlRequest> {
        match key {
            "model" => value.as_str().map(|model| ControlRequest::SetModel(model.to_string())),
            "permissionMode" | "permission_mode" => value
                .as_str()
                .map(|mode| ControlRequest::SetPermissionMode(mode.to_string())),
            "maxThinkingTokens" | "max_thinking_tokens" => match value {
                Value::Null => Some(ControlRequest::SetMaxThinkingTokens(None)),
                other => other.as_u64().map(|n| ControlRequest::SetMaxThinkingTokens(Some(n))),
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(record: Value) -> Inbound {
        ClaudeProtocol.classify(record)
    }

    fn events(record: Value) -> Vec<SessionEvent> {
        match classify(record) {
            Inbound::Events(events) => events,
            other => panic!("Expected events, got {other:?}"),
        }
    }

    #[test]
    fn test_system_init() {
        let events = events(json!({
            "type": "system",
            "subtype": "init",
            "session_id": "abc123",
            "model": "claude-sonnet-4-5",
            "apiKeySource": "none"
        }));
        assert_eq!(
            events,
            vec![SessionEvent::SessionInit {
                cli_session_id: Some("abc123".to_string()),
                model: Some("claude-sonnet-4-5".to_string()),
                auth_type: Some("none".to_string()),
            }]
        );
    }

    #[test]
    fn test_assistant_blocks_and_usage() {
        let events = events(json!({
            "type": "assistant",
            "message": {
                "role": "assistant",
                "content": [
                    {"type": "thinking", "thinking": "Let me look"},
                    {"type": "text", "text": "Hello!"},
                    {"type": "tool_use", "id": "tool123", "name": "Read", "input": {"file_path": "/test.rs"}},
                    {"type": "server_tool_use", "id": "x"}
                ],
                "usage": {"input_tokens": 10, "output_tokens": 5, "cache_read_input_tokens": 100}
            }
        }));
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], SessionEvent::Thinking { content: "Let me look".to_string() });
        assert_eq!(events[1], SessionEvent::Text { content: "Hello!".to_string() });
        assert_eq!(
            events[2],
            SessionEvent::ToolStart {
                tool_use_id: "tool123".to_string(),
                tool_name: "Read".to_string(),
                target: "/test.rs".to_string(),
            }
        );
        assert_eq!(
            events[3],
            SessionEvent::TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                cache_read_tokens: 100,
                cache_creation_tokens: 0,
            }
        );
    }

    #[test]
    fn test_tool_results() {
        let ends = events(json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "ok"},
                    {"type": "tool_result", "tool_use_id": "t2", "content": "boom", "is_error": true}
                ]
            }
        }));
        assert_eq!(
            ends,
            vec![
                SessionEvent::ToolEnd { tool_use_id: "t1".to_string(), status: ToolStatus::Completed },
                SessionEvent::ToolEnd { tool_use_id: "t2".to_string(), status: ToolStatus::Error },
            ]
        );

        let plain = events(json!({"type": "user", "message": {"role": "user", "content": "hi"}}));
        assert!(plain.is_empty());
    }

    #[test]
    fn test_result_event() {
        let events = events(json!({
            "type": "result",
            "subtype": "success",
            "total_cost_usd": 0.001,
            "duration_ms": 5000,
            "num_turns": 2,
            "session_id": "session123"
        }));
        assert_eq!(
            events,
            vec![SessionEvent::TurnComplete {
                success: true,
                cost_usd: Some(0.001),
                num_turns: Some(2),
                duration_ms: Some(5000),
                cli_session_id: Some("session123".to_string()),
            }]
        );
    }

    #[test]
    fn test_unknown_record_passes_through() {
        let record = json!({"type": "rate_limit", "retry_after": 3});
        assert_eq!(
            events(record.clone()),
            vec![SessionEvent::Other { kind: "rate_limit".to_string(), payload: record }]
        );
        assert_eq!(classify(json!({"type": "keep_alive"})), Inbound::Ignore);
        assert_eq!(classify(json!([1, 2])), Inbound::Ignore);
    }

    #[test]
    fn test_can_use_tool() {
        let inbound = classify(json!({
            "type": "control_request",
            "request_id": "req_1",
            "request": {
                "subtype": "can_use_tool",
                "tool_name": "Bash",
                "input": {"command": "rm -rf build"},
                "permission_suggestions": [{"type": "setMode", "mode": "acceptEdits", "destination": "session"}],
                "tool_use_id": "toolu_1"
            }
        }));
        match inbound {
            Inbound::Permission(request) => {
                assert_eq!(request.request_id, "req_1");
                assert_eq!(request.tool_name, "Bash");
                assert_eq!(request.input["command"], "rm -rf build");
                assert_eq!(request.tool_use_id.as_deref(), Some("toolu_1"));
                assert!(request.suggestions.is_some());
                assert!(request.blocked_path.is_none());
            }
            other => panic!("Expected permission request, got {other:?}"),
        }
    }

    #[test]
    fn test_hook_callback() {
        let inbound = classify(json!({
            "type": "control_request",
            "request_id": "req_123",
            "request": {
                "subtype": "hook_callback",
                "callback_id": "pretool_0",
                "tool_use_id": "tool_456",
                "input": {
                    "hook_event_name": "PreToolUse",
                    "tool_name": "Bash",
                    "tool_input": {"command": "ls -la"}
                }
            }
        }));
        assert_eq!(
            inbound,
            Inbound::Hook(HookCall {
                request_id: "req_123".to_string(),
                callback_id: Some("pretool_0".to_string()),
                hook_event_name: "PreToolUse".to_string(),
                tool_name: Some("Bash".to_string()),
                tool_input: Some(json!({"command": "ls -la"})),
                tool_use_id: Some("tool_456".to_string()),
            })
        );
    }

    #[test]
    fn test_unknown_control_subtype() {
        let inbound = classify(json!({
            "type": "control_request",
            "request_id": "req_9",
            "request": {"subtype": "mcp_message", "server_name": "x"}
        }));
        assert_eq!(
            inbound,
            Inbound::UnsupportedControl {
                request_id: "req_9".to_string(),
                subtype: "mcp_message".to_string(),
            }
        );
    }

    #[test]
    fn test_control_response_layouts() {
        let nested = classify(json!({
            "type": "control_response",
            "response": {"subtype": "success", "request_id": "req_456", "response": {"commands": []}}
        }));
        assert_eq!(
            nested,
            Inbound::ControlResponse {
                request_id: "req_456".to_string(),
                result: Ok(json!({"commands": []})),
            }
        );

        let flat = classify(json!({"type": "control_response", "subtype": "success", "request_id": "req_123"}));
        assert_eq!(
            flat,
            Inbound::ControlResponse { request_id: "req_123".to_string(), result: Ok(Value::Null) }
        );

        let error = classify(json!({
            "type": "control_response",
            "response": {"subtype": "error", "request_id": "req_7", "error": "Unknown model"}
        }));
        assert_eq!(
            error,
            Inbound::ControlResponse { request_id: "req_7".to_string(), result: Err("Unknown model".to_string()) }
        );

        let direct = classify(json!({
            "type": "control_response",
            "request_id": "req_9",
            "response": {"models": [{"value": "sonnet"}]}
        }));
        assert_eq!(
            direct,
            Inbound::ControlResponse {
                request_id: "req_9".to_string(),
                result: Ok(json!({"models": [{"value": "sonnet"}]})),
            }
        );
    }

    #[test]
    fn test_direct_layout_feeds_discovery() {
        let inbound = classify(json!({
            "type": "control_response",
            "request_id": "init-1",
            "response": {
                "models": [{"value": "sonnet", "displayName": "Sonnet"}],
                "account": {"email": "dev@example.com"}
            }
        }));
        let Inbound::ControlResponse { result: Ok(payload), .. } = inbound else {
            panic!("expected a successful control response, got {inbound:?}");
        };
        let info = crate::backends::claude::discovery::parse_backend_info(&payload);
        assert_eq!(info.models.len(), 1);
        assert_eq!(info.models[0].id, "sonnet");
    }

    #[test]
    fn test_control_request_id_round_trip() {
        let protocol = ClaudeProtocol;
        let request_id = protocol.new_request_id();
        let request = protocol.encode_control_request(
            &request_id,
            &ControlRequest::Initialize { hooks: Some(json!({"PreToolUse": []})) },
        );
        assert_eq!(request["type"], "control_request");
        assert_eq!(request["request_id"], request_id.as_str());
        assert_eq!(request["request"]["subtype"], "initialize");
        assert_eq!(request["request"]["hooks"], json!({"PreToolUse": []}));

        let payload = json!({"models": [{"value": "sonnet"}]});
        let response = json!({
            "type": "control_response",
            "response": {"subtype": "success", "request_id": request["request_id"], "response": payload}
        });
        assert_eq!(
            protocol.classify(response),
            Inbound::ControlResponse { request_id, result: Ok(payload) }
        );
    }

    #[test]
    fn test_encode_permission_replies() {
        let request = ToolPermissionRequest {
            request_id: "req_1".to_string(),
            tool_name: "Bash".to_string(),
            input: json!({"command": "ls"}),
            suggestions: None,
            tool_use_id: None,
            blocked_path: None,
        };

        let allow = ClaudeProtocol.encode_permission_reply(
            &request,
            &PermissionReply::Allow { updated_input: None, updated_permissions: None },
        );
        assert_eq!(allow["type"], "control_response");
        assert_eq!(allow["response"]["subtype"], "success");
        assert_eq!(allow["response"]["request_id"], "req_1");
        assert_eq!(
            allow["response"]["response"],
            json!({"behavior": "allow", "updatedInput": {"command": "ls"}})
        );

        let deny = ClaudeProtocol.encode_permission_reply(
            &request,
            &PermissionReply::Deny { message: "User denied permission".to_string(), interrupt: false },
        );
        assert_eq!(
            deny["response"]["response"],
            json!({"behavior": "deny", "message": "User denied permission", "interrupt": false})
        );
    }

    #[test]
    fn test_encode_user_message() {
        let text = ClaudeProtocol.encode_user_message(Some("cli-1"), &[ContentBlock::text("hello")]);
        assert_eq!(text["message"]["content"], "hello");
        assert_eq!(text["session_id"], "cli-1");

        let mixed = ClaudeProtocol.encode_user_message(
            None,
            &[
                ContentBlock::text("look"),
                ContentBlock::Image { media_type: "image/png".to_string(), data: "AAAA".to_string() },
            ],
        );
        assert_eq!(mixed["session_id"], "default");
        assert_eq!(mixed["message"]["content"][1]["source"]["media_type"], "image/png");
    }

    #[test]
    fn test_config_options() {
        assert_eq!(
            ClaudeProtocol.config_option_request("maxThinkingTokens", &json!(8000)),
            Some(ControlRequest::SetMaxThinkingTokens(Some(8000)))
        );
        assert_eq!(
            ClaudeProtocol.config_option_request("max_thinking_tokens", &Value::Null),
            Some(ControlRequest::SetMaxThinkingTokens(None))
        );
        assert_eq!(ClaudeProtocol.config_option_request("temperature", &json!(1)), None);

        let encoded = ClaudeProtocol.encode_control_request(
            "req_2",
            &ControlRequest::SetMaxThinkingTokens(Some(8000)),
        );
        assert_eq!(encoded["request"], json!({"subtype": "set_max_thinking_tokens", "max_thinking_tokens": 8000}));
    }
}
