//! Backend-agnostic session contract and the data that crosses it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use super::channel::ProcessExit;
use super::error::SessionError;
use super::types::BackendKind;

/// Lifecycle of a session's protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Starting,
    Active,
    Terminating,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Terminating => "terminating",
            SessionState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Input block for [`BackendSession::send_with_content`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Base64-encoded image.
    #[serde(rename_all = "camelCase")]
    Image { media_type: String, data: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolStatus {
    Completed,
    Error,
}

/// Application event decoded from the agent's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    SessionInit {
        cli_session_id: Option<String>,
        model: Option<String>,
        auth_type: Option<String>,
    },
    Text {
        content: String,
    },
    Thinking {
        content: String,
    },
    ToolStart {
        tool_use_id: String,
        tool_name: String,
        /// Short human-readable target such as a file name or command.
        target: String,
    },
    ToolEnd {
        tool_use_id: String,
        status: ToolStatus,
    },
    TokenUsage {
        input_tokens: u64,
        output_tokens: u64,
        cache_read_tokens: u64,
        cache_creation_tokens: u64,
    },
    PartialMessage {
        payload: Value,
    },
    TurnComplete {
        success: bool,
        cost_usd: Option<f64>,
        num_turns: Option<u32>,
        duration_ms: Option<u64>,
        cli_session_id: Option<String>,
    },
    Error {
        message: String,
    },
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
        expected: bool,
    },
    Other {
        kind: String,
        payload: Value,
    },
}

impl SessionEvent {
    pub fn exited(exit: &ProcessExit) -> Self {
        SessionEvent::Exited {
            code: exit.code,
            signal: exit.signal,
            expected: exit.is_expected(),
        }
    }
}

/// Where a permission rule change is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionDestination {
    User,
    Project,
    Local,
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleBehavior {
    Allow,
    Deny,
    Ask,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRule {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_content: Option<String>,
}

/// A remediation the agent offers alongside a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PermissionSuggestion {
    AddRules {
        rules: Vec<PermissionRule>,
        behavior: RuleBehavior,
        destination: PermissionDestination,
    },
    ReplaceRules {
        rules: Vec<PermissionRule>,
        behavior: RuleBehavior,
        destination: PermissionDestination,
    },
    RemoveRules {
        rules: Vec<PermissionRule>,
        behavior: RuleBehavior,
        destination: PermissionDestination,
    },
    SetMode {
        mode: String,
        destination: PermissionDestination,
    },
    AddDirectories {
        directories: Vec<String>,
        destination: PermissionDestination,
    },
    RemoveDirectories {
        directories: Vec<String>,
        destination: PermissionDestination,
    },
}

/// A pending tool authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub input: Value,
    #[serde(default)]
    pub suggestions: Vec<PermissionSuggestion>,
    pub tool_use_id: Option<String>,
    pub blocked_path: Option<String>,
    /// One-line summary for prompts, e.g. "Run command: ls -la".
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PermissionResponse {
    Allow {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_permissions: Option<Vec<PermissionSuggestion>>,
    },
    Deny {
        message: String,
        /// Also interrupt the current turn.
        #[serde(default)]
        interrupt: bool,
    },
}

impl PermissionResponse {
    pub fn allow() -> Self {
        PermissionResponse::Allow {
            updated_input: None,
            updated_permissions: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        PermissionResponse::Deny {
            message: message.into(),
            interrupt: false,
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, PermissionResponse::Allow { .. })
    }
}

/// A hook callback the agent is blocked on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRequest {
    pub id: String,
    pub session_id: String,
    pub callback_id: Option<String>,
    pub hook_event_name: String,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    pub tool_use_id: Option<String>,
}

/// Answer to a [`HookRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookResponse {
    #[serde(rename = "continue")]
    pub continue_: bool,
    #[serde(
        rename = "hookSpecificOutput",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub hook_specific_output: Option<Value>,
}

impl HookResponse {
    fn pretool(decision: &str, reason: &str) -> Self {
        Self {
            continue_: true,
            hook_specific_output: Some(serde_json::json!({
                "hookEventName": "PreToolUse",
                "permissionDecision": decision,
                "permissionDecisionReason": reason,
            })),
        }
    }

    /// PreToolUse: let the tool run.
    pub fn allow_tool(reason: &str) -> Self {
        Self::pretool("allow", reason)
    }

    /// PreToolUse: block the tool and tell the model why.
    pub fn deny_tool(reason: &str) -> Self {
        Self::pretool("deny", reason)
    }

    pub fn acknowledge() -> Self {
        Self {
            continue_: true,
            hook_specific_output: None,
        }
    }
}

/// A live conversation with one agent process.
///
/// Sessions are created by a [`Backend`](super::types::Backend) and stay
/// registered with it until their process exits or they are killed.
#[async_trait]
pub trait BackendSession: Send + Sync {
    fn session_id(&self) -> &str;

    fn backend_kind(&self) -> BackendKind;

    fn folder_path(&self) -> &str;

    fn state(&self) -> SessionState;

    /// Sends a plain-text user message.
    async fn send_message(&self, message: &str) -> Result<(), SessionError>;

    /// Sends a user message made of content blocks.
    async fn send_with_content(&self, content: Vec<ContentBlock>) -> Result<(), SessionError>;

    /// Stops the current turn without ending the process.
    async fn interrupt(&self) -> Result<(), SessionError>;

    /// Terminates the process and deregisters the session. Idempotent.
    async fn kill(&self);

    fn get_model(&self) -> String;

    async fn set_model(&self, model: String) -> Result<(), SessionError>;

    fn get_permission_mode(&self) -> String;

    async fn set_permission_mode(&self, mode: String) -> Result<(), SessionError>;

    /// Sets a backend-specific option, e.g. `maxThinkingTokens`.
    async fn set_config_option(&self, key: String, value: Value) -> Result<(), SessionError>;

    fn events(&self) -> broadcast::Receiver<SessionEvent>;

    fn permission_requests(&self) -> broadcast::Receiver<PermissionRequest>;

    /// Requests emitted so far that have not been answered.
    fn pending_permission_requests(&self) -> Vec<PermissionRequest>;

    fn hook_requests(&self) -> broadcast::Receiver<HookRequest>;

    /// Answers a permission request. A second answer for the same id is ignored.
    async fn respond_permission(&self, request_id: &str, response: PermissionResponse);

    /// Answers a hook request. Returns false if it was already answered.
    async fn respond_hook(&self, request_id: &str, response: HookResponse) -> bool;

    async fn wait_for_exit(&self) -> ProcessExit;

    /// Session id reported by the agent process itself, once known.
    fn cli_session_id(&self) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn permission_response_wire_shape() {
        let deny = PermissionResponse::Deny {
            message: "User denied permission".to_string(),
            interrupt: true,
        };
        assert_eq!(
            serde_json::to_value(&deny).unwrap(),
            json!({"behavior": "deny", "message": "User denied permission", "interrupt": true})
        );

        let allow: PermissionResponse = serde_json::from_value(json!({
            "behavior": "allow",
            "updatedPermissions": [{
                "kind": "addRules",
                "rules": [{"toolName": "Bash", "ruleContent": "ls:*"}],
                "behavior": "allow",
                "destination": "session"
            }]
        }))
        .unwrap();
        match allow {
            PermissionResponse::Allow {
                updated_input,
                updated_permissions: Some(perms),
            } => {
                assert!(updated_input.is_none());
                assert_eq!(
                    perms[0],
                    PermissionSuggestion::AddRules {
                        rules: vec![PermissionRule {
                            tool_name: "Bash".to_string(),
                            rule_content: Some("ls:*".to_string()),
                        }],
                        behavior: RuleBehavior::Allow,
                        destination: PermissionDestination::Session,
                    }
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn session_event_is_tagged() {
        let event = SessionEvent::ToolStart {
            tool_use_id: "tu_1".to_string(),
            tool_name: "Read".to_string(),
            target: "main.rs".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "toolStart", "toolUseId": "tu_1", "toolName": "Read", "target": "main.rs"})
        );
    }

    #[test]
    fn hook_response_helpers() {
        let value = serde_json::to_value(HookResponse::deny_tool("nope")).unwrap();
        assert_eq!(value["continue"], true);
        assert_eq!(value["hookSpecificOutput"]["permissionDecision"], "deny");
        assert_eq!(
            serde_json::to_value(HookResponse::acknowledge()).unwrap(),
            json!({"continue": true})
        );
    }
}
