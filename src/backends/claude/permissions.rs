//! Translation between Claude's permission shapes and the generic ones.
//!
//! The CLI tags suggestions with `type` and names destinations after its
//! settings files (`localSettings`, ...); the generic contract uses `kind` and
//! short destination names.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::tool_utils::describe_permission;
use crate::backends::engine::{PermissionReply, ToolPermissionRequest};
use crate::backends::session::{
    PermissionDestination, PermissionRequest, PermissionResponse, PermissionRule,
    PermissionSuggestion, RuleBehavior,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum CliDestination {
    UserSettings,
    ProjectSettings,
    LocalSettings,
    Session,
}

impl From<CliDestination> for PermissionDestination {
    fn from(value: CliDestination) -> Self {
        match value {
            CliDestination::UserSettings => PermissionDestination::User,
            CliDestination::ProjectSettings => PermissionDestination::Project,
            CliDestination::LocalSettings => PermissionDestination::Local,
            CliDestination::Session => PermissionDestination::Session,
        }
    }
}

impl From<PermissionDestination> for CliDestination {
    fn from(value: PermissionDestination) -> Self {
        match value {
            PermissionDestination::User => CliDestination::UserSettings,
            PermissionDestination::Project => CliDestination::ProjectSettings,
            PermissionDestination::Local => CliDestination::LocalSettings,
            PermissionDestination::Session => CliDestination::Session,
        }
    }
}

/// Suggestion object as the CLI sends and expects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum CliSuggestion {
    AddRules {
        rules: Vec<PermissionRule>,
        behavior: RuleBehavior,
        destination: CliDestination,
    },
    ReplaceRules {
        rules: Vec<PermissionRule>,
        behavior: RuleBehavior,
        destination: CliDestination,
    },
    RemoveRules {
        rules: Vec<PermissionRule>,
        behavior: RuleBehavior,
        destination: CliDestination,
    },
    SetMode {
        mode: String,
        destination: CliDestination,
    },
    AddDirectories {
        directories: Vec<String>,
        destination: CliDestination,
    },
    RemoveDirectories {
        directories: Vec<String>,
        destination: CliDestination,
    },
}

impl From<CliSuggestion> for PermissionSuggestion {
    fn from(value: CliSuggestion) -> Self {
        match value {
            CliSuggestion::AddRules { rules, behavior, destination } => {
                PermissionSuggestion::AddRules { rules, behavior, destination: destination.into() }
            }
            CliSuggestion::ReplaceRules { rules, behavior, destination } => {
                PermissionSuggestion::ReplaceRules { rules, behavior, destination: destination.into() }
            }
            CliSuggestion::RemoveRules { rules, behavior, destination } => {
                PermissionSuggestion::RemoveRules { rules, behavior, destination: destination.into() }
            }
            CliSuggestion::SetMode { mode, destination } => {
                PermissionSuggestion::SetMode { mode, destination: destination.into() }
            }
            CliSuggestion::AddDirectories { directories, destination } => {
                PermissionSuggestion::AddDirectories { directories, destination: destination.into() }
            }
            CliSuggestion::RemoveDirectories { directories, destination } => {
                PermissionSuggestion::RemoveDirectories { directories, destination: destination.into() }
            }
        }
    }
}

impl From<PermissionSuggestion> for CliSuggestion {
    fn from(value: PermissionSuggestion) -> Self {
        match value {
            PermissionSuggestion::AddRules { rules, behavior, destination } => {
                CliSuggestion::AddRules { rules, behavior, destination: destination.into() }
            }
            PermissionSuggestion::ReplaceRules { rules, behavior, destination } => {
                CliSuggestion::ReplaceRules { rules, behavior, destination: destination.into() }
            }
            PermissionSuggestion::RemoveRules { rules, behavior, destination } => {
                CliSuggestion::RemoveRules { rules, behavior, destination: destination.into() }
            }
            PermissionSuggestion::SetMode { mode, destination } => {
                CliSuggestion::SetMode { mode, destination: destination.into() }
            }
            PermissionSuggestion::AddDirectories { directories, destination } => {
                CliSuggestion::AddDirectories { directories, destination: destination.into() }
            }
            PermissionSuggestion::RemoveDirectories { directories, destination } => {
                CliSuggestion::RemoveDirectories { directories, destination: destination.into() }
            }
        }
    }
}

/// Parses the CLI's `permission_suggestions`, skipping entries it cannot read.
pub fn suggestions_from_cli(raw: Option<&Value>) -> Vec<PermissionSuggestion> {
    let Some(items) = raw.and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<CliSuggestion>(item.clone()) {
            Ok(suggestion) => Some(suggestion.into()),
            Err(err) => {
                log::debug!("[claude] Skipping permission suggestion {}: {}", item, err);
                None
            }
        })
        .collect()
}

pub fn suggestions_to_cli(suggestions: Vec<PermissionSuggestion>) -> Value {
    let items: Vec<CliSuggestion> = suggestions.into_iter().map(Into::into).collect();
    serde_json::to_value(items).unwrap_or_else(|_| Value::Array(Vec::new()))
}

/// Generic view of a CLI permission request.
pub fn to_generic_request(session_id: &str, request: &ToolPermissionRequest) -> PermissionRequest {
    PermissionRequest {
        id: request.request_id.clone(),
        session_id: session_id.to_string(),
        tool_name: request.tool_name.clone(),
        input: request.input.clone(),
        suggestions: suggestions_from_cli(request.suggestions.as_ref()),
        tool_use_id: request.tool_use_id.clone(),
        blocked_path: request.blocked_path.clone(),
        description: describe_permission(
            &request.tool_name,
            &request.input,
            request.blocked_path.as_deref(),
        ),
    }
}

pub fn to_cli_reply(response: PermissionResponse) -> PermissionReply {
    match response {
        PermissionResponse::Allow {
            updated_input,
            updated_permissions,
        } => PermissionReply::Allow {
            updated_input,
            updated_permissions: updated_permissions.map(suggestions_to_cli),
        },
        PermissionResponse::Deny { message, interrupt } => PermissionReply::Deny { message, interrupt },
    }
}
