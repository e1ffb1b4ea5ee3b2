//! Core types and traits for the backend abstraction layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::error::{BackendError, SessionError};
use super::runtime::DiagnosticLine;
use super::session::{BackendSession, ContentBlock};
use crate::config::BackendSettings;

/// Identifies the type of AI backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Claude,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Claude => write!(f, "claude"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "claude" => Ok(BackendKind::Claude),
            _ => Err(SessionError::UnknownBackend(s.to_string())),
        }
    }
}

/// Options for a new session. Fields a backend kind does not support are
/// reported by [`SessionOptions::unsupported_fields`] and otherwise ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionOptions {
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub setting_sources: Option<Vec<String>>,
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,
    pub resume_session_id: Option<String>,
    pub include_partial_messages: bool,
    pub reasoning_effort: Option<String>,
    /// Hook registrations sent with the initialize request.
    pub hooks: Option<Value>,
    pub env: HashMap<String, String>,
}

impl SessionOptions {
    /// Names of set fields that `caps` does not support.
    pub fn unsupported_fields(&self, caps: &BackendCapabilities) -> Vec<&'static str> {
        let checks = [
            ("settingSources", self.setting_sources.is_some(), caps.supports_setting_sources),
            ("maxTurns", self.max_turns.is_some(), caps.supports_max_turns),
            ("maxBudgetUsd", self.max_budget_usd.is_some(), caps.supports_budget),
            ("resumeSessionId", self.resume_session_id.is_some(), caps.supports_resume),
            (
                "includePartialMessages",
                self.include_partial_messages,
                caps.supports_partial_messages,
            ),
            ("reasoningEffort", self.reasoning_effort.is_some(), caps.supports_reasoning_effort),
            ("hooks", self.hooks.is_some(), caps.supports_hooks),
        ];
        checks
            .into_iter()
            .filter(|(_, set, supported)| *set && !*supported)
            .map(|(name, _, _)| name)
            .collect()
    }
}

/// Information about an available model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub description: Option<String>,
    pub supports_thinking: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub email: Option<String>,
    /// Subscription tier, e.g. "max" or "pro".
    pub plan: Option<String>,
}

/// Discovery result. Built fresh for every query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendInfo {
    pub models: Vec<ModelInfo>,
    pub account: Option<AccountInfo>,
}

impl BackendInfo {
    pub fn is_empty(&self) -> bool {
        self.models.is_empty() && self.account.is_none()
    }
}

/// How the backend handles permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionModel {
    /// Per-operation permission prompts
    PerOperation,
    /// Session-level permissions
    SessionLevel,
    /// No permission system
    None,
}

/// Capabilities of a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendCapabilities {
    pub permission_model: PermissionModel,
    pub supports_streaming: bool,
    pub supports_interrupt: bool,
    pub supports_resume: bool,
    pub supports_extended_thinking: bool,
    pub supports_partial_messages: bool,
    pub supports_budget: bool,
    pub supports_max_turns: bool,
    pub supports_setting_sources: bool,
    pub supports_reasoning_effort: bool,
    pub supports_hooks: bool,
}

/// One backend kind: session factory, registry and discovery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> BackendCapabilities;

    /// Spawns a session, sends `prompt` (followed by `content`, if any) and
    /// registers it. Fails with `BackendDisposed` after [`Backend::dispose`].
    async fn create_session(
        &self,
        prompt: &str,
        cwd: &Path,
        options: SessionOptions,
        content: Vec<ContentBlock>,
    ) -> Result<Arc<dyn BackendSession>, SessionError>;

    fn get_session(&self, session_id: &str) -> Option<Arc<dyn BackendSession>>;

    fn session_ids(&self) -> Vec<String>;

    /// Backend-wide error stream.
    fn errors(&self) -> broadcast::Receiver<BackendError>;

    fn diagnostics(&self) -> broadcast::Receiver<DiagnosticLine>;

    /// Runs discovery. Never fails; an empty result means nothing was learned.
    async fn query_backend_info(&self) -> BackendInfo;

    async fn list_models(&self) -> Vec<ModelInfo>;

    /// Kills every session and closes the backend channels. Idempotent.
    async fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

/// Builds a backend from settings.
pub type BackendFactory = Arc<dyn Fn(&BackendSettings) -> Arc<dyn Backend> + Send + Sync>;

/// Factory map from backend kind to constructor.
///
/// Owned by whatever composes the application; nothing is registered
/// implicitly.
pub struct BackendRegistry {
    factories: HashMap<BackendKind, BackendFactory>,
    default: BackendKind,
}

impl BackendRegistry {
    /// Creates an empty registry.
    pub fn new(default: BackendKind) -> Self {
        Self {
            factories: HashMap::new(),
            default,
        }
    }

    /// Registry with every built-in backend.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new(BackendKind::Claude);
        registry.register(
            BackendKind::Claude,
            Arc::new(|settings: &BackendSettings| {
                Arc::new(super::claude::ClaudeCliBackend::new(settings.clone())) as Arc<dyn Backend>
            }),
        );
        registry
    }

    pub fn register(&mut self, kind: BackendKind, factory: BackendFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn create(
        &self,
        kind: BackendKind,
        settings: &BackendSettings,
    ) -> Result<Arc<dyn Backend>, SessionError> {
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| SessionError::UnknownBackend(kind.to_string()))?;
        Ok(factory(settings))
    }

    pub fn create_default(&self, settings: &BackendSettings) -> Result<Arc<dyn Backend>, SessionError> {
        self.create(self.default, settings)
    }

    pub fn default_kind(&self) -> BackendKind {
        self.default
    }

    pub fn set_default(&mut self, kind: BackendKind) {
        self.default = kind;
    }

    pub fn available_backends(&self) -> Vec<BackendKind> {
        self.factories.keys().copied().collect()
    }
}
