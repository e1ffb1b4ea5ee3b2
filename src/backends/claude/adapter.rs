//! Claude session adapter.
//!
//! Wraps one [`SessionEngine`] as a [`BackendSession`]: permission requests
//! are re-emitted in the generic shape, and answers are translated back into
//! the CLI's suggestion objects before they reach the engine.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

use super::permissions::{to_cli_reply, to_generic_request};
use crate::backends::channel::ProcessExit;
use crate::backends::engine::{SessionEngine, ToolPermissionRequest};
use crate::backends::error::SessionError;
use crate::backends::runtime::{Fanout, SessionRegistry};
use crate::backends::session::{
    BackendSession, ContentBlock, HookRequest, HookResponse, PermissionRequest,
    PermissionResponse, SessionEvent, SessionState,
};
use crate::backends::types::BackendKind;

pub struct ClaudeSession {
    id: String,
    folder_path: String,
    engine: Arc<SessionEngine>,
    model: RwLock<String>,
    permission_mode: RwLock<String>,
    permissions: Arc<Fanout<PermissionRequest>>,
    registry: Weak<SessionRegistry<dyn BackendSession>>,
}

impl ClaudeSession {
    pub fn new(
        engine: Arc<SessionEngine>,
        folder_path: String,
        model: String,
        permission_mode: String,
        registry: Weak<SessionRegistry<dyn BackendSession>>,
        event_buffer: usize,
    ) -> Self {
        let id = engine.session_id().to_string();
        let permissions = Arc::new(Fanout::new(event_buffer));
        Self::spawn_permission_translator(
            id.clone(),
            engine.permission_requests(),
            permissions.clone(),
        );

        Self {
            id,
            folder_path,
            engine,
            model: RwLock::new(model),
            permission_mode: RwLock::new(permission_mode),
            permissions,
            registry,
        }
    }

    /// Forwards the engine's requests in generic form until the engine
    /// closes its channel.
    fn spawn_permission_translator(
        session_id: String,
        mut requests: broadcast::Receiver<ToolPermissionRequest>,
        permissions: Arc<Fanout<PermissionRequest>>,
    ) {
        tokio::spawn(async move {
            loop {
                match requests.recv().await {
                    Ok(request) => {
                        log::debug!(
                            "[{}] Permission requested for {} ({})",
                            session_id,
                            request.tool_name,
                            request.request_id
                        );
                        permissions.publish(to_generic_request(&session_id, &request));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!(
                            "[{}] Permission stream lagged by {} request(s)",
                            session_id,
                            skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            permissions.close();
        });
    }

    fn deregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(&self.id).is_some() {
                log::debug!("[{}] Removed from session registry", self.id);
            }
        }
    }
}

#[async_trait]
impl BackendSession for ClaudeSession {
    fn session_id(&self) -> &str {
        &self.id
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Claude
    }

    fn folder_path(&self) -> &str {
        &self.folder_path
    }

    fn state(&self) -> SessionState {
        self.engine.state()
    }

    async fn send_message(&self, message: &str) -> Result<(), SessionError> {
        self.engine.send(message).await
    }

    async fn send_with_content(&self, content: Vec<ContentBlock>) -> Result<(), SessionError> {
        self.engine.send_with_content(&content).await
    }

    async fn interrupt(&self) -> Result<(), SessionError> {
        self.engine.interrupt().await
    }

    async fn kill(&self) {
        self.engine.kill().await;
        self.deregister();
    }

    fn get_model(&self) -> String {
        self.model.read().clone()
    }

    async fn set_model(&self, model: String) -> Result<(), SessionError> {
        self.engine.set_model(&model).await?;
        *self.model.write() = model;
        Ok(())
    }

    fn get_permission_mode(&self) -> String {
        self.permission_mode.read().clone()
    }

    async fn set_permission_mode(&self, mode: String) -> Result<(), SessionError> {
        self.engine.set_permission_mode(&mode).await?;
        *self.permission_mode.write() = mode;
        Ok(())
    }

    async fn set_config_option(&self, key: String, value: Value) -> Result<(), SessionError> {
        self.engine.set_config_option(&key, &value).await?;
        if let Some(text) = value.as_str() {
            match key.as_str() {
                "model" => *self.model.write() = text.to_string(),
                "permissionMode" | "permission_mode" => *self.permission_mode.write() = text.to_string(),
                _ => {}
            }
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.engine.events()
    }

    fn permission_requests(&self) -> broadcast::Receiver<PermissionRequest> {
        self.permissions.subscribe()
    }

    fn pending_permission_requests(&self) -> Vec<PermissionRequest> {
        self.engine
            .pending_permissions()
            .iter()
            .map(|request| to_generic_request(&self.id, request))
            .collect()
    }

    fn hook_requests(&self) -> broadcast::Receiver<HookRequest> {
        self.engine.hook_requests()
    }

    async fn respond_permission(&self, request_id: &str, response: PermissionResponse) {
        let allowed = response.is_allow();
        if self.engine.resolve_permission(request_id, to_cli_reply(response)) {
            log::debug!(
                "[{}] Permission {} {}",
                self.id,
                request_id,
                if allowed { "allowed" } else { "denied" }
            );
        }
    }

    async fn respond_hook(&self, request_id: &str, response: HookResponse) -> bool {
        self.engine.resolve_hook(request_id, response)
    }

    async fn wait_for_exit(&self) -> ProcessExit {
        self.engine.closed().await
    }

    fn cli_session_id(&self) -> Option<String> {
        self.engine.cli_session_id()
    }
}
