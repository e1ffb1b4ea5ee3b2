//! Claude CLI backend: session factory, registry and discovery.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use super::adapter::ClaudeSession;
use super::cli_protocol::ClaudeProtocol;
use super::discovery;
use crate::backends::channel::LaunchSpec;
use crate::backends::engine::{ControlRequest, EngineOptions, SessionEngine};
use crate::backends::error::{BackendError, SessionError};
use crate::backends::runtime::{DiagnosticLine, DiagnosticSource, Fanout, SessionRegistry};
use crate::backends::session::{BackendSession, ContentBlock};
use crate::backends::types::{
    Backend, BackendCapabilities, BackendInfo, BackendKind, ModelInfo, PermissionModel,
    SessionOptions,
};
use crate::backends::utils::resolve_cli_path;
use crate::config::BackendSettings;

/// Environment variable consulted when no `cliPath` is configured.
pub const CLI_PATH_ENV: &str = "CLAUDE_CLI_PATH";
const CLI_PROGRAM: &str = "claude";

const STREAM_ARGS: [&str; 8] = [
    "-p",
    "--output-format",
    "stream-json",
    "--verbose",
    "--input-format",
    "stream-json",
    "--permission-prompt-tool",
    "stdio",
];

/// CLI arguments for an interactive session.
pub fn session_args(
    session_id: &str,
    model: Option<&str>,
    permission_mode: &str,
    options: &SessionOptions,
) -> Vec<String> {
    let mut args: Vec<String> = STREAM_ARGS.iter().map(|arg| arg.to_string()).collect();
    let mut push = |flag: &str, value: String| {
        args.push(flag.to_string());
        args.push(value);
    };

    if let Some(model) = model {
        push("--model", model.to_string());
    }
    push("--permission-mode", permission_mode.to_string());

    // The CLI rejects --session-id together with --resume.
    match &options.resume_session_id {
        Some(resume) => push("--resume", resume.clone()),
        None => push("--session-id", session_id.to_string()),
    }
    if let Some(turns) = options.max_turns {
        push("--max-turns", turns.to_string());
    }
    if let Some(budget) = options.max_budget_usd {
        push("--max-budget-usd", budget.to_string());
    }
    if let Some(sources) = &options.setting_sources {
        push("--setting-sources", sources.join(","));
    }
    if options.include_partial_messages {
        args.push("--include-partial-messages".to_string());
    }
    args
}

/// CLI arguments for a discovery process: no settings, no tools, one turn.
pub fn discovery_args() -> Vec<String> {
    let mut args: Vec<String> = STREAM_ARGS.iter().map(|arg| arg.to_string()).collect();
    args.extend(
        [
            "--setting-sources",
            "",
            "--max-turns",
            "1",
            "--permission-mode",
            "plan",
        ]
        .map(String::from),
    );
    args
}

pub struct ClaudeCliBackend {
    settings: BackendSettings,
    sessions: Arc<SessionRegistry<dyn BackendSession>>,
    errors: Arc<Fanout<BackendError>>,
    diagnostics: Arc<Fanout<DiagnosticLine>>,
    disposed: AtomicBool,
    /// Held shared by `create_session` while it registers, exclusively by
    /// `dispose` while it drains.
    registration: RwLock<()>,
}

impl ClaudeCliBackend {
    pub fn new(settings: BackendSettings) -> Self {
        let buffer = settings.event_buffer;
        Self {
            settings,
            sessions: Arc::new(SessionRegistry::new()),
            errors: Arc::new(Fanout::new(buffer)),
            diagnostics: Arc::new(Fanout::new(buffer)),
            disposed: AtomicBool::new(false),
            registration: RwLock::new(()),
        }
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    fn program(&self) -> Result<PathBuf, SessionError> {
        resolve_cli_path(self.settings.cli_path.as_deref(), CLI_PATH_ENV, CLI_PROGRAM)
    }

    fn warn_unsupported(&self, options: &SessionOptions) {
        for field in options.unsupported_fields(&self.capabilities()) {
            let line = format!("Option `{}` is not supported by the Claude CLI; ignoring", field);
            log::warn!("[claude] {}", line);
            self.diagnostics.publish(DiagnosticLine {
                session_id: None,
                source: DiagnosticSource::Warning,
                line,
            });
        }
    }

    async fn start_session(
        &self,
        cwd: &Path,
        options: SessionOptions,
    ) -> Result<Arc<ClaudeSession>, SessionError> {
        let program = self.program()?;
        let session_id = Uuid::new_v4().to_string();
        let model = options.model.clone().or_else(|| self.settings.default_model.clone());
        let permission_mode = options
            .permission_mode
            .clone()
            .unwrap_or_else(|| self.settings.default_permission_mode.clone());

        let mut spec = LaunchSpec::new(program, cwd).args(session_args(
            &session_id,
            model.as_deref(),
            &permission_mode,
            &options,
        ));
        spec.env = options.env.into_iter().collect();

        let engine = SessionEngine::start(
            &spec,
            Arc::new(ClaudeProtocol),
            EngineOptions {
                session_id,
                handshake: Some(ControlRequest::Initialize { hooks: options.hooks }),
                handshake_timeout: self.settings.handshake_timeout(),
                event_buffer: self.settings.event_buffer,
            },
            self.errors.clone(),
            self.diagnostics.clone(),
        )
        .await?;

        Ok(Arc::new(ClaudeSession::new(
            engine,
            cwd.to_string_lossy().into_owned(),
            model.unwrap_or_else(|| "default".to_string()),
            permission_mode,
            Arc::downgrade(&self.sessions),
            self.settings.event_buffer,
        )))
    }

    /// Removes the session once its process is gone and reports exits this
    /// layer did not cause.
    fn spawn_exit_monitor(&self, session: Arc<ClaudeSession>) {
        let sessions = self.sessions.clone();
        let errors = self.errors.clone();
        tokio::spawn(async move {
            let exit = session.wait_for_exit().await;
            let session_id = session.session_id().to_string();
            sessions.remove(&session_id);

            if exit.is_expected() {
                log::debug!("[{}] Process exited ({})", session_id, exit);
            } else {
                log::warn!("[{}] Process exited unexpectedly ({})", session_id, exit);
                let err = SessionError::UnexpectedExit(exit);
                errors.publish(BackendError::from_session_error(&err, Some(&session_id)));
            }
        });
    }
}

#[async_trait]
impl Backend for ClaudeCliBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Claude
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            permission_model: PermissionModel::PerOperation,
            supports_streaming: true,
            supports_interrupt: true,
            supports_resume: true,
            supports_extended_thinking: true,
            supports_partial_messages: true,
            supports_budget: true,
            supports_max_turns: true,
            supports_setting_sources: true,
            supports_reasoning_effort: false,
            supports_hooks: true,
        }
    }

    async fn create_session(
        &self,
        prompt: &str,
        cwd: &Path,
        options: SessionOptions,
        content: Vec<ContentBlock>,
    ) -> Result<Arc<dyn BackendSession>, SessionError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SessionError::BackendDisposed);
        }
        let _registering = self.registration.read().await;
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SessionError::BackendDisposed);
        }

        self.warn_unsupported(&options);
        let session = self
            .start_session(cwd, options)
            .await
            .map_err(SessionError::into_create_error)?;
        let session_id = session.session_id().to_string();

        self.sessions
            .insert(session_id.clone(), session.clone() as Arc<dyn BackendSession>);
        if self.disposed.load(Ordering::SeqCst) {
            log::debug!("[{}] Backend disposed during creation", session_id);
            session.kill().await;
            return Err(SessionError::BackendDisposed);
        }
        self.spawn_exit_monitor(session.clone());
        log::info!("[{}] Claude session created in {}", session_id, cwd.display());

        let mut blocks = Vec::with_capacity(content.len() + 1);
        if !prompt.is_empty() {
            blocks.push(ContentBlock::text(prompt));
        }
        blocks.extend(content);
        if !blocks.is_empty() {
            if let Err(err) = session.send_with_content(blocks).await {
                session.kill().await;
                return Err(err.into_create_error());
            }
        }

        Ok(session)
    }

    fn get_session(&self, session_id: &str) -> Option<Arc<dyn BackendSession>> {
        self.sessions.get(session_id)
    }

    fn session_ids(&self) -> Vec<String> {
        self.sessions.ids()
    }

    fn errors(&self) -> broadcast::Receiver<BackendError> {
        self.errors.subscribe()
    }

    fn diagnostics(&self) -> broadcast::Receiver<DiagnosticLine> {
        self.diagnostics.subscribe()
    }

    async fn query_backend_info(&self) -> BackendInfo {
        if self.is_disposed() {
            return BackendInfo::default();
        }
        let program = match self.program() {
            Ok(program) => program,
            Err(err) => {
                log::warn!("[claude] Discovery skipped: {}", err);
                return BackendInfo::default();
            }
        };
        let spec = LaunchSpec::new(program, std::env::temp_dir()).args(discovery_args());
        discovery::run(
            &spec,
            self.settings.discovery_timeout(),
            self.errors.clone(),
            self.diagnostics.clone(),
        )
        .await
    }

    async fn list_models(&self) -> Vec<ModelInfo> {
        self.query_backend_info().await.models
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _draining = self.registration.write().await;

        let sessions = self.sessions.drain();
        log::info!("[claude] Disposing backend ({} session(s))", sessions.len());
        for session in sessions {
            session.kill().await;
        }
        self.errors.close();
        self.diagnostics.close();
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}
