//! Session protocol engine: one process channel turned into a typed session.
//!
//! Incoming records are classified by a [`WireProtocol`] into events,
//! permission requests, hook requests and control responses. Outgoing control
//! requests are correlated with their responses by request id.
//!
//! State machine: `Starting -> Active -> Terminating -> Closed`. Permission
//! and hook requests are only accepted while `Active`. Application events are
//! also delivered while `Terminating`, as stdout drains after the process
//! exits. Writes fail once the process is going away, and `Closed` is
//! terminal and closes every fan-out exactly once.

use futures::StreamExt;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::process::ChildStdout;
use tokio::sync::{broadcast, watch};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::channel::{LaunchSpec, ProcessChannel, ProcessExit};
use super::codec::{RecordCodec, MAX_CONSECUTIVE_READ_ERRORS};
use super::error::{BackendError, SessionError};
use super::runtime::{DiagnosticLine, Fanout, PendingReplies};
use super::session::{ContentBlock, HookRequest, HookResponse, SessionEvent, SessionState};
use super::utils::spawn_stderr_forwarder;

/// How long the exit watcher waits for stdout to drain before closing.
const READER_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Outgoing control request payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    Initialize { hooks: Option<Value> },
    Interrupt,
    SetModel(String),
    SetPermissionMode(String),
    SetMaxThinkingTokens(Option<u64>),
    Custom { subtype: String, payload: Value },
}

impl ControlRequest {
    pub fn subtype(&self) -> &str {
        match self {
            ControlRequest::Initialize { .. } => "initialize",
            ControlRequest::Interrupt => "interrupt",
            ControlRequest::SetModel(_) => "set_model",
            ControlRequest::SetPermissionMode(_) => "set_permission_mode",
            ControlRequest::SetMaxThinkingTokens(_) => "set_max_thinking_tokens",
            ControlRequest::Custom { subtype, .. } => subtype,
        }
    }
}

/// Permission request as the process phrased it.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPermissionRequest {
    pub request_id: String,
    pub tool_name: String,
    pub input: Value,
    /// Vendor-shaped suggestion list, untouched.
    pub suggestions: Option<Value>,
    pub tool_use_id: Option<String>,
    pub blocked_path: Option<String>,
}

/// Permission decision in the vendor's terms.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionReply {
    Allow {
        updated_input: Option<Value>,
        updated_permissions: Option<Value>,
    },
    Deny {
        message: String,
        interrupt: bool,
    },
}

/// Hook callback as the process phrased it.
#[derive(Debug, Clone, PartialEq)]
pub struct HookCall {
    pub request_id: String,
    pub callback_id: Option<String>,
    pub hook_event_name: String,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    pub tool_use_id: Option<String>,
}

/// Classification of one incoming record.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Events(Vec<SessionEvent>),
    Permission(ToolPermissionRequest),
    Hook(HookCall),
    ControlResponse {
        request_id: String,
        result: Result<Value, String>,
    },
    /// Inbound control request this side does not handle.
    UnsupportedControl { request_id: String, subtype: String },
    Ignore,
}

/// Vendor grammar for one backend kind.
pub trait WireProtocol: Send + Sync + 'static {
    fn classify(&self, record: Value) -> Inbound;

    fn encode_user_message(&self, session_id: Option<&str>, content: &[ContentBlock]) -> Value;

    fn encode_control_request(&self, request_id: &str, request: &ControlRequest) -> Value;

    fn encode_permission_reply(&self, request: &ToolPermissionRequest, reply: &PermissionReply) -> Value;

    fn encode_hook_reply(&self, request_id: &str, response: &HookResponse) -> Value;

    fn encode_control_error(&self, request_id: &str, message: &str) -> Value;

    /// Maps a generic config key to a control request, if the backend has one.
    fn config_option_request(&self, key: &str, value: &Value) -> Option<ControlRequest>;

    fn new_request_id(&self) -> String {
        format!("req_{}", Uuid::new_v4().simple())
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub session_id: String,
    /// Sent before the session becomes active; `None` skips the handshake.
    pub handshake: Option<ControlRequest>,
    pub handshake_timeout: Duration,
    pub event_buffer: usize,
}

pub struct SessionEngine {
    session_id: String,
    protocol: Arc<dyn WireProtocol>,
    channel: ProcessChannel,
    state: watch::Sender<SessionState>,
    shutdown: CancellationToken,
    events: Fanout<SessionEvent>,
    permissions: Fanout<ToolPermissionRequest>,
    hooks: Fanout<HookRequest>,
    controls: PendingReplies<Result<Value, String>>,
    permission_replies: PendingReplies<PermissionReply>,
    hook_replies: PendingReplies<HookResponse>,
    outstanding: parking_lot::Mutex<Vec<ToolPermissionRequest>>,
    cli_session_id: parking_lot::Mutex<Option<String>>,
    errors: Arc<Fanout<BackendError>>,
}

impl SessionEngine {
    /// Spawns the process, runs the handshake and returns an `Active` engine.
    pub async fn start(
        spec: &LaunchSpec,
        protocol: Arc<dyn WireProtocol>,
        options: EngineOptions,
        errors: Arc<Fanout<BackendError>>,
        diagnostics: Arc<Fanout<DiagnosticLine>>,
    ) -> Result<Arc<Self>, SessionError> {
        let channel = ProcessChannel::start(spec)?;
        let records = channel.records().ok_or(SessionError::ChannelClosed)?;
        let stderr = channel.diagnostics().ok_or(SessionError::ChannelClosed)?;
        let exit_signal = channel.exit_signal();

        let (state, _) = watch::channel(SessionState::Starting);
        let engine = Arc::new(Self {
            session_id: options.session_id.clone(),
            protocol,
            channel,
            state,
            shutdown: CancellationToken::new(),
            events: Fanout::new(options.event_buffer),
            permissions: Fanout::new(options.event_buffer),
            hooks: Fanout::new(options.event_buffer),
            controls: PendingReplies::new(),
            permission_replies: PendingReplies::new(),
            hook_replies: PendingReplies::new(),
            outstanding: parking_lot::Mutex::new(Vec::new()),
            cli_session_id: parking_lot::Mutex::new(None),
            errors: errors.clone(),
        });

        spawn_stderr_forwarder(stderr, options.session_id.clone(), diagnostics, errors);

        let mut reader = tokio::spawn(Self::read_loop(
            Arc::downgrade(&engine),
            records,
            engine.shutdown.clone(),
        ));

        let weak = Arc::downgrade(&engine);
        tokio::spawn(async move {
            let exit = exit_signal.wait().await;
            if let Some(engine) = weak.upgrade() {
                engine.mark_terminating();
            }
            if tokio::time::timeout(READER_DRAIN_GRACE, &mut reader).await.is_err() {
                reader.abort();
            }
            if let Some(engine) = weak.upgrade() {
                engine.finish(exit);
            }
        });

        if let Some(handshake) = options.handshake {
            if let Err(err) = engine
                .request(handshake, Some(options.handshake_timeout))
                .await
            {
                engine.kill().await;
                return Err(match err {
                    SessionError::Handshake(_) => err,
                    other => SessionError::Handshake(other.to_string()),
                });
            }
        }

        if let Some(exit) = engine.channel.exit_status() {
            engine.kill().await;
            return Err(SessionError::Handshake(format!(
                "process exited during startup ({})",
                exit
            )));
        }

        let activated = engine.state.send_if_modified(|state| {
            if *state == SessionState::Starting {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        });
        if !activated {
            return Err(SessionError::SessionClosed(engine.state()));
        }

        log::info!(
            "[{}] Session active (pid {:?})",
            engine.session_id,
            engine.channel.pid()
        );
        Ok(engine)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn cli_session_id(&self) -> Option<String> {
        self.cli_session_id.lock().clone()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn permission_requests(&self) -> broadcast::Receiver<ToolPermissionRequest> {
        self.permissions.subscribe()
    }

    pub fn hook_requests(&self) -> broadcast::Receiver<HookRequest> {
        self.hooks.subscribe()
    }

    /// Permission requests emitted but not yet answered.
    pub fn pending_permissions(&self) -> Vec<ToolPermissionRequest> {
        self.outstanding.lock().clone()
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Active => Ok(()),
            other => Err(SessionError::SessionClosed(other)),
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Starting | SessionState::Active => Ok(()),
            other => Err(SessionError::SessionClosed(other)),
        }
    }

    pub async fn send(&self, text: &str) -> Result<(), SessionError> {
        self.send_with_content(&[ContentBlock::text(text)]).await
    }

    pub async fn send_with_content(&self, content: &[ContentBlock]) -> Result<(), SessionError> {
        self.ensure_active()?;
        let cli_session_id = self.cli_session_id();
        let record = self
            .protocol
            .encode_user_message(cli_session_id.as_deref(), content);
        self.channel.write_record(&record).await
    }

    /// Sends a control request and waits for its response.
    ///
    /// Without a timeout the wait is bounded only by [`SessionEngine::kill`].
    pub async fn request(
        &self,
        request: ControlRequest,
        timeout: Option<Duration>,
    ) -> Result<Value, SessionError> {
        self.ensure_open()?;
        let request_id = self.protocol.new_request_id();
        let rx = self.controls.register(&request_id);

        let record = self.protocol.encode_control_request(&request_id, &request);
        if let Err(err) = self.channel.write_record(&record).await {
            self.controls.cancel(&request_id);
            return Err(err);
        }

        let result = tokio::select! {
            result = rx => result.map_err(|_| SessionError::SessionClosed(self.state()))?,
            _ = self.shutdown.cancelled() => {
                self.controls.cancel(&request_id);
                return Err(SessionError::SessionClosed(self.state()));
            }
            _ = deadline(timeout) => {
                self.controls.cancel(&request_id);
                return Err(SessionError::Timeout(timeout.unwrap_or_default()));
            }
        };

        result.map_err(|message| SessionError::ControlRejected {
            subtype: request.subtype().to_string(),
            message,
        })
    }

    /// Writes a control request without waiting for the response.
    ///
    /// Write failures are returned and also published on the error channel;
    /// a later rejection is only published.
    pub async fn send_control(&self, request: ControlRequest) -> Result<(), SessionError> {
        if let Err(err) = self.ensure_active() {
            self.publish_error(&err);
            return Err(err);
        }

        let request_id = self.protocol.new_request_id();
        let rx = self.controls.register(&request_id);
        let record = self.protocol.encode_control_request(&request_id, &request);
        if let Err(err) = self.channel.write_record(&record).await {
            self.controls.cancel(&request_id);
            self.publish_error(&err);
            return Err(err);
        }

        let errors = self.errors.clone();
        let shutdown = self.shutdown.clone();
        let session_id = self.session_id.clone();
        let subtype = request.subtype().to_string();
        tokio::spawn(async move {
            let result = tokio::select! {
                result = rx => result,
                _ = shutdown.cancelled() => return,
            };
            if let Ok(Err(message)) = result {
                log::warn!("[{session_id}] Control request `{subtype}` rejected: {message}");
                let err = SessionError::ControlRejected { subtype, message };
                errors.publish(BackendError::from_session_error(&err, Some(&session_id)));
            }
        });
        Ok(())
    }

    pub async fn interrupt(&self) -> Result<(), SessionError> {
        self.send_control(ControlRequest::Interrupt).await
    }

    pub async fn set_model(&self, model: &str) -> Result<(), SessionError> {
        self.send_control(ControlRequest::SetModel(model.to_string())).await
    }

    pub async fn set_permission_mode(&self, mode: &str) -> Result<(), SessionError> {
        self.send_control(ControlRequest::SetPermissionMode(mode.to_string()))
            .await
    }

    pub async fn set_config_option(&self, key: &str, value: &Value) -> Result<(), SessionError> {
        let request = self
            .protocol
            .config_option_request(key, value)
            .ok_or_else(|| SessionError::UnsupportedOption(key.to_string()))?;
        self.send_control(request).await
    }

    /// Delivers the answer to a permission request. Returns false if the
    /// request was already answered or is unknown.
    pub fn resolve_permission(&self, request_id: &str, reply: PermissionReply) -> bool {
        let delivered = self.permission_replies.resolve(request_id, reply);
        if delivered {
            self.remove_outstanding(request_id);
        } else {
            log::debug!(
                "[{}] Ignoring response for unknown or answered permission {}",
                self.session_id,
                request_id
            );
        }
        delivered
    }

    pub fn resolve_hook(&self, request_id: &str, response: HookResponse) -> bool {
        let delivered = self.hook_replies.resolve(request_id, response);
        if !delivered {
            log::debug!(
                "[{}] Ignoring response for unknown or answered hook {}",
                self.session_id,
                request_id
            );
        }
        delivered
    }

    /// Terminates the process and closes the session. Safe to call
    /// concurrently and repeatedly.
    pub async fn kill(&self) {
        let first = self.state.send_if_modified(|state| match state {
            SessionState::Starting | SessionState::Active => {
                *state = SessionState::Terminating;
                true
            }
            SessionState::Terminating | SessionState::Closed => false,
        });
        if first {
            log::debug!("[{}] Killing session", self.session_id);
            self.shutdown.cancel();
            self.channel.kill();
        }
        let exit = self.channel.terminated().await;
        self.finish(exit);
    }

    /// Resolves once the session is `Closed`, with the process exit status.
    pub async fn closed(&self) -> ProcessExit {
        let mut rx = self.state.subscribe();
        loop {
            if *rx.borrow_and_update() == SessionState::Closed {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.channel.terminated().await
    }

    fn mark_terminating(&self) {
        self.state.send_if_modified(|state| {
            if matches!(state, SessionState::Starting | SessionState::Active) {
                *state = SessionState::Terminating;
                true
            } else {
                false
            }
        });
    }

    fn finish(&self, exit: ProcessExit) {
        let first = self.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
        if !first {
            return;
        }

        self.shutdown.cancel();
        self.channel.kill();
        self.controls.cancel_all();
        self.permission_replies.cancel_all();
        self.hook_replies.cancel_all();
        self.outstanding.lock().clear();

        log::info!("[{}] Session closed ({})", self.session_id, exit);
        self.events.publish(SessionEvent::exited(&exit));
        self.events.close();
        self.permissions.close();
        self.hooks.close();
    }

    fn publish_error(&self, err: &SessionError) {
        self.errors
            .publish(BackendError::from_session_error(err, Some(&self.session_id)));
    }

    fn remove_outstanding(&self, request_id: &str) {
        self.outstanding
            .lock()
            .retain(|request| request.request_id != request_id);
    }

    async fn read_loop(
        weak: Weak<Self>,
        mut records: FramedRead<ChildStdout, RecordCodec>,
        shutdown: CancellationToken,
    ) {
        let mut failures = 0;
        // FramedRead yields one `None` after an error, then reads on.
        let mut resuming = false;
        loop {
            let next = tokio::select! {
                next = records.next() => next,
                _ = shutdown.cancelled() => break,
            };
            let Some(engine) = weak.upgrade() else {
                break;
            };
            match next {
                Some(Ok(record)) => {
                    failures = 0;
                    resuming = false;
                    engine.dispatch(record).await;
                }
                Some(Err(err)) => {
                    log::warn!("[{}] Failed to read stdout: {}", engine.session_id, err);
                    engine.publish_error(&err);
                    failures += 1;
                    if failures >= MAX_CONSECUTIVE_READ_ERRORS {
                        log::warn!(
                            "[{}] Giving up on stdout after {} read errors",
                            engine.session_id,
                            failures
                        );
                        break;
                    }
                    resuming = true;
                }
                None if resuming => resuming = false,
                None => break,
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, record: Value) {
        match self.protocol.classify(record) {
            Inbound::ControlResponse { request_id, result } => {
                if !self.controls.resolve(&request_id, result) {
                    log::debug!(
                        "[{}] Discarding late control response {}",
                        self.session_id,
                        request_id
                    );
                }
            }
            Inbound::Events(events) => {
                let state = self.state();
                if !matches!(state, SessionState::Active | SessionState::Terminating) {
                    log::debug!(
                        "[{}] Dropping {} event(s) while {}",
                        self.session_id,
                        events.len(),
                        state
                    );
                    return;
                }
                for event in events {
                    self.observe(&event);
                    self.events.publish(event);
                }
            }
            Inbound::Permission(request) => {
                if self.state() == SessionState::Active {
                    self.track_permission(request);
                } else {
                    self.reject_control(&request.request_id, "Session is not active")
                        .await;
                }
            }
            Inbound::Hook(call) => {
                if self.state() == SessionState::Active {
                    self.track_hook(call);
                } else {
                    self.reject_control(&call.request_id, "Session is not active")
                        .await;
                }
            }
            Inbound::UnsupportedControl {
                request_id,
                subtype,
            } => {
                log::warn!(
                    "[{}] Unsupported control request `{}`",
                    self.session_id,
                    subtype
                );
                self.reject_control(
                    &request_id,
                    &format!("Unsupported control request: {}", subtype),
                )
                .await;
            }
            Inbound::Ignore => {}
        }
    }

    fn observe(&self, event: &SessionEvent) {
        let reported = match event {
            SessionEvent::SessionInit { cli_session_id, .. }
            | SessionEvent::TurnComplete { cli_session_id, .. } => cli_session_id.as_ref(),
            _ => None,
        };
        if let Some(id) = reported {
            *self.cli_session_id.lock() = Some(id.clone());
        }
    }

    async fn reject_control(&self, request_id: &str, message: &str) {
        let record = self.protocol.encode_control_error(request_id, message);
        if let Err(err) = self.channel.write_record(&record).await {
            log::debug!(
                "[{}] Could not reject control request {}: {}",
                self.session_id,
                request_id,
                err
            );
        }
    }

    fn track_permission(self: &Arc<Self>, request: ToolPermissionRequest) {
        let rx = self.permission_replies.register(&request.request_id);
        self.outstanding.lock().push(request.clone());
        self.permissions.publish(request.clone());

        self.spawn_reply_writer(rx, request.request_id.clone(), move |engine, reply| {
            engine.protocol.encode_permission_reply(&request, &reply)
        });
    }

    fn track_hook(self: &Arc<Self>, call: HookCall) {
        let rx = self.hook_replies.register(&call.request_id);
        self.hooks.publish(HookRequest {
            id: call.request_id.clone(),
            session_id: self.session_id.clone(),
            callback_id: call.callback_id,
            hook_event_name: call.hook_event_name,
            tool_name: call.tool_name,
            tool_input: call.tool_input,
            tool_use_id: call.tool_use_id,
        });

        let request_id = call.request_id;
        self.spawn_reply_writer(rx, request_id.clone(), move |engine, response| {
            engine.protocol.encode_hook_reply(&request_id, &response)
        });
    }

    /// Waits for one reply and writes it. The reply slot is single-use, so
    /// this is the only write for `request_id`.
    fn spawn_reply_writer<T, F>(
        self: &Arc<Self>,
        rx: tokio::sync::oneshot::Receiver<T>,
        request_id: String,
        encode: F,
    ) where
        T: Send + 'static,
        F: FnOnce(&SessionEngine, T) -> Value + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let reply = tokio::select! {
                reply = rx => reply.ok(),
                _ = shutdown.cancelled() => None,
            };
            let (Some(reply), Some(engine)) = (reply, weak.upgrade()) else {
                return;
            };
            engine.remove_outstanding(&request_id);
            let record = encode(&*engine, reply);
            if let Err(err) = engine.channel.write_record(&record).await {
                log::warn!(
                    "[{}] Failed to deliver reply for {}: {}",
                    engine.session_id,
                    request_id,
                    err
                );
                engine.publish_error(&err);
            }
        });
    }
}

fn deadline(timeout: Option<Duration>) -> impl Future<Output = ()> {
    async move {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backends::claude::ClaudeProtocol;
    use serde_json::json;

    const ANSWER_INIT: &str = r#"read line
id=$(printf '%s\n' "$line" | sed -n 's/.*"request_id":"\([^"]*\)".*/\1/p')
printf '{"type":"control_response","response":{"subtype":"success","request_id":"%s","response":{}}}\n' "$id"
"#;

    fn options(handshake_timeout: Duration) -> EngineOptions {
        EngineOptions {
            session_id: "engine-test".to_string(),
            handshake: Some(ControlRequest::Initialize { hooks: None }),
            handshake_timeout,
            event_buffer: 16,
        }
    }

    async fn start(script: &str, timeout: Duration) -> Result<Arc<SessionEngine>, SessionError> {
        let spec = LaunchSpec::new("sh", std::env::temp_dir()).args(["-c", script]);
        SessionEngine::start(
            &spec,
            Arc::new(ClaudeProtocol),
            options(timeout),
            Arc::new(Fanout::new(16)),
            Arc::new(Fanout::new(16)),
        )
        .await
    }

    #[tokio::test]
    async fn handshake_timeout_fails_start() {
        let result = start("cat > /dev/null", Duration::from_millis(200)).await;
        assert!(matches!(result, Err(SessionError::Handshake(_))));
    }

    #[tokio::test]
    async fn exit_during_handshake_fails_start() {
        let result = start("read line; exit 3", Duration::from_secs(5)).await;
        assert!(matches!(result, Err(SessionError::Handshake(_))));
    }

    #[tokio::test]
    async fn final_events_are_delivered_before_exit() {
        let script = format!(
            "{ANSWER_INIT}read msg\n\
             echo '{{\"type\":\"assistant\",\"message\":{{\"content\":[{{\"type\":\"text\",\"text\":\"done\"}}]}}}}'\n\
             echo '{{\"type\":\"result\",\"subtype\":\"success\",\"session_id\":\"cli-7\"}}'\n\
             exit 0"
        );
        let engine = start(&script, Duration::from_secs(5)).await.unwrap();
        assert_eq!(engine.state(), SessionState::Active);
        let mut events = engine.events();
        engine.send("hi").await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Text { content: "done".to_string() }
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::TurnComplete { success: true, .. }
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Exited { code: Some(0), signal: None, expected: true }
        );
        assert!(events.recv().await.is_err());
        assert_eq!(engine.cli_session_id().as_deref(), Some("cli-7"));
        assert_eq!(engine.closed().await.code, Some(0));
        assert_eq!(engine.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn rejected_control_request_is_an_error() {
        let script = format!(
            r#"{ANSWER_INIT}read line
id=$(printf '%s\n' "$line" | sed -n 's/.*"request_id":"\([^"]*\)".*/\1/p')
printf '{{"type":"control_response","response":{{"subtype":"error","request_id":"%s","error":"Unknown model"}}}}\n' "$id"
cat > /dev/null"#
        );
        let engine = start(&script, Duration::from_secs(5)).await.unwrap();
        let result = engine
            .request(ControlRequest::SetModel("nope".to_string()), Some(Duration::from_secs(5)))
            .await;

        match result {
            Err(SessionError::ControlRejected { subtype, message }) => {
                assert_eq!(subtype, "set_model");
                assert_eq!(message, "Unknown model");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        engine.kill().await;
    }

    #[tokio::test]
    async fn unknown_control_request_gets_error_response() {
        // The script reports whether our answer was an error as a system record.
        let script = format!(
            r#"{ANSWER_INIT}read msg
echo '{{"type":"control_request","request_id":"cr-1","request":{{"subtype":"mcp_message"}}}}'
read reply
case "$reply" in
  *'"subtype":"error"'*'"request_id":"cr-1"'*|*'"request_id":"cr-1"'*'"subtype":"error"'*) ok=true ;;
  *) ok=false ;;
esac
echo "{{\"type\":\"system\",\"subtype\":\"check\",\"ok\":$ok}}"
cat > /dev/null"#
        );
        let engine = start(&script, Duration::from_secs(5)).await.unwrap();
        let mut events = engine.events();
        engine.send("go").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SessionEvent::Other { kind, payload } => {
                assert_eq!(kind, "system");
                assert_eq!(payload["ok"], json!(true));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        engine.kill().await;
    }

    #[tokio::test]
    async fn kill_fails_pending_requests_and_writes() {
        let engine = start(&format!("{ANSWER_INIT}cat > /dev/null"), Duration::from_secs(5))
            .await
            .unwrap();

        let waiting = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.request(ControlRequest::Interrupt, None).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        engine.kill().await;
        engine.kill().await;
        assert!(matches!(
            waiting.await.unwrap(),
            Err(SessionError::SessionClosed(_))
        ));
        assert!(matches!(
            engine.send("late").await,
            Err(SessionError::SessionClosed(SessionState::Closed))
        ));
        assert!(engine.closed().await.killed);
        assert!(!engine.resolve_permission(
            "missing",
            PermissionReply::Deny { message: "no".to_string(), interrupt: false }
        ));
    }
    #[tokio::test]
    async fn invalid_stderr_leaves_session_usable() {
        let script = format!(
            r#"{ANSWER_INIT}printf '\377\376 bad bytes\n' >&2
sleep 0.3
echo 'still talking' >&2
read msg
echo '{{"type":"assistant","message":{{"content":[{{"type":"text","text":"heard you"}}]}}}}'
cat > /dev/null"#
        );
        let diagnostics = Arc::new(Fanout::new(16));
        let mut lines = diagnostics.subscribe();
        let spec = LaunchSpec::new("sh", std::env::temp_dir()).args(["-c", script.as_str()]);
        let engine = SessionEngine::start(
            &spec,
            Arc::new(ClaudeProtocol),
            options(Duration::from_secs(5)),
            Arc::new(Fanout::new(16)),
            diagnostics.clone(),
        )
        .await
        .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), lines.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(first.line.ends_with(" bad bytes"));
        let second = tokio::time::timeout(Duration::from_secs(5), lines.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.line, "still talking");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.state(), SessionState::Active);
        assert!(engine.channel.exit_status().is_none());

        let mut events = engine.events();
        engine.send("hello").await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, SessionEvent::Text { content: "heard you".to_string() });
        engine.kill().await;
    }

    #[tokio::test]
    async fn terminating_while_stdout_drains() {
        let script = format!(
            r#"{ANSWER_INIT}read msg
(sleep 0.6; echo '{{"type":"result","subtype":"success","session_id":"cli-9"}}') &
exit 0"#
        );
        let engine = start(&script, Duration::from_secs(5)).await.unwrap();
        let mut events = engine.events();
        engine.send("bye").await.unwrap();

        let mut state = engine.state.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|state| *state != SessionState::Active),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(engine.state(), SessionState::Terminating);
        assert!(matches!(
            engine.send("too late").await,
            Err(SessionError::SessionClosed(SessionState::Terminating))
        ));

        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::TurnComplete { success: true, .. }
        ));
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Exited { .. }));
        assert_eq!(engine.closed().await.code, Some(0));
        assert_eq!(engine.state(), SessionState::Closed);
    }
}
