//! Backend abstraction layer for agent CLIs.
//!
//! Each backend kind spawns one CLI process per session and exposes it as a
//! [`BackendSession`]. The layers, leaf first:
//! - [`channel`]: one OS process and its framed stdio
//! - [`engine`]: the control protocol and session state machine on top of it
//! - a backend kind (`claude`): wire grammar, adapter and orchestrator

pub mod channel;
pub mod codec;
pub mod engine;
pub mod error;
pub mod runtime;
pub mod session;
pub mod types;
pub mod utils;

pub mod claude;

pub use channel::{LaunchSpec, ProcessChannel, ProcessExit};
pub use error::{BackendError, BackendErrorCode, SessionError};
pub use runtime::{DiagnosticLine, DiagnosticSource};
pub use session::{
    BackendSession, ContentBlock, HookRequest, HookResponse, PermissionDestination,
    PermissionRequest, PermissionResponse, PermissionRule, PermissionSuggestion, RuleBehavior,
    SessionEvent, SessionState, ToolStatus,
};
pub use types::{
    AccountInfo, Backend, BackendCapabilities, BackendFactory, BackendInfo, BackendKind,
    BackendRegistry, ModelInfo, PermissionModel, SessionOptions,
};
