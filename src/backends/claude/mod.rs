//! Claude Code CLI backend.

mod adapter;
mod backend;
pub mod cli_protocol;
pub mod discovery;
mod permissions;
mod tool_utils;

pub use adapter::ClaudeSession;
pub use backend::{discovery_args, session_args, ClaudeCliBackend, CLI_PATH_ENV};
pub use cli_protocol::ClaudeProtocol;
pub use tool_utils::{describe_permission, tool_target};
