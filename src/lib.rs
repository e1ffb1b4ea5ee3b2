//! Process-backed sessions for agent CLIs.
//!
//! A [`Backend`] spawns one CLI process per conversation, speaks its
//! line-delimited JSON control protocol and presents the result as a
//! [`BackendSession`]: an event stream, permission and hook round trips,
//! interrupt and kill, model and mode changes.

pub mod backends;
pub mod config;

pub use backends::{
    Backend, BackendError, BackendKind, BackendRegistry, BackendSession, SessionError,
    SessionEvent, SessionOptions,
};
pub use config::BackendSettings;
