//! Shared utilities used by multiple backend adapters.

use futures::StreamExt;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::ChildStderr;
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};

use super::codec::MAX_CONSECUTIVE_READ_ERRORS;
use super::error::{BackendError, SessionError};
use super::runtime::{DiagnosticLine, DiagnosticSource, Fanout};

/// Windows constant to hide console windows when spawning CLI subprocesses.
#[cfg(target_os = "windows")]
pub const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Executable lookup: explicit override, then the environment variable value,
/// then every directory on `path_var`.
pub fn resolve_cli_path_with(
    override_path: Option<&Path>,
    env_value: Option<OsString>,
    path_var: Option<OsString>,
    program: &str,
) -> Option<PathBuf> {
    if let Some(path) = override_path {
        return Some(path.to_path_buf());
    }
    if let Some(value) = env_value.filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(value));
    }

    let candidates: Vec<String> = if cfg!(windows) {
        vec![
            format!("{program}.exe"),
            format!("{program}.cmd"),
            program.to_string(),
        ]
    } else {
        vec![program.to_string()]
    };

    let path_var = path_var?;
    std::env::split_paths(&path_var)
        .flat_map(|dir| candidates.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// [`resolve_cli_path_with`] against the live process environment.
pub fn resolve_cli_path(
    override_path: Option<&Path>,
    env_var: &str,
    program: &str,
) -> Result<PathBuf, SessionError> {
    resolve_cli_path_with(
        override_path,
        std::env::var_os(env_var),
        std::env::var_os("PATH"),
        program,
    )
    .ok_or_else(|| SessionError::Spawn {
        program: program.to_string(),
        reason: format!("not found (set {} or add it to PATH)", env_var),
    })
}

/// Spawn a task that drains stderr line-by-line.
///
/// Each non-empty line is decoded lossily, logged and published as a
/// diagnostic. Read errors go to the error channel and the drain carries on,
/// so the pipe stays open for as long as the process writes to it.
pub fn spawn_stderr_forwarder(
    mut lines: FramedRead<ChildStderr, AnyDelimiterCodec>,
    session_id: String,
    diagnostics: Arc<Fanout<DiagnosticLine>>,
    errors: Arc<Fanout<BackendError>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut failures = 0;
        // FramedRead yields one `None` after a decoder error, then reads on.
        let mut resuming = false;
        loop {
            match lines.next().await {
                Some(Ok(raw)) => {
                    failures = 0;
                    resuming = false;
                    let text = String::from_utf8_lossy(&raw);
                    let line = text.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    log::debug!("[{session_id} stderr] {}", line);
                    diagnostics.publish(DiagnosticLine {
                        session_id: Some(session_id.clone()),
                        source: DiagnosticSource::Stderr,
                        line: line.to_string(),
                    });
                }
                Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                    log::warn!("[{session_id} stderr] Skipping overlong line");
                    resuming = true;
                }
                Some(Err(AnyDelimiterCodecError::Io(err))) => {
                    log::warn!("[{session_id} stderr] Read failed: {}", err);
                    let err = SessionError::Io(err);
                    errors.publish(BackendError::from_session_error(&err, Some(&session_id)));
                    failures += 1;
                    if failures >= MAX_CONSECUTIVE_READ_ERRORS {
                        log::warn!("[{session_id} stderr] Giving up after {} read errors", failures);
                        break;
                    }
                    resuming = true;
                }
                None if resuming => resuming = false,
                None => break,
            }
        }
    })
}
